// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Response-ring consumption.
//!
//! Firmware DMAs 64-byte IOCBs into the ring; the driver walks it until it
//! finds a slot still carrying the processed sentinel, dispatching each entry
//! by type. Retired slots get the sentinel rewritten (with a release fence so
//! the store is visible before the index is published) and the read index is
//! written back to hardware once per batch.

use crate::adapter::Command;
use crate::adapter::CommandKind;
use crate::adapter::CommandResult;
use crate::adapter::CompletionClass;
use crate::adapter::HbaEvents;
use crate::adapter::IocbResult;
use crate::adapter::PortId;
use crate::adapter::ScsiResult;
use crate::adapter::VpReport;
use crate::interrupt::Adapter;
use crate::interrupt::split_handle;
use crate::outstanding::HandleError;
use crate::registers::ChipRegisters;
use crate::status::PendingSense;
use isp_spec::CompletionStatus;
use isp_spec::ElsCtEntry;
use isp_spec::LogioEntry;
use isp_spec::MbxIocbEntry;
use isp_spec::RESPONSE_PROCESSED;
use isp_spec::RawResponseEntry;
use isp_spec::Status21Entry;
use isp_spec::Status22Entry;
use isp_spec::StatusEntryFwi2;
use isp_spec::VpRptIdEntry;
use isp_spec::entry_type;
use isp_spec::fcp_swap;
use isp_spec::logio_subcode;
use isp_spec::mbs;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use zerocopy::FromBytes;

/// One response ring and its consumption cursor.
pub struct ResponseRing {
    id: u16,
    entries: Box<[RawResponseEntry]>,
    /// Next slot to examine.
    index: usize,
    /// Slot of the most recently consumed entry, pending retirement.
    last: usize,
    /// Device-side producer cursor, used by tests and by the ZIO poll path
    /// to stage entries.
    producer: usize,
    /// Sense bytes still owed by status-continuation entries on this ring.
    pub(crate) pending_sense: Option<PendingSense>,
}

impl ResponseRing {
    pub fn new(id: u16, len: usize) -> Self {
        assert!(len >= 2);
        let mut retired = RawResponseEntry { bytes: [0; 64] };
        retired.bytes[..4].copy_from_slice(&RESPONSE_PROCESSED.to_le_bytes());
        Self {
            id,
            entries: vec![retired; len].into_boxed_slice(),
            index: 0,
            last: 0,
            producer: 0,
            pending_sense: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current read index, as published to the hardware.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Stages an entry at the producer cursor, standing in for firmware DMA.
    pub fn post(&mut self, entry: RawResponseEntry) {
        self.entries[self.producer] = entry;
        self.producer = (self.producer + 1) % self.entries.len();
    }

    /// Takes the next unprocessed entry, if any, advancing the read cursor.
    /// The slot stays live until [`Self::retire_last`].
    fn consume(&mut self) -> Option<RawResponseEntry> {
        let entry = self.entries[self.index];
        if entry.signature() == RESPONSE_PROCESSED {
            return None;
        }
        self.last = self.index;
        self.index = (self.index + 1) % self.entries.len();
        Some(entry)
    }

    /// Rewrites the processed sentinel over the consumed slot. The release
    /// fence orders the sentinel store before the subsequent ring-index
    /// register write that hands the slot back to firmware.
    fn retire_last(&mut self) {
        self.entries[self.last].bytes[..4].copy_from_slice(&RESPONSE_PROCESSED.to_le_bytes());
        fence(Ordering::Release);
    }
}

impl<R: ChipRegisters, E: HbaEvents> Adapter<R, E> {
    /// Drains every unprocessed entry from `queue`, then publishes the read
    /// index to hardware exactly once.
    pub(crate) fn process_response_queue(&mut self, queue: usize) {
        if !self.port.online {
            return;
        }
        while let Some(raw) = self.rsp_queues[queue].consume() {
            let header = raw.header();
            if header.entry_status != 0 {
                self.error_entry(&raw);
            } else {
                match header.entry_type {
                    entry_type::STATUS => self.status_entry(queue, &raw),
                    entry_type::STATUS_CONT => self.status_cont_entry(queue, &raw),
                    entry_type::STATUS_21 => self.status21_entry(&raw),
                    entry_type::STATUS_22 => self.status22_entry(&raw),
                    entry_type::MBX_IOCB => self.mbx_iocb_entry(&raw),
                    entry_type::LOGINOUT_PORT => self.logio_entry(&raw),
                    entry_type::TSK_MGMT => self.tm_iocb_entry(&raw),
                    entry_type::ELS_PASSTHRU | entry_type::CT_PASSTHRU => self.els_ct_entry(&raw),
                    entry_type::VP_RPT_ID => self.vp_rpt_id_entry(&raw),
                    // Marker completions carry nothing for the driver.
                    entry_type::MARKER => {}
                    other => {
                        tracing::debug!(entry_type = other, "unknown response entry type");
                    }
                }
            }
            self.rsp_queues[queue].retire_last();
        }
        let ring = &self.rsp_queues[queue];
        self.regs.write_response_index(ring.id, ring.index as u16);
    }

    /// Resolves a handle to its in-flight command. `Ok(None)` covers both the
    /// already-returned slot and the invalid handle; the latter escalates to
    /// an ISP abort before returning.
    pub(crate) fn claim_handle(&mut self, handle: u32) -> Option<Command> {
        let (que, idx) = split_handle(handle);
        let lookup = match self.req_queues.get_mut(que as usize) {
            Some(table) => table.lookup_and_clear(idx),
            None => Err(HandleError::OutOfRange { handle: idx }),
        };
        match lookup {
            Ok(found) => found,
            Err(err) => {
                self.invalid_handle(&err);
                None
            }
        }
    }

    /// Firmware handed back a handle the driver does not have in flight. The
    /// two views of what is outstanding have diverged; only a reset
    /// resynchronizes them.
    fn invalid_handle(&mut self, err: &HandleError) {
        tracing::error!(
            error = err as &dyn std::error::Error,
            "invalid completion handle, scheduling adapter reset"
        );
        self.port.dpc_flags.set_isp_abort_needed(true);
        self.events.wake_dpc();
    }

    /// Fast-path completion: the firmware vouched for full success, so the
    /// command finishes with a synthesized all-good result.
    pub(crate) fn process_completed_request(&mut self, handle: u32) {
        if let Some(command) = self.claim_handle(handle) {
            self.events
                .complete_command(command, CommandResult::Scsi(ScsiResult::success()));
        }
    }

    /// An entry the firmware itself flagged as malformed. The payload is
    /// garbage but the handle prefix is still good; fail the command rather
    /// than strand it.
    fn error_entry(&mut self, raw: &RawResponseEntry) {
        let prefix = raw.prefix();
        tracing::warn!(
            entry_type = prefix.header.entry_type,
            entry_status = prefix.header.entry_status,
            handle = prefix.handle,
            "error-flagged response entry"
        );
        if let Some(command) = self.claim_handle(prefix.handle) {
            let result = match command.kind {
                CommandKind::Scsi => CommandResult::Scsi(ScsiResult {
                    class: CompletionClass::DeviceError,
                    scsi_status: 0,
                    residual: 0,
                    sense: Vec::new(),
                    fw_status: [prefix.header.entry_status as u16, 0, 0],
                }),
                _ => CommandResult::Iocb(IocbResult {
                    comp_status: CompletionStatus::TRANSPORT_ERROR,
                    data: [0, 0],
                }),
            };
            self.events.complete_command(command, result);
        }
    }

    fn status21_entry(&mut self, raw: &RawResponseEntry) {
        // Infallible: the entry is exactly one ring slot.
        let entry = Status21Entry::read_from_bytes(&raw.bytes).unwrap();
        let count = (entry.handle_count as usize).min(entry.handle.len());
        for &handle in &entry.handle[..count] {
            self.process_completed_request(handle);
        }
    }

    fn status22_entry(&mut self, raw: &RawResponseEntry) {
        let entry = Status22Entry::read_from_bytes(&raw.bytes).unwrap();
        let count = (entry.handle_count as usize).min(entry.handle.len());
        for &handle in &entry.handle[..count] {
            self.process_completed_request(handle as u32);
        }
    }

    fn mbx_iocb_entry(&mut self, raw: &RawResponseEntry) {
        let entry = MbxIocbEntry::read_from_bytes(&raw.bytes).unwrap();
        let Some(command) = self.claim_handle(entry.handle) else {
            return;
        };
        let mut status = entry.status;
        if status == mbs::LOGIN_COMPLETE_QUIRK
            && command.kind == CommandKind::Login
            && entry.mb[0] == mbs::COMMAND_COMPLETE
        {
            status = 0;
        }
        let result = if status == 0 && entry.mb[0] == mbs::COMMAND_COMPLETE {
            IocbResult {
                comp_status: CompletionStatus::COMPLETE,
                data: [mbs::COMMAND_COMPLETE as u32, entry.mb[1] as u32],
            }
        } else {
            let detail = match entry.mb[0] {
                mbs::PORT_ID_USED => entry.mb[1],
                mbs::LOOP_ID_USED => entry.mb[6],
                _ => entry.mb[2],
            };
            tracing::debug!(
                status = entry.status,
                mb0 = entry.mb[0],
                detail,
                "mailbox IOCB failed"
            );
            IocbResult {
                comp_status: CompletionStatus::INCOMPLETE,
                data: [entry.mb[0] as u32, detail as u32],
            }
        };
        self.events
            .complete_command(command, CommandResult::Iocb(result));
    }

    fn logio_entry(&mut self, raw: &RawResponseEntry) {
        let entry = LogioEntry::read_from_bytes(&raw.bytes).unwrap();
        let Some(command) = self.claim_handle(entry.handle) else {
            return;
        };
        let result = if entry.comp_status == CompletionStatus::COMPLETE {
            IocbResult {
                comp_status: CompletionStatus::COMPLETE,
                data: [mbs::COMMAND_COMPLETE as u32, entry.io_parameter[0]],
            }
        } else {
            let (status, detail) = match entry.io_parameter[0] {
                logio_subcode::PORT_ID_USED => (mbs::PORT_ID_USED, entry.io_parameter[1]),
                logio_subcode::LOOP_ID_USED => (mbs::LOOP_ID_USED, entry.io_parameter[1]),
                _ => (mbs::COMMAND_ERROR, entry.io_parameter[1]),
            };
            tracing::debug!(
                comp_status = ?entry.comp_status,
                subcode = entry.io_parameter[0],
                "login/logout IOCB failed"
            );
            IocbResult {
                comp_status: entry.comp_status,
                data: [status as u32, detail],
            }
        };
        self.events
            .complete_command(command, CommandResult::Iocb(result));
    }

    /// Task-management completions reuse the FWI2 status entry layout; the
    /// FCP response code sits in the swapped data area.
    fn tm_iocb_entry(&mut self, raw: &RawResponseEntry) {
        let entry = StatusEntryFwi2::read_from_bytes(&raw.bytes).unwrap();
        let Some(command) = self.claim_handle(entry.handle) else {
            return;
        };
        let mut data = entry.data;
        fcp_swap(&mut data);
        let response_code = data[3];
        let ok = entry.comp_status == CompletionStatus::COMPLETE && response_code == 0;
        if !ok {
            tracing::debug!(
                comp_status = ?entry.comp_status,
                response_code,
                "task management IOCB failed"
            );
        }
        let status = if ok {
            mbs::COMMAND_COMPLETE
        } else {
            mbs::COMMAND_ERROR
        };
        self.events.complete_command(
            command,
            CommandResult::Iocb(IocbResult {
                comp_status: entry.comp_status,
                data: [status as u32, response_code as u32],
            }),
        );
    }

    fn els_ct_entry(&mut self, raw: &RawResponseEntry) {
        let entry = ElsCtEntry::read_from_bytes(&raw.bytes).unwrap();
        let Some(command) = self.claim_handle(entry.handle) else {
            return;
        };
        let result = if entry.comp_status == CompletionStatus::COMPLETE {
            IocbResult {
                comp_status: CompletionStatus::COMPLETE,
                data: [0, entry.total_byte_count],
            }
        } else {
            tracing::debug!(
                comp_status = ?entry.comp_status,
                subcode_1 = entry.error_subcode_1,
                subcode_2 = entry.error_subcode_2,
                "pass-through IOCB failed"
            );
            IocbResult {
                comp_status: entry.comp_status,
                data: [entry.error_subcode_1, entry.error_subcode_2],
            }
        };
        self.events
            .complete_command(command, CommandResult::Iocb(result));
    }

    fn vp_rpt_id_entry(&mut self, raw: &RawResponseEntry) {
        let entry = VpRptIdEntry::read_from_bytes(&raw.bytes).unwrap();
        let report = VpReport {
            vp_index: entry.vp_index,
            acquired: entry.vp_acquired != 0,
            port_id: PortId {
                domain: entry.port_id[2],
                area: entry.port_id[1],
                al_pa: entry.port_id[0],
            },
            format: entry.format,
        };
        tracing::debug!(vp_index = report.vp_index, acquired = report.acquired, "vp report id");
        self.events.register_vp_id(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::raw_entry;
    use crate::test_support::scsi_command;
    use crate::test_support::test_adapter;
    use isp_spec::EntryHeader;
    use isp_spec::ScsiStatus;
    use isp_spec::entry_type;

    fn good_status_fwi2(handle: u32) -> RawResponseEntry {
        raw_entry(&StatusEntryFwi2 {
            header: EntryHeader {
                entry_type: entry_type::STATUS,
                entry_count: 1,
                sys_define: 0,
                entry_status: 0,
            },
            handle,
            comp_status: CompletionStatus::COMPLETE,
            ox_id: 0,
            residual_len: 0,
            reserved1: 0,
            state_flags: 0,
            retry_delay: 0,
            scsi_status: ScsiStatus::new(),
            rsp_residual_count: 0,
            sense_len: 0,
            rsp_data_len: 0,
            data: [0; 28],
        })
    }

    #[test]
    fn ring_consume_stops_at_sentinel() {
        let mut ring = ResponseRing::new(0, 8);
        assert!(ring.consume().is_none());
        ring.post(good_status_fwi2(1));
        ring.post(good_status_fwi2(2));
        assert_eq!(ring.consume().unwrap().prefix().handle, 1);
        ring.retire_last();
        assert_eq!(ring.consume().unwrap().prefix().handle, 2);
        ring.retire_last();
        assert!(ring.consume().is_none());
        assert_eq!(ring.index(), 2);
    }

    #[test]
    fn retired_slot_is_not_reconsumed_after_wrap() {
        let mut ring = ResponseRing::new(0, 2);
        ring.post(good_status_fwi2(1));
        ring.post(good_status_fwi2(2));
        while ring.consume().is_some() {
            ring.retire_last();
        }
        // The cursor wrapped back to slot 0, which now carries the sentinel.
        assert_eq!(ring.index(), 0);
        assert!(ring.consume().is_none());
    }

    #[test]
    fn batch_publishes_ring_index_once() {
        let mut adapter = test_adapter(crate::registers::IspGeneration::Isp24xx);
        adapter.req_queues[0].insert(1, scsi_command(1));
        adapter.req_queues[0].insert(2, scsi_command(2));
        adapter.rsp_queues[0].post(good_status_fwi2(1));
        adapter.rsp_queues[0].post(good_status_fwi2(2));
        adapter.process_response_queue(0);
        assert_eq!(adapter.events.completions.len(), 2);
        assert_eq!(adapter.regs.response_index_writes.borrow().as_slice(), &[(0, 2)]);
    }

    #[test]
    fn offline_adapter_leaves_ring_untouched() {
        let mut adapter = test_adapter(crate::registers::IspGeneration::Isp24xx);
        adapter.port.online = false;
        adapter.rsp_queues[0].post(good_status_fwi2(1));
        adapter.process_response_queue(0);
        assert!(adapter.events.completions.is_empty());
        assert!(adapter.regs.response_index_writes.borrow().is_empty());
    }

    #[test]
    fn error_entry_fails_command_and_keeps_going() {
        let mut adapter = test_adapter(crate::registers::IspGeneration::Isp24xx);
        adapter.req_queues[0].insert(3, scsi_command(3));
        let mut bad = good_status_fwi2(3);
        bad.bytes[3] = 0x10; // entry_status
        adapter.rsp_queues[0].post(bad);
        adapter.process_response_queue(0);
        let (_, result) = &adapter.events.completions[0];
        match result {
            CommandResult::Scsi(scsi) => {
                assert_eq!(scsi.class, CompletionClass::DeviceError);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn invalid_handle_schedules_abort() {
        let mut adapter = test_adapter(crate::registers::IspGeneration::Isp24xx);
        // Nothing outstanding at handle 9.
        adapter.rsp_queues[0].post(good_status_fwi2(9));
        adapter.process_response_queue(0);
        assert!(adapter.events.completions.is_empty());
        assert!(adapter.port.dpc_flags.isp_abort_needed());
        assert_eq!(adapter.events.dpc_wakes, 1);
    }

    #[test]
    fn multi_handle_entry_completes_each_handle() {
        let mut adapter = test_adapter(crate::registers::IspGeneration::Isp2300);
        for handle in [4u16, 5, 6] {
            adapter.req_queues[0].insert(handle, scsi_command(handle as u32));
        }
        let mut entry = Status22Entry {
            entry_type: entry_type::STATUS_22,
            entry_count: 1,
            handle_count: 3,
            entry_status: 0,
            handle: [0; 30],
        };
        entry.handle[..3].copy_from_slice(&[4, 5, 6]);
        adapter.rsp_queues[0].post(raw_entry(&entry));
        adapter.process_response_queue(0);
        assert_eq!(adapter.events.completions.len(), 3);
    }

    #[test]
    fn login_quirk_status_maps_to_success() {
        let mut adapter = test_adapter(crate::registers::IspGeneration::Isp2300);
        let mut command = scsi_command(7);
        command.kind = CommandKind::Login;
        adapter.req_queues[0].insert(7, command);
        let mut entry = MbxIocbEntry {
            header: EntryHeader {
                entry_type: entry_type::MBX_IOCB,
                entry_count: 1,
                sys_define: 0,
                entry_status: 0,
            },
            handle: 7,
            status: mbs::LOGIN_COMPLETE_QUIRK,
            state_flags: 0,
            status_flags: 0,
            reserved1: 0,
            mb: [0; 8],
            reserved2: [0; 32],
        };
        entry.mb[0] = mbs::COMMAND_COMPLETE;
        adapter.rsp_queues[0].post(raw_entry(&entry));
        adapter.process_response_queue(0);
        let (_, result) = &adapter.events.completions[0];
        match result {
            CommandResult::Iocb(iocb) => {
                assert_eq!(iocb.comp_status, CompletionStatus::COMPLETE);
                assert_eq!(iocb.data[0], mbs::COMMAND_COMPLETE as u32);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn vp_report_id_reaches_registration() {
        let mut adapter = test_adapter(crate::registers::IspGeneration::Isp24xx);
        let entry = VpRptIdEntry {
            header: EntryHeader {
                entry_type: entry_type::VP_RPT_ID,
                entry_count: 1,
                sys_define: 0,
                entry_status: 0,
            },
            reserved1: 0,
            vp_acquired: 1,
            vp_setup: 0,
            vp_index: 2,
            reserved2: 0,
            port_id: [0x03, 0x02, 0x01],
            format: 1,
            reserved3: [0; 48],
        };
        adapter.rsp_queues[0].post(raw_entry(&entry));
        adapter.process_response_queue(0);
        assert_eq!(adapter.events.vp_reports.len(), 1);
        let report = &adapter.events.vp_reports[0];
        assert!(report.acquired);
        assert_eq!(report.port_id.domain, 1);
        assert_eq!(report.port_id.al_pa, 3);
    }
}
