// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Status entry translation: firmware completion status plus SCSI status
//! flags in, a normalized [`ScsiResult`] out.
//!
//! The two wire formats (legacy and FWI2) decode into one
//! generation-neutral record; classification itself is a pure function so
//! the interesting cases test without an adapter. Sense data longer than one
//! entry arrives via status-continuation entries, chained through the ring's
//! pending-sense slot.

use crate::adapter::Command;
use crate::adapter::CommandResult;
use crate::adapter::CompletionClass;
use crate::adapter::HbaEvents;
use crate::adapter::PortState;
use crate::adapter::ScsiResult;
use crate::interrupt::Adapter;
use crate::registers::ChipRegisters;
use crate::registers::IspGeneration;
use arrayvec::ArrayVec;
use isp_spec::CompletionStatus;
use isp_spec::DIF_ACTUAL_OFFSET;
use isp_spec::DIF_EXPECTED_OFFSET;
use isp_spec::DifTags;
use isp_spec::RawResponseEntry;
use isp_spec::SF_LOGOUT_SENT;
use isp_spec::ScsiStatus;
use isp_spec::StatusContEntry;
use isp_spec::StatusEntry;
use isp_spec::StatusEntryFwi2;
use isp_spec::fcp_swap;
use isp_spec::sam;
use isp_spec::sense;
use zerocopy::FromBytes;

/// Midlayer sense buffer size; sense beyond this is discarded even when the
/// firmware declares more.
pub const SENSE_BUFFER_SIZE: usize = 96;

/// Sense bytes still owed to a command by continuation entries.
pub(crate) struct PendingSense {
    pub command: Command,
    pub result: ScsiResult,
    pub remaining: usize,
}

/// A status entry decoded out of either wire format.
pub(crate) struct DecodedStatus {
    pub comp_status: CompletionStatus,
    pub scsi_status: ScsiStatus,
    /// Legacy-format status flags; zero on FWI2.
    pub status_flags: u16,
    /// Residual as reported in the entry's residual field.
    pub residual: u32,
    /// Residual the FWI2 firmware computed from frames actually moved.
    /// Mirrors `residual` on legacy chips.
    pub fw_residual: u32,
    pub rsp_info: ArrayVec<u8, 28>,
    /// First chunk of sense data carried in the entry itself.
    pub sense: ArrayVec<u8, 32>,
    /// Total sense length the firmware declared; the excess over `sense`
    /// arrives in continuation entries.
    pub sense_declared: usize,
    /// DIF tag tuples (actual, expected), present only on a DIF error.
    pub dif: Option<(DifTags, DifTags)>,
    pub fw_status: [u16; 3],
}

pub(crate) fn decode_legacy(entry: &StatusEntry) -> DecodedStatus {
    let scsi = entry.scsi_status;
    let mut rsp_info = ArrayVec::new();
    if scsi.response_info_valid() {
        let len = (entry.rsp_info_len as usize).min(entry.rsp_info.len());
        rsp_info.extend(entry.rsp_info[..len].iter().copied());
    }
    let mut sense = ArrayVec::new();
    let mut sense_declared = 0;
    if scsi.sense_len_valid() {
        sense_declared = entry.req_sense_length as usize;
        let len = sense_declared.min(entry.req_sense_data.len());
        sense.extend(entry.req_sense_data[..len].iter().copied());
    }
    DecodedStatus {
        comp_status: entry.comp_status,
        scsi_status: scsi,
        status_flags: entry.status_flags,
        residual: entry.residual_length,
        fw_residual: entry.residual_length,
        rsp_info,
        sense,
        sense_declared,
        dif: None,
        fw_status: [entry.comp_status.0, u16::from(scsi), entry.status_flags],
    }
}

pub(crate) fn decode_fwi2(entry: &StatusEntryFwi2) -> DecodedStatus {
    let scsi = entry.scsi_status;
    // DIF tags ride in the raw (unswapped) data area.
    let dif = (entry.comp_status == CompletionStatus::DIF_ERROR).then(|| {
        (
            DifTags::parse(&entry.data[DIF_ACTUAL_OFFSET..DIF_ACTUAL_OFFSET + 8]),
            DifTags::parse(&entry.data[DIF_EXPECTED_OFFSET..DIF_EXPECTED_OFFSET + 8]),
        )
    });
    let mut data = entry.data;
    fcp_swap(&mut data);
    let mut rsp_info = ArrayVec::new();
    let mut rsp_info_len = 0;
    if scsi.response_info_valid() {
        rsp_info_len = (entry.rsp_data_len as usize).min(data.len());
        rsp_info.extend(data[..rsp_info_len].iter().copied());
    }
    let mut sense = ArrayVec::new();
    let mut sense_declared = 0;
    if scsi.sense_len_valid() {
        sense_declared = entry.sense_len as usize;
        let end = (rsp_info_len + sense_declared).min(data.len());
        sense.extend(data[rsp_info_len..end].iter().copied());
    }
    DecodedStatus {
        comp_status: entry.comp_status,
        scsi_status: scsi,
        status_flags: 0,
        residual: entry.residual_len,
        fw_residual: entry.rsp_residual_count,
        rsp_info,
        sense,
        sense_declared,
        dif,
        fw_status: [entry.comp_status.0, u16::from(scsi), entry.state_flags],
    }
}

/// Outcome of classifying a decoded status entry.
pub(crate) struct Translation {
    pub result: ScsiResult,
    /// Whether the completion is worth a log line.
    pub logit: bool,
    /// Whether the target port should transition to lost.
    pub mark_port_lost: bool,
    /// Sense bytes still owed by continuation entries.
    pub sense_remaining: usize,
}

fn underflow_violated(command: &Command, residual: u32) -> bool {
    command.buffer_len.saturating_sub(residual) < command.underflow
}

/// Maps the firmware completion status and SCSI status flags to a completion
/// class. Pure; all adapter-state side effects happen in the caller.
pub(crate) fn classify(
    generation: IspGeneration,
    dec: &DecodedStatus,
    command: &Command,
) -> Translation {
    let scsi = dec.scsi_status;
    let sam_status = scsi.sam_status();
    let mut tr = Translation {
        result: ScsiResult {
            class: CompletionClass::Ok,
            scsi_status: sam_status,
            residual: 0,
            sense: Vec::new(),
            fw_status: dec.fw_status,
        },
        logit: true,
        mark_port_lost: false,
        sense_remaining: 0,
    };

    // A nonzero FCP response code means the target rejected the command at
    // the protocol level; nothing else in the entry is meaningful.
    if dec.rsp_info.len() > 3 && dec.rsp_info[3] != 0 {
        tracing::warn!(code = dec.rsp_info[3], "FCP protocol failure in response info");
        tr.result.class = CompletionClass::BusBusy;
        return tr;
    }

    let mut comp = dec.comp_status;
    // FWI2 firmware reports some overruns as COMPLETE with only the
    // underrun flag set; reclassify before dispatching.
    if generation.fwi2_capable()
        && comp == CompletionStatus::COMPLETE
        && scsi.residual_under()
        && !scsi.residual_over()
    {
        comp = CompletionStatus::DATA_OVERRUN;
    }

    match comp {
        CompletionStatus::COMPLETE | CompletionStatus::QUEUE_FULL => {
            if scsi.residual_under() || scsi.residual_over() {
                tr.result.residual = dec.residual;
                if scsi.residual_under()
                    && sam_status == sam::GOOD
                    && underflow_violated(command, dec.residual)
                {
                    tracing::warn!(
                        residual = dec.residual,
                        underflow = command.underflow,
                        "underrun below midlayer floor"
                    );
                    tr.result.class = CompletionClass::DeviceError;
                    return tr;
                }
            }
            sam_status_epilogue(&mut tr, dec);
        }
        CompletionStatus::DATA_UNDERRUN => {
            let residual = if generation.fwi2_capable() {
                dec.fw_residual
            } else {
                dec.residual
            };
            tr.result.residual = residual;
            if scsi.residual_under() {
                if generation.fwi2_capable() && dec.fw_residual != dec.residual {
                    // The two residual counts disagree: frames were dropped
                    // on the wire and the data can't be trusted.
                    tracing::warn!(
                        residual = dec.residual,
                        fw_residual = dec.fw_residual,
                        "residual mismatch, dropped frames"
                    );
                    tr.result.class = CompletionClass::DeviceError;
                    sam_status_epilogue(&mut tr, dec);
                    return tr;
                }
                if sam_status == sam::GOOD && underflow_violated(command, residual) {
                    tracing::warn!(
                        residual,
                        underflow = command.underflow,
                        "underrun below midlayer floor"
                    );
                    tr.result.class = CompletionClass::DeviceError;
                    return tr;
                }
            } else if sam_status != sam::TASK_SET_FULL && sam_status != sam::BUSY {
                // An underrun the firmware didn't flag, and the target isn't
                // reporting a queueing condition that would explain it.
                tracing::warn!(residual, "underrun without residual flag, dropped frames");
                tr.result.class = CompletionClass::DeviceError;
                sam_status_epilogue(&mut tr, dec);
                return tr;
            }
            sam_status_epilogue(&mut tr, dec);
        }
        CompletionStatus::DATA_OVERRUN => {
            tracing::warn!(residual = dec.residual, "data overrun");
            tr.result.class = CompletionClass::Overrun;
        }
        CompletionStatus::TIMEOUT => {
            tr.result.class = CompletionClass::TransportDisrupted;
            // FWI2 firmware has already logged the port out by the time it
            // reports a timeout; legacy chips say so with a status flag.
            if !generation.fwi2_capable() && dec.status_flags & SF_LOGOUT_SENT != 0 {
                tr.mark_port_lost = true;
            }
        }
        CompletionStatus::INCOMPLETE
        | CompletionStatus::PORT_UNAVAILABLE
        | CompletionStatus::PORT_LOGGED_OUT
        | CompletionStatus::PORT_CONFIG_CHG
        | CompletionStatus::PORT_BUSY => {
            tr.result.class = CompletionClass::TransportDisrupted;
            tr.mark_port_lost = true;
        }
        CompletionStatus::RESET => {
            // Bus/target reset: the midlayer retries, the port is intact.
            tr.result.class = CompletionClass::TransportDisrupted;
        }
        CompletionStatus::ABORTED => {
            tr.result.class = CompletionClass::Reset;
        }
        CompletionStatus::DIF_ERROR => {
            dif_error(&mut tr, dec);
        }
        _ => {
            tr.result.class = CompletionClass::DeviceError;
        }
    }
    tr
}

/// Common tail for the COMPLETE/underrun arms: queueing conditions keep the
/// log line, CHECK CONDITION collects sense, everything else completes
/// quietly if no error class was assigned.
fn sam_status_epilogue(tr: &mut Translation, dec: &DecodedStatus) {
    let sam_status = dec.scsi_status.sam_status();
    if sam_status == sam::TASK_SET_FULL || sam_status == sam::BUSY {
        return;
    }
    if sam_status != sam::CHECK_CONDITION {
        if tr.result.class == CompletionClass::Ok {
            tr.logit = false;
        }
        return;
    }
    if !dec.scsi_status.sense_len_valid() {
        return;
    }
    let declared = dec.sense_declared.min(SENSE_BUFFER_SIZE);
    let chunk = declared.min(dec.sense.len());
    tr.result.sense.extend_from_slice(&dec.sense[..chunk]);
    tr.sense_remaining = declared - chunk;
}

/// DIF tag mismatch: report the failed check as a synthesized CHECK
/// CONDITION. Guard outranks reference tag outranks application tag when
/// several checks failed at once.
fn dif_error(tr: &mut Translation, dec: &DecodedStatus) {
    tr.result.class = CompletionClass::DifError;
    let Some((actual, expected)) = dec.dif else {
        return;
    };
    let ascq = if expected.guard != actual.guard {
        sense::ASCQ_GUARD_CHECK
    } else if expected.ref_tag != actual.ref_tag {
        sense::ASCQ_REF_TAG_CHECK
    } else if expected.app_tag != actual.app_tag {
        sense::ASCQ_APP_TAG_CHECK
    } else {
        tracing::error!(?actual, ?expected, "DIF error without a tag mismatch");
        return;
    };
    tracing::error!(?actual, ?expected, ascq, "DIF tag check failed");
    tr.result.scsi_status = sam::CHECK_CONDITION;
    tr.result.sense = fixed_sense(sense::KEY_ILLEGAL_REQUEST, sense::ASC_DIF_CHECK_FAILED, ascq);
}

/// 18-byte fixed-format sense buffer.
fn fixed_sense(key: u8, asc: u8, ascq: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 18];
    buf[0] = sense::RESPONSE_CODE_FIXED;
    buf[2] = key;
    buf[7] = 10;
    buf[12] = asc;
    buf[13] = ascq;
    buf
}

impl<R: ChipRegisters, E: HbaEvents> Adapter<R, E> {
    pub(crate) fn status_entry(&mut self, queue: usize, raw: &RawResponseEntry) {
        if self.generation.fwi2_capable() {
            // Infallible: the entry is exactly one ring slot.
            let entry = StatusEntryFwi2::read_from_bytes(&raw.bytes).unwrap();
            let Some(command) = self.claim_handle(entry.handle) else {
                return;
            };
            // Clean completion: nothing else in the entry needs decoding.
            if entry.comp_status == CompletionStatus::COMPLETE
                && u16::from(entry.scsi_status) == 0
            {
                self.events
                    .complete_command(command, CommandResult::Scsi(ScsiResult::success()));
                return;
            }
            let dec = decode_fwi2(&entry);
            self.finish_status(queue, command, &dec);
        } else {
            let entry = StatusEntry::read_from_bytes(&raw.bytes).unwrap();
            let Some(command) = self.claim_handle(entry.handle) else {
                return;
            };
            if entry.comp_status == CompletionStatus::COMPLETE
                && u16::from(entry.scsi_status) == 0
            {
                self.events
                    .complete_command(command, CommandResult::Scsi(ScsiResult::success()));
                return;
            }
            let dec = decode_legacy(&entry);
            self.finish_status(queue, command, &dec);
        }
    }

    fn finish_status(&mut self, queue: usize, command: Command, dec: &DecodedStatus) {
        let tr = classify(self.generation, dec, &command);
        if tr.mark_port_lost
            && let Some(index) = command.port
            && self.port.ports.get(index).map(|p| p.state) == Some(PortState::Online)
        {
            self.port.mark_device_lost(index);
        }
        if tr.logit {
            tracing::debug!(
                handle = command.handle,
                comp_status = ?dec.comp_status,
                sam_status = dec.scsi_status.sam_status(),
                residual = tr.result.residual,
                class = ?tr.result.class,
                "command completed with status"
            );
        }
        if tr.sense_remaining > 0 {
            self.rsp_queues[queue].pending_sense = Some(PendingSense {
                command,
                result: tr.result,
                remaining: tr.sense_remaining,
            });
        } else {
            self.events
                .complete_command(command, CommandResult::Scsi(tr.result));
        }
    }

    /// Continuation entries carry nothing but further sense bytes for the
    /// most recent status entry on this ring.
    pub(crate) fn status_cont_entry(&mut self, queue: usize, raw: &RawResponseEntry) {
        let Some(mut pending) = self.rsp_queues[queue].pending_sense.take() else {
            tracing::debug!("status continuation with no sense pending");
            return;
        };
        let entry = StatusContEntry::read_from_bytes(&raw.bytes).unwrap();
        let mut data = entry.data;
        if self.generation.fwi2_capable() {
            fcp_swap(&mut data);
        }
        let take = pending.remaining.min(data.len());
        pending.result.sense.extend_from_slice(&data[..take]);
        pending.remaining -= take;
        if pending.remaining == 0 {
            self.events
                .complete_command(pending.command, CommandResult::Scsi(pending.result));
        } else {
            self.rsp_queues[queue].pending_sense = Some(pending);
        }
    }
}
