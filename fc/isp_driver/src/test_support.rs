// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared test doubles: a scripted register file and a recording event sink.

use crate::adapter::Command;
use crate::adapter::CommandKind;
use crate::adapter::CommandResult;
use crate::adapter::HbaEvents;
use crate::adapter::Notification;
use crate::adapter::PortId;
use crate::adapter::VpReport;
use crate::interrupt::Adapter;
use crate::interrupt::AdapterConfig;
use crate::interrupt::Hba;
use crate::registers::ChipRegisters;
use crate::registers::InterruptReason;
use crate::registers::IspGeneration;
use isp_spec::RawResponseEntry;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::VecDeque;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// Register file that replays a scripted sequence of interrupt reasons and
/// records every side-effecting access.
#[derive(Default)]
pub(crate) struct TestRegisters {
    pub reasons: RefCell<VecDeque<InterruptReason>>,
    pub mailboxes: RefCell<[u16; 32]>,
    pub clears: Cell<usize>,
    pub reset_pulses: Cell<usize>,
    pub response_index_writes: RefCell<Vec<(u16, u16)>>,
    pub offline: Cell<bool>,
}

impl ChipRegisters for TestRegisters {
    fn interrupt_reason(&self) -> InterruptReason {
        self.reasons
            .borrow_mut()
            .pop_front()
            .unwrap_or(InterruptReason::NotPending)
    }

    fn read_mailbox(&self, index: usize) -> u16 {
        self.mailboxes.borrow()[index]
    }

    fn clear_risc_interrupt(&self) {
        self.clears.set(self.clears.get() + 1);
    }

    fn pulse_risc_reset(&self) {
        self.reset_pulses.set(self.reset_pulses.get() + 1);
    }

    fn write_response_index(&self, queue: u16, index: u16) {
        self.response_index_writes.borrow_mut().push((queue, index));
    }

    fn bus_offline(&self) -> bool {
        self.offline.get()
    }
}

/// Event sink that records every outbound call.
#[derive(Default)]
pub(crate) struct TestEvents {
    pub completions: Vec<(Command, CommandResult)>,
    pub dumps: usize,
    pub dpc_wakes: usize,
    pub notifications: Vec<Notification>,
    pub vp_reports: Vec<VpReport>,
    pub idc_acks: Vec<[u16; 8]>,
}

impl HbaEvents for TestEvents {
    fn complete_command(&mut self, command: Command, result: CommandResult) {
        self.completions.push((command, result));
    }

    fn schedule_firmware_dump(&mut self) {
        self.dumps += 1;
    }

    fn wake_dpc(&mut self) {
        self.dpc_wakes += 1;
    }

    fn post_notification(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    fn register_vp_id(&mut self, report: VpReport) {
        self.vp_reports.push(report);
    }

    fn post_idc_ack(&mut self, mb: [u16; 8]) {
        self.idc_acks.push(mb);
    }
}

pub(crate) type TestAdapter = Adapter<TestRegisters, TestEvents>;

fn test_config(generation: IspGeneration) -> AdapterConfig {
    AdapterConfig {
        generation,
        port_id: PortId {
            domain: 1,
            area: 2,
            al_pa: 3,
        },
        request_queues: 1,
        request_queue_depth: 32,
        response_queues: 1,
        response_queue_len: 8,
    }
}

pub(crate) fn test_adapter(generation: IspGeneration) -> TestAdapter {
    Adapter::new(
        test_config(generation),
        TestRegisters::default(),
        TestEvents::default(),
    )
}

pub(crate) fn test_hba(generation: IspGeneration) -> Hba<TestRegisters, TestEvents> {
    Hba::new(
        test_config(generation),
        TestRegisters::default(),
        TestEvents::default(),
    )
}

/// A SCSI command context with a 4 KiB buffer and no underflow floor.
pub(crate) fn scsi_command(handle: u32) -> Command {
    Command {
        handle,
        kind: CommandKind::Scsi,
        port: None,
        buffer_len: 4096,
        underflow: 0,
    }
}

pub(crate) fn raw_entry<T: IntoBytes + Immutable>(entry: &T) -> RawResponseEntry {
    RawResponseEntry::from_entry(entry)
}
