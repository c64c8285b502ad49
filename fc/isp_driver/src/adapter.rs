// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-adapter state mutated by the interrupt path: loop and port state
//! machines, deferred-work flags for the DPC worker, the RSCN queue, and the
//! outbound collaborator interface.

use bitfield_struct::bitfield;
use isp_spec::CompletionStatus;
use isp_spec::PortSpeed;

/// Countdown armed when the loop drops; the reconnection logic gives the
/// link this long to come back before declaring devices dead.
pub const LOOP_DOWN_TIME: u32 = 255;

/// Capacity of the per-port RSCN queue. Overflow degrades to a full rescan,
/// it never grows the queue.
pub const RSCN_QUEUE_LEN: usize = 32;

/// Fibre Channel loop state, per port instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    Down,
    Up,
    Update,
    Ready,
    Dead,
}

/// Virtual-port health, meaningful only when `vp_idx != 0`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VpState {
    Active,
    Failed,
}

/// Remote port (target) state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortState {
    Unconfigured,
    Online,
    Lost,
    Dead,
}

/// A 24-bit Fibre Channel port ID.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PortId {
    pub domain: u8,
    pub area: u8,
    pub al_pa: u8,
}

impl PortId {
    pub(crate) fn as_u32(&self) -> u32 {
        (self.domain as u32) << 16 | (self.area as u32) << 8 | self.al_pa as u32
    }
}

/// A remote port known to this port instance.
#[derive(Clone, Debug)]
pub struct RemotePort {
    pub loop_id: u16,
    pub d_id: PortId,
    pub state: PortState,
}

/// Deferred-work flags consumed by the DPC worker thread. The interrupt path
/// only ever sets bits; the worker clears them.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct DpcFlags {
    pub isp_abort_needed: bool,
    pub reset_marker_needed: bool,
    pub loop_resync_needed: bool,
    pub local_loop_update: bool,
    pub rscn_update: bool,
    #[bits(27)]
    _reserved: u32,
}

/// Bounded queue of pending RSCN entries with a sticky overflow flag.
///
/// Entries are enqueued from interrupt context and drained by the deferred
/// rescan logic. On overflow the flag is set and the oldest entries are
/// clobbered; the consumer falls back to a full rescan.
#[derive(Debug)]
pub struct RscnQueue {
    queue: [u32; RSCN_QUEUE_LEN],
    in_idx: usize,
    out_idx: usize,
    overflow: bool,
}

impl RscnQueue {
    pub fn new() -> Self {
        Self {
            queue: [0; RSCN_QUEUE_LEN],
            in_idx: 0,
            out_idx: 0,
            overflow: false,
        }
    }

    /// Enqueues an RSCN port ID. Never blocks and never grows the queue.
    pub fn push(&mut self, entry: u32) {
        self.queue[self.in_idx] = entry;
        self.in_idx = (self.in_idx + 1) % RSCN_QUEUE_LEN;
        if self.in_idx == self.out_idx {
            self.overflow = true;
        }
    }

    /// Dequeues the oldest pending entry. Drained outside interrupt context.
    pub fn pop(&mut self) -> Option<u32> {
        if self.in_idx == self.out_idx && !self.overflow {
            return None;
        }
        let entry = self.queue[self.out_idx];
        self.out_idx = (self.out_idx + 1) % RSCN_QUEUE_LEN;
        self.overflow = false;
        Some(entry)
    }

    /// Whether the queue wrapped since the last drain. Consumers treat this
    /// as "rescan everything".
    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    pub fn clear_overflow(&mut self) {
        self.overflow = false;
    }
}

impl Default for RscnQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-port-instance state. The physical function is instance 0; NPIV
/// virtual ports get their own instance sharing the physical link.
#[derive(Debug)]
pub struct PortInstance {
    pub vp_idx: u8,
    /// This port's own fabric address, used to drop self-referential RSCNs.
    pub d_id: PortId,
    /// Cleared when the adapter is held in reset or marked failed; gates the
    /// fast-post completion path.
    pub online: bool,
    pub management_server_logged_in: bool,
    pub loop_state: LoopState,
    pub loop_down_timer: u32,
    pub vp_state: VpState,
    pub dpc_flags: DpcFlags,
    pub rscn: RscnQueue,
    pub ports: Vec<RemotePort>,
}

impl PortInstance {
    pub fn new(vp_idx: u8, d_id: PortId) -> Self {
        Self {
            vp_idx,
            d_id,
            online: true,
            management_server_logged_in: false,
            loop_state: LoopState::Down,
            loop_down_timer: 0,
            vp_state: VpState::Active,
            dpc_flags: DpcFlags::new(),
            rscn: RscnQueue::new(),
            ports: Vec::new(),
        }
    }

    /// Marks every known remote port lost. Bulk operation used by the
    /// loop-down family of events.
    pub fn mark_all_devices_lost(&mut self) {
        for port in &mut self.ports {
            if port.state == PortState::Online {
                port.state = PortState::Lost;
            }
        }
    }

    /// Marks a single remote port lost.
    pub fn mark_device_lost(&mut self, index: usize) {
        if let Some(port) = self.ports.get_mut(index) {
            port.state = PortState::Lost;
        }
    }

    /// Common loop-down transition: state machine to DOWN, arm the timer,
    /// drop every remote port, fail the virtual port if this is one.
    pub(crate) fn loop_down(&mut self) {
        if self.loop_state != LoopState::Down {
            self.loop_state = LoopState::Down;
            self.loop_down_timer = LOOP_DOWN_TIME;
            self.mark_all_devices_lost();
        }
        if self.vp_idx != 0 {
            self.vp_state = VpState::Failed;
        }
    }
}

/// The kind of in-flight command a handle resolves to. Non-SCSI kinds are
/// the out-of-band async IOCBs; they follow the same handle-matching
/// contract but complete with an [`IocbResult`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Scsi,
    Login,
    Logout,
    TaskManagement,
    ElsPassThrough,
    CtPassThrough,
}

/// An in-flight command context, owned by the outstanding-command table from
/// submission until completion delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    /// Full 32-bit firmware handle: low word is the table slot, high word
    /// the request queue (FWI2 chips).
    pub handle: u32,
    pub kind: CommandKind,
    /// Index of the remote port this command targets, if any; used to mark
    /// the port lost on transport-level completion errors.
    pub port: Option<usize>,
    /// Data buffer length the submitter attached.
    pub buffer_len: u32,
    /// Midlayer underflow floor: fewer transferred bytes than this is an
    /// error even if the firmware says the command succeeded.
    pub underflow: u32,
}

/// Classification of a completed SCSI command, the analog of the midlayer
/// host byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompletionClass {
    Ok,
    Overrun,
    /// Transport-level disruption (port logged out, unavailable, timed out);
    /// the midlayer requeues rather than failing upward.
    TransportDisrupted,
    BusBusy,
    /// Command was aborted by the firmware; midlayer treats it as a reset.
    Reset,
    DifError,
    DeviceError,
}

/// Normalized completion of a SCSI command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScsiResult {
    pub class: CompletionClass,
    pub scsi_status: u8,
    pub residual: u32,
    pub sense: Vec<u8>,
    /// Raw firmware status words (comp status, scsi status, state flags),
    /// carried for diagnostics only.
    pub fw_status: [u16; 3],
}

impl ScsiResult {
    pub(crate) fn success() -> Self {
        Self {
            class: CompletionClass::Ok,
            scsi_status: 0,
            residual: 0,
            sense: Vec::new(),
            fw_status: [0; 3],
        }
    }
}

/// Normalized completion of an out-of-band IOCB (login, logout, task
/// management, ELS/CT pass-through).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IocbResult {
    pub comp_status: CompletionStatus,
    /// Completion-specific words: mailbox status plus detail for mailbox
    /// IOCBs, the error sub-codes for logins and pass-through commands.
    pub data: [u32; 2],
}

/// A command completion, delivered to the submitter exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandResult {
    Scsi(ScsiResult),
    Iocb(IocbResult),
}

/// Asynchronous notifications published to upper layers. These are posted
/// and forgotten; nothing in the interrupt path consumes them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    LipOccurred { lip_id: u16 },
    LinkUp { speed: PortSpeed },
    LinkDown,
    LipReset { subcode: u16 },
    Rscn { affected_id: u32 },
}

/// Decoded virtual-port report-ID acquisition entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VpReport {
    pub vp_index: u8,
    pub acquired: bool,
    pub port_id: PortId,
    pub format: u8,
}

/// Outbound calls the interrupt engine makes on its environment. All
/// implementations must be non-blocking; everything here runs under the
/// hardware lock.
pub trait HbaEvents: Send {
    /// Delivers a completed command back to its submitter.
    fn complete_command(&mut self, command: Command, result: CommandResult);

    /// Schedules a firmware state capture for postmortem analysis.
    fn schedule_firmware_dump(&mut self);

    /// Wakes the DPC worker to service newly set [`DpcFlags`].
    fn wake_dpc(&mut self);

    /// Publishes a link/fabric notification to upper layers.
    fn post_notification(&mut self, notification: Notification);

    /// Hands a report-ID acquisition to the NPIV registration logic.
    fn register_vp_id(&mut self, report: VpReport);

    /// Posts an inter-driver-communication acknowledgement work item.
    fn post_idc_ack(&mut self, mb: [u16; 8]);
}
