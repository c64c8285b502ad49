// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire formats for the QLogic ISP family of Fibre Channel HBAs.
//!
//! This crate defines the on-wire layouts the firmware produces: response-ring
//! entries (both the legacy 2xxx format and the FWI2 24xx+ format), mailbox
//! completion codes, asynchronous event codes, and the SCSI status flag words
//! embedded in status entries.
//!
//! Layouts are little-endian, matching the ISP DMA byte order. Each 64-byte
//! ring entry is decoded exactly once into a generation-neutral record by the
//! driver; nothing in this crate carries behavior beyond field access.

#![expect(missing_docs)] // constants/fields are self-explanatory
#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use core::fmt;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Every response-ring entry is a fixed 64-byte IOCB.
pub const RESPONSE_ENTRY_SIZE: usize = 64;

/// Sentinel written over a ring entry's leading dword once the driver has
/// consumed it. The firmware never produces this value, so a slot whose
/// signature equals the sentinel has not been rewritten by DMA since the
/// driver last retired it.
pub const RESPONSE_PROCESSED: u32 = 0xDEAD_DEAD;

/// Response-ring entry type tags.
pub mod entry_type {
    pub const STATUS: u8 = 0x03;
    pub const MARKER: u8 = 0x04;
    pub const STATUS_CONT: u8 = 0x10;
    pub const TSK_MGMT: u8 = 0x14;
    pub const STATUS_21: u8 = 0x21;
    pub const STATUS_22: u8 = 0x22;
    pub const CT_PASSTHRU: u8 = 0x29;
    pub const VP_RPT_ID: u8 = 0x32;
    pub const MBX_IOCB: u8 = 0x39;
    pub const LOGINOUT_PORT: u8 = 0x52;
    pub const ELS_PASSTHRU: u8 = 0x53;
}

/// Common 4-byte header shared by every IOCB.
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EntryHeader {
    pub entry_type: u8,
    pub entry_count: u8,
    pub sys_define: u8,
    /// Nonzero when the firmware flags the entry itself as malformed or
    /// aborted; such entries carry no valid payload beyond the handle.
    pub entry_status: u8,
}

/// Header plus the command handle, the prefix common to all completion-bearing
/// entries. Used to salvage the handle out of error-flagged entries.
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EntryPrefix {
    pub header: EntryHeader,
    pub handle: u32,
}

/// A raw, untyped response-ring slot.
#[repr(C)]
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RawResponseEntry {
    pub bytes: [u8; RESPONSE_ENTRY_SIZE],
}

impl RawResponseEntry {
    /// The leading dword, compared against [`RESPONSE_PROCESSED`].
    pub fn signature(&self) -> u32 {
        u32::from_le_bytes(self.bytes[..4].try_into().unwrap())
    }

    pub fn header(&self) -> EntryHeader {
        EntryHeader::read_from_prefix(&self.bytes).unwrap().0
    }

    pub fn prefix(&self) -> EntryPrefix {
        EntryPrefix::read_from_prefix(&self.bytes).unwrap().0
    }

    /// Builds a raw slot from a typed entry, zero-padding to 64 bytes.
    ///
    /// Panics if the typed entry is larger than a ring slot.
    pub fn from_entry<T: IntoBytes + Immutable + ?Sized>(entry: &T) -> Self {
        let src = entry.as_bytes();
        let mut bytes = [0u8; RESPONSE_ENTRY_SIZE];
        bytes[..src.len()].copy_from_slice(src);
        Self { bytes }
    }
}

impl fmt::Debug for RawResponseEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResponseEntry")
            .field("header", &self.header())
            .finish()
    }
}

/// Firmware completion status, the `comp_status` word of a status entry.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CompletionStatus(pub u16);

impl CompletionStatus {
    pub const COMPLETE: Self = Self(0x00);
    pub const INCOMPLETE: Self = Self(0x01);
    pub const DMA_ERROR: Self = Self(0x02);
    pub const TRANSPORT_ERROR: Self = Self(0x03);
    pub const RESET: Self = Self(0x04);
    pub const ABORTED: Self = Self(0x05);
    pub const TIMEOUT: Self = Self(0x06);
    pub const DATA_OVERRUN: Self = Self(0x07);
    pub const DIF_ERROR: Self = Self(0x0c);
    pub const DATA_UNDERRUN: Self = Self(0x15);
    pub const QUEUE_FULL: Self = Self(0x1c);
    pub const PORT_UNAVAILABLE: Self = Self(0x28);
    pub const PORT_LOGGED_OUT: Self = Self(0x29);
    pub const PORT_CONFIG_CHG: Self = Self(0x2a);
    pub const PORT_BUSY: Self = Self(0x2b);
}

impl fmt::Debug for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::COMPLETE => "COMPLETE",
            Self::INCOMPLETE => "INCOMPLETE",
            Self::DMA_ERROR => "DMA_ERROR",
            Self::TRANSPORT_ERROR => "TRANSPORT_ERROR",
            Self::RESET => "RESET",
            Self::ABORTED => "ABORTED",
            Self::TIMEOUT => "TIMEOUT",
            Self::DATA_OVERRUN => "DATA_OVERRUN",
            Self::DIF_ERROR => "DIF_ERROR",
            Self::DATA_UNDERRUN => "DATA_UNDERRUN",
            Self::QUEUE_FULL => "QUEUE_FULL",
            Self::PORT_UNAVAILABLE => "PORT_UNAVAILABLE",
            Self::PORT_LOGGED_OUT => "PORT_LOGGED_OUT",
            Self::PORT_CONFIG_CHG => "PORT_CONFIG_CHG",
            Self::PORT_BUSY => "PORT_BUSY",
            _ => return write!(f, "CompletionStatus({:#x})", self.0),
        };
        f.pad(name)
    }
}

/// The `scsi_status` word of a status entry: the SAM status byte in the low
/// bits plus validity flags for the optional trailing fields.
#[bitfield(u16)]
#[derive(PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ScsiStatus {
    pub sam_status: u8,
    pub response_info_valid: bool,
    pub sense_len_valid: bool,
    pub residual_over: bool,
    pub residual_under: bool,
    #[bits(4)]
    _reserved: u8,
}

/// SAM-4 status byte values.
pub mod sam {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const TASK_SET_FULL: u8 = 0x28;
}

/// `status_flags` bit set when the firmware sent an implicit logout alongside
/// a command timeout. Only meaningful in the legacy status entry format.
pub const SF_LOGOUT_SENT: u16 = 1 << 8;

/// Status entry, legacy 2100/2200/2300 format.
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct StatusEntry {
    pub header: EntryHeader,
    pub handle: u32,
    pub scsi_status: ScsiStatus,
    pub comp_status: CompletionStatus,
    pub state_flags: u16,
    pub status_flags: u16,
    pub rsp_info_len: u16,
    pub req_sense_length: u16,
    pub residual_length: u32,
    pub rsp_info: [u8; 8],
    pub req_sense_data: [u8; 32],
}

const _: () = assert!(size_of::<StatusEntry>() == RESPONSE_ENTRY_SIZE);

/// Status entry, FWI2 (24xx and later) format. The `data` area holds FCP
/// response info followed by sense bytes, byte-swapped per 32-bit word on the
/// wire; see [`fcp_swap`].
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct StatusEntryFwi2 {
    pub header: EntryHeader,
    pub handle: u32,
    pub comp_status: CompletionStatus,
    pub ox_id: u16,
    pub residual_len: u32,
    pub reserved1: u16,
    pub state_flags: u16,
    pub retry_delay: u16,
    pub scsi_status: ScsiStatus,
    /// Residual as computed by the firmware from the actual frames moved.
    pub rsp_residual_count: u32,
    pub sense_len: u32,
    pub rsp_data_len: u32,
    pub data: [u8; 28],
}

const _: () = assert!(size_of::<StatusEntryFwi2>() == RESPONSE_ENTRY_SIZE);

/// Byte offsets of the DIF tag tuples within [`StatusEntryFwi2::data`] when
/// `comp_status` is [`CompletionStatus::DIF_ERROR`].
pub const DIF_ACTUAL_OFFSET: usize = 12;
pub const DIF_EXPECTED_OFFSET: usize = 20;

/// A guard/app-tag/ref-tag tuple as carried in a DIF error entry. Tags are
/// big-endian on the wire, per the T10 DIF block format.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DifTags {
    pub ref_tag: u32,
    pub app_tag: u16,
    pub guard: u16,
}

impl DifTags {
    /// Parses a tuple from an 8-byte region of the status entry data area.
    pub fn parse(data: &[u8]) -> Self {
        Self {
            ref_tag: u32::from_be_bytes(data[0..4].try_into().unwrap()),
            app_tag: u16::from_be_bytes(data[4..6].try_into().unwrap()),
            guard: u16::from_be_bytes(data[6..8].try_into().unwrap()),
        }
    }
}

/// Multi-handle fast completion, 32-bit handles (legacy chips).
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Status21Entry {
    pub entry_type: u8,
    pub entry_count: u8,
    pub handle_count: u8,
    pub entry_status: u8,
    pub handle: [u32; 15],
}

const _: () = assert!(size_of::<Status21Entry>() == RESPONSE_ENTRY_SIZE);

/// Multi-handle fast completion, 16-bit handles (legacy chips).
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Status22Entry {
    pub entry_type: u8,
    pub entry_count: u8,
    pub handle_count: u8,
    pub entry_status: u8,
    pub handle: [u16; 30],
}

const _: () = assert!(size_of::<Status22Entry>() == RESPONSE_ENTRY_SIZE);

/// Continuation of a status entry whose sense data exceeded one entry.
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct StatusContEntry {
    pub header: EntryHeader,
    pub data: [u8; 60],
}

const _: () = assert!(size_of::<StatusContEntry>() == RESPONSE_ENTRY_SIZE);

/// Mailbox IOCB completion (legacy async login/logout commands).
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MbxIocbEntry {
    pub header: EntryHeader,
    pub handle: u32,
    pub status: u16,
    pub state_flags: u16,
    pub status_flags: u16,
    pub reserved1: u16,
    /// Mailbox-out image: registers 0-3, 6 and 7 (4 and 5 are reserved).
    pub mb: [u16; 8],
    pub reserved2: [u8; 32],
}

const _: () = assert!(size_of::<MbxIocbEntry>() == RESPONSE_ENTRY_SIZE);

/// Login/logout port IOCB completion (FWI2).
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct LogioEntry {
    pub header: EntryHeader,
    pub handle: u32,
    pub comp_status: CompletionStatus,
    pub nport_handle: u16,
    pub control_flags: u16,
    pub vp_index: u8,
    pub reserved1: u8,
    pub port_id: [u8; 3],
    pub reserved2: u8,
    pub io_parameter: [u32; 11],
}

const _: () = assert!(size_of::<LogioEntry>() == RESPONSE_ENTRY_SIZE);

/// `io_parameter[0]` sub-codes reported on a failed login.
pub mod logio_subcode {
    pub const PORT_ID_USED: u32 = 0x1a;
    pub const LOOP_ID_USED: u32 = 0x1b;
}

/// ELS/CT pass-through completion (FWI2). Both entry types share this shape.
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ElsCtEntry {
    pub header: EntryHeader,
    pub handle: u32,
    pub comp_status: CompletionStatus,
    pub nport_handle: u16,
    pub total_byte_count: u32,
    pub error_subcode_1: u32,
    pub error_subcode_2: u32,
    pub reserved: [u8; 40],
}

const _: () = assert!(size_of::<ElsCtEntry>() == RESPONSE_ENTRY_SIZE);

/// Virtual-port report-ID acquisition (24xx and later).
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VpRptIdEntry {
    pub header: EntryHeader,
    pub reserved1: u32,
    pub vp_acquired: u8,
    pub vp_setup: u8,
    pub vp_index: u8,
    pub reserved2: u8,
    pub port_id: [u8; 3],
    pub format: u8,
    pub reserved3: [u8; 48],
}

const _: () = assert!(size_of::<VpRptIdEntry>() == RESPONSE_ENTRY_SIZE);

/// Asynchronous event code, delivered in mailbox register 0.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AsyncEventCode(pub u16);

impl AsyncEventCode {
    pub const RESET: Self = Self(0x8001);
    pub const SYSTEM_ERR: Self = Self(0x8002);
    pub const REQ_TRANSFER_ERR: Self = Self(0x8003);
    pub const RSP_TRANSFER_ERR: Self = Self(0x8004);
    pub const WAKEUP_THRES: Self = Self(0x8005);
    pub const ISP84XX_ALERT: Self = Self(0x800f);
    pub const LIP_OCCURRED: Self = Self(0x8010);
    pub const LOOP_UP: Self = Self(0x8011);
    pub const LOOP_DOWN: Self = Self(0x8012);
    pub const LIP_RESET: Self = Self(0x8013);
    pub const PORT_UPDATE: Self = Self(0x8014);
    pub const RSCN_UPDATE: Self = Self(0x8015);
    pub const DCBX_START: Self = Self(0x8016);
    pub const LOOP_INIT_ERR: Self = Self(0x8017);
    pub const DCBX_PARAM_UPDATE: Self = Self(0x8019);
    pub const FCF_CONF_ERR: Self = Self(0x801a);
    pub const SCSI_COMPLETION: Self = Self(0x8020);
    pub const CMPLT_1_16BIT: Self = Self(0x8021);
    pub const CMPLT_2_16BIT: Self = Self(0x8022);
    pub const CMPLT_3_16BIT: Self = Self(0x8023);
    pub const CMPLT_4_16BIT: Self = Self(0x8024);
    pub const CMPLT_5_16BIT: Self = Self(0x8025);
    pub const POINT_TO_POINT: Self = Self(0x8030);
    pub const CMPLT_1_32BIT: Self = Self(0x8031);
    pub const CMPLT_2_32BIT: Self = Self(0x8032);
    pub const CHG_IN_CONNECTION: Self = Self(0x8036);
    pub const ZIO_RESPONSE: Self = Self(0x8040);
    pub const IDC_COMPLETE: Self = Self(0x8100);
    pub const IDC_NOTIFY: Self = Self(0x8101);
    pub const IDC_TIME_EXT: Self = Self(0x8102);
}

impl fmt::Debug for AsyncEventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::RESET => "RESET",
            Self::SYSTEM_ERR => "SYSTEM_ERR",
            Self::REQ_TRANSFER_ERR => "REQ_TRANSFER_ERR",
            Self::RSP_TRANSFER_ERR => "RSP_TRANSFER_ERR",
            Self::WAKEUP_THRES => "WAKEUP_THRES",
            Self::ISP84XX_ALERT => "ISP84XX_ALERT",
            Self::LIP_OCCURRED => "LIP_OCCURRED",
            Self::LOOP_UP => "LOOP_UP",
            Self::LOOP_DOWN => "LOOP_DOWN",
            Self::LIP_RESET => "LIP_RESET",
            Self::PORT_UPDATE => "PORT_UPDATE",
            Self::RSCN_UPDATE => "RSCN_UPDATE",
            Self::DCBX_START => "DCBX_START",
            Self::LOOP_INIT_ERR => "LOOP_INIT_ERR",
            Self::DCBX_PARAM_UPDATE => "DCBX_PARAM_UPDATE",
            Self::FCF_CONF_ERR => "FCF_CONF_ERR",
            Self::SCSI_COMPLETION => "SCSI_COMPLETION",
            Self::CMPLT_1_16BIT => "CMPLT_1_16BIT",
            Self::CMPLT_2_16BIT => "CMPLT_2_16BIT",
            Self::CMPLT_3_16BIT => "CMPLT_3_16BIT",
            Self::CMPLT_4_16BIT => "CMPLT_4_16BIT",
            Self::CMPLT_5_16BIT => "CMPLT_5_16BIT",
            Self::POINT_TO_POINT => "POINT_TO_POINT",
            Self::CMPLT_1_32BIT => "CMPLT_1_32BIT",
            Self::CMPLT_2_32BIT => "CMPLT_2_32BIT",
            Self::CHG_IN_CONNECTION => "CHG_IN_CONNECTION",
            Self::ZIO_RESPONSE => "ZIO_RESPONSE",
            Self::IDC_COMPLETE => "IDC_COMPLETE",
            Self::IDC_NOTIFY => "IDC_NOTIFY",
            Self::IDC_TIME_EXT => "IDC_TIME_EXT",
            _ => return write!(f, "AsyncEventCode({:#x})", self.0),
        };
        f.pad(name)
    }
}

/// Mailbox command completion statuses, delivered in mailbox register 0.
pub mod mbs {
    pub const COMMAND_COMPLETE: u16 = 0x4000;
    pub const INVALID_COMMAND: u16 = 0x4001;
    pub const HOST_INTERFACE_ERROR: u16 = 0x4002;
    pub const TEST_FAILED: u16 = 0x4003;
    pub const COMMAND_ERROR: u16 = 0x4005;
    pub const COMMAND_PARAMETER_ERROR: u16 = 0x4006;
    pub const PORT_ID_USED: u16 = 0x4007;
    pub const LOOP_ID_USED: u16 = 0x4008;
    pub const ALL_IDS_IN_USE: u16 = 0x4009;
    pub const NOT_LOGGED_IN: u16 = 0x400a;

    /// Some firmware revisions report 0x30 for a login IOCB that actually
    /// completed. Known quirk; treated as [`COMMAND_COMPLETE`] for login
    /// commands only. Do not generalize.
    pub const LOGIN_COMPLETE_QUIRK: u16 = 0x30;
}

/// Mailbox register 0 ranges that distinguish a synchronous command
/// completion from an async event on legacy chips.
pub const MBS_RANGE_START: u16 = 0x4000;
pub const MBA_RANGE_START: u16 = 0x8000;

/// ISP84xx alert sub-codes (mailbox register 1 of an `ISP84XX_ALERT`).
pub mod alert_84xx {
    pub const PANIC_RECOVERY: u16 = 0x1;
    pub const OP_LOGIN_COMPLETE: u16 = 0x2;
    pub const DIAG_LOGIN_COMPLETE: u16 = 0x3;
    pub const GOLD_LOGIN_COMPLETE: u16 = 0x4;
}

/// Link rate reported by a loop-up event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortSpeed {
    OneGb,
    TwoGb,
    FourGb,
    EightGb,
    TenGb,
    Unknown,
}

impl PortSpeed {
    /// Decodes the speed code in mailbox register 1 of a loop-up event.
    /// Unrecognized codes map to `Unknown`.
    pub fn from_event_code(code: u16) -> Self {
        match code {
            0x00 => Self::OneGb,
            0x01 => Self::TwoGb,
            0x03 => Self::FourGb,
            0x04 => Self::EightGb,
            0x13 => Self::TenGb,
            _ => Self::Unknown,
        }
    }
}

/// Swaps each 32-bit word of an FCP data area in place. The FWI2 firmware
/// DMAs response info and sense bytes as big-endian words.
pub fn fcp_swap(data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(4) {
        chunk.reverse();
    }
}

/// Sense data synthesized by the driver (DIF errors) uses the fixed format.
pub mod sense {
    /// Fixed-format sense, current error.
    pub const RESPONSE_CODE_FIXED: u8 = 0x70;
    pub const KEY_ILLEGAL_REQUEST: u8 = 0x05;
    /// ASC for all three DIF check failures.
    pub const ASC_DIF_CHECK_FAILED: u8 = 0x10;
    pub const ASCQ_GUARD_CHECK: u8 = 0x01;
    pub const ASCQ_APP_TAG_CHECK: u8 = 0x02;
    pub const ASCQ_REF_TAG_CHECK: u8 = 0x03;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_entry_signature_tracks_leading_dword() {
        let mut raw = RawResponseEntry::from_entry(&[0u8; 0][..]);
        assert_eq!(raw.signature(), 0);
        raw.bytes[..4].copy_from_slice(&RESPONSE_PROCESSED.to_le_bytes());
        assert_eq!(raw.signature(), RESPONSE_PROCESSED);
    }

    #[test]
    fn status_entry_roundtrips_through_raw_slot() {
        let entry = StatusEntry {
            header: EntryHeader {
                entry_type: entry_type::STATUS,
                entry_count: 1,
                sys_define: 0,
                entry_status: 0,
            },
            handle: 0x12,
            scsi_status: ScsiStatus::new().with_sam_status(sam::CHECK_CONDITION),
            comp_status: CompletionStatus::COMPLETE,
            state_flags: 0,
            status_flags: 0,
            rsp_info_len: 0,
            req_sense_length: 18,
            residual_length: 0,
            rsp_info: [0; 8],
            req_sense_data: [0xaa; 32],
        };
        let raw = RawResponseEntry::from_entry(&entry);
        assert_eq!(raw.header().entry_type, entry_type::STATUS);
        let parsed = StatusEntry::read_from_bytes(&raw.bytes).unwrap();
        assert_eq!(parsed.handle, 0x12);
        assert_eq!(parsed.req_sense_length, 18);
    }

    #[test]
    fn fcp_swap_reverses_each_word() {
        let mut data = [1, 2, 3, 4, 5, 6, 7, 8];
        fcp_swap(&mut data);
        assert_eq!(data, [4, 3, 2, 1, 8, 7, 6, 5]);
    }

    #[test]
    fn dif_tags_parse_big_endian() {
        let data = [0x00, 0x00, 0x00, 0x10, 0x00, 0x22, 0xbe, 0xef];
        let tags = DifTags::parse(&data);
        assert_eq!(tags.ref_tag, 0x10);
        assert_eq!(tags.app_tag, 0x22);
        assert_eq!(tags.guard, 0xbeef);
    }

    #[test]
    fn port_speed_decode() {
        assert_eq!(PortSpeed::from_event_code(0x00), PortSpeed::OneGb);
        assert_eq!(PortSpeed::from_event_code(0x13), PortSpeed::TenGb);
        assert_eq!(PortSpeed::from_event_code(0x2f), PortSpeed::Unknown);
    }
}
