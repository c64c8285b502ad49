// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Chip register access, abstracted over the ISP generations.
//!
//! The register file moved and changed width several times between ISP2100
//! and ISP82xx. Rather than replicate each layout bit for bit, the driver
//! consumes a decoded view: the implementation owns the generation-specific
//! offsets and folds the status/semaphore/mailbox-0 read sequence into a
//! single [`InterruptReason`].

/// ISP chip generation. Drives capability checks, not register offsets;
/// offsets live behind [`ChipRegisters`] implementations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IspGeneration {
    Isp2100,
    Isp2200,
    Isp2300,
    Isp24xx,
    Isp25xx,
    Isp81xx,
    Isp82xx,
}

impl IspGeneration {
    /// Whether the chip speaks the FWI2 interface (24xx and later): 32-bit
    /// handles, the second status entry format, swapped FCP data areas.
    pub fn fwi2_capable(&self) -> bool {
        !matches!(self, Self::Isp2100 | Self::Isp2200 | Self::Isp2300)
    }

    /// Number of mailbox-out registers the firmware writes on a completion.
    pub fn mailbox_count(&self) -> usize {
        match self {
            Self::Isp2100 => 8,
            Self::Isp2200 => 24,
            _ => 32,
        }
    }
}

/// The chip's interrupt condition, decoded from the generation-specific
/// status registers at the top of each dispatcher iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterruptReason {
    /// No interrupt condition is pending.
    NotPending,
    /// The RISC processor is paused on a firmware fault.
    RiscPaused,
    /// A synchronous mailbox command completed; register 0 is latched in
    /// the status on legacy chips and re-read on FWI2 chips.
    MailboxComplete { mb0: u16 },
    /// An asynchronous event fired. `mb` holds mailbox registers 1-3; the
    /// decoder fetches any further registers it needs itself.
    AsyncEvent { code: u16, mb: [u16; 3] },
    /// The response ring has unconsumed entries.
    ResponseReady,
    /// Mailbox register 0 held a value outside both the completion and the
    /// event ranges. Acknowledged and otherwise ignored.
    Spurious { mb0: u16 },
}

/// Register-level access to one adapter.
///
/// All methods are non-blocking MMIO. Callers must hold the adapter hardware
/// lock; implementations do not synchronize.
pub trait ChipRegisters: Send {
    /// Reads and decodes the chip interrupt status.
    fn interrupt_reason(&self) -> InterruptReason;

    /// Reads a mailbox-out register.
    fn read_mailbox(&self, index: usize) -> u16;

    /// Clears the RISC interrupt and performs a read-back so the clear is
    /// posted to the bus before the next status read.
    fn clear_risc_interrupt(&self);

    /// Pulses a hard reset into the RISC processor. Recovery proper is the
    /// DPC worker's job; this only stops the firmware where it is.
    fn pulse_risc_reset(&self);

    /// Publishes the driver's response-ring read index so the firmware can
    /// reuse the retired slots.
    fn write_response_index(&self, queue: u16, index: u16);

    /// Whether the underlying bus has disconnected (surprise removal, link
    /// down at the PCI level). Used to suppress escalation on a dead bus.
    fn bus_offline(&self) -> bool;
}

/// Reads a mailbox register until two consecutive reads agree.
///
/// Registers 4 and 5 are unstable while the firmware is still storing the
/// mailbox-out image on some chip revisions. This is a hardware workaround,
/// not incidental duplication; keep it as a named operation.
pub fn debounced_mailbox_read(regs: &dyn ChipRegisters, index: usize) -> u16 {
    let mut first = regs.read_mailbox(index);
    loop {
        let second = regs.read_mailbox(index);
        if first == second {
            return first;
        }
        first = second;
    }
}
