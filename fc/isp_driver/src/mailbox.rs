// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mailbox completion latch.
//!
//! The mailbox command issuer (out of scope here) writes the mailbox-in
//! registers, marks a command active, and blocks on the adapter's mailbox
//! event. This module captures the mailbox-out image when the completion
//! interrupt arrives; the dispatcher signals the waiter after the hardware
//! lock is released.

use crate::registers::ChipRegisters;
use crate::registers::debounced_mailbox_read;

/// Upper bound across all generations; the live count comes from
/// [`crate::registers::IspGeneration::mailbox_count`].
pub const MAX_MAILBOX_REGISTERS: usize = 32;

/// Latched mailbox-out registers plus the flags tying them to a waiter.
pub struct MailboxLatch {
    count: usize,
    out: [u16; MAX_MAILBOX_REGISTERS],
    interrupt_seen: bool,
    command_active: bool,
}

impl MailboxLatch {
    pub fn new(count: usize) -> Self {
        assert!((1..=MAX_MAILBOX_REGISTERS).contains(&count));
        Self {
            count,
            out: [0; MAX_MAILBOX_REGISTERS],
            interrupt_seen: false,
            command_active: false,
        }
    }

    /// Called by the mailbox issuer before handing a command to firmware.
    /// Resets the latch for the next completion.
    pub fn begin_command(&mut self) {
        self.interrupt_seen = false;
        self.command_active = true;
    }

    /// Captures a mailbox completion: latches register 0 from the decoded
    /// interrupt status and reads the remaining registers from hardware.
    ///
    /// Registers 4 and 5 take the debounced read path; they are known to
    /// read unstable mid-store on some revisions.
    pub fn capture(&mut self, mb0: u16, regs: &dyn ChipRegisters) {
        self.interrupt_seen = true;
        self.out[0] = mb0;
        for index in 1..self.count {
            self.out[index] = if index == 4 || index == 5 {
                debounced_mailbox_read(regs, index)
            } else {
                regs.read_mailbox(index)
            };
        }
        if !self.command_active {
            // Diagnostic only; a completion with no waiter is harmless.
            tracing::debug!(mb0, "mailbox completion with no command pending");
        }
    }

    /// True when a completion has been captured since `begin_command`.
    pub fn completed(&self) -> bool {
        self.interrupt_seen
    }

    pub(crate) fn should_wake_waiter(&self) -> bool {
        self.interrupt_seen && self.command_active
    }

    /// Consumes the captured mailbox-out image. At most one waiter consumes
    /// a given completion; the flags reset for the next command.
    pub fn take_completion(&mut self) -> Option<[u16; MAX_MAILBOX_REGISTERS]> {
        if !self.interrupt_seen {
            return None;
        }
        self.interrupt_seen = false;
        self.command_active = false;
        Some(self.out)
    }

    /// Number of registers the firmware writes on this generation.
    pub fn register_count(&self) -> usize {
        self.count
    }
}
