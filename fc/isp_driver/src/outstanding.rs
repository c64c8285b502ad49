// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The outstanding-command table: one slot per firmware handle, per request
//! queue. A handle's low 16 bits are its slot index; the high 16 bits select
//! the request queue on FWI2 chips.

use crate::adapter::Command;
use thiserror::Error;

/// Default table depth per request queue.
pub const MAX_OUTSTANDING_COMMANDS: usize = 1024;

/// A failed handle lookup. Both cases mean firmware and driver disagree
/// about what is in flight, which the caller escalates to an ISP abort.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    #[error("handle {handle:#x} out of range")]
    OutOfRange { handle: u16 },
    #[error("no command outstanding at handle {handle:#x}")]
    Empty { handle: u16 },
}

enum Slot {
    Empty,
    Pending(Command),
    /// The submitter reclaimed the command context (midlayer abort) while
    /// the handle was still posted to firmware. A completion for it is a
    /// silent no-op, not a protocol error.
    Returned,
}

/// Per-request-queue table mapping a 16-bit handle to its in-flight command.
///
/// All operations require the adapter hardware lock; the table itself has no
/// interior synchronization.
pub struct OutstandingCommands {
    slots: Vec<Slot>,
}

impl OutstandingCommands {
    pub fn new(depth: usize) -> Self {
        Self {
            slots: (0..depth).map(|_| Slot::Empty).collect(),
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Posts a command at `handle`. Called by the submission path before the
    /// request is handed to firmware.
    ///
    /// Panics if the slot is occupied; the submitter allocates handles and
    /// must not reuse one that is still in flight.
    pub fn insert(&mut self, handle: u16, command: Command) {
        let slot = &mut self.slots[handle as usize];
        assert!(
            matches!(slot, Slot::Empty),
            "handle {handle:#x} already in flight"
        );
        *slot = Slot::Pending(command);
    }

    /// Detaches the command context at `handle` without freeing the slot,
    /// modeling a midlayer abort racing a firmware completion.
    pub fn mark_returned(&mut self, handle: u16) {
        if let Some(slot @ Slot::Pending(_)) = self.slots.get_mut(handle as usize) {
            *slot = Slot::Returned;
        }
    }

    /// Atomically clears the slot and returns the command, enforcing
    /// at-most-once delivery.
    ///
    /// `Ok(None)` means the handle was valid but its command context was
    /// already reclaimed; the completion is dropped silently. A second
    /// lookup for the same handle reports [`HandleError::Empty`].
    pub fn lookup_and_clear(&mut self, handle: u16) -> Result<Option<Command>, HandleError> {
        let slot = self
            .slots
            .get_mut(handle as usize)
            .ok_or(HandleError::OutOfRange { handle })?;
        match std::mem::replace(slot, Slot::Empty) {
            Slot::Empty => Err(HandleError::Empty { handle }),
            Slot::Pending(command) => Ok(Some(command)),
            Slot::Returned => Ok(None),
        }
    }
}
