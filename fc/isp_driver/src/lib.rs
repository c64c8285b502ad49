// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt service engine for QLogic ISP Fibre Channel HBAs.
//!
//! The driver front half (command submission, mailbox issue, the DPC worker)
//! is out of scope here; this crate owns the back half: deciding what an
//! interrupt means, draining the response rings, matching completions to
//! outstanding commands, and decoding asynchronous firmware events.
//!
//! The hardware surface is the [`registers::ChipRegisters`] trait; the
//! environment surface is [`adapter::HbaEvents`]. Everything in between runs
//! under the adapter hardware lock owned by [`interrupt::Hba`].

#![expect(missing_docs)] // fields and accessors are self-explanatory
#![forbid(unsafe_code)]

pub mod adapter;
mod aen;
pub mod interrupt;
pub mod mailbox;
pub mod outstanding;
pub mod registers;
pub mod response;
mod status;

#[cfg(test)]
mod test_support;

pub use interrupt::Adapter;
pub use interrupt::AdapterConfig;
pub use interrupt::Hba;
pub use interrupt::IrqReturn;
