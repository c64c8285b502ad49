// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Top-level interrupt dispatch.
//!
//! [`Hba::handle_interrupt`] is the per-vector entry point. It runs a bounded
//! service loop under the adapter hardware lock: read the chip status,
//! dispatch mailbox completions, async events, and response-ring work, then
//! acknowledge the interrupt. The lock is released exactly once, before any
//! synchronous mailbox waiter is woken.

use crate::adapter::HbaEvents;
use crate::adapter::PortId;
use crate::adapter::PortInstance;
use crate::mailbox::MailboxLatch;
use crate::outstanding::MAX_OUTSTANDING_COMMANDS;
use crate::outstanding::OutstandingCommands;
use crate::registers::ChipRegisters;
use crate::registers::InterruptReason;
use crate::registers::IspGeneration;
use crate::response::ResponseRing;
use event_listener::Event;
use event_listener::EventListener;
use isp_spec::PortSpeed;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

/// Upper bound on dispatcher iterations per interrupt. A chip that still has
/// work after this many rounds will raise another interrupt.
pub const MAX_ISR_ITERATIONS: usize = 50;

/// Interrupt-sharing return value: whether this adapter claimed the
/// interrupt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    Handled,
    NotHandled,
}

/// Construction parameters for an [`Adapter`].
pub struct AdapterConfig {
    pub generation: IspGeneration,
    /// The physical function's fabric address.
    pub port_id: PortId,
    pub request_queues: usize,
    pub request_queue_depth: usize,
    pub response_queues: usize,
    pub response_queue_len: usize,
}

impl AdapterConfig {
    /// Single-queue configuration with the default table depth.
    pub fn new(generation: IspGeneration, port_id: PortId) -> Self {
        Self {
            generation,
            port_id,
            request_queues: 1,
            request_queue_depth: MAX_OUTSTANDING_COMMANDS,
            response_queues: 1,
            response_queue_len: 64,
        }
    }
}

/// Everything the interrupt path touches on one adapter. Callers reach it
/// through [`Hba::lock`]; every method here assumes the hardware lock is
/// held.
pub struct Adapter<R: ChipRegisters, E: HbaEvents> {
    pub(crate) generation: IspGeneration,
    pub(crate) regs: R,
    pub(crate) events: E,
    /// The physical function (vp_idx 0).
    pub(crate) port: PortInstance,
    /// NPIV instances sharing the physical link.
    pub(crate) vports: Vec<PortInstance>,
    pub(crate) req_queues: Vec<OutstandingCommands>,
    pub(crate) rsp_queues: Vec<ResponseRing>,
    pub(crate) mailbox: MailboxLatch,
    pub(crate) link_rate: PortSpeed,
    /// Operational firmware version captured from an ISP84xx alert.
    pub(crate) fw_84xx_version: Option<u32>,
}

impl<R: ChipRegisters, E: HbaEvents> Adapter<R, E> {
    pub fn new(config: AdapterConfig, regs: R, events: E) -> Self {
        Self {
            regs,
            events,
            port: PortInstance::new(0, config.port_id),
            vports: Vec::new(),
            req_queues: (0..config.request_queues)
                .map(|_| OutstandingCommands::new(config.request_queue_depth))
                .collect(),
            rsp_queues: (0..config.response_queues)
                .map(|id| ResponseRing::new(id as u16, config.response_queue_len))
                .collect(),
            mailbox: MailboxLatch::new(config.generation.mailbox_count()),
            link_rate: PortSpeed::Unknown,
            fw_84xx_version: None,
            generation: config.generation,
        }
    }

    /// Registers an NPIV virtual port instance.
    pub fn add_virtual_port(&mut self, vp_idx: u8, port_id: PortId) {
        assert_ne!(vp_idx, 0, "vp index 0 is the physical function");
        self.vports.push(PortInstance::new(vp_idx, port_id));
    }

    pub fn generation(&self) -> IspGeneration {
        self.generation
    }

    pub fn port(&self) -> &PortInstance {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut PortInstance {
        &mut self.port
    }

    pub fn virtual_ports(&self) -> &[PortInstance] {
        &self.vports
    }

    pub fn virtual_ports_mut(&mut self) -> &mut [PortInstance] {
        &mut self.vports
    }

    pub fn request_queue_mut(&mut self, queue: usize) -> &mut OutstandingCommands {
        &mut self.req_queues[queue]
    }

    pub fn response_queue_mut(&mut self, queue: usize) -> &mut ResponseRing {
        &mut self.rsp_queues[queue]
    }

    pub fn mailbox_mut(&mut self) -> &mut MailboxLatch {
        &mut self.mailbox
    }

    pub fn link_rate(&self) -> PortSpeed {
        self.link_rate
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    /// Bounded interrupt service loop. Returns whether a mailbox waiter
    /// should be woken once the hardware lock has been dropped.
    pub(crate) fn service(&mut self, queue: usize) -> bool {
        for _ in 0..MAX_ISR_ITERATIONS {
            match self.regs.interrupt_reason() {
                InterruptReason::RiscPaused => {
                    if self.regs.bus_offline() {
                        // The bus is gone; there is nothing left to reset.
                        break;
                    }
                    tracing::error!("RISC paused, scheduling adapter reset");
                    self.regs.pulse_risc_reset();
                    self.events.schedule_firmware_dump();
                    self.port.dpc_flags.set_isp_abort_needed(true);
                    self.events.wake_dpc();
                    break;
                }
                InterruptReason::NotPending => break,
                InterruptReason::MailboxComplete { mb0 } => {
                    self.mbx_completion(mb0);
                    self.regs.clear_risc_interrupt();
                }
                InterruptReason::AsyncEvent { code, mb } => {
                    self.async_event(code, mb, queue);
                    self.regs.clear_risc_interrupt();
                }
                InterruptReason::ResponseReady => {
                    self.process_response_queue(queue);
                    self.regs.clear_risc_interrupt();
                }
                InterruptReason::Spurious { mb0 } => {
                    tracing::debug!(mb0, "unrecognized interrupt type");
                    self.regs.clear_risc_interrupt();
                }
            }
        }
        self.mailbox.should_wake_waiter()
    }

    fn mbx_completion(&mut self, mb0: u16) {
        let Self { mailbox, regs, .. } = self;
        mailbox.capture(mb0, regs);
    }
}

/// One host adapter: the interrupt engine behind its hardware lock, plus the
/// mailbox waiter signal that must be raised outside it.
pub struct Hba<R: ChipRegisters, E: HbaEvents> {
    state: Mutex<Adapter<R, E>>,
    mailbox_event: Event,
}

impl<R: ChipRegisters, E: HbaEvents> Hba<R, E> {
    pub fn new(config: AdapterConfig, regs: R, events: E) -> Self {
        Self {
            state: Mutex::new(Adapter::new(config, regs, events)),
            mailbox_event: Event::new(),
        }
    }

    /// The adapter hardware lock. Collaborators (command submission, mailbox
    /// issue, DPC worker) take this to touch registers or the outstanding
    /// command tables.
    pub fn lock(&self) -> MutexGuard<'_, Adapter<R, E>> {
        self.state.lock()
    }

    /// Per-interrupt entry point for the vector servicing `queue`.
    ///
    /// Returns [`IrqReturn::NotHandled`] only when the queue identifier does
    /// not resolve; once it does, the interrupt is claimed even if no
    /// actionable condition was found.
    pub fn handle_interrupt(&self, queue: u16) -> IrqReturn {
        let mut state = self.state.lock();
        if (queue as usize) >= state.rsp_queues.len() {
            tracing::error!(queue, "interrupt for unknown response queue");
            return IrqReturn::NotHandled;
        }
        let wake_waiter = state.service(queue as usize);
        drop(state);
        if wake_waiter {
            self.mailbox_event.notify(usize::MAX);
        }
        IrqReturn::Handled
    }

    /// Injects an asynchronous event outside the interrupt path (used by the
    /// mailbox polling path on some generations).
    pub fn async_event(&self, code: u16, mb: [u16; 3]) {
        self.state.lock().async_event(code, mb, 0);
    }

    /// Listener for mailbox completion wake-ups. The mailbox issuer listens
    /// before publishing its command and consumes the latch after waking.
    pub fn mailbox_listener(&self) -> EventListener {
        self.mailbox_event.listen()
    }
}

/// Splits a firmware handle into its request queue (high word) and table
/// slot (low word).
pub(crate) fn split_handle(handle: u32) -> (u16, u16) {
    ((handle >> 16) as u16, handle as u16)
}
