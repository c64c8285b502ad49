// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Asynchronous event decoding.
//!
//! Events arrive as mailbox register 0 (the code) plus registers 1-3; a few
//! fetch further registers on demand. The fast-post completion family is
//! handled first and never touches per-port state. Link-family events replay
//! against every virtual port after the physical function has seen them;
//! per-instance routing happens inside the dispatch.

use crate::adapter::HbaEvents;
use crate::adapter::LOOP_DOWN_TIME;
use crate::adapter::LoopState;
use crate::adapter::Notification;
use crate::adapter::PortInstance;
use crate::adapter::VpState;
use crate::interrupt::Adapter;
use crate::registers::ChipRegisters;
use crate::registers::IspGeneration;
use arrayvec::ArrayVec;
use isp_spec::AsyncEventCode;
use isp_spec::PortSpeed;
use isp_spec::alert_84xx;

/// Events that describe the shared physical link and therefore fan out to
/// every virtual port.
fn is_link_family(event: AsyncEventCode) -> bool {
    matches!(
        event,
        AsyncEventCode::LIP_OCCURRED
            | AsyncEventCode::LOOP_UP
            | AsyncEventCode::LOOP_DOWN
            | AsyncEventCode::LIP_RESET
            | AsyncEventCode::POINT_TO_POINT
            | AsyncEventCode::CHG_IN_CONNECTION
            | AsyncEventCode::PORT_UPDATE
            | AsyncEventCode::RSCN_UPDATE
    )
}

impl<R: ChipRegisters, E: HbaEvents> Adapter<R, E> {
    /// Decodes one async event against the physical function, replaying
    /// link-family events to the virtual ports afterwards. `queue` is the
    /// response queue a ZIO completion notice drains.
    pub fn async_event(&mut self, code: u16, mb: [u16; 3], queue: usize) {
        let event = AsyncEventCode(code);

        if event == AsyncEventCode::ZIO_RESPONSE {
            self.process_response_queue(queue);
            return;
        }
        if let Some(handles) = self.fast_post_handles(event, mb) {
            if self.port.online {
                for handle in handles {
                    self.process_completed_request(handle);
                }
            } else {
                tracing::debug!(?event, "fast-post completion while offline, dropped");
            }
            return;
        }

        let Self {
            generation,
            regs,
            events,
            port,
            vports,
            link_rate,
            fw_84xx_version,
            ..
        } = self;
        let mut cx = EventContext {
            generation: *generation,
            regs,
            events,
            link_rate,
            fw_84xx_version,
        };
        dispatch(&mut cx, port, event, code, mb);
        if is_link_family(event) {
            for state in vports.iter_mut() {
                dispatch(&mut cx, state, event, code, mb);
            }
        }
    }

    /// Decodes the fast-post completion families into their command handles.
    /// Returns `None` for anything that is not a completion event.
    fn fast_post_handles(&self, event: AsyncEventCode, mb: [u16; 3]) -> Option<ArrayVec<u32, 5>> {
        let [m1, m2, m3] = mb;
        let mut handles = ArrayVec::new();
        match event {
            AsyncEventCode::SCSI_COMPLETION | AsyncEventCode::CMPLT_1_32BIT => {
                handles.push(((m2 as u32) << 16) | m1 as u32);
            }
            AsyncEventCode::CMPLT_1_16BIT => {
                handles.push(m1 as u32);
            }
            AsyncEventCode::CMPLT_2_16BIT => {
                handles.push(m1 as u32);
                handles.push(m2 as u32);
            }
            AsyncEventCode::CMPLT_3_16BIT => {
                handles.push(m1 as u32);
                handles.push(m2 as u32);
                handles.push(m3 as u32);
            }
            AsyncEventCode::CMPLT_4_16BIT => {
                handles.push(m1 as u32);
                handles.push(m2 as u32);
                handles.push(m3 as u32);
                handles.push(self.regs.read_mailbox(6) as u32);
            }
            AsyncEventCode::CMPLT_5_16BIT => {
                handles.push(m1 as u32);
                handles.push(m2 as u32);
                handles.push(m3 as u32);
                handles.push(self.regs.read_mailbox(6) as u32);
                handles.push(self.regs.read_mailbox(7) as u32);
            }
            AsyncEventCode::CMPLT_2_32BIT => {
                handles.push(((m2 as u32) << 16) | m1 as u32);
                let mb6 = self.regs.read_mailbox(6) as u32;
                let mb7 = self.regs.read_mailbox(7) as u32;
                handles.push((mb7 << 16) | mb6);
            }
            _ => return None,
        }
        Some(handles)
    }
}

/// Adapter-wide pieces an event may touch besides the port instance.
struct EventContext<'a, R, E> {
    generation: IspGeneration,
    regs: &'a R,
    events: &'a mut E,
    link_rate: &'a mut PortSpeed,
    fw_84xx_version: &'a mut Option<u32>,
}

/// Applies one event to one port instance.
fn dispatch<R: ChipRegisters, E: HbaEvents>(
    cx: &mut EventContext<'_, R, E>,
    state: &mut PortInstance,
    event: AsyncEventCode,
    code: u16,
    mb: [u16; 3],
) {
    let [m1, m2, m3] = mb;
    match event {
        AsyncEventCode::RESET => {
            tracing::debug!("asynchronous reset");
            state.dpc_flags.set_reset_marker_needed(true);
        }
        AsyncEventCode::SYSTEM_ERR => {
            tracing::error!(m1, m2, m3, "firmware system error");
            cx.events.schedule_firmware_dump();
            if cx.generation.fwi2_capable() && m1 == 0 && m2 == 0 {
                // Parity or ECC fault with no error context. The firmware
                // cannot be restarted; take the adapter down.
                tracing::error!("unrecoverable hardware error, adapter offline");
                state.online = false;
            } else {
                state.dpc_flags.set_isp_abort_needed(true);
                cx.events.wake_dpc();
            }
        }
        AsyncEventCode::REQ_TRANSFER_ERR => {
            tracing::error!(m1, "request queue transfer error");
            state.dpc_flags.set_isp_abort_needed(true);
            cx.events.wake_dpc();
        }
        AsyncEventCode::RSP_TRANSFER_ERR => {
            tracing::error!(m1, "response queue transfer error");
            state.dpc_flags.set_isp_abort_needed(true);
            cx.events.wake_dpc();
        }
        AsyncEventCode::WAKEUP_THRES => {
            tracing::debug!(m1, "request queue wake-up threshold");
        }
        AsyncEventCode::LIP_OCCURRED => {
            tracing::info!(lip_id = m1, "LIP occurred");
            state.loop_down();
            state.management_server_logged_in = false;
            cx.events
                .post_notification(Notification::LipOccurred { lip_id: m1 });
        }
        AsyncEventCode::LOOP_UP => {
            // 1Gb chips don't report a speed code.
            *cx.link_rate = match cx.generation {
                IspGeneration::Isp2100 | IspGeneration::Isp2200 => PortSpeed::OneGb,
                _ => PortSpeed::from_event_code(m1),
            };
            tracing::info!(speed = ?*cx.link_rate, "loop up");
            state.management_server_logged_in = false;
            cx.events.post_notification(Notification::LinkUp {
                speed: *cx.link_rate,
            });
        }
        AsyncEventCode::LOOP_DOWN => {
            tracing::info!(m1, m2, m3, "loop down");
            state.loop_down();
            state.management_server_logged_in = false;
            *cx.link_rate = PortSpeed::Unknown;
            cx.events.post_notification(Notification::LinkDown);
        }
        AsyncEventCode::LIP_RESET => {
            tracing::info!(subcode = m1, "LIP reset");
            state.loop_down();
            state.management_server_logged_in = false;
            cx.events
                .post_notification(Notification::LipReset { subcode: m1 });
        }
        AsyncEventCode::POINT_TO_POINT => {
            tracing::debug!("point-to-point mode");
            state.loop_down();
        }
        AsyncEventCode::CHG_IN_CONNECTION => {
            tracing::debug!(m1, "connection mode changed");
            state.loop_down();
        }
        AsyncEventCode::PORT_UPDATE => port_update(state, mb),
        AsyncEventCode::RSCN_UPDATE => rscn_update(cx, state, mb),
        AsyncEventCode::LOOP_INIT_ERR => {
            tracing::warn!(m1, m2, m3, "loop initialization error");
        }
        AsyncEventCode::ISP84XX_ALERT => match m1 {
            alert_84xx::PANIC_RECOVERY => {
                tracing::warn!(m2, m3, "ISP84xx panic recovery");
            }
            alert_84xx::OP_LOGIN_COMPLETE => {
                let version = ((m3 as u32) << 16) | m2 as u32;
                *cx.fw_84xx_version = Some(version);
                tracing::debug!(version, "ISP84xx operational firmware login");
            }
            alert_84xx::DIAG_LOGIN_COMPLETE | alert_84xx::GOLD_LOGIN_COMPLETE => {
                tracing::debug!(subcode = m1, "ISP84xx firmware login");
            }
            other => {
                tracing::debug!(subcode = other, m2, m3, "ISP84xx alert");
            }
        },
        AsyncEventCode::DCBX_START => {
            tracing::debug!(m1, m2, m3, "DCBX started");
        }
        AsyncEventCode::DCBX_PARAM_UPDATE => {
            tracing::debug!(m1, m2, m3, "DCBX parameters changed");
        }
        AsyncEventCode::FCF_CONF_ERR => {
            tracing::warn!(m1, m2, m3, "FCF configuration error");
        }
        AsyncEventCode::IDC_COMPLETE | AsyncEventCode::IDC_NOTIFY | AsyncEventCode::IDC_TIME_EXT => {
            let mb4 = cx.regs.read_mailbox(4);
            let mb5 = cx.regs.read_mailbox(5);
            let mb6 = cx.regs.read_mailbox(6);
            let mb7 = cx.regs.read_mailbox(7);
            tracing::debug!(?event, m1, m2, m3, mb4, mb5, mb6, mb7, "inter-driver communication");
            if event == AsyncEventCode::IDC_NOTIFY {
                let ack_timeout = (mb4 >> 8) & 0xf;
                if ack_timeout != 0 {
                    cx.events.post_idc_ack([code, m1, m2, m3, mb4, mb5, mb6, mb7]);
                }
            }
        }
        _ => {
            tracing::trace!(?event, m1, m2, m3, "unhandled async event");
        }
    }
}

fn port_update(state: &mut PortInstance, mb: [u16; 3]) {
    let [m1, m2, m3] = mb;
    let vp_byte = (m3 & 0xff) as u8;
    let global = m1 == 0xffff;
    let routed = if global {
        vp_byte == 0xff || vp_byte == state.vp_idx
    } else {
        vp_byte == state.vp_idx
    };
    if !routed {
        return;
    }
    if global && m2 == 0x7 {
        // Global N_Port logout: firmware dropped every login. Force the
        // loop down regardless of its current state.
        tracing::info!(vp_idx = state.vp_idx, "global port logout");
        state.loop_state = LoopState::Down;
        state.loop_down_timer = LOOP_DOWN_TIME;
        state.mark_all_devices_lost();
        if state.vp_idx != 0 {
            state.vp_state = VpState::Failed;
        }
        state.management_server_logged_in = false;
        return;
    }
    if state.loop_state != LoopState::Down && state.loop_state != LoopState::Dead {
        // Loop is already up; the update carries no news.
        tracing::debug!(m1, m2, m3, "port update ignored, loop is up");
        return;
    }
    tracing::debug!(m1, m2, m3, "port database update");
    state.loop_down_timer = 0;
    state.management_server_logged_in = false;
    state.mark_all_devices_lost();
    state.dpc_flags.set_loop_resync_needed(true);
    state.dpc_flags.set_local_loop_update(true);
}

fn rscn_update<R: ChipRegisters, E: HbaEvents>(
    cx: &mut EventContext<'_, R, E>,
    state: &mut PortInstance,
    mb: [u16; 3],
) {
    let [m1, m2, m3] = mb;
    let vp_byte = (m3 & 0xff) as u8;
    if vp_byte != 0xff && vp_byte != state.vp_idx {
        return;
    }
    let raw_port_id = ((m1 as u32) << 16) | m2 as u32;
    if raw_port_id & 0xff_ffff == state.d_id.as_u32() {
        // The fabric echoed our own address change back at us.
        tracing::debug!(raw_port_id, "self-referential RSCN ignored");
        return;
    }
    let affected_id = (((m1 & 0x3ff) as u32) << 16) | m2 as u32;
    tracing::debug!(affected_id, vp_idx = state.vp_idx, "RSCN");
    state.rscn.push(affected_id);
    state.loop_down_timer = 0;
    state.management_server_logged_in = false;
    state.dpc_flags.set_rscn_update(true);
    state.dpc_flags.set_loop_resync_needed(true);
    cx.events
        .post_notification(Notification::Rscn { affected_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PortId;
    use crate::adapter::PortState;
    use crate::interrupt::AdapterConfig;
    use crate::adapter::RSCN_QUEUE_LEN;
    use crate::adapter::RemotePort;
    use crate::test_support::TestAdapter;
    use crate::test_support::scsi_command;
    use crate::test_support::test_adapter;

    fn event(adapter: &mut TestAdapter, code: AsyncEventCode, mb: [u16; 3]) {
        adapter.async_event(code.0, mb, 0);
    }

    #[test]
    fn fast_post_completes_without_touching_port_state() {
        let mut adapter = test_adapter(IspGeneration::Isp2300);
        adapter.req_queues[0].insert(7, scsi_command(7));
        event(&mut adapter, AsyncEventCode::CMPLT_1_16BIT, [7, 0, 0]);
        assert_eq!(adapter.events.completions.len(), 1);
        assert!(adapter.events.notifications.is_empty());
        assert_eq!(adapter.port.dpc_flags, crate::adapter::DpcFlags::new());
    }

    #[test]
    fn fast_post_five_handles_fetches_extra_registers() {
        let mut adapter = test_adapter(IspGeneration::Isp2300);
        adapter.regs.mailboxes.borrow_mut()[6] = 14;
        adapter.regs.mailboxes.borrow_mut()[7] = 15;
        for handle in [11u16, 12, 13, 14, 15] {
            adapter.req_queues[0].insert(handle, scsi_command(handle as u32));
        }
        event(&mut adapter, AsyncEventCode::CMPLT_5_16BIT, [11, 12, 13]);
        assert_eq!(adapter.events.completions.len(), 5);
    }

    #[test]
    fn fast_post_32bit_handle_spans_two_registers() {
        // The high word (register 2) selects the request queue, so a second
        // queue is needed to see it take effect.
        let config = AdapterConfig {
            request_queues: 2,
            ..AdapterConfig::new(
                IspGeneration::Isp24xx,
                PortId {
                    domain: 1,
                    area: 2,
                    al_pa: 3,
                },
            )
        };
        let mut adapter = TestAdapter::new(config, Default::default(), Default::default());
        adapter.req_queues[1].insert(0x1a, scsi_command(0x0001_001a));
        event(&mut adapter, AsyncEventCode::SCSI_COMPLETION, [0x1a, 1, 0]);
        assert_eq!(adapter.events.completions.len(), 1);
        assert_eq!(adapter.events.completions[0].0.handle, 0x0001_001a);
    }

    #[test]
    fn fast_post_dropped_while_offline() {
        let mut adapter = test_adapter(IspGeneration::Isp2300);
        adapter.port.online = false;
        adapter.req_queues[0].insert(7, scsi_command(7));
        event(&mut adapter, AsyncEventCode::CMPLT_1_16BIT, [7, 0, 0]);
        assert!(adapter.events.completions.is_empty());
        // The command stays in flight for the reset path to clean up.
        assert!(adapter.req_queues[0].lookup_and_clear(7).unwrap().is_some());
    }

    #[test]
    fn system_error_with_zero_params_takes_fwi2_adapter_offline() {
        let mut adapter = test_adapter(IspGeneration::Isp25xx);
        event(&mut adapter, AsyncEventCode::SYSTEM_ERR, [0, 0, 0]);
        assert_eq!(adapter.events.dumps, 1);
        assert!(!adapter.port.online);
        assert!(!adapter.port.dpc_flags.isp_abort_needed());
    }

    #[test]
    fn system_error_with_context_schedules_abort() {
        let mut adapter = test_adapter(IspGeneration::Isp25xx);
        event(&mut adapter, AsyncEventCode::SYSTEM_ERR, [0x1234, 0, 0]);
        assert_eq!(adapter.events.dumps, 1);
        assert!(adapter.port.online);
        assert!(adapter.port.dpc_flags.isp_abort_needed());
        assert_eq!(adapter.events.dpc_wakes, 1);
    }

    #[test]
    fn loop_down_family_arms_timer_and_notifies() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        adapter.port.loop_state = LoopState::Ready;
        event(&mut adapter, AsyncEventCode::LOOP_DOWN, [0, 0, 0]);
        assert_eq!(adapter.port.loop_state, LoopState::Down);
        assert_eq!(adapter.port.loop_down_timer, LOOP_DOWN_TIME);
        assert_eq!(adapter.link_rate, PortSpeed::Unknown);
        assert_eq!(adapter.events.notifications, vec![Notification::LinkDown]);
    }

    #[test]
    fn loop_up_decodes_speed() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        event(&mut adapter, AsyncEventCode::LOOP_UP, [0x04, 0, 0]);
        assert_eq!(adapter.link_rate, PortSpeed::EightGb);
        assert_eq!(
            adapter.events.notifications,
            vec![Notification::LinkUp {
                speed: PortSpeed::EightGb
            }]
        );
    }

    #[test]
    fn loop_up_on_1g_chip_ignores_speed_code() {
        let mut adapter = test_adapter(IspGeneration::Isp2100);
        event(&mut adapter, AsyncEventCode::LOOP_UP, [0x04, 0, 0]);
        assert_eq!(adapter.link_rate, PortSpeed::OneGb);
    }

    #[test]
    fn global_logout_forces_loop_down_even_when_up() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        adapter.port.loop_state = LoopState::Ready;
        adapter.port.management_server_logged_in = true;
        adapter.port.ports.push(RemotePort {
            loop_id: 1,
            d_id: PortId::default(),
            state: PortState::Online,
        });
        event(&mut adapter, AsyncEventCode::PORT_UPDATE, [0xffff, 0x7, 0xff]);
        assert_eq!(adapter.port.loop_state, LoopState::Down);
        assert_eq!(adapter.port.loop_down_timer, LOOP_DOWN_TIME);
        assert_eq!(adapter.port.ports[0].state, PortState::Lost);
        assert!(!adapter.port.management_server_logged_in);
    }

    #[test]
    fn port_update_ignored_while_loop_is_up() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        adapter.port.loop_state = LoopState::Ready;
        adapter.port.ports.push(RemotePort {
            loop_id: 1,
            d_id: PortId::default(),
            state: PortState::Online,
        });
        event(&mut adapter, AsyncEventCode::PORT_UPDATE, [0x2, 0x6, 0]);
        assert_eq!(adapter.port.ports[0].state, PortState::Online);
        assert!(!adapter.port.dpc_flags.loop_resync_needed());
    }

    #[test]
    fn port_update_while_down_schedules_resync() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        adapter.port.loop_state = LoopState::Down;
        adapter.port.loop_down_timer = 100;
        event(&mut adapter, AsyncEventCode::PORT_UPDATE, [0x2, 0x6, 0]);
        assert_eq!(adapter.port.loop_down_timer, 0);
        assert!(adapter.port.dpc_flags.loop_resync_needed());
        assert!(adapter.port.dpc_flags.local_loop_update());
    }

    #[test]
    fn rscn_masks_reserved_bits_and_queues() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        event(&mut adapter, AsyncEventCode::RSCN_UPDATE, [0xfc02, 0x0304, 0]);
        assert_eq!(adapter.port.rscn.pop(), Some(0x02_0304));
        assert!(adapter.port.dpc_flags.rscn_update());
        assert!(adapter.port.dpc_flags.loop_resync_needed());
        assert_eq!(
            adapter.events.notifications,
            vec![Notification::Rscn {
                affected_id: 0x02_0304
            }]
        );
    }

    #[test]
    fn self_referential_rscn_is_dropped() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        let d_id = adapter.port.d_id;
        let m1 = d_id.domain as u16;
        let m2 = ((d_id.area as u16) << 8) | d_id.al_pa as u16;
        event(&mut adapter, AsyncEventCode::RSCN_UPDATE, [m1, m2, 0]);
        assert_eq!(adapter.port.rscn.pop(), None);
        assert!(adapter.events.notifications.is_empty());
    }

    #[test]
    fn rscn_burst_stays_bounded() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        for i in 0..(2 * RSCN_QUEUE_LEN as u16) {
            event(&mut adapter, AsyncEventCode::RSCN_UPDATE, [1, i, 0]);
        }
        assert!(adapter.port.rscn.overflowed());
    }

    #[test]
    fn link_events_fan_out_to_virtual_ports() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        adapter.add_virtual_port(
            1,
            PortId {
                domain: 9,
                area: 9,
                al_pa: 9,
            },
        );
        adapter.vports[0].loop_state = LoopState::Ready;
        event(&mut adapter, AsyncEventCode::LOOP_DOWN, [0, 0, 0]);
        assert_eq!(adapter.vports[0].loop_state, LoopState::Down);
        assert_eq!(adapter.vports[0].vp_state, VpState::Failed);
    }

    #[test]
    fn port_update_routes_by_vp_index() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        adapter.add_virtual_port(
            2,
            PortId {
                domain: 9,
                area: 9,
                al_pa: 9,
            },
        );
        // Addressed to vp 2 only; the physical port must not resync.
        event(&mut adapter, AsyncEventCode::PORT_UPDATE, [0x5, 0x6, 0x2]);
        assert!(!adapter.port.dpc_flags.loop_resync_needed());
        assert!(adapter.vports[0].dpc_flags.loop_resync_needed());
    }

    #[test]
    fn idc_notify_with_ack_timeout_posts_ack() {
        let mut adapter = test_adapter(IspGeneration::Isp81xx);
        adapter.regs.mailboxes.borrow_mut()[4] = 0x0300;
        event(&mut adapter, AsyncEventCode::IDC_NOTIFY, [1, 2, 3]);
        assert_eq!(adapter.events.idc_acks.len(), 1);
        assert_eq!(
            adapter.events.idc_acks[0],
            [AsyncEventCode::IDC_NOTIFY.0, 1, 2, 3, 0x0300, 0, 0, 0]
        );
    }

    #[test]
    fn idc_complete_does_not_ack() {
        let mut adapter = test_adapter(IspGeneration::Isp81xx);
        event(&mut adapter, AsyncEventCode::IDC_COMPLETE, [1, 2, 3]);
        assert!(adapter.events.idc_acks.is_empty());
    }

    #[test]
    fn alert_84xx_captures_firmware_version() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        event(
            &mut adapter,
            AsyncEventCode::ISP84XX_ALERT,
            [alert_84xx::OP_LOGIN_COMPLETE, 0x0005, 0x0002],
        );
        assert_eq!(adapter.fw_84xx_version, Some(0x0002_0005));
    }

    #[test]
    fn async_reset_requests_marker() {
        let mut adapter = test_adapter(IspGeneration::Isp24xx);
        event(&mut adapter, AsyncEventCode::RESET, [0, 0, 0]);
        assert!(adapter.port.dpc_flags.reset_marker_needed());
    }
}
