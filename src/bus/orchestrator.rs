//! Tick-time frame movement: outbound PCM assembly, inbound PCM demux and
//! receive-path dispatch.

use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::frame::{Frame, OpCode, Packet, PcmSlots, PcmView};
use crate::sync::SyncMode;

use super::Bus;

/// What the receive path decided about an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxDisposition {
    /// Sync-flagged PCM frame: the caller must run the tick sequence now
    TickNow,
    /// Command frame queued for the receive worker
    Queued,
    /// Consumed (non-sync PCM) or dropped
    Handled,
}

impl Bus {
    /// Route one frame arriving from the transport.
    ///
    /// PCM frames go to the tick-drained inbound queue; the sync-flagged
    /// one per tick asks the caller to run the tick sequence. Everything
    /// else lands on the receive queue for command dispatch.
    pub fn frame_received(&self, frame: Frame) -> RxDisposition {
        self.counters.rx_frames.fetch_add(1, Ordering::Relaxed);
        match frame.first_opcode() {
            Some(OpCode::PcmRead) => {
                let sync = frame.is_sync_tagged();
                if let Err(frame) = self.pcm_inbound.enqueue(frame) {
                    if let Some(n) = self.gates.pcm_drop.check() {
                        tracing::debug!(bus = %self.name(), dropped = n, "pcm inbound queue full");
                    }
                    self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    self.free_recv_frame(frame);
                }
                if sync {
                    self.counters.pcm_rx_ticks.fetch_add(1, Ordering::Relaxed);
                    RxDisposition::TickNow
                } else {
                    self.counters.frag_frames.fetch_add(1, Ordering::Relaxed);
                    RxDisposition::Handled
                }
            }
            Some(_) => {
                if let Err(frame) = self.receive_queue.enqueue(frame) {
                    if let Some(n) = self.gates.pcm_drop.check() {
                        tracing::warn!(bus = %self.name(), dropped = n, "receive queue full");
                    }
                    self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    self.free_recv_frame(frame);
                    return RxDisposition::Handled;
                }
                self.rx_pending.notify_one();
                RxDisposition::Queued
            }
            None => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                if let Some(n) = self.gates.bad_pcm.check() {
                    tracing::warn!(bus = %self.name(), errors = n, "frame with malformed first header");
                }
                self.free_recv_frame(frame);
                RxDisposition::Handled
            }
        }
    }

    /// Dispatch every queued command frame.
    ///
    /// Returns the sync modes newly entered through acks, so the caller
    /// can update the reference election.
    pub fn receive_tick(&self) -> Vec<SyncMode> {
        let mut transitions = Vec::new();
        while let Some(frame) = self.receive_queue.dequeue() {
            self.dispatch_command_frame(&frame, &mut transitions);
            self.free_recv_frame(frame);
        }
        transitions
    }

    fn dispatch_command_frame(&self, frame: &Frame, transitions: &mut Vec<SyncMode>) {
        for result in frame.packets() {
            let packet = match result {
                Ok(p) => p,
                Err(e) => {
                    self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(n) = self.gates.bad_pcm.check() {
                        tracing::warn!(bus = %self.name(), errors = n, error = %e, "malformed packet in command frame");
                    }
                    return;
                }
            };
            match packet.header.opcode {
                OpCode::SyncSource => {
                    let Some((mode, drift)) = parse_sync_ack(&packet.payload) else {
                        self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    if let Some(entered) = self.got_new_sync_ack(mode, drift) {
                        transitions.push(entered);
                    }
                }
                OpCode::RegisterReply => match self.device(packet.header.addr) {
                    Some(device) => device.family().register_reply(&device, &packet.payload),
                    None => {
                        if let Some(n) = self.gates.unknown_device.check() {
                            tracing::debug!(
                                bus = %self.name(), addr = %packet.header.addr, count = n,
                                "register reply for unknown device",
                            );
                        }
                    }
                },
                other => {
                    tracing::trace!(bus = %self.name(), opcode = ?other, "unhandled inbound opcode");
                }
            }
        }
    }

    /// Run one self-ticking PCM cycle: fill and send outbound frames,
    /// drain the inbound PCM queue, then deliver per-device tick callbacks.
    pub(crate) fn bus_tick(&self, now: Instant) {
        let devices = self.devices();
        self.fill_outbound(&devices, now);
        while let Some(frame) = self.pcm_inbound.dequeue() {
            let sync = frame.is_sync_tagged();
            self.demux_pcm_frame(&frame);
            if sync {
                self.observe_rx_sync(now);
            }
            self.free_recv_frame(frame);
        }
        let counter = self.global_counter();
        for device in &devices {
            if !device.is_present() {
                continue;
            }
            device.end_of_tick(counter);
            device.family().tick(device);
        }
    }

    fn fill_outbound(&self, devices: &[std::sync::Arc<super::Device>], now: Instant) {
        let Some(transport) = self.transport() else {
            return;
        };
        let max_frame = transport.max_frame_size();
        drop(transport);
        let mut frame: Option<Frame> = None;
        let mut sent_sync_bit = false;
        for device in devices {
            let wire_len = device.pcm_wire_len();
            if !device.is_present() || wire_len == 0 {
                continue;
            }
            if wire_len > max_frame {
                // Can never fit any frame: skip the device or the loop
                // below would spin on empty frames forever.
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                if let Some(n) = self.gates.pcm_drop.check() {
                    tracing::warn!(
                        bus = %self.name(), device = %device.addr(), wire_len, max_frame,
                        dropped = n, "pcm packet exceeds frame capacity",
                    );
                }
                continue;
            }
            let wanted = device.wanted_pcm();
            let mut packet = Packet::pcm_write(device.addr(), wanted);
            if !sent_sync_bit {
                packet.header.sync = true;
                sent_sync_bit = true;
            }
            {
                let mut slots = PcmSlots::of(&mut packet);
                device.family().pcm_from_host(device, wanted, &mut slots);
            }
            loop {
                if let Some(f) = frame.as_mut() {
                    if f.push_packet(&packet).is_ok() {
                        break;
                    }
                    if f.is_empty() {
                        // A pooled frame smaller than the capacity check
                        // assumed; drop the packet rather than loop.
                        self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    // Full frame: flush it and pack into a fresh one.
                    self.counters.tx_pcm_frag.fetch_add(1, Ordering::Relaxed);
                    if let Some(full) = frame.take() {
                        self.pcm_frame_out(full, now);
                    }
                }
                match self.alloc_send_frame() {
                    Ok(f) => frame = Some(f),
                    Err(e) => {
                        if let Some(n) = self.gates.alloc_fail.check() {
                            tracing::warn!(bus = %self.name(), failures = n, error = %e, "pcm frame allocation failed");
                        }
                        return;
                    }
                }
            }
        }
        if let Some(leftover) = frame {
            if leftover.is_empty() {
                self.free_send_frame(leftover);
            } else {
                self.pcm_frame_out(leftover, now);
            }
        }
    }

    fn pcm_frame_out(&self, frame: Frame, now: Instant) {
        let Some(transport) = self.transport() else {
            self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
            self.free_send_frame(frame);
            return;
        };
        if frame.is_sync_tagged() {
            self.observe_tx_sync(now);
        }
        match transport.send_frame(frame) {
            Ok(()) => {
                self.counters.tx_frames.fetch_add(1, Ordering::Relaxed);
                self.counters.tx_pcm_frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                if let Some(n) = self.gates.pcm_drop.check() {
                    tracing::warn!(bus = %self.name(), dropped = n, error = %e, "pcm send failed");
                }
            }
        }
    }

    fn demux_pcm_frame(&self, frame: &Frame) {
        for result in frame.packets() {
            let packet = match result {
                Ok(p) => p,
                Err(e) => {
                    self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(n) = self.gates.bad_pcm.check() {
                        tracing::debug!(bus = %self.name(), errors = n, error = %e, "malformed pcm packet");
                    }
                    return;
                }
            };
            if packet.header.opcode != OpCode::PcmRead {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                if let Some(n) = self.gates.bad_pcm.check() {
                    tracing::debug!(bus = %self.name(), errors = n, "non-pcm packet within a pcm frame");
                }
                return;
            }
            let Some(device) = self.device(packet.header.addr) else {
                if let Some(n) = self.gates.unknown_device.check() {
                    tracing::debug!(bus = %self.name(), addr = %packet.header.addr, count = n, "pcm for unknown device");
                }
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                return;
            };
            match PcmView::parse(&packet.payload) {
                Ok(view) => device.family().pcm_to_host(&device, &view),
                Err(e) => {
                    device.count_recv_error();
                    if let Some(n) = self.gates.bad_pcm.check() {
                        tracing::debug!(
                            bus = %self.name(), device = %device.addr(), errors = n, error = %e,
                            "bad pcm reply",
                        );
                    }
                    return;
                }
            }
        }
        self.counters.rx_pcm_frames.fetch_add(1, Ordering::Relaxed);
    }
}

fn parse_sync_ack(payload: &[u8]) -> Option<(SyncMode, i32)> {
    if payload.len() < 2 {
        return None;
    }
    let mode = SyncMode::from_wire(payload[0])?;
    #[allow(clippy::cast_possible_wrap)]
    let drift = i32::from(payload[1] as i8);
    Some((mode, drift))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::family::GenericFamily;
    use crate::testing::MockTransport;
    use crate::types::{BusEngineConfig, BusId, ChannelSet, DeviceAddr};

    use super::super::Device;

    fn setup() -> (Arc<Bus>, Arc<MockTransport>) {
        let config = Arc::new(BusEngineConfig::default());
        let bus = Bus::new(BusId::new(0, 1), config);
        let transport = MockTransport::shared();
        bus.connect_transport(transport.clone());
        (bus, transport)
    }

    fn add_device(bus: &Bus, unit: u8, subunit: u8, priority: u32) -> Arc<Device> {
        let device = Arc::new(Device::new(
            DeviceAddr::new(unit, subunit).unwrap(),
            bus.id(),
            8,
            priority,
            Arc::new(GenericFamily),
        ));
        bus.register_device(Arc::clone(&device)).unwrap();
        device
    }

    #[test]
    fn test_tick_sends_one_sync_flagged_frame() {
        let (bus, transport) = setup();
        let _ = add_device(&bus, 0, 0, 0);
        let _ = add_device(&bus, 1, 0, 0);
        bus.device(DeviceAddr::new(1, 0).unwrap())
            .unwrap()
            .set_offhook(2, true);

        bus.bus_tick(Instant::now());

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        // Two PCM packets packed into one frame, sync bit on the first.
        let packets = &sent[0];
        assert_eq!(packets.len(), 2);
        assert!(packets[0].header.sync);
        assert!(!packets[1].header.sync);
        assert_eq!(packets[0].header.opcode, OpCode::PcmWrite);
    }

    #[test]
    fn test_oversize_pcm_packet_skipped() {
        // A single off-hook channel needs 16 wire bytes; the transport
        // only carries 8. The tick must return without sending anything.
        let config = Arc::new(BusEngineConfig::default());
        let bus = Bus::new(BusId::new(0, 1), config);
        let transport = MockTransport::with_frame_size(8);
        bus.connect_transport(transport.clone());
        let device = add_device(&bus, 0, 0, 0);
        device.set_offhook(0, true);

        bus.bus_tick(Instant::now());

        assert_eq!(transport.sent_count(), 0);
        assert_eq!(bus.counters.dropped_frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_oversize_device_does_not_block_others() {
        let config = Arc::new(BusEngineConfig::default());
        let bus = Bus::new(BusId::new(0, 1), config);
        // Room for the 16-byte unit-0 keepalive, not for two channels.
        let transport = MockTransport::with_frame_size(20);
        bus.connect_transport(transport.clone());
        let _ = add_device(&bus, 0, 0, 0);
        let wide = add_device(&bus, 1, 0, 0);
        wide.set_offhook(2, true);
        wide.set_offhook(3, true);

        bus.bus_tick(Instant::now());

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 1);
        assert_eq!(sent[0][0].header.addr, DeviceAddr::new(0, 0).unwrap());
        assert_eq!(bus.counters.dropped_frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_idle_devices_send_nothing() {
        let (bus, transport) = setup();
        // Unit 1 with nothing off-hook has no PCM to exchange.
        let _ = add_device(&bus, 1, 0, 0);
        bus.bus_tick(Instant::now());
        assert_eq!(transport.sent_count(), 0);
    }

    #[test]
    fn test_sync_pcm_frame_requests_tick() {
        let (bus, _transport) = setup();
        let device = add_device(&bus, 0, 0, 0);

        let mut packet = Packet::pcm_write(device.addr(), ChannelSet::single(0));
        packet.header.opcode = OpCode::PcmRead;
        packet.header.sync = true;
        let mut frame = bus.alloc_recv_frame().unwrap();
        frame.push_packet(&packet).unwrap();

        assert_eq!(bus.frame_received(frame), RxDisposition::TickNow);
        assert_eq!(bus.counters.pcm_rx_ticks.load(Ordering::Relaxed), 1);
        assert_eq!(bus.pcm_inbound.len(), 1);
    }

    #[test]
    fn test_nonsync_pcm_frame_counts_frag() {
        let (bus, _transport) = setup();
        let device = add_device(&bus, 0, 0, 0);

        let mut packet = Packet::pcm_write(device.addr(), ChannelSet::single(0));
        packet.header.opcode = OpCode::PcmRead;
        let mut frame = bus.alloc_recv_frame().unwrap();
        frame.push_packet(&packet).unwrap();

        assert_eq!(bus.frame_received(frame), RxDisposition::Handled);
        assert_eq!(bus.counters.frag_frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_malformed_frame_is_counted_and_recycled() {
        let (bus, _transport) = setup();
        let mut frame = bus.alloc_recv_frame().unwrap();
        frame.fill_from(&[0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3]);
        assert_eq!(bus.frame_received(frame), RxDisposition::Handled);
        assert_eq!(bus.counters.recv_errors.load(Ordering::Relaxed), 1);
        // The buffer went back to the receive pool.
        assert_eq!(bus.receive_pool.len(), 1);
    }

    #[test]
    fn test_sync_ack_dispatched_from_receive_queue() {
        let (bus, _transport) = setup();
        let packet = Packet::control(
            DeviceAddr::new(0, 0).unwrap(),
            OpCode::SyncSource,
            vec![SyncMode::PhaseLocked.to_wire(), 3],
        );
        let mut frame = bus.alloc_recv_frame().unwrap();
        frame.push_packet(&packet).unwrap();

        assert_eq!(bus.frame_received(frame), RxDisposition::Queued);
        let transitions = bus.receive_tick();
        assert_eq!(transitions, vec![SyncMode::PhaseLocked]);
        assert_eq!(bus.sync_adjustment(), 3);
        assert!(bus.self_ticking());
    }

    #[test]
    fn test_inbound_pcm_reaches_device() {
        let (bus, _transport) = setup();
        let device = add_device(&bus, 0, 0, 0);
        device.set_offhook(1, true);

        let mut packet = Packet::pcm_write(device.addr(), device.wanted_pcm());
        packet.header.opcode = OpCode::PcmRead;
        packet.header.sync = true;
        {
            let mut slots = PcmSlots::of(&mut packet);
            slots.chunk_mut(1).unwrap().copy_from_slice(&[0x42; 8]);
        }
        let mut frame = bus.alloc_recv_frame().unwrap();
        frame.push_packet(&packet).unwrap();
        let _ = bus.frame_received(frame);

        bus.bus_tick(Instant::now());
        assert_eq!(device.read_chunk(1), [0x42; 8]);
        assert_eq!(bus.counters.rx_pcm_frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_pcm_length_mismatch_rejected() {
        let (bus, _transport) = setup();
        let device = add_device(&bus, 0, 0, 0);

        // Mask claims channels 0 and 1 but carries a single chunk.
        let mut payload = vec![0u8; 4 + 8];
        payload[0] = 0b11;
        let packet = Packet {
            header: crate::frame::PacketHeader {
                addr: device.addr(),
                sync: true,
                opcode: OpCode::PcmRead,
            },
            payload,
        };
        let mut frame = bus.alloc_recv_frame().unwrap();
        frame.push_packet(&packet).unwrap();
        let _ = bus.frame_received(frame);

        bus.bus_tick(Instant::now());
        assert_eq!(device.counters().recv_errors.load(Ordering::Relaxed), 1);
        assert_eq!(bus.counters.rx_pcm_frames.load(Ordering::Relaxed), 0);
    }
}
