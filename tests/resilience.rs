//! Fault-path tests: malformed traffic, queue overflow, detach safety and
//! frame-buffer accounting.

use std::sync::Arc;

use tdmbus::frame::{OpCode, Packet};
use tdmbus::testing::MockTransport;
use tdmbus::{BusEngine, BusEngineConfig, BusError, ChannelSet, DeviceAddr, GenericFamily, SyncMode};

fn addr(unit: u8, subunit: u8) -> DeviceAddr {
    DeviceAddr::new(unit, subunit).unwrap()
}

fn sync_ack(mode: SyncMode) -> Vec<u8> {
    Packet::control(addr(0, 0), OpCode::SyncSource, vec![mode.to_wire(), 0]).encode()
}

fn pcm_frame(sync: bool) -> Vec<u8> {
    let mut packet = Packet::pcm_write(addr(0, 0), ChannelSet::single(0));
    packet.header.opcode = OpCode::PcmRead;
    packet.header.sync = sync;
    packet.encode()
}

// ===== Malformed traffic =====

#[tokio::test]
async fn test_garbage_flood_does_not_break_the_bus() {
    let engine = BusEngine::new(BusEngineConfig::default());
    let bus = engine.attach_bus(MockTransport::shared());
    engine
        .register_device(bus.id(), addr(0, 0), 8, 5, Arc::new(GenericFamily))
        .unwrap();

    for i in 0..100u8 {
        // Unknown opcodes and truncated headers.
        engine
            .frame_received(bus.id(), &[0xff, i, 0xff, 0xff, i])
            .unwrap();
    }
    assert_eq!(bus.summary().recv_errors, 100);

    // Valid traffic still flows.
    engine
        .frame_received(bus.id(), &sync_ack(SyncMode::Reference))
        .unwrap();
    assert!(bus.self_ticking());
    engine.frame_received(bus.id(), &pcm_frame(true)).unwrap();
    assert_eq!(engine.tick_count(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_truncated_sync_ack_is_ignored() {
    let engine = BusEngine::new(BusEngineConfig::default());
    let bus = engine.attach_bus(MockTransport::shared());

    let short = Packet::control(addr(0, 0), OpCode::SyncSource, vec![0x01]).encode();
    engine.frame_received(bus.id(), &short).unwrap();
    assert!(!bus.self_ticking());
    assert_eq!(bus.summary().recv_errors, 1);
    engine.shutdown().await;
}

// ===== Queue overflow =====

#[tokio::test]
async fn test_pcm_inbound_overflow_drops_and_recycles() {
    let engine = BusEngine::new(BusEngineConfig::default());
    let transport = MockTransport::shared();
    let bus = engine.attach_bus(transport.clone());
    engine
        .register_device(bus.id(), addr(0, 0), 8, 0, Arc::new(GenericFamily))
        .unwrap();

    // Non-sync PCM never ticks, so nothing drains the inbound queue.
    let capacity = engine.config().pcm_inbound_capacity;
    let frame = pcm_frame(false);
    for _ in 0..capacity + 5 {
        engine.frame_received(bus.id(), &frame).unwrap();
    }

    let summary = bus.summary();
    assert_eq!(summary.frag_frames as usize, capacity + 5);
    assert_eq!(summary.dropped_frames, 5);
    let (_, pcm_inbound) = summary
        .queues
        .iter()
        .find(|(name, _)| *name == "pcm_inbound")
        .unwrap();
    assert_eq!(pcm_inbound.overflows, 5);
    assert_eq!(pcm_inbound.count, capacity);
    engine.shutdown().await;
}

// ===== Detach safety =====

#[tokio::test]
async fn test_detach_returns_every_frame_buffer() {
    let engine = BusEngine::new(BusEngineConfig::default());
    let transport = MockTransport::shared();
    let bus = engine.attach_bus(transport.clone());
    engine
        .register_device(bus.id(), addr(0, 0), 8, 5, Arc::new(GenericFamily))
        .unwrap();
    engine
        .frame_received(bus.id(), &sync_ack(SyncMode::Reference))
        .unwrap();

    // Mixed traffic, including frames left sitting in the inbound queue.
    for _ in 0..20 {
        engine.frame_received(bus.id(), &pcm_frame(true)).unwrap();
    }
    for _ in 0..5 {
        engine.frame_received(bus.id(), &pcm_frame(false)).unwrap();
    }
    engine
        .frame_received(bus.id(), &[0xff, 0xff, 0xff, 0xff])
        .unwrap();
    assert!(transport.allocated() > 0);

    let id = bus.id();
    drop(bus);
    engine.detach_bus(id).await.unwrap();
    // Every buffer the engine ever took was sent back or freed.
    assert_eq!(transport.outstanding(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_detached_bus_rejects_further_traffic() {
    let engine = BusEngine::new(BusEngineConfig::default());
    let bus = engine.attach_bus(MockTransport::shared());
    let id = bus.id();
    drop(bus);
    engine.detach_bus(id).await.unwrap();

    assert!(matches!(
        engine.frame_received(id, &pcm_frame(true)),
        Err(BusError::NoSuchBus { .. })
    ));
    assert!(matches!(engine.query_sync(id), Err(BusError::NoSuchBus { .. })));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_bus_slot_reuse_invalidates_old_id() {
    let engine = BusEngine::new(BusEngineConfig::default());
    let first = engine.attach_bus(MockTransport::shared());
    let old_id = first.id();
    drop(first);
    engine.detach_bus(old_id).await.unwrap();

    // The slot comes back with a new generation.
    let second = engine.attach_bus(MockTransport::shared());
    assert_eq!(second.id().index(), old_id.index());
    assert_ne!(second.id(), old_id);
    assert!(matches!(engine.bus(old_id), Err(BusError::NoSuchBus { .. })));
    assert!(engine.bus(second.id()).is_ok());
    engine.shutdown().await;
}

// ===== Transport faults =====

#[tokio::test]
async fn test_send_failures_are_counted_not_fatal() {
    let engine = BusEngine::new(BusEngineConfig::default());
    let transport = MockTransport::shared();
    let bus = engine.attach_bus(transport.clone());
    engine
        .register_device(bus.id(), addr(0, 0), 8, 5, Arc::new(GenericFamily))
        .unwrap();
    engine
        .frame_received(bus.id(), &sync_ack(SyncMode::Reference))
        .unwrap();

    transport.fail_sends(true);
    for _ in 0..3 {
        engine.frame_received(bus.id(), &pcm_frame(true)).unwrap();
    }
    assert!(bus.summary().dropped_frames >= 3);

    transport.fail_sends(false);
    transport.clear_sent();
    engine.frame_received(bus.id(), &pcm_frame(true)).unwrap();
    assert!(transport.sent_count() > 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_allocation_failure_skips_outbound_pcm() {
    let engine = BusEngine::new(BusEngineConfig::default());
    let transport = MockTransport::shared();
    let bus = engine.attach_bus(transport.clone());
    let device = engine
        .register_device(bus.id(), addr(0, 0), 8, 5, Arc::new(GenericFamily))
        .unwrap();
    device.set_offhook(0, true);
    engine
        .frame_received(bus.id(), &sync_ack(SyncMode::Reference))
        .unwrap();

    transport.fail_allocs(true);
    transport.clear_sent();
    engine.frame_received(bus.id(), &pcm_frame(true)).unwrap();
    // The tick still ran; only the outbound PCM was skipped.
    assert_eq!(engine.tick_count(), 1);
    assert!(transport
        .sent_frames()
        .iter()
        .flatten()
        .all(|p| p.header.opcode != OpCode::PcmWrite));
    engine.shutdown().await;
}
