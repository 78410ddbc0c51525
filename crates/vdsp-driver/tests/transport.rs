// SPDX-License-Identifier: AGPL-3.0-only

//! Boot handshake and request round trips against the simulated accelerator.

mod common;

use std::thread;
use vdsp_driver::prelude::*;
use vdsp_driver::{CompletionMode, LogConfig};

#[test]
fn test_first_open_boots_and_last_close_powers_off() {
    let (sim, device) = common::attach(common::config());
    assert_eq!(device.link_state(), LinkState::Offline);
    assert!(!sim.is_powered());

    let a = device.open().unwrap();
    assert_eq!(device.link_state(), LinkState::Operational);
    assert!(sim.is_serving());
    assert!(sim.iommu_enabled(0));
    assert_eq!(sim.stats().boots, 1);
    let vectors = sim.local_segment(vdsp_driver::sim::LOCAL_VECTORS).unwrap();
    assert_eq!(&vectors[..7], b"vectors");

    let b = device.open().unwrap();
    assert_eq!(sim.stats().boots, 1, "second open must not reboot");
    assert_eq!(device.session_count(), 2);

    a.close().unwrap();
    assert!(sim.is_powered());
    drop(b);
    assert_eq!(device.session_count(), 0);
    assert!(!sim.is_powered());
    assert_eq!(device.link_state(), LinkState::Offline);
    assert!(!device.iommu_enabled(0), "driver regions unmapped at power off");

    let _c = device.open().unwrap();
    assert_eq!(sim.stats().boots, 2);
}

#[test]
fn test_v2_handshake_negotiates_queue_priorities() {
    let config = common::config().with_queue_priorities(vec![2, 0, 1]);
    let (sim, device) = common::attach(config);
    let _s = device.open().unwrap();
    assert_eq!(device.active_queues(), 3);
    assert_eq!(sim.queues(), 3);
    assert_eq!(device.queue_priorities(), vec![2, 0, 1]);
}

#[test]
fn test_v1_accelerator_serves_one_queue() {
    let config = common::config().with_queue_priorities(vec![0, 1]);
    let (sim, device) = common::attach(config);
    sim.protocol_v1(true);
    let s = device.open().unwrap();
    assert_eq!(device.active_queues(), 1);

    let reply = s.submit(&Request::new(&b"v1"[..]).with_output(2).with_priority(1)).unwrap();
    assert_eq!(reply.output.as_ref(), b"v1");
}

#[test]
fn test_refused_queue_table_falls_back() {
    let config = common::config().with_queue_priorities(vec![0, 1, 2, 3]);
    let (sim, device) = common::attach(config);
    sim.reject_queues(true);
    let _s = device.open().unwrap();
    assert_eq!(device.active_queues(), 1);
    assert_eq!(sim.queues(), 1);
}

#[test]
fn test_inline_echo() {
    let (_sim, device) = common::attach(common::config());
    let s = device.open().unwrap();
    let reply = s.submit(&Request::new(&b"ping"[..]).with_output(4)).unwrap();
    assert_eq!(reply.output.as_ref(), b"ping");
    assert_eq!(reply.generation, 0);

    let reply = s.submit(&Request::new(&b"abc"[..])).unwrap();
    assert!(reply.output.is_empty());
}

#[test]
fn test_staged_payloads_round_trip() {
    let (_sim, device) = common::attach(common::config());
    let s = device.open().unwrap();
    let input: Vec<u8> = (0..200u8).collect();
    let before = s.memory_usage().unwrap();

    let reply = s.submit(&Request::new(input.clone()).with_output(200)).unwrap();
    assert_eq!(reply.output.as_ref(), &input[..]);

    // Staging buffers are released with the request.
    assert_eq!(s.memory_usage().unwrap().current, before.current);
    assert!(s.buffers().unwrap().is_empty());
    assert!(s.memory_usage().unwrap().peak > before.peak);
}

#[test]
fn test_writable_buffers_receive_input() {
    let (_sim, device) = common::attach(common::config());
    let s = device.open().unwrap();
    let a = s.alloc_from(HeapKind::Unified, 64, BufferAttr::default()).unwrap();
    let b = s.alloc_from(HeapKind::Unified, 8, BufferAttr::default()).unwrap();
    let ro = s.alloc_from(HeapKind::Unified, 64, BufferAttr::default()).unwrap();

    // One descriptor travels inline.
    s.submit(&Request::new(&b"hello world"[..]).with_buffer(BufferRef::read_write(a)))
        .unwrap();
    let view = s.map_user(a).unwrap();
    assert_eq!(view.read(0, 11).unwrap(), b"hello world");

    // Three go through a staged descriptor array.
    s.submit(
        &Request::new(&b"0123456789abcdef!"[..])
            .with_buffer(BufferRef::read_write(a))
            .with_buffer(BufferRef::read_write(b))
            .with_buffer(BufferRef::read(ro)),
    )
    .unwrap();
    assert_eq!(view.read(0, 17).unwrap(), b"0123456789abcdef!");
    assert_eq!(s.map_user(b).unwrap().read(0, 8).unwrap(), b"01234567");
    assert!(s.map_user(ro).unwrap().read(0, 4).unwrap().iter().all(|&x| x == 0));

    // Request mappings are dropped afterwards, so the buffers can be freed.
    for id in [a, b, ro] {
        assert_eq!(s.info(id).unwrap().device_addr, None);
        s.free(id).unwrap();
    }
}

#[test]
fn test_priorities_clamp_to_available_queues() {
    let config = common::config().with_queue_priorities(vec![0, 1]);
    let (_sim, device) = common::attach(config);
    let s = device.open().unwrap();
    for priority in [0, 1, 7] {
        let reply = s
            .submit(&Request::new(vec![priority as u8; 3]).with_output(3).with_priority(priority))
            .unwrap();
        assert_eq!(reply.output.as_ref(), &[priority as u8; 3]);
    }
    let err = s.submit(&Request::new(&b"x"[..]).with_priority(300)).unwrap_err();
    assert!(matches!(err, VdspError::InvalidArgument { .. }));
}

#[test]
fn test_concurrent_sessions() {
    let config = common::config().with_queue_priorities(vec![0, 1, 2]);
    let (_sim, device) = common::attach(config);
    let _keep = device.open().unwrap();

    let handles: Vec<_> = (0..6u8)
        .map(|t| {
            let device = device.clone();
            thread::spawn(move || {
                let s = device.open().unwrap();
                for i in 0..20u8 {
                    let payload = vec![t, i, t ^ i, 0x5a];
                    let reply = s
                        .submit(
                            &Request::new(payload.clone())
                                .with_output(4)
                                .with_priority(u32::from(t % 3)),
                        )
                        .unwrap();
                    assert_eq!(reply.output.as_ref(), &payload[..]);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(device.session_count(), 1);
}

#[test]
fn test_polling_completion() {
    let config = common::config().with_completion(CompletionMode::Polling);
    let (_sim, device) = common::attach(config);
    let s = device.open().unwrap();
    let reply = s.submit(&Request::new(&b"poll"[..]).with_output(4)).unwrap();
    assert_eq!(reply.output.as_ref(), b"poll");
}

#[test]
fn test_dsp_log_is_drained() {
    let (sim, device) = common::attach(common::config());
    let _s = device.open().unwrap();
    assert!(sim.emit_log("dsp: hello"));
    assert!(common::eventually(|| device.dsp_log_lines() == 1));
    assert!(sim.emit_log("dsp: again"));
    assert!(common::eventually(|| device.dsp_log_lines() == 2));
}

#[test]
fn test_log_off_leaves_banks_alone() {
    let config = common::config().with_log(LogConfig {
        mode: vdsp_chip::log::MODE_OFF,
        ..LogConfig::default()
    });
    let (sim, device) = common::attach(config);
    let _s = device.open().unwrap();
    assert!(!sim.emit_log("dropped"));
    assert_eq!(device.dsp_log_lines(), 0);
}

#[test]
fn test_device_drop_detaches() {
    let (sim, device) = common::attach(common::config());
    let s = device.open().unwrap();
    drop(device);
    assert!(!sim.is_powered());
    assert!(matches!(
        s.submit(&Request::new(&b"x"[..])),
        Err(VdspError::DeviceUnavailable)
    ));
    drop(s);
}
