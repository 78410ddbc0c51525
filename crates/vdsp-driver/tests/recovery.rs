// SPDX-License-Identifier: AGPL-3.0-only

//! Timeout recovery and boot failures.

mod common;

use std::thread;
use std::time::Duration;
use vdsp_driver::prelude::*;

fn quick() -> VdspConfig {
    common::config()
        .with_cmd_timeout(Duration::from_millis(300))
        .with_boot_timeout(Duration::from_millis(500))
}

#[test]
fn test_timeout_reboots_once_and_link_recovers() {
    let (sim, device) = common::attach(quick());
    let s = device.open().unwrap();

    sim.hang_next(1);
    let err = s.submit(&Request::new(&b"stuck"[..]).with_output(5)).unwrap_err();
    assert!(matches!(err, VdspError::Timeout { duration_ms: 300 }));

    let stats = sim.stats();
    assert_eq!(stats.boots, 2);
    assert_eq!(stats.coredumps, 1);
    assert_eq!(device.link_state(), LinkState::Operational);
    assert_eq!(device.generation(), 1);

    let reply = s.submit(&Request::new(&b"again"[..]).with_output(5)).unwrap();
    assert_eq!(reply.output.as_ref(), b"again");
    assert_eq!(reply.generation, 1);
}

#[test]
fn test_concurrent_submitters_survive_a_recovery() {
    let config = quick()
        .with_cmd_timeout(Duration::from_millis(500))
        .with_queue_priorities(vec![0, 1]);
    let (sim, device) = common::attach(config);
    let hung = device.open().unwrap();

    sim.hang_next(1);
    let stuck = thread::spawn(move || hung.submit(&Request::new(&b"hang"[..]).with_priority(0)));
    assert!(common::eventually(|| sim.stats().commands >= 1));

    let other = device.open().unwrap();
    let mut served = 0;
    while !stuck.is_finished() {
        let reply = other
            .submit(&Request::new(&b"ok"[..]).with_output(2).with_priority(1))
            .unwrap();
        assert_eq!(reply.output.as_ref(), b"ok");
        served += 1;
    }
    assert!(served > 0);
    assert!(matches!(stuck.join().unwrap(), Err(VdspError::Timeout { .. })));
    assert_eq!(sim.stats().boots, 2, "exactly one reboot");
    assert_eq!(device.generation(), 1);
}

#[test]
fn test_two_hung_queues_share_one_recovery() {
    let config = quick()
        .with_cmd_timeout(Duration::from_millis(500))
        .with_queue_priorities(vec![0, 1]);
    let (sim, device) = common::attach(config);
    let a = device.open().unwrap();
    let b = device.open().unwrap();

    sim.hang_next(2);
    let workers: Vec<_> = [(a, 0u32), (b, 1u32)]
        .into_iter()
        .map(|(s, prio)| {
            thread::spawn(move || {
                let result = s.submit(&Request::new(&b"hang"[..]).with_priority(prio));
                (s, result)
            })
        })
        .collect();
    assert!(common::eventually(|| sim.stats().commands >= 2));

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let timeouts = results
        .iter()
        .filter(|(_, r)| matches!(r, Err(VdspError::Timeout { .. })))
        .count();
    let served = results.iter().filter(|(_, r)| r.is_ok()).count();
    assert_eq!((timeouts, served), (1, 1), "{:?}", results.iter().map(|(_, r)| r).collect::<Vec<_>>());
    assert_eq!(sim.stats().boots, 2, "one recovery for both waiters");
    assert_eq!(device.generation(), 1);
    assert_eq!(device.session_count(), 2);
    assert_eq!(device.link_state(), LinkState::Operational);
}

#[test]
fn test_failed_reboot_takes_the_link_down() {
    let (sim, device) = common::attach(quick());
    let s = device.open().unwrap();

    sim.hang_next(1);
    sim.fail_boots(1);
    assert!(s.submit(&Request::new(&b"x"[..])).is_err());
    assert_eq!(device.link_state(), LinkState::Down);
    assert!(matches!(
        s.submit(&Request::new(&b"y"[..])),
        Err(VdspError::DeviceUnavailable)
    ));

    // A full close and reopen powers the accelerator up again.
    drop(s);
    let s = device.open().unwrap();
    assert_eq!(device.link_state(), LinkState::Operational);
    assert_eq!(device.generation(), 0);
    s.submit(&Request::new(&b"z"[..])).unwrap();
}

#[test]
fn test_reboot_disabled_reports_timeout_only() {
    let (sim, device) = common::attach(quick().with_firmware_reboot(false));
    let s = device.open().unwrap();
    sim.hang_next(1);
    let err = s.submit(&Request::new(&b"x"[..])).unwrap_err();
    assert!(matches!(err, VdspError::Timeout { .. }));
    assert_eq!(sim.stats().boots, 1);
    assert_eq!(sim.stats().coredumps, 0);
    assert_eq!(device.generation(), 0);
}

#[test]
fn test_boot_failure_on_open_powers_off() {
    let (sim, device) = common::attach(quick());
    sim.fail_boots(1);
    let err = device.open().unwrap_err();
    assert!(matches!(err, VdspError::Protocol { .. }));
    assert!(!sim.is_powered());
    assert_eq!(device.session_count(), 0);
    assert_eq!(device.memory_usage().current, 0);

    let _s = device.open().unwrap();
    assert_eq!(device.link_state(), LinkState::Operational);
}

#[test]
fn test_panic_after_host_reply_fails_fast() {
    let config = quick().with_boot_timeout(Duration::from_secs(5));
    let (sim, device) = common::attach(config);
    sim.panic_boots(1);
    let start = std::time::Instant::now();
    let err = device.open().unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(4), "waited out the boot timeout");
    match err {
        VdspError::Protocol { reason } => assert!(reason.contains("panicked"), "{reason}"),
        other => panic!("expected a protocol error, got {other:?}"),
    }
    assert!(!sim.is_powered());

    let _s = device.open().unwrap();
    assert_eq!(device.link_state(), LinkState::Operational);
}

#[test]
fn test_missing_firmware_fails_open() {
    let config = quick();
    let (sim, platform) = SimulatedDsp::platform(&config).unwrap();
    let device = Device::attach(config.with_firmware("absent.elf"), platform).unwrap();
    let err = device.open().unwrap_err();
    assert!(matches!(err, VdspError::Firmware { .. }));
    assert!(!sim.is_powered());
}
