// SPDX-License-Identifier: AGPL-3.0-only

//! Library load/unload bookkeeping.

mod common;

use std::thread;
use std::time::Duration;
use vdsp_chip::library::LibraryPackage;
use vdsp_driver::prelude::*;

fn package() -> Vec<u8> {
    let mut code = vec![0u8; 64];
    code[8..12].copy_from_slice(&0x10u32.to_le_bytes());
    LibraryPackage::build(&code, 0x100, 0x20, &[8])
}

fn upload(s: &Session) -> BufferId {
    let bytes = package();
    let id = s.alloc_from(HeapKind::Unified, bytes.len(), BufferAttr::default()).unwrap();
    s.map_user(id).unwrap().write(0, &bytes).unwrap();
    s.unmap_user(id).unwrap();
    id
}

#[test]
fn test_load_is_counted_per_user() {
    let (sim, device) = common::attach(common::config());
    let a = device.open().unwrap();
    let b = device.open().unwrap();
    let pa = upload(&a);
    let pb = upload(&b);

    a.load_library("fft", pa).unwrap();
    assert_eq!(a.library_state("fft").unwrap(), LibraryState::Loaded);
    assert_eq!(sim.loaded_libraries(), vec!["fft".to_owned()]);

    b.load_library("fft", pb).unwrap();
    assert_eq!(sim.stats().loads, 1, "second user does not reload");
    assert_eq!(b.library_users("fft").unwrap(), 2);

    a.unload_library("fft").unwrap();
    assert_eq!(sim.stats().unloads, 0);
    assert_eq!(a.library_users("fft").unwrap(), 1);
    assert!(matches!(
        a.unload_library("fft"),
        Err(VdspError::LibraryState { .. })
    ));

    b.unload_library("fft").unwrap();
    assert_eq!(sim.stats().unloads, 1);
    assert_eq!(b.library_state("fft").unwrap(), LibraryState::Idle);
    assert!(sim.loaded_libraries().is_empty());
}

#[test]
fn test_requests_route_to_loaded_libraries() {
    let (_sim, device) = common::attach(common::config());
    let s = device.open().unwrap();
    let pkg = upload(&s);

    let req = Request::new(&b"data"[..]).with_output(4).with_namespace("fft").unwrap();
    assert!(matches!(
        s.submit(&req),
        Err(VdspError::UnknownNamespace { nsid }) if nsid == "fft"
    ));

    s.load_library("fft", pkg).unwrap();
    let reply = s.submit(&req).unwrap();
    assert_eq!(reply.output.as_ref(), b"data");
    assert_eq!(s.library_state("fft").unwrap(), LibraryState::Loaded);
}

#[test]
fn test_close_unloads_what_the_session_held() {
    let (sim, device) = common::attach(common::config());
    let keep = device.open().unwrap();
    let s = device.open().unwrap();
    let pkg = upload(&s);
    s.load_library("conv", pkg).unwrap();
    let before = device.memory_usage().current;

    drop(s);
    assert_eq!(sim.stats().unloads, 1);
    assert_eq!(keep.library_state("conv").unwrap(), LibraryState::Idle);
    assert!(device.memory_usage().current < before);
}

#[test]
fn test_unload_refused_while_commands_in_flight() {
    let config = common::config()
        .with_cmd_timeout(Duration::from_millis(400))
        .with_boot_timeout(Duration::from_millis(500));
    let (sim, device) = common::attach(config);
    let owner = device.open().unwrap();
    let pkg = upload(&owner);
    owner.load_library("fir", pkg).unwrap();

    let user = device.open().unwrap();
    sim.hang_next(1);
    let worker = thread::spawn(move || {
        let req = Request::new(&b"slow"[..]).with_namespace("fir").unwrap();
        user.submit(&req)
    });
    assert!(common::eventually(|| sim.stats().commands >= 2));
    assert_eq!(owner.library_state("fir").unwrap(), LibraryState::Processing);
    assert!(matches!(
        owner.unload_library("fir"),
        Err(VdspError::LibraryState { .. })
    ));

    assert!(matches!(worker.join().unwrap(), Err(VdspError::Timeout { .. })));
}

#[test]
fn test_shared_holder_unloads_while_commands_in_flight() {
    let config = common::config()
        .with_cmd_timeout(Duration::from_millis(400))
        .with_boot_timeout(Duration::from_millis(500));
    let (sim, device) = common::attach(config);
    let a = device.open().unwrap();
    let b = device.open().unwrap();
    let (pa, pb) = (upload(&a), upload(&b));
    a.load_library("fir", pa).unwrap();
    b.load_library("fir", pb).unwrap();

    let user = device.open().unwrap();
    sim.hang_next(1);
    let worker = thread::spawn(move || {
        let req = Request::new(&b"slow"[..]).with_namespace("fir").unwrap();
        user.submit(&req)
    });
    assert!(common::eventually(|| sim.stats().commands >= 2));

    // Dropping one of two holders never reaches the firmware.
    a.unload_library("fir").unwrap();
    assert_eq!(b.library_users("fir").unwrap(), 1);
    assert_eq!(sim.stats().unloads, 0);

    // The last holder has to wait for the command.
    assert!(matches!(
        b.unload_library("fir"),
        Err(VdspError::LibraryState { .. })
    ));
    assert_eq!(b.library_users("fir").unwrap(), 1);

    assert!(matches!(worker.join().unwrap(), Err(VdspError::Timeout { .. })));
}

#[test]
fn test_recovery_forgets_libraries() {
    let config = common::config()
        .with_cmd_timeout(Duration::from_millis(300))
        .with_boot_timeout(Duration::from_millis(500));
    let (sim, device) = common::attach(config);
    let s = device.open().unwrap();
    let pkg = upload(&s);
    s.load_library("fft", pkg).unwrap();
    let loaded = device.memory_usage().current;

    sim.hang_next(1);
    assert!(s.submit(&Request::new(&b"x"[..])).is_err());
    assert_eq!(device.generation(), 1);
    assert!(sim.loaded_libraries().is_empty());

    assert_eq!(s.library_state("fft").unwrap(), LibraryState::Idle);
    assert!(device.memory_usage().current < loaded);

    // Reloading after the reboot sends a fresh load.
    s.load_library("fft", pkg).unwrap();
    assert_eq!(sim.stats().loads, 2);
}

#[test]
fn test_malformed_package_is_rejected() {
    let (sim, device) = common::attach(common::config());
    let s = device.open().unwrap();
    let junk = s.alloc_from(HeapKind::Unified, 64, BufferAttr::default()).unwrap();
    assert!(matches!(
        s.load_library("bad", junk),
        Err(VdspError::Format(_))
    ));
    assert_eq!(sim.stats().loads, 0);
    assert_eq!(s.library_state("bad").unwrap(), LibraryState::Idle);
}
