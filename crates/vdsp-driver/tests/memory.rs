// SPDX-License-Identifier: AGPL-3.0-only

//! Buffers, heaps and namespaces through the session API.

mod common;

use std::io::Write;
use vdsp_driver::prelude::*;
use vdsp_driver::{DirStore, SimulatedDsp, SyncDirection};

#[test]
fn test_standard_heaps() {
    let (_sim, device) = common::attach(common::config());
    let heaps = device.heaps();
    let kinds: Vec<HeapKind> = heaps.iter().map(|h| h.kind).collect();
    assert_eq!(
        kinds,
        vec![HeapKind::Unified, HeapKind::DmaBuf, HeapKind::Anonymous, HeapKind::Carveout]
    );
    assert!(heaps[3].contiguous);
    assert!(heaps[0].exportable && !heaps[2].exportable);

    let (_sim, device) = common::attach(common::config().with_carveout_size(0));
    assert_eq!(device.heaps().len(), 3);
}

#[test]
fn test_buffer_lifecycle() {
    let (_sim, device) = common::attach(common::config());
    let s = device.open().unwrap();
    let id = s.alloc_from(HeapKind::Unified, 5000, BufferAttr::default()).unwrap();
    let info = s.info(id).unwrap();
    assert_eq!(info.requested_size, 5000);
    assert_eq!(info.size, 8192);
    assert_eq!(s.page_array(id).unwrap().len(), 2);
    assert_eq!(s.memory_usage().unwrap().current, 8192);

    let addr = s.map_device(id).unwrap();
    assert_eq!(s.map_device(id).unwrap(), addr, "second map shares the address");
    assert_eq!(device.translate(addr + 4), Some(s.page_array(id).unwrap()[0] + 4));
    assert!(matches!(s.free(id), Err(VdspError::StillMapped { .. })));

    s.unmap_device(id).unwrap();
    assert!(s.info(id).unwrap().device_addr.is_some());
    s.unmap_device(id).unwrap();
    assert_eq!(s.info(id).unwrap().device_addr, None);
    assert_eq!(device.translate(addr), None);
    assert!(matches!(s.unmap_device(id), Err(VdspError::NotMapped { .. })));

    let view = s.map_kernel(id).unwrap();
    s.map_kernel(id).unwrap();
    s.unmap_kernel(id).unwrap();
    assert_eq!(s.info(id).unwrap().kernel_maps, 1);
    view.write(4990, b"end").unwrap();
    assert!(view.write(8190, b"end").is_err());
    s.unmap_kernel(id).unwrap();
    assert!(s.unmap_kernel(id).is_err());

    s.free(id).unwrap();
    assert!(matches!(s.info(id), Err(VdspError::UnknownBuffer { .. })));
    assert_eq!(s.memory_usage().unwrap().current, 0);
    assert_eq!(s.memory_usage().unwrap().peak, 8192);
}

#[test]
fn test_namespaces_are_isolated_and_torn_down() {
    let (_sim, device) = common::attach(common::config());
    let a = device.open().unwrap();
    let b = device.open().unwrap();
    assert_ne!(a.namespace(), b.namespace());

    let id = a.alloc_from(HeapKind::Unified, 4096, BufferAttr::default()).unwrap();
    assert!(matches!(b.info(id), Err(VdspError::UnknownBuffer { .. })));
    assert!(matches!(b.free(id), Err(VdspError::UnknownBuffer { .. })));

    a.map_device(id).unwrap();
    let records = device.iommu_usage().records;
    let total = device.memory_usage().current;

    // Closing with the buffer still mapped cleans up both.
    a.close().unwrap();
    assert_eq!(device.iommu_usage().records, records - 1);
    assert_eq!(device.memory_usage().current, total - 4096);
    drop(b);
}

#[test]
fn test_namespace_limit() {
    // The driver's own namespace takes one slot.
    let config = common::config().with_namespace_limits(2, 16);
    let (_sim, device) = common::attach(config);
    let _a = device.open().unwrap();
    assert!(matches!(device.open(), Err(VdspError::ResourceExhausted { .. })));
}

#[test]
fn test_buffer_ids_run_out() {
    let config = common::config().with_namespace_limits(4, 3);
    let (_sim, device) = common::attach(config);
    let s = device.open().unwrap();
    for _ in 0..3 {
        s.alloc_from(HeapKind::Anonymous, 4096, BufferAttr::default()).unwrap();
    }
    assert!(matches!(
        s.alloc_from(HeapKind::Anonymous, 4096, BufferAttr::default()),
        Err(VdspError::ResourceExhausted { .. })
    ));
}

#[test]
fn test_mapping_record_fills_up() {
    // Firmware, command and log regions take three slots.
    let config = common::config().with_record_capacity(5);
    let (_sim, device) = common::attach(config);
    let s = device.open().unwrap();
    let ids: Vec<_> = (0..3)
        .map(|_| s.alloc_from(HeapKind::Unified, 4096, BufferAttr::default()).unwrap())
        .collect();
    s.map_device(ids[0]).unwrap();
    s.map_device(ids[1]).unwrap();
    assert!(matches!(
        s.map_device(ids[2]),
        Err(VdspError::ResourceExhausted { .. })
    ));
    assert_eq!(s.info(ids[2]).unwrap().device_addr, None);

    s.unmap_device(ids[0]).unwrap();
    s.map_device(ids[2]).unwrap();
    assert!(device.iommu_dump().lines().count() >= 5);
}

#[test]
fn test_firmware_region_sits_at_window_base() {
    let (sim, device) = common::attach(common::config());
    let _s = device.open().unwrap();
    let base = device.config().iova_base;
    assert!(device.translate(base).is_some());
    let image = sim.read_device(base as u32, 4).unwrap();
    assert_eq!(image, vdsp_driver::sim::HW_MAGIC.to_le_bytes().to_vec());
}

#[test]
fn test_carveout_is_contiguous_and_recycled() {
    let (_sim, device) = common::attach(common::config());
    let s = device.open().unwrap();
    let a = s.alloc_from(HeapKind::Carveout, 3 * 4096, BufferAttr::default()).unwrap();
    let info = s.info(a).unwrap();
    let paddr = info.paddr.unwrap();
    assert_eq!(s.scatter_list(a).unwrap(), vec![(paddr, 3 * 4096)]);

    let rest = (256 << 10) - 3 * 4096;
    let b = s.alloc_from(HeapKind::Carveout, rest, BufferAttr::default()).unwrap();
    assert!(matches!(
        s.alloc_from(HeapKind::Carveout, 4096, BufferAttr::default()),
        Err(VdspError::ResourceExhausted { .. })
    ));
    s.free(a).unwrap();
    let c = s.alloc_from(HeapKind::Carveout, 4096, BufferAttr::default()).unwrap();
    assert_eq!(s.info(c).unwrap().paddr, Some(paddr));
    s.free(b).unwrap();
    s.free(c).unwrap();
}

#[test]
fn test_cache_sync_outcomes() {
    let (_sim, device) = common::attach(common::config());
    let s = device.open().unwrap();
    let cached = s.alloc_from(HeapKind::Unified, 4096, BufferAttr::CACHED).unwrap();
    let uncached = s.alloc_from(HeapKind::Unified, 4096, BufferAttr::UNCACHED).unwrap();
    assert_eq!(s.sync(cached, SyncDirection::ToDevice).unwrap(), CacheSync::Performed);
    assert_eq!(s.sync(cached, SyncDirection::FromDevice).unwrap(), CacheSync::Performed);
    assert_eq!(s.sync(uncached, SyncDirection::ToDevice).unwrap(), CacheSync::Uncached);

    let (_sim, device) = common::attach(common::config().with_cache_sync(false));
    let s = device.open().unwrap();
    let cached = s.alloc_from(HeapKind::Unified, 4096, BufferAttr::CACHED).unwrap();
    assert_eq!(s.sync(cached, SyncDirection::ToDevice).unwrap(), CacheSync::Disabled);
}

#[test]
fn test_export_and_import_fd() {
    let (_sim, device) = common::attach(common::config());
    let owner = device.open().unwrap();
    let other = device.open().unwrap();

    let id = owner.alloc_from(HeapKind::Unified, 4096, BufferAttr::default()).unwrap();
    owner.map_user(id).unwrap().write(0, b"shared").unwrap();
    let fd = owner.export(id).unwrap();

    let dmabuf = other.heaps().unwrap()[1].id;
    let imported = other.import_fd(dmabuf, fd, 4096, BufferAttr::default()).unwrap();
    assert_eq!(other.map_user(imported).unwrap().read(0, 6).unwrap(), b"shared");

    let anon = owner.alloc_from(HeapKind::Anonymous, 4096, BufferAttr::default()).unwrap();
    assert!(owner.export(anon).is_err());

    let too_small = owner.export(id).unwrap();
    assert!(other.import_fd(dmabuf, too_small, 3 * 4096, BufferAttr::default()).is_err());
    let unified = other.heaps().unwrap()[0].id;
    let fd = owner.export(id).unwrap();
    assert!(other.import_fd(unified, fd, 4096, BufferAttr::default()).is_err());
}

#[test]
fn test_import_user_pages() {
    let (_sim, device) = common::attach(common::config());
    let s = device.open().unwrap();
    let layout = std::alloc::Layout::from_size_align(8192, 4096).unwrap();
    // SAFETY: non-zero size, power-of-two alignment; freed below.
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null());

    let anon = s.heaps().unwrap()[2].id;
    // SAFETY: the pages outlive the buffer, which is freed before dealloc.
    let id = unsafe { s.import_user(anon, ptr, 8192, BufferAttr::default()) }.unwrap();
    s.submit(&Request::new(&b"into user pages"[..]).with_buffer(BufferRef::read_write(id)))
        .unwrap();
    // SAFETY: ptr is valid for 8192 bytes and no device access is in flight.
    let seen = unsafe { std::slice::from_raw_parts(ptr, 15) }.to_vec();
    assert_eq!(seen, b"into user pages");

    // SAFETY: misaligned pointer is rejected before it is used.
    let bad = unsafe { s.import_user(anon, ptr.wrapping_add(8), 4096, BufferAttr::default()) };
    assert!(bad.is_err());
    let unified = s.heaps().unwrap()[0].id;
    // SAFETY: rejected by heap type before use.
    assert!(unsafe { s.import_user(unified, ptr, 4096, BufferAttr::default()) }.is_err());

    s.free(id).unwrap();
    // SAFETY: same layout as the allocation.
    unsafe { std::alloc::dealloc(ptr, layout) };
}

#[test]
fn test_firmware_from_directory() {
    let config = common::config().with_firmware("dsp.elf");
    let dir = tempfile::tempdir().unwrap();
    let mut file = std::fs::File::create(dir.path().join("dsp.elf")).unwrap();
    file.write_all(&SimulatedDsp::firmware_image(config.iova_base as u32))
        .unwrap();

    let (sim, mut platform) = SimulatedDsp::platform(&config).unwrap();
    platform.firmware = std::sync::Arc::new(DirStore::new(dir.path()));
    let device = Device::attach(config, platform).unwrap();
    let s = device.open().unwrap();
    assert!(sim.is_serving());
    s.submit(&Request::new(&b"ok"[..])).unwrap();
}

#[test]
fn test_dvfs_follows_activity_and_hints() {
    let (sim, device) = common::attach(common::config());
    let a = device.open().unwrap();
    let b = device.open().unwrap();
    assert_eq!(sim.dvfs_level(), Some(0), "auto mode idles at zero");

    a.set_power_hint(3, true).unwrap();
    assert_eq!(sim.dvfs_level(), Some(3));
    b.set_power_hint(2, true).unwrap();
    assert_eq!(device.dvfs_level(), Some(3));
    assert!(a.set_power_hint(9, true).is_err());

    drop(a);
    assert_eq!(sim.dvfs_level(), Some(2), "closing drops the hint");

    b.set_dvfs_mode(DvfsMode::Fixed(4)).unwrap();
    assert_eq!(sim.dvfs_level(), Some(4));
    b.set_power_hint(2, false).unwrap();
    b.set_dvfs_mode(DvfsMode::Auto).unwrap();
    assert_eq!(sim.dvfs_level(), Some(0));

    b.submit(&Request::new(&b"busy"[..])).unwrap();
    assert_eq!(sim.dvfs_level(), Some(0), "back to idle after the request");
}
