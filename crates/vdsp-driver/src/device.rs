// SPDX-License-Identifier: AGPL-3.0-only

//! Device and sessions.
//!
//! A [`Device`] owns the IOMMU table, the buffer manager and, while at least
//! one [`Session`] is open, a booted accelerator. The first open powers the
//! accelerator on, maps the firmware, command and log regions and runs the
//! handshake; the last close unloads what is left and powers it off.
//!
//! Sessions hold only a weak reference to the device. Operations on a session
//! whose device is gone fail with [`VdspError::DeviceUnavailable`].

use crate::config::{VdspConfig, FIRMWARE_EXTENT};
use crate::dma::PhysMemory;
use crate::dsplog::DspLog;
use crate::dvfs::{Dvfs, DvfsMode};
use crate::error::{Result, VdspError};
use crate::firmware::FirmwareLoader;
use crate::iommu::{IommuTable, IommuUsage, Placement};
use crate::library::{control_request, LibraryRegistry, LibraryState};
use crate::lock;
use crate::mem::{
    BufferAttr, BufferId, BufferInfo, BufferManager, CacheSync, HeapInfo, HeapKind, MemoryUsage,
    NamespaceId, SyncDirection, UserMapping,
};
use crate::platform::{Accelerator, FirmwareStore, HostBus};
use crate::request::{BufferRef, Executor, Request, Response};
use crate::transport::{LinkState, Transport};
use rustix::fd::OwnedFd;
use slab::Slab;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};
use vdsp_chip::comm::COMM_REGION_SIZE;
use vdsp_chip::library::{LibraryCommand, LibraryOp};

/// Session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub usize);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// Board hooks for a device.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Power, reset and interrupt control
    pub accelerator: Arc<dyn Accelerator>,
    /// Firmware blobs
    pub firmware: Arc<dyn FirmwareStore>,
}

/// State that exists while the accelerator is powered.
#[derive(Debug)]
struct Running {
    transport: Transport,
    log: DspLog,
    regions: [BufferId; 3],
}

#[derive(Debug)]
struct SessionEntry {
    namespace: NamespaceId,
}

#[derive(Debug)]
struct Inner {
    config: VdspConfig,
    accel: Arc<dyn Accelerator>,
    store: Arc<dyn FirmwareStore>,
    iommu: Arc<IommuTable>,
    buffers: Arc<BufferManager>,
    driver_ns: NamespaceId,
    libraries: LibraryRegistry,
    dvfs: Dvfs,
    sessions: Mutex<Slab<SessionEntry>>,
    running: Mutex<Option<Arc<Running>>>,
}

impl Inner {
    fn running(&self) -> Result<Arc<Running>> {
        lock(&self.running)
            .clone()
            .ok_or(VdspError::DeviceUnavailable)
    }

    fn on_irq(&self) {
        let running = lock(&self.running).clone();
        if let Some(r) = running {
            r.log.drain();
            r.transport.handle_irq();
        }
    }

    fn executor<'a>(&'a self, running: &'a Running) -> Executor<'a> {
        Executor {
            buffers: &self.buffers,
            transport: &running.transport,
        }
    }

    fn alloc_region(&self, size: usize, attr: BufferAttr, placement: Placement) -> Result<(BufferId, u32)> {
        let heap = self
            .buffers
            .heap_id(HeapKind::Unified)
            .ok_or(VdspError::UnknownHeap { heap: 0 })?;
        let id = self.buffers.alloc(self.driver_ns, heap, size, attr)?;
        match self.buffers.map_device_at(self.driver_ns, id, placement) {
            Ok(addr) => Ok((id, device_u32(addr)?)),
            Err(e) => {
                let _ = self.buffers.free(self.driver_ns, id);
                Err(e)
            }
        }
    }

    fn release_regions(&self, regions: &[BufferId]) {
        for &id in regions {
            let _ = self.buffers.unmap_device(self.driver_ns, id);
            if let Err(e) = self.buffers.free(self.driver_ns, id) {
                warn!("driver region {id}: {e}");
            }
        }
    }

    /// Power on, lay out the shared regions and boot.
    fn bring_up(&self) -> Result<()> {
        self.accel.power_on()?;
        let mut regions = Vec::with_capacity(3);
        let result = self.layout(&mut regions);
        let running = match result {
            Ok(running) => Arc::new(running),
            Err(e) => {
                self.release_regions(&regions);
                self.accel.power_off();
                return Err(e);
            }
        };

        *lock(&self.running) = Some(Arc::clone(&running));
        if let Err(e) = self.dvfs.enable() {
            warn!("DVFS enable: {e}");
        }
        if let Err(e) = running.transport.start() {
            lock(&self.running).take();
            self.dvfs.disable();
            self.release_regions(&running.regions);
            self.accel.power_off();
            return Err(e);
        }
        info!(
            "accelerator up, {} queue(s)",
            running.transport.active_queues()
        );
        Ok(())
    }

    fn layout(&self, regions: &mut Vec<BufferId>) -> Result<Running> {
        let (fw_addr, fw_size) = self
            .iommu
            .reserved(FIRMWARE_EXTENT)
            .ok_or_else(|| VdspError::firmware("firmware extent not reserved"))?;
        let fw_size = usize::try_from(fw_size)
            .map_err(|_| VdspError::invalid_argument("firmware region too large"))?;
        let (firmware, fw_iova) =
            self.alloc_region(fw_size, BufferAttr::WRITECOMBINE, Placement::Fixed(fw_addr))?;
        regions.push(firmware);
        let (comm, comm_iova) =
            self.alloc_region(COMM_REGION_SIZE, BufferAttr::UNCACHED, Placement::Any)?;
        regions.push(comm);
        let log_size = vdsp_chip::log::buffer_size(self.config.log.bank_size);
        let (log_buf, log_iova) = self.alloc_region(log_size, BufferAttr::UNCACHED, Placement::Any)?;
        regions.push(log_buf);
        debug!("firmware {fw_iova:#x}, comm {comm_iova:#x}, log {log_iova:#x}");

        let loader = FirmwareLoader::new(
            Arc::clone(&self.store),
            Arc::clone(&self.accel),
            self.config.firmware_name.clone(),
            self.buffers.region(self.driver_ns, firmware)?,
            u64::from(fw_iova),
            u64::from(comm_iova),
        );
        let transport = Transport::new(
            &self.config,
            Arc::clone(&self.accel),
            self.buffers.region(self.driver_ns, comm)?,
            loader,
            log_iova,
        );
        let log = DspLog::new(
            self.buffers.region(self.driver_ns, log_buf)?,
            log_iova,
            &self.config.log,
        );
        Ok(Running {
            transport,
            log,
            regions: [firmware, comm, log_buf],
        })
    }

    /// Halt, forget libraries and power off.
    fn tear_down(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        running.transport.stop();
        self.libraries.clear(&self.buffers);
        self.dvfs.disable();
        self.release_regions(&running.regions);
        self.accel.power_off();
        info!("accelerator powered off");
    }

    fn close(&self, id: SessionId) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        let entry = sessions
            .try_remove(id.0)
            .ok_or_else(|| VdspError::invalid_argument(format!("{id} is not open")))?;
        if let Ok(running) = self.running() {
            self.libraries
                .release_session(id, &self.executor(&running));
        }
        self.dvfs.release(id);
        let result = self.buffers.destroy_namespace(entry.namespace);
        debug!("{id} closed");
        if sessions.is_empty() {
            self.tear_down();
        }
        result
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.tear_down();
        self.iommu.release_reserved();
        self.accel.detach();
    }
}

fn device_u32(addr: u64) -> Result<u32> {
    u32::try_from(addr).map_err(|_| VdspError::invalid_argument(format!("device address {addr:#x} above 4 GiB")))
}

/// One accelerator and its host-side state.
#[derive(Debug, Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

impl Device {
    /// Set up the IOMMU table and heaps and connect to the accelerator. The
    /// accelerator stays off until the first [`Device::open`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, driver memory cannot
    /// be allocated, or the accelerator cannot be attached.
    pub fn attach(config: VdspConfig, platform: Platform) -> Result<Self> {
        config.validate()?;
        let memory = Arc::new(PhysMemory::new());
        let iommu = Arc::new(IommuTable::new(
            &config,
            &memory,
            Arc::clone(&platform.accelerator),
        )?);
        let buffers = Arc::new(BufferManager::new(
            Arc::clone(&memory),
            Arc::clone(&iommu),
            config.carveout_size,
            config.buffers_per_namespace,
            config.max_namespaces,
            config.cache_sync,
        )?);
        let driver_ns = buffers.create_namespace()?;

        let inner = Arc::new(Inner {
            dvfs: Dvfs::new(Arc::clone(&platform.accelerator), config.dvfs_max_level),
            libraries: LibraryRegistry::new(driver_ns),
            accel: platform.accelerator,
            store: platform.firmware,
            iommu,
            buffers,
            driver_ns,
            sessions: Mutex::new(Slab::new()),
            running: Mutex::new(None),
            config,
        });

        let weak = Arc::downgrade(&inner);
        let irq = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_irq();
            }
        });
        inner.accel.attach(HostBus::new(memory, irq))?;
        info!(
            "vdsp attached: {} heap(s), firmware {}",
            inner.buffers.heaps().len(),
            inner.config.firmware_name
        );
        Ok(Self { inner })
    }

    /// Open a session, booting the accelerator if it is off.
    ///
    /// # Errors
    ///
    /// Returns the boot error on first open, or
    /// [`VdspError::ResourceExhausted`] at the namespace limit.
    pub fn open(&self) -> Result<Session> {
        let inner = &self.inner;
        let mut sessions = lock(&inner.sessions);
        if sessions.is_empty() {
            inner.bring_up()?;
        }
        let namespace = match inner.buffers.create_namespace() {
            Ok(ns) => ns,
            Err(e) => {
                if sessions.is_empty() {
                    inner.tear_down();
                }
                return Err(e);
            }
        };
        let id = SessionId(sessions.insert(SessionEntry { namespace }));
        debug!("{id} opened with {namespace}");
        Ok(Session {
            id,
            namespace,
            device: Arc::downgrade(inner),
            closed: false,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &VdspConfig {
        &self.inner.config
    }

    /// Registered heaps.
    pub fn heaps(&self) -> Vec<HeapInfo> {
        self.inner.buffers.heaps()
    }

    /// Open sessions.
    pub fn session_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    /// Link state; `Offline` while powered off.
    pub fn link_state(&self) -> LinkState {
        self.inner
            .running()
            .map_or(LinkState::Offline, |r| r.transport.link().0)
    }

    /// Completed recoveries since power on.
    pub fn generation(&self) -> u64 {
        self.inner.running().map_or(0, |r| r.transport.link().1)
    }

    /// Queues negotiated in the last handshake.
    pub fn active_queues(&self) -> usize {
        self.inner
            .running()
            .map_or(0, |r| r.transport.active_queues())
    }

    /// Queue priorities negotiated in the last handshake.
    pub fn queue_priorities(&self) -> Vec<u32> {
        self.inner
            .running()
            .map_or_else(|_| Vec::new(), |r| r.transport.queue_priorities())
    }

    /// IOMMU occupancy.
    pub fn iommu_usage(&self) -> IommuUsage {
        self.inner.iommu.usage()
    }

    /// Live IOMMU mappings, one per line.
    pub fn iommu_dump(&self) -> String {
        self.inner.iommu.dump()
    }

    /// Bus address a device address translates to.
    pub fn translate(&self, iova: u64) -> Option<u64> {
        self.inner.iommu.translate(iova)
    }

    /// Whether IOMMU unit `unit` is switched on.
    pub fn iommu_enabled(&self, unit: usize) -> bool {
        self.inner.iommu.is_enabled(unit)
    }

    /// Bytes allocated across all namespaces.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.inner.buffers.total_usage()
    }

    /// DVFS level last programmed.
    pub fn dvfs_level(&self) -> Option<u32> {
        self.inner.dvfs.level()
    }

    /// Accelerator log lines drained so far.
    pub fn dsp_log_lines(&self) -> u64 {
        self.inner.running().map_or(0, |r| r.log.lines())
    }
}

/// A client's handle on the device.
///
/// Dropping a session closes it; [`Session::close`] does the same and
/// reports errors.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    namespace: NamespaceId,
    device: Weak<Inner>,
    closed: bool,
}

impl Session {
    fn inner(&self) -> Result<Arc<Inner>> {
        self.device.upgrade().ok_or(VdspError::DeviceUnavailable)
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session's buffer namespace.
    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    /// Registered heaps.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::DeviceUnavailable`] if the device is gone.
    pub fn heaps(&self) -> Result<Vec<HeapInfo>> {
        Ok(self.inner()?.buffers.heaps())
    }

    /// Allocate from heap `heap`.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::alloc`].
    pub fn alloc(&self, heap: u32, size: usize, attr: BufferAttr) -> Result<BufferId> {
        self.inner()?.buffers.alloc(self.namespace, heap, size, attr)
    }

    /// Allocate from the first heap of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::UnknownHeap`] if there is no such heap.
    pub fn alloc_from(&self, kind: HeapKind, size: usize, attr: BufferAttr) -> Result<BufferId> {
        let inner = self.inner()?;
        let heap = inner
            .buffers
            .heap_id(kind)
            .ok_or(VdspError::UnknownHeap { heap: u32::MAX })?;
        inner.buffers.alloc(self.namespace, heap, size, attr)
    }

    /// Import a shared fd.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::import_fd`].
    pub fn import_fd(&self, heap: u32, fd: OwnedFd, size: usize, attr: BufferAttr) -> Result<BufferId> {
        self.inner()?
            .buffers
            .import_fd(self.namespace, heap, fd, size, attr)
    }

    /// Import caller-owned pages.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::import_user`].
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for reads and writes of `size` bytes until the
    /// buffer is freed or the session closes.
    pub unsafe fn import_user(&self, heap: u32, ptr: *mut u8, size: usize, attr: BufferAttr) -> Result<BufferId> {
        let inner = self.inner()?;
        // SAFETY: forwarded from the caller.
        unsafe { inner.buffers.import_user(self.namespace, heap, ptr, size, attr) }
    }

    /// Export a buffer as a shareable fd.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::export`].
    pub fn export(&self, id: BufferId) -> Result<OwnedFd> {
        self.inner()?.buffers.export(self.namespace, id)
    }

    /// Free a buffer.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::free`].
    pub fn free(&self, id: BufferId) -> Result<()> {
        self.inner()?.buffers.free(self.namespace, id)
    }

    /// Map a buffer for the accelerator.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::map_device`].
    pub fn map_device(&self, id: BufferId) -> Result<u64> {
        self.inner()?.buffers.map_device(self.namespace, id)
    }

    /// Drop a device mapping reference.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::unmap_device`].
    pub fn unmap_device(&self, id: BufferId) -> Result<()> {
        self.inner()?.buffers.unmap_device(self.namespace, id)
    }

    /// Give the driver a host mapping.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::map_kernel`].
    pub fn map_kernel(&self, id: BufferId) -> Result<UserMapping> {
        self.inner()?.buffers.map_kernel(self.namespace, id)
    }

    /// Drop the driver's host mapping.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::unmap_kernel`].
    pub fn unmap_kernel(&self, id: BufferId) -> Result<()> {
        self.inner()?.buffers.unmap_kernel(self.namespace, id)
    }

    /// Map a buffer into this process.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::map_user`].
    pub fn map_user(&self, id: BufferId) -> Result<UserMapping> {
        self.inner()?.buffers.map_user(self.namespace, id)
    }

    /// Drop a user mapping.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::unmap_user`].
    pub fn unmap_user(&self, id: BufferId) -> Result<()> {
        self.inner()?.buffers.unmap_user(self.namespace, id)
    }

    /// Cache maintenance.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::sync`].
    pub fn sync(&self, id: BufferId, direction: SyncDirection) -> Result<CacheSync> {
        self.inner()?.buffers.sync(self.namespace, id, direction)
    }

    /// Buffer attributes.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::info`].
    pub fn info(&self, id: BufferId) -> Result<BufferInfo> {
        self.inner()?.buffers.info(self.namespace, id)
    }

    /// Scatter list of a buffer.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::scatter_list`].
    pub fn scatter_list(&self, id: BufferId) -> Result<Vec<(u64, u64)>> {
        self.inner()?.buffers.scatter_list(self.namespace, id)
    }

    /// Page addresses of a buffer.
    ///
    /// # Errors
    ///
    /// See [`BufferManager::page_array`].
    pub fn page_array(&self, id: BufferId) -> Result<Vec<u64>> {
        self.inner()?.buffers.page_array(self.namespace, id)
    }

    /// Live buffers of this session.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::DeviceUnavailable`] if the device is gone.
    pub fn buffers(&self) -> Result<Vec<BufferId>> {
        self.inner()?.buffers.buffers(self.namespace)
    }

    /// Bytes held by this session.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::DeviceUnavailable`] if the device is gone.
    pub fn memory_usage(&self) -> Result<MemoryUsage> {
        self.inner()?.buffers.usage(self.namespace)
    }

    /// Send a request and wait for the answer.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::Timeout`], [`VdspError::DeviceUnavailable`],
    /// [`VdspError::UnknownNamespace`] or a buffer or library error.
    pub fn submit(&self, request: &Request) -> Result<Response> {
        let inner = self.inner()?;
        let running = inner.running()?;
        inner.dvfs.begin();
        let result = inner.libraries.dispatch(
            self.id,
            self.namespace,
            request,
            &inner.executor(&running),
        );
        inner.dvfs.end();
        if let Err(e) = &result {
            debug!("{}: request failed: {e}", self.id);
        }
        result
    }

    /// Load library `name` from the package in `package`.
    ///
    /// # Errors
    ///
    /// Returns an error if the package is malformed or the firmware refuses
    /// the load.
    pub fn load_library(&self, name: &str, package: BufferId) -> Result<()> {
        let command = LibraryCommand::new(LibraryOp::Load, name)?;
        self.submit(&control_request(&command).with_buffer(BufferRef::read(package)))
            .map(|_| ())
    }

    /// Drop this session's hold on library `name`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::LibraryState`] if the session does not hold it or
    /// commands are in flight.
    pub fn unload_library(&self, name: &str) -> Result<()> {
        let command = LibraryCommand::new(LibraryOp::Unload, name)?;
        self.submit(&control_request(&command)).map(|_| ())
    }

    /// Host view of library `name`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::DeviceUnavailable`] if the accelerator is off.
    pub fn library_state(&self, name: &str) -> Result<LibraryState> {
        let inner = self.inner()?;
        let running = inner.running()?;
        Ok(inner.libraries.state(name, &inner.executor(&running)))
    }

    /// Host-wide user count of library `name`.
    ///
    /// # Errors
    ///
    /// Returns [`VdspError::DeviceUnavailable`] if the accelerator is off.
    pub fn library_users(&self, name: &str) -> Result<u32> {
        let inner = self.inner()?;
        let running = inner.running()?;
        Ok(inner.libraries.users(name, &inner.executor(&running)))
    }

    /// Select the DVFS base level.
    ///
    /// # Errors
    ///
    /// Returns an error for a level above the maximum.
    pub fn set_dvfs_mode(&self, mode: DvfsMode) -> Result<()> {
        self.inner()?.dvfs.set_mode(mode)
    }

    /// Set or clear this session's power hint.
    ///
    /// # Errors
    ///
    /// Returns an error for a level above the maximum.
    pub fn set_power_hint(&self, level: u32, enable: bool) -> Result<()> {
        self.inner()?.dvfs.set_hint(self.id, level, enable)
    }

    /// Close the session, reporting teardown errors.
    ///
    /// # Errors
    ///
    /// Returns the namespace teardown error, or
    /// [`VdspError::DeviceUnavailable`] if the device is gone.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.inner()?.close(self.id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Some(inner) = self.device.upgrade() {
            if let Err(e) = inner.close(self.id) {
                error!("{} close: {e}", self.id);
            }
        }
    }
}
