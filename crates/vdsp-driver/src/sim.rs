// SPDX-License-Identifier: AGPL-3.0-only

//! In-process accelerator model.
//!
//! [`SimulatedDsp`] runs the firmware side of the link on a background thread.
//! It reaches host memory only the way hardware would: through the page table
//! of IOMMU unit 0 and the [`PhysMemory`](crate::dma::PhysMemory) registry.
//!
//! ```text
//!   release ─► AwaitStart ─► AwaitHost ─► AwaitDoorbell ─► Serving
//!                 (START)     (HOST_TO_DSP)  (doorbell)      (commands)
//! ```
//!
//! What it answers:
//!
//! | Request | Reply |
//! |---------|-------|
//! | system namespace, load | reads the relocation info, records the library |
//! | system namespace, unload | forgets the library |
//! | library namespace, loaded | echo |
//! | library namespace, unknown | `RESPONSE_DELIVERY_FAIL` |
//! | no namespace | echo; input also copied into every writable buffer |
//!
//! Faults can be injected to exercise recovery and handshake fallbacks.

// Device addresses are 32-bit; the model narrows host-side sizes to match
#![allow(clippy::cast_possible_truncation)]

use crate::config::VdspConfig;
use crate::device::Platform;
use crate::dma::DmaRegion;
use crate::error::{Result, VdspError};
use crate::lock;
use crate::platform::{Accelerator, BootInfo, HostBus, IommuProgram, MemoryStore};
use crate::transport::Descriptor;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};
use vdsp_chip::comm::cmd::{self, flags, INLINE_DATA_SIZE, NAMESPACE_ID_SIZE};
use vdsp_chip::comm::{queue_offset, sync, tlv, CMD_STRIDE, COMM_REGION_SIZE, MAX_QUEUES};
use vdsp_chip::firmware::{ImageBuilder, COMM_BASE_SYMBOL};
use vdsp_chip::iommu::{entry_index, translate, PAGE_SIZE, PTE_SIZE};
use vdsp_chip::library::{
    nsid_name, LibraryCommand, LibraryOp, PilInfo, PIL_INFO_SIZE, SYSTEM_NSID,
};
use vdsp_chip::log::{self as log_layout, BANK_BUSY, BANK_READY};

/// Offset of the comm-base word from the image entry point.
pub const COMM_BASE_OFFSET: u32 = 0x100;

/// Core-local address of the vector segment in [`SimulatedDsp::firmware_image`].
pub const LOCAL_VECTORS: u32 = 0x0010_0000;

/// Second word of the hardware blob.
pub const HW_MAGIC: u32 = u32::from_le_bytes(*b"VSIM");

const TICK: Duration = Duration::from_millis(1);

/// Event counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Releases from reset
    pub boots: u32,
    /// Resets
    pub resets: u32,
    /// Commands picked up, hung ones included
    pub commands: u32,
    /// Library loads served
    pub loads: u32,
    /// Library unloads served
    pub unloads: u32,
    /// Doorbells rung by the host
    pub doorbells: u32,
    /// Coredumps taken
    pub coredumps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Halted,
    AwaitStart,
    AwaitHost { v2: bool },
    AwaitDoorbell,
    Serving,
    /// Released but never answers
    Wedged,
}

#[derive(Debug, Default)]
struct Faults {
    hang_next: u32,
    fail_boots: u32,
    panic_boots: u32,
    reject_queues: bool,
    protocol_v1: bool,
}

#[derive(Debug)]
struct State {
    bus: Option<HostBus>,
    shutdown: bool,
    powered: bool,
    phase: Phase,
    comm: Option<Arc<DmaRegion>>,
    log_iova: Option<u32>,
    queues: usize,
    doorbells: u32,
    units: HashMap<usize, IommuProgram>,
    local: BTreeMap<u32, Vec<u8>>,
    libraries: BTreeSet<String>,
    hung: BTreeSet<usize>,
    dvfs_level: Option<u32>,
    faults: Faults,
    stats: SimStats,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

/// Simulated accelerator core.
#[derive(Debug)]
pub struct SimulatedDsp {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SimulatedDsp {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDsp {
    /// Powered-off core, not attached to a host.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    bus: None,
                    shutdown: false,
                    powered: false,
                    phase: Phase::Halted,
                    comm: None,
                    log_iova: None,
                    queues: 1,
                    doorbells: 0,
                    units: HashMap::new(),
                    local: BTreeMap::new(),
                    libraries: BTreeSet::new(),
                    hung: BTreeSet::new(),
                    dvfs_level: None,
                    faults: Faults::default(),
                    stats: SimStats::default(),
                }),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// A firmware image this model boots, linked at `fw_iova`. It carries a
    /// vector segment in core-local memory below the firmware region.
    pub fn firmware_image(fw_iova: u32) -> Vec<u8> {
        let mut code = vec![0u8; 0x200];
        code[..4].copy_from_slice(&HW_MAGIC.to_le_bytes());
        ImageBuilder::new(fw_iova)
            .segment(fw_iova, &code, 0x1000)
            .object(COMM_BASE_SYMBOL, fw_iova + COMM_BASE_OFFSET, 4)
            .segment(LOCAL_VECTORS, b"vectors", 0x100)
            .build()
    }

    /// A fresh model plus a platform serving its firmware under the name
    /// `config` expects.
    ///
    /// # Errors
    ///
    /// Returns an error if the IOVA base does not fit a 32-bit address.
    pub fn platform(config: &VdspConfig) -> Result<(Arc<Self>, Platform)> {
        let fw_iova = u32::try_from(config.iova_base)
            .map_err(|_| VdspError::invalid_argument("IOVA base above 4 GiB"))?;
        let store = MemoryStore::new();
        store.insert(config.firmware_name.clone(), Self::firmware_image(fw_iova));
        let sim = Arc::new(Self::new());
        let platform = Platform {
            accelerator: Arc::clone(&sim) as Arc<dyn Accelerator>,
            firmware: Arc::new(store),
        };
        Ok((sim, platform))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        lock(&self.shared.state)
    }

    /// Leave the next `n` commands unanswered.
    pub fn hang_next(&self, n: u32) {
        self.state().faults.hang_next = n;
    }

    /// Make the next `n` boots wedge before the handshake.
    pub fn fail_boots(&self, n: u32) {
        self.state().faults.fail_boots = n;
    }

    /// Make the next `n` boots panic on the host's handshake reply.
    pub fn panic_boots(&self, n: u32) {
        self.state().faults.panic_boots = n;
    }

    /// Refuse the queue table in the handshake.
    pub fn reject_queues(&self, reject: bool) {
        self.state().faults.reject_queues = reject;
    }

    /// Answer the handshake as a v1 core.
    pub fn protocol_v1(&self, v1: bool) {
        self.state().faults.protocol_v1 = v1;
    }

    /// Counters so far.
    pub fn stats(&self) -> SimStats {
        self.state().stats
    }

    /// Libraries the firmware currently holds.
    pub fn loaded_libraries(&self) -> Vec<String> {
        self.state().libraries.iter().cloned().collect()
    }

    /// DVFS level last applied.
    pub fn dvfs_level(&self) -> Option<u32> {
        self.state().dvfs_level
    }

    /// Whether IOMMU unit `unit` is on.
    pub fn iommu_enabled(&self, unit: usize) -> bool {
        self.state().units.contains_key(&unit)
    }

    /// Whether powered.
    pub fn is_powered(&self) -> bool {
        self.state().powered
    }

    /// Whether the handshake completed and commands are being served.
    pub fn is_serving(&self) -> bool {
        self.state().phase == Phase::Serving
    }

    /// Queues served after the last handshake.
    pub fn queues(&self) -> usize {
        self.state().queues
    }

    /// Contents of the core-local segment at `addr`.
    pub fn local_segment(&self, addr: u32) -> Option<Vec<u8>> {
        self.state().local.get(&addr).cloned()
    }

    /// Read `len` bytes at device address `iova` through IOMMU unit 0.
    pub fn read_device(&self, iova: u32, len: usize) -> Option<Vec<u8>> {
        read_iova(&self.state(), iova, len)
    }

    /// Append a line to a free log bank and interrupt the host. Returns
    /// `false` if logging is off or both banks are waiting on the host.
    pub fn emit_log(&self, line: &str) -> bool {
        let st = self.state();
        let Some(header) = st.log_iova else {
            return false;
        };
        let Some((hdr, base)) = word_region(&st, header, log_layout::HEADER_SIZE) else {
            return false;
        };
        if hdr.read32(base + log_layout::MODE) != log_layout::MODE_BUFFER {
            return false;
        }
        let bank_size = hdr.read32(base + log_layout::BANK_SIZE) as usize;
        let text = format!("{line}\n");
        for bank in 0..2 {
            let (flag, addr, fill) = log_layout::bank_fields(bank);
            if hdr.read32(base + flag) != BANK_BUSY {
                continue;
            }
            let used = hdr.read32(base + fill) as usize;
            if used + text.len() > bank_size {
                continue;
            }
            let at = hdr.read32(base + addr) + used as u32;
            if !write_iova(&st, at, text.as_bytes()) {
                return false;
            }
            hdr.write32(base + fill, (used + text.len()) as u32);
            hdr.write32(base + flag, BANK_READY);
            let bus = st.bus.clone();
            drop(st);
            if let Some(bus) = bus {
                bus.raise_irq();
            }
            return true;
        }
        false
    }
}

/// Bus address `iova` resolves to through unit 0.
fn bus_addr(st: &State, iova: u64) -> Option<u64> {
    let program = st.units.get(&0)?;
    if iova < program.iova_base || iova >= program.iova_base + program.iova_size {
        return None;
    }
    let bus = st.bus.as_ref()?;
    let at = program.page_table + (entry_index(program.iova_base, iova) * PTE_SIZE) as u64;
    let (table, offset) = bus.memory.resolve(at, PTE_SIZE)?;
    translate(table.read32(offset), iova)
}

/// Region backing `[iova, iova + len)`, which must not cross a page.
fn word_region(st: &State, iova: u32, len: usize) -> Option<(Arc<DmaRegion>, usize)> {
    let phys = bus_addr(st, u64::from(iova))?;
    st.bus.as_ref()?.memory.resolve(phys, len)
}

/// Walk `[iova, iova + len)` page by page.
fn for_each_page(st: &State, iova: u32, len: usize, mut f: impl FnMut(&DmaRegion, usize, usize, usize)) -> bool {
    let mut done = 0;
    while done < len {
        let at = u64::from(iova) + done as u64;
        let chunk = (PAGE_SIZE - at % PAGE_SIZE).min((len - done) as u64) as usize;
        let Some(phys) = bus_addr(st, at) else {
            return false;
        };
        let Some((region, offset)) = st.bus.as_ref().and_then(|b| b.memory.resolve(phys, chunk)) else {
            return false;
        };
        f(&region, offset, done, chunk);
        done += chunk;
    }
    true
}

fn read_iova(st: &State, iova: u32, len: usize) -> Option<Vec<u8>> {
    let mut out = vec![0u8; len];
    for_each_page(st, iova, len, |region, offset, at, chunk| {
        region.read(offset, &mut out[at..at + chunk]);
    })
    .then_some(out)
}

fn write_iova(st: &State, iova: u32, data: &[u8]) -> bool {
    for_each_page(st, iova, data.len(), |region, offset, at, chunk| {
        region.write(offset, &data[at..at + chunk]);
    })
}

/// Firmware side of one step. Returns whether the host should be interrupted.
fn step(st: &mut State) -> bool {
    let Some(comm) = st.comm.clone() else {
        return false;
    };
    match st.phase {
        Phase::Halted | Phase::Wedged => false,
        Phase::AwaitStart => {
            if comm.read32(sync::OFFSET) == sync::START {
                let v2 = !st.faults.protocol_v1;
                let reply = if v2 { sync::DSP_READY_V2 } else { sync::DSP_READY_V1 };
                comm.write32(sync::OFFSET, reply);
                st.phase = Phase::AwaitHost { v2 };
            }
            false
        }
        Phase::AwaitHost { v2 } => {
            if comm.read32(sync::OFFSET) != sync::HOST_TO_DSP {
                return false;
            }
            if st.faults.panic_boots > 0 {
                st.faults.panic_boots -= 1;
                comm.write32(sync::OFFSET, sync::DSP_PANIC);
                st.phase = Phase::Wedged;
                return false;
            }
            if v2 {
                accept_records(st, &comm);
            } else {
                st.queues = 1;
                st.log_iova = Some(comm.read32(sync::OFFSET + sync::V1_DATA_OFFSET));
            }
            st.doorbells = 0;
            comm.write32(sync::OFFSET, sync::DSP_TO_HOST);
            st.phase = Phase::AwaitDoorbell;
            false
        }
        Phase::AwaitDoorbell => {
            if st.doorbells == 0 {
                return false;
            }
            st.doorbells = 0;
            st.phase = Phase::Serving;
            debug!("simulated DSP serving {} queue(s)", st.queues);
            true
        }
        Phase::Serving => {
            st.doorbells = 0;
            let mut answered = false;
            for q in 0..st.queues {
                answered |= serve(st, &comm, q);
            }
            answered
        }
    }
}

fn accept_records(st: &mut State, comm: &DmaRegion) {
    st.queues = 1;
    let mut at = sync::V2_DATA_OFFSET;
    while at + tlv::HEADER_SIZE <= CMD_STRIDE {
        let kind = comm.read32(at);
        let len = comm.read32(at + 4) as usize;
        if kind & tlv::TYPE_MASK == tlv::LAST || at + tlv::record_size(len) > CMD_STRIDE {
            break;
        }
        let accept = match kind & tlv::TYPE_MASK {
            tlv::HW_SPEC_DATA => {
                if len >= 4 {
                    st.log_iova = Some(comm.read32(at + tlv::HEADER_SIZE));
                }
                true
            }
            tlv::HW_QUEUES => {
                if st.faults.reject_queues {
                    false
                } else {
                    st.queues = (len / 4).clamp(1, MAX_QUEUES);
                    true
                }
            }
            tlv::LOG => true,
            other => {
                warn!("simulated DSP: unknown record type {other}");
                false
            }
        };
        if accept {
            comm.write32(at, kind | tlv::ACCEPT);
        }
        at += tlv::record_size(len);
    }
}

/// Answer queue `q` if it holds a request. Returns whether it was answered.
fn serve(st: &mut State, comm: &DmaRegion, q: usize) -> bool {
    let base = queue_offset(q);
    let status = comm.read32(base + cmd::FLAGS);
    if status & flags::REQUEST_VALID == 0 || status & flags::RESPONSE_VALID != 0 || st.hung.contains(&q) {
        return false;
    }
    st.stats.commands += 1;
    if st.faults.hang_next > 0 {
        st.faults.hang_next -= 1;
        st.hung.insert(q);
        debug!("simulated DSP: hanging queue {q}");
        return false;
    }

    let in_size = comm.read32(base + cmd::IN_DATA_SIZE) as usize;
    let out_size = comm.read32(base + cmd::OUT_DATA_SIZE) as usize;
    let buf_size = comm.read32(base + cmd::BUFFER_SIZE) as usize;
    let input = if in_size <= INLINE_DATA_SIZE {
        Some(comm.to_vec(base + cmd::IN_DATA, in_size))
    } else {
        read_iova(st, comm.read32(base + cmd::IN_DATA), in_size)
    };
    let descriptors = if buf_size <= std::mem::size_of::<Descriptor>() {
        Some(comm.to_vec(base + cmd::BUFFER_DATA, buf_size))
    } else {
        read_iova(st, comm.read32(base + cmd::BUFFER_DATA), buf_size)
    };
    let (Some(input), Some(descriptors)) = (input, descriptors) else {
        warn!("simulated DSP: queue {q} request points at unmapped memory");
        comm.write32(base + cmd::FLAGS, status | flags::RESPONSE_VALID | flags::RESPONSE_DELIVERY_FAIL);
        return true;
    };

    let nsid = (status & flags::REQUEST_NSID != 0).then(|| comm.to_vec(base + cmd::NSID, NAMESPACE_ID_SIZE));
    let delivered = match nsid {
        Some(ns) if ns[..] == SYSTEM_NSID[..] => library_command(st, &input),
        Some(ns) => st.libraries.contains(nsid_name(&ns)),
        None => {
            for chunk in descriptors.chunks_exact(std::mem::size_of::<Descriptor>()) {
                let d: Descriptor = bytemuck::pod_read_unaligned(chunk);
                if d.access() & vdsp_chip::comm::descriptor::ACCESS_WRITE != 0 {
                    let len = (d.size() as usize).min(input.len());
                    write_iova(st, d.addr(), &input[..len]);
                }
            }
            true
        }
    };

    let mut reply = status | flags::RESPONSE_VALID;
    if delivered {
        let mut output = input;
        output.resize(out_size, 0);
        if out_size <= INLINE_DATA_SIZE {
            let mut inline = [0u8; INLINE_DATA_SIZE];
            inline[..out_size].copy_from_slice(&output);
            comm.write(base + cmd::OUT_DATA, &inline);
        } else if !write_iova(st, comm.read32(base + cmd::OUT_DATA), &output) {
            warn!("simulated DSP: queue {q} output buffer unmapped");
        }
    } else {
        reply |= flags::RESPONSE_DELIVERY_FAIL;
    }
    trace!("simulated DSP: queue {q} answered {reply:#x}");
    comm.write32(base + cmd::FLAGS, reply);
    true
}

fn library_command(st: &mut State, input: &[u8]) -> bool {
    let Ok(command) = LibraryCommand::decode(input) else {
        return false;
    };
    match command.op {
        LibraryOp::Load => {
            let pil = read_iova(st, command.pil_info, PIL_INFO_SIZE).and_then(|b| PilInfo::decode(&b).ok());
            let Some(pil) = pil else {
                warn!("simulated DSP: {} has no readable relocation info", command.name);
                return false;
            };
            debug!("simulated DSP: {} loaded at {:#x}", command.name, pil.code_addr);
            st.libraries.insert(command.name);
            st.stats.loads += 1;
            true
        }
        LibraryOp::Unload => {
            if st.libraries.remove(&command.name) {
                st.stats.unloads += 1;
            }
            true
        }
    }
}

fn run(shared: &Shared) {
    let mut st = lock(&shared.state);
    loop {
        if st.shutdown {
            return;
        }
        st = shared
            .wake
            .wait_timeout(st, TICK)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
        if st.shutdown {
            return;
        }
        if !st.powered {
            continue;
        }
        if step(&mut st) {
            let bus = st.bus.clone();
            drop(st);
            if let Some(bus) = bus {
                bus.raise_irq();
            }
            st = lock(&shared.state);
        }
    }
}

impl Accelerator for SimulatedDsp {
    fn attach(&self, bus: HostBus) -> Result<()> {
        let mut worker = lock(&self.worker);
        {
            let mut st = self.state();
            if st.bus.is_some() {
                return Err(VdspError::invalid_argument("simulated DSP already attached"));
            }
            st.bus = Some(bus);
            st.shutdown = false;
        }
        if worker.is_none() {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name("vdsp-sim".to_owned())
                .spawn(move || run(&shared))?;
            *worker = Some(handle);
        }
        Ok(())
    }

    fn detach(&self) {
        {
            let mut st = self.state();
            st.shutdown = true;
            st.bus = None;
            st.comm = None;
            st.phase = Phase::Halted;
        }
        self.shared.wake.notify_all();
        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        // The last device reference can be dropped from our own interrupt.
        if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
            warn!("simulated DSP worker panicked");
        }
    }

    fn power_on(&self) -> Result<()> {
        let mut st = self.state();
        if st.bus.is_none() {
            return Err(VdspError::DeviceUnavailable);
        }
        st.powered = true;
        Ok(())
    }

    fn power_off(&self) {
        let mut st = self.state();
        st.powered = false;
        st.phase = Phase::Halted;
        st.comm = None;
        st.dvfs_level = None;
    }

    fn reset(&self) {
        let mut st = self.state();
        st.stats.resets += 1;
        st.phase = Phase::Halted;
    }

    fn halt(&self) {
        self.state().phase = Phase::Halted;
    }

    fn release(&self, boot: &BootInfo) -> Result<()> {
        let mut st = self.state();
        if !st.powered {
            return Err(VdspError::DeviceUnavailable);
        }
        let comm_word = read_iova(&st, boot.entry + COMM_BASE_OFFSET, 4)
            .ok_or_else(|| VdspError::firmware("entry point is not mapped"))?;
        let comm_iova = u32::from_le_bytes([comm_word[0], comm_word[1], comm_word[2], comm_word[3]]);
        let (region, offset) = word_region(&st, comm_iova, COMM_REGION_SIZE)
            .ok_or_else(|| VdspError::firmware(format!("comm region {comm_iova:#x} is not mapped")))?;
        let comm = Arc::new(DmaRegion::sub(&region, offset, COMM_REGION_SIZE)?);

        st.stats.boots += 1;
        st.comm = Some(comm);
        st.hung.clear();
        st.libraries.clear();
        st.queues = 1;
        st.doorbells = 0;
        if st.faults.fail_boots > 0 {
            st.faults.fail_boots -= 1;
            st.phase = Phase::Wedged;
            debug!("simulated DSP: boot {} wedged", st.stats.boots);
        } else {
            st.phase = Phase::AwaitStart;
            debug!("simulated DSP: released at {:#x}, comm {comm_iova:#x}", boot.entry);
        }
        drop(st);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn send_irq(&self) {
        let mut st = self.state();
        st.stats.doorbells += 1;
        st.doorbells += 1;
        drop(st);
        self.shared.wake.notify_all();
    }

    fn hw_sync_data(&self, log_iova: u32) -> Bytes {
        let mut blob = Vec::with_capacity(8);
        blob.extend_from_slice(&log_iova.to_le_bytes());
        blob.extend_from_slice(&HW_MAGIC.to_le_bytes());
        Bytes::from(blob)
    }

    fn iommu_enable(&self, unit: usize, program: &IommuProgram) -> Result<()> {
        debug!("simulated DSP: IOMMU {unit} ({}) on", program.name);
        self.state().units.insert(unit, program.clone());
        Ok(())
    }

    fn iommu_disable(&self, unit: usize) {
        self.state().units.remove(&unit);
    }

    fn set_dvfs_level(&self, level: u32) -> Result<()> {
        self.state().dvfs_level = Some(level);
        Ok(())
    }

    fn load_local(&self, addr: u32, data: &[u8], memsz: usize) -> Result<()> {
        let mut segment = data.to_vec();
        segment.resize(memsz.max(data.len()), 0);
        self.state().local.insert(addr, segment);
        Ok(())
    }

    fn coredump(&self) {
        let mut st = self.state();
        st.stats.coredumps += 1;
        debug!("simulated DSP: coredump, {} hung queue(s)", st.hung.len());
    }
}

impl Drop for SimulatedDsp {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdsp_chip::firmware::FirmwareImage;

    #[test]
    fn test_firmware_image_layout() {
        let blob = SimulatedDsp::firmware_image(0x8000_0000);
        let image = FirmwareImage::parse(&blob).unwrap();
        assert_eq!(image.entry(), 0x8000_0000);
        let symbol = image.find_object_symbol(COMM_BASE_SYMBOL).unwrap();
        assert_eq!(symbol.value, 0x8000_0000 + COMM_BASE_OFFSET);
        let segments = image.loadable_segments().unwrap();
        assert!(segments.iter().any(|s| s.paddr == LOCAL_VECTORS));
    }

    #[test]
    fn test_power_requires_attach() {
        let sim = SimulatedDsp::new();
        assert!(matches!(sim.power_on(), Err(VdspError::DeviceUnavailable)));
        assert_eq!(sim.hw_sync_data(0x1234).len(), 8);
        sim.load_local(LOCAL_VECTORS, b"abc", 8).unwrap();
        assert_eq!(sim.local_segment(LOCAL_VECTORS).unwrap(), b"abc\0\0\0\0\0");
    }
}
