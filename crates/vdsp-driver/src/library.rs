// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side registry of libraries loaded into the firmware.
//!
//! Load and unload requests are system-namespace commands. The registry
//! intercepts them:
//!
//! | Request | Registry action |
//! |---------|-----------------|
//! | load, first client | relocate the package into driver memory, send the load |
//! | load, already loaded | count the client, nothing sent |
//! | unload, other users left | uncount the client, nothing sent |
//! | unload, last user | send the unload, free the library memory |
//! | command to a library | counted as in flight; unload is refused meanwhile |
//!
//! The registry lock is held across load and unload round trips. Entries are
//! stamped with the link generation they were loaded in; after a recovery
//! reboot the firmware has forgotten them, so any entry from an older
//! generation is dropped the next time the registry is touched.

use crate::device::SessionId;
use crate::error::{Result, VdspError};
use crate::lock;
use crate::mem::{BufferAttr, BufferId, BufferManager, HeapKind, NamespaceId};
use crate::request::{Executor, Request, Response};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use vdsp_chip::library::{
    nsid_name, LibraryCommand, LibraryOp, LibraryPackage, COMMAND_SIZE, SYSTEM_NSID,
};

/// Where a library is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryState {
    /// Not known to the firmware
    Idle,
    /// Load round trip in progress
    Loading,
    /// Loaded and idle
    Loaded,
    /// Commands in flight
    Processing,
    /// Unload round trip in progress
    Unloading,
}

impl fmt::Display for LibraryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Loaded => write!(f, "loaded"),
            Self::Processing => write!(f, "processing"),
            Self::Unloading => write!(f, "unloading"),
        }
    }
}

#[derive(Debug)]
struct Entry {
    state: LibraryState,
    clients: HashMap<SessionId, u32>,
    in_flight: u32,
    code: BufferId,
    pil: BufferId,
    pil_addr: u32,
    generation: u64,
}

impl Entry {
    fn users(&self) -> u32 {
        self.clients.values().sum()
    }
}

/// What a request turns out to be.
enum Kind {
    Plain,
    Control(LibraryCommand),
    Library(String),
}

fn classify(req: &Request) -> Result<Kind> {
    match &req.nsid {
        None => Ok(Kind::Plain),
        Some(nsid) if *nsid == SYSTEM_NSID => {
            Ok(Kind::Control(LibraryCommand::decode(&req.input)?))
        }
        Some(nsid) => Ok(Kind::Library(nsid_name(nsid).to_owned())),
    }
}

/// Loaded-library registry.
#[derive(Debug)]
pub struct LibraryRegistry {
    driver_ns: NamespaceId,
    entries: Mutex<HashMap<String, Entry>>,
}

impl LibraryRegistry {
    /// Registry keeping library memory in `driver_ns`.
    pub fn new(driver_ns: NamespaceId) -> Self {
        Self {
            driver_ns,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Drop entries the firmware lost in a reboot.
    fn purge(&self, entries: &mut HashMap<String, Entry>, exec: &Executor<'_>) {
        let generation = exec.transport.link().1;
        entries.retain(|name, entry| {
            if entry.generation >= generation {
                return true;
            }
            info!("library {name} dropped, accelerator rebooted since it was loaded");
            self.free_memory(entry, exec.buffers);
            false
        });
    }

    fn free_memory(&self, entry: &Entry, buffers: &BufferManager) {
        for id in [entry.code, entry.pil] {
            let _ = buffers.unmap_device(self.driver_ns, id);
            if let Err(e) = buffers.free(self.driver_ns, id) {
                warn!("library buffer {id}: {e}");
            }
        }
    }

    /// Route a request, intercepting library control.
    pub(crate) fn dispatch(
        &self,
        session: SessionId,
        ns: NamespaceId,
        req: &Request,
        exec: &Executor<'_>,
    ) -> Result<Response> {
        match classify(req)? {
            Kind::Plain => exec.run(ns, req),
            Kind::Control(cmd) => match cmd.op {
                LibraryOp::Load => self.load(session, ns, &cmd.name, req, exec),
                LibraryOp::Unload => self.unload(session, &cmd.name, exec),
            },
            Kind::Library(name) => self.command(&name, ns, req, exec),
        }
    }

    fn load(
        &self,
        session: SessionId,
        ns: NamespaceId,
        name: &str,
        req: &Request,
        exec: &Executor<'_>,
    ) -> Result<Response> {
        let mut entries = lock(&self.entries);
        self.purge(&mut entries, exec);
        let generation = exec.transport.link().1;

        if let Some(entry) = entries.get_mut(name) {
            if entry.state != LibraryState::Loaded {
                return Err(VdspError::library_state(
                    name,
                    format!("cannot load while {}", entry.state),
                ));
            }
            *entry.clients.entry(session).or_insert(0) += 1;
            debug!("library {name}: {} user(s), no reload", entry.users());
            return Ok(Response {
                output: Bytes::new(),
                generation,
            });
        }

        let package_ref = req.buffers.first().ok_or_else(|| {
            VdspError::library_state(name, "load request carries no package buffer")
        })?;
        let package = exec.buffers.region(ns, package_ref.buffer)?;
        let size = exec.buffers.info(ns, package_ref.buffer)?.requested_size;
        let package = package.to_vec(0, size);
        let package = LibraryPackage::parse(&package)?;

        let (code, pil, pil_addr) = self.place(name, &package, exec.buffers)?;
        entries.insert(
            name.to_owned(),
            Entry {
                state: LibraryState::Loading,
                clients: HashMap::new(),
                in_flight: 0,
                code,
                pil,
                pil_addr,
                generation,
            },
        );

        let mut command = LibraryCommand::new(LibraryOp::Load, name)?;
        command.pil_info = pil_addr;
        let result = exec.run(self.driver_ns, &control_request(&command));
        match result {
            Ok(response) => {
                if let Some(entry) = entries.get_mut(name) {
                    entry.state = LibraryState::Loaded;
                    entry.clients.insert(session, 1);
                    entry.generation = response.generation;
                }
                info!("library {name} loaded");
                Ok(response)
            }
            Err(e) => {
                if let Some(entry) = entries.remove(name) {
                    if !matches!(e, VdspError::DeviceUnavailable) {
                        self.free_memory(&entry, exec.buffers);
                    }
                }
                warn!("library {name} load failed: {e}");
                Err(e)
            }
        }
    }

    /// Relocate `package` into fresh driver buffers. Returns the code buffer,
    /// the relocation-info buffer and its device address.
    fn place(
        &self,
        name: &str,
        package: &LibraryPackage<'_>,
        buffers: &BufferManager,
    ) -> Result<(BufferId, BufferId, u32)> {
        let ns = self.driver_ns;
        let heap = buffers
            .heap_id(HeapKind::Unified)
            .ok_or(VdspError::UnknownHeap { heap: 0 })?;

        let code = buffers.alloc(ns, heap, package.load_size(), BufferAttr::default())?;
        let placed = buffers.map_device(ns, code).and_then(|addr| {
            let addr = u32::try_from(addr)
                .map_err(|_| VdspError::invalid_argument("code above 4 GiB"))?;
            let mut image = vec![0u8; package.load_size()];
            let pil_info = package.relocate_into(&mut image, addr)?;
            buffers.region(ns, code)?.write(0, &image);

            let pil = buffers.alloc(ns, heap, pil_info.encode().len(), BufferAttr::default())?;
            buffers.region(ns, pil)?.write(0, &pil_info.encode());
            match buffers.map_device(ns, pil) {
                Ok(pil_addr) => Ok((pil, pil_addr)),
                Err(e) => {
                    let _ = buffers.free(ns, pil);
                    Err(e)
                }
            }
        });
        match placed {
            Ok((pil, pil_addr)) => {
                debug!("library {name}: code {code}, relocation info at {pil_addr:#x}");
                Ok((code, pil, pil_addr as u32))
            }
            Err(e) => {
                let _ = buffers.unmap_device(ns, code);
                let _ = buffers.free(ns, code);
                Err(e)
            }
        }
    }

    fn unload(&self, session: SessionId, name: &str, exec: &Executor<'_>) -> Result<Response> {
        let mut entries = lock(&self.entries);
        self.purge(&mut entries, exec);
        let generation = exec.transport.link().1;

        let entry = entries
            .get_mut(name)
            .ok_or_else(|| VdspError::library_state(name, "not loaded"))?;
        if entry.clients.get(&session).copied().unwrap_or(0) == 0 {
            return Err(VdspError::library_state(name, "not loaded by this session"));
        }
        release_client(entry, session);
        if entry.users() > 0 {
            debug!("library {name}: {} user(s) left", entry.users());
            return Ok(Response {
                output: Bytes::new(),
                generation,
            });
        }
        // Only the unload that reaches the firmware waits for idle.
        if entry.in_flight > 0 {
            entry.clients.insert(session, 1);
            return Err(VdspError::library_state(
                name,
                format!("{} command(s) in flight", entry.in_flight),
            ));
        }

        self.send_unload(name, &mut entries, exec, Some(session))
    }

    /// Send the unload for `name` and drop its entry on success. On failure
    /// the entry is restored, with `session` counted again if given.
    fn send_unload(
        &self,
        name: &str,
        entries: &mut HashMap<String, Entry>,
        exec: &Executor<'_>,
        session: Option<SessionId>,
    ) -> Result<Response> {
        let Some(entry) = entries.get_mut(name) else {
            return Err(VdspError::library_state(name, "not loaded"));
        };
        entry.state = LibraryState::Unloading;
        let mut command = LibraryCommand::new(LibraryOp::Unload, name)?;
        command.pil_info = entry.pil_addr;

        match exec.run(self.driver_ns, &control_request(&command)) {
            Ok(response) => {
                if let Some(entry) = entries.remove(name) {
                    self.free_memory(&entry, exec.buffers);
                }
                info!("library {name} unloaded");
                Ok(response)
            }
            Err(e) => {
                if let Some(entry) = entries.get_mut(name) {
                    entry.state = LibraryState::Loaded;
                    if let Some(session) = session {
                        entry.clients.insert(session, 1);
                    }
                }
                warn!("library {name} unload failed: {e}");
                Err(e)
            }
        }
    }

    fn command(&self, name: &str, ns: NamespaceId, req: &Request, exec: &Executor<'_>) -> Result<Response> {
        let tracked = {
            let mut entries = lock(&self.entries);
            self.purge(&mut entries, exec);
            match entries.get_mut(name) {
                Some(entry) if entry.state != LibraryState::Loading => {
                    entry.in_flight += 1;
                    entry.state = LibraryState::Processing;
                    true
                }
                _ => false,
            }
        };

        let result = exec.run(ns, req);

        if tracked {
            let mut entries = lock(&self.entries);
            if let Some(entry) = entries.get_mut(name) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                if entry.in_flight == 0 && entry.state == LibraryState::Processing {
                    entry.state = LibraryState::Loaded;
                }
            }
        }
        result
    }

    /// Drop a closing session's holds, unloading libraries nobody else uses.
    pub(crate) fn release_session(&self, session: SessionId, exec: &Executor<'_>) {
        let mut entries = lock(&self.entries);
        self.purge(&mut entries, exec);
        let held: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.clients.contains_key(&session))
            .map(|(name, _)| name.clone())
            .collect();
        for name in held {
            let Some(entry) = entries.get_mut(&name) else {
                continue;
            };
            release_client(entry, session);
            if entry.users() > 0 {
                continue;
            }
            debug!("library {name}: last user {session} closed, unloading");
            if let Err(e) = self.send_unload(&name, &mut entries, exec, None) {
                warn!("unload of {name} at close: {e}");
            }
        }
    }

    /// Drop every entry without telling the firmware, which is being shut
    /// down.
    pub(crate) fn clear(&self, buffers: &BufferManager) {
        let mut entries = lock(&self.entries);
        for (name, entry) in entries.drain() {
            debug!("library {name} forgotten at shutdown");
            self.free_memory(&entry, buffers);
        }
    }

    /// State of `name` as the host sees it.
    pub(crate) fn state(&self, name: &str, exec: &Executor<'_>) -> LibraryState {
        let mut entries = lock(&self.entries);
        self.purge(&mut entries, exec);
        entries.get(name).map_or(LibraryState::Idle, |e| e.state)
    }

    /// Host-wide user count of `name`.
    pub(crate) fn users(&self, name: &str, exec: &Executor<'_>) -> u32 {
        let mut entries = lock(&self.entries);
        self.purge(&mut entries, exec);
        entries.get(name).map_or(0, Entry::users)
    }
}

fn release_client(entry: &mut Entry, session: SessionId) {
    if let Some(count) = entry.clients.get_mut(&session) {
        *count -= 1;
        if *count == 0 {
            entry.clients.remove(&session);
        }
    }
}

pub(crate) fn control_request(command: &LibraryCommand) -> Request {
    let encoded: [u8; COMMAND_SIZE] = command.encode();
    Request {
        nsid: Some(SYSTEM_NSID),
        input: Bytes::copy_from_slice(&encoded),
        ..Request::default()
    }
}
