// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side control stack for a DSP accelerator.
//!
//! The accelerator runs its own firmware and sees host memory only through an
//! IOMMU. This crate owns everything on the host side of that link: the IOVA
//! window and page tables, buffer heaps and per-client namespaces, the shared
//! command region with its boot handshake and priority queues, timeout
//! recovery, and the registry of libraries loaded into the firmware.
//!
//! # Layers
//!
//! ```text
//!   Session ──► LibraryRegistry ──► Executor ──► Transport ──► Accelerator
//!      │                               │            │
//!      └──────► BufferManager ◄────────┘            └── handshake, queues,
//!                    │                                  recovery
//!                    ▼
//!               IommuTable (IovaAllocator + MappingRecord + page tables)
//! ```
//!
//! Board specifics live behind [`Accelerator`] and [`FirmwareStore`]; the
//! [`SimulatedDsp`] implements the firmware side in-process.
//!
//! # Quick start
//!
//! ```no_run
//! use vdsp_driver::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let config = VdspConfig::default();
//! let (_sim, platform) = SimulatedDsp::platform(&config)?;
//! let device = Device::attach(config, platform)?;
//!
//! let session = device.open()?;
//! let reply = session.submit(&Request::new(&b"ping"[..]).with_output(4))?;
//! assert_eq!(reply.output.as_ref(), b"ping");
//! # Ok(())
//! # }
//! ```
//!
//! # Lock order
//!
//! | Rank | Lock |
//! |------|------|
//! | 1 | device sessions (open / close) |
//! | 2 | library registry |
//! | 3 | queue slot |
//! | 4 | buffer namespaces |
//! | 5 | IOMMU table |
//!
//! Recovery runs while holding a queue slot and never takes the registry.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod config;
mod device;
pub mod dma;
pub mod dsplog;
pub mod dvfs;
mod error;
pub mod firmware;
pub mod iommu;
pub mod library;
pub mod mem;
pub mod platform;
pub mod request;
pub mod sim;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{CompletionMode, IommuInstanceConfig, LogConfig, VdspConfig};
pub use device::{Device, Platform, Session, SessionId};
pub use dma::{DmaRegion, PhysMemory};
pub use dvfs::DvfsMode;
pub use error::{Result, VdspError};
pub use iommu::{IommuTable, IommuUsage, Placement};
pub use library::LibraryState;
pub use mem::{
    BufferAttr, BufferId, BufferInfo, CacheSync, HeapInfo, HeapKind, MemoryUsage, NamespaceId,
    SyncDirection, UserMapping,
};
pub use platform::{Accelerator, BootInfo, DirStore, FirmwareStore, HostBus, MemoryStore};
pub use request::{Access, BufferRef, Request, Response};
pub use sim::SimulatedDsp;
pub use transport::LinkState;

/// Lock a mutex, taking the data even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Access, BufferAttr, BufferId, BufferRef, CacheSync, Device, DvfsMode, HeapKind,
        LibraryState, LinkState, Platform, Request, Response, Result, Session, SimulatedDsp,
        SyncDirection, VdspConfig, VdspError,
    };
}
