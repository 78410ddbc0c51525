// SPDX-License-Identifier: AGPL-3.0-only

//! Binary formats shared between the vdsp host stack and the accelerator.
//!
//! This crate has **no hardware access** and depends only on `thiserror`. It describes
//! what both sides of the link agree on: the command region, the IOMMU page
//! table, the firmware image, the library protocol and the log buffer.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`comm`] | Command region layout, sync sentinels, TLV records, descriptors |
//! | [`iommu`] | Page-table entry format and page arithmetic |
//! | [`firmware`] | ELF32 Xtensa firmware parsing and a test image builder |
//! | [`library`] | Load/unload command, relocatable package, relocation info |
//! | [`log`] | Two-bank accelerator log buffer |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod comm;
mod error;
pub mod firmware;
pub mod iommu;
pub mod library;
pub mod log;

pub use error::FormatError;
