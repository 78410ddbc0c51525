// SPDX-License-Identifier: AGPL-3.0-only

//! Format errors for images and packages parsed by this crate.

use thiserror::Error;

/// A binary image or command did not match its expected format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Input shorter than a header or table requires.
    #[error("{what} truncated: need {need} bytes, have {have}")]
    Truncated {
        /// Structure being read
        what: &'static str,
        /// Bytes needed
        need: usize,
        /// Bytes available
        have: usize,
    },
    /// Magic number mismatch.
    #[error("bad {what} magic")]
    BadMagic {
        /// Structure being read
        what: &'static str,
    },
    /// A field holds a value this implementation does not accept.
    #[error("unsupported {what}: {value:#x}")]
    Unsupported {
        /// Field name
        what: &'static str,
        /// Value found
        value: u32,
    },
    /// An offset or size points outside the input.
    #[error("{what} out of bounds")]
    OutOfBounds {
        /// Structure being read
        what: &'static str,
    },
    /// Named symbol not present in the image.
    #[error("symbol \"{name}\" not found")]
    MissingSymbol {
        /// Symbol name
        name: String,
    },
    /// Library name empty, too long, or not UTF-8.
    #[error("invalid library name")]
    InvalidName,
}

/// Read a little-endian u32 at `offset`.
pub(crate) fn read_u32(bytes: &[u8], offset: usize, what: &'static str) -> Result<u32, FormatError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(FormatError::Truncated {
            what,
            need: offset + 4,
            have: bytes.len(),
        })
}

/// Read a little-endian u16 at `offset`.
pub(crate) fn read_u16(bytes: &[u8], offset: usize, what: &'static str) -> Result<u16, FormatError> {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(FormatError::Truncated {
            what,
            need: offset + 2,
            have: bytes.len(),
        })
}
