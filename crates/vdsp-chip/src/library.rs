// SPDX-License-Identifier: AGPL-3.0-only

//! Library load/unload command and relocatable package formats.
//!
//! ## Control command
//!
//! Load and unload requests are ordinary requests whose namespace id is
//! [`SYSTEM_NSID`]. Their 44-byte input is:
//!
//! ```text
//! 0      flag        0 = load, 1 = unload
//! 1..33  name        NUL-terminated, at most 31 bytes
//! 40..44 pil_info    device address of the relocation-info block
//! ```
//!
//! ## Package
//!
//! ```text
//! 0x00  magic        "VPKG"
//! 0x04  version      u16 (1), reserved u16
//! 0x08  code_size    u32
//! 0x0c  bss_size     u32
//! 0x10  entry        u32, offset into code
//! 0x14  reloc_count  u32
//! 0x18  code         [code_size]
//! ....  relocs       [reloc_count] u32 code offsets, 4-byte aligned
//! ```
//!
//! Relocation adds the load address to every listed word.

use crate::comm::cmd::NAMESPACE_ID_SIZE;
use crate::error::{read_u16, read_u32, FormatError};

/// Namespace id that marks a library control request: `"system cmd"`.
pub const SYSTEM_NSID: [u8; NAMESPACE_ID_SIZE] = nsid_bytes(b"system cmd");

/// Load flag value.
pub const LOAD_FLAG: u8 = 0;
/// Unload flag value.
pub const UNLOAD_FLAG: u8 = 1;
/// Name field offset.
pub const NAME_OFFSET: usize = 1;
/// Longest accepted name (one byte is kept for the terminator).
pub const NAME_MAX: usize = NAMESPACE_ID_SIZE - 1;
/// Relocation-info address offset.
pub const PIL_INFO_OFFSET: usize = 40;
/// Command input size.
pub const COMMAND_SIZE: usize = 44;

/// Package magic, `"VPKG"`.
pub const PACKAGE_MAGIC: u32 = u32::from_le_bytes(*b"VPKG");
/// Package format version.
pub const PACKAGE_VERSION: u16 = 1;
/// Package header size.
pub const PACKAGE_HEADER_SIZE: usize = 0x18;

/// Relocation-info magic, `"VPIL"`.
pub const PIL_MAGIC: u32 = u32::from_le_bytes(*b"VPIL");
/// Encoded relocation-info size.
pub const PIL_INFO_SIZE: usize = 20;

const fn nsid_bytes(name: &[u8]) -> [u8; NAMESPACE_ID_SIZE] {
    let mut out = [0u8; NAMESPACE_ID_SIZE];
    let mut i = 0;
    while i < name.len() && i < NAME_MAX {
        out[i] = name[i];
        i += 1;
    }
    out
}

/// Namespace id for a library name, zero padded.
///
/// # Errors
///
/// Returns [`FormatError::InvalidName`] if `name` is empty, longer than
/// [`NAME_MAX`] or contains a NUL byte.
pub fn nsid_for(name: &str) -> Result<[u8; NAMESPACE_ID_SIZE], FormatError> {
    validate_name(name)?;
    Ok(nsid_bytes(name.as_bytes()))
}

/// The name carried by a namespace id, up to the first NUL.
#[must_use]
pub fn nsid_name(nsid: &[u8]) -> &str {
    let end = nsid.iter().position(|&b| b == 0).unwrap_or(nsid.len());
    std::str::from_utf8(&nsid[..end]).unwrap_or("")
}

fn validate_name(name: &str) -> Result<(), FormatError> {
    if name.is_empty() || name.len() > NAME_MAX || name.as_bytes().contains(&0) {
        return Err(FormatError::InvalidName);
    }
    Ok(())
}

/// Load or unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryOp {
    /// Load a package
    Load,
    /// Unload a loaded library
    Unload,
}

/// Decoded library control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryCommand {
    /// Operation
    pub op: LibraryOp,
    /// Library name
    pub name: String,
    /// Relocation-info address, filled in by the host on load
    pub pil_info: u32,
}

impl LibraryCommand {
    /// Build a command.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidName`] for names that do not fit.
    pub fn new(op: LibraryOp, name: &str) -> Result<Self, FormatError> {
        validate_name(name)?;
        Ok(Self {
            op,
            name: name.to_owned(),
            pil_info: 0,
        })
    }

    /// Encode into the 44-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; COMMAND_SIZE] {
        let mut out = [0u8; COMMAND_SIZE];
        out[0] = match self.op {
            LibraryOp::Load => LOAD_FLAG,
            LibraryOp::Unload => UNLOAD_FLAG,
        };
        let name = self.name.as_bytes();
        let len = name.len().min(NAME_MAX);
        out[NAME_OFFSET..NAME_OFFSET + len].copy_from_slice(&name[..len]);
        out[PIL_INFO_OFFSET..COMMAND_SIZE].copy_from_slice(&self.pil_info.to_le_bytes());
        out
    }

    /// Decode from request input.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is short, the flag is unknown or the name
    /// is not valid.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < COMMAND_SIZE {
            return Err(FormatError::Truncated {
                what: "library command",
                need: COMMAND_SIZE,
                have: bytes.len(),
            });
        }
        let op = match bytes[0] {
            LOAD_FLAG => LibraryOp::Load,
            UNLOAD_FLAG => LibraryOp::Unload,
            other => {
                return Err(FormatError::Unsupported {
                    what: "library command flag",
                    value: u32::from(other),
                })
            }
        };
        let name = nsid_name(&bytes[NAME_OFFSET..NAME_OFFSET + NAME_MAX]);
        validate_name(name)?;
        Ok(Self {
            op,
            name: name.to_owned(),
            pil_info: read_u32(bytes, PIL_INFO_OFFSET, "library command")?,
        })
    }

    /// Overwrite the relocation-info address in an encoded command.
    pub fn patch_pil_info(encoded: &mut [u8], pil_info: u32) {
        if let Some(slot) = encoded.get_mut(PIL_INFO_OFFSET..COMMAND_SIZE) {
            slot.copy_from_slice(&pil_info.to_le_bytes());
        }
    }
}

/// A parsed relocatable package.
#[derive(Debug, Clone)]
pub struct LibraryPackage<'a> {
    code: &'a [u8],
    bss_size: u32,
    entry: u32,
    relocs: Vec<u32>,
}

impl<'a> LibraryPackage<'a> {
    /// Parse and validate a package.
    ///
    /// # Errors
    ///
    /// Returns an error for bad magic, unknown version, truncated sections,
    /// an entry point outside the code, or misplaced relocations.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FormatError> {
        if read_u32(bytes, 0, "package header")? != PACKAGE_MAGIC {
            return Err(FormatError::BadMagic { what: "package" });
        }
        let version = read_u16(bytes, 4, "package header")?;
        if version != PACKAGE_VERSION {
            return Err(FormatError::Unsupported {
                what: "package version",
                value: u32::from(version),
            });
        }
        let code_size = read_u32(bytes, 0x08, "package header")? as usize;
        let bss_size = read_u32(bytes, 0x0c, "package header")?;
        let entry = read_u32(bytes, 0x10, "package header")?;
        let reloc_count = read_u32(bytes, 0x14, "package header")? as usize;

        let code_end = PACKAGE_HEADER_SIZE
            .checked_add(code_size)
            .ok_or(FormatError::OutOfBounds { what: "package code" })?;
        let reloc_end = reloc_count
            .checked_mul(4)
            .and_then(|n| n.checked_add(code_end))
            .ok_or(FormatError::OutOfBounds { what: "package relocations" })?;
        if bytes.len() < reloc_end {
            return Err(FormatError::Truncated {
                what: "package",
                need: reloc_end,
                have: bytes.len(),
            });
        }
        if code_size == 0 || entry as usize >= code_size {
            return Err(FormatError::OutOfBounds { what: "package entry" });
        }

        let mut relocs = Vec::with_capacity(reloc_count);
        for i in 0..reloc_count {
            let off = read_u32(bytes, code_end + i * 4, "package relocations")?;
            if off % 4 != 0 || off as usize + 4 > code_size {
                return Err(FormatError::OutOfBounds { what: "relocation" });
            }
            relocs.push(off);
        }

        Ok(Self {
            code: &bytes[PACKAGE_HEADER_SIZE..code_end],
            bss_size,
            entry,
            relocs,
        })
    }

    /// Bytes needed in device memory (code plus bss).
    pub fn load_size(&self) -> usize {
        self.code.len() + self.bss_size as usize
    }

    /// Entry offset within the code.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Number of relocations.
    pub fn reloc_count(&self) -> usize {
        self.relocs.len()
    }

    /// Copy the code into `dest`, zero the bss and relocate against `base`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Truncated`] if `dest` is smaller than
    /// [`Self::load_size`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn relocate_into(&self, dest: &mut [u8], base: u32) -> Result<PilInfo, FormatError> {
        let size = self.load_size();
        if dest.len() < size {
            return Err(FormatError::Truncated {
                what: "library destination",
                need: size,
                have: dest.len(),
            });
        }
        dest[..self.code.len()].copy_from_slice(self.code);
        dest[self.code.len()..size].fill(0);
        for &off in &self.relocs {
            let at = off as usize;
            let word = u32::from_le_bytes([dest[at], dest[at + 1], dest[at + 2], dest[at + 3]]);
            dest[at..at + 4].copy_from_slice(&word.wrapping_add(base).to_le_bytes());
        }
        Ok(PilInfo {
            code_addr: base,
            code_size: size as u32,
            entry_addr: base.wrapping_add(self.entry),
            reloc_count: self.relocs.len() as u32,
        })
    }

    /// Encode a package. Used by tooling and tests.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(code: &[u8], bss_size: u32, entry: u32, relocs: &[u32]) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKAGE_HEADER_SIZE + code.len() + relocs.len() * 4);
        out.extend_from_slice(&PACKAGE_MAGIC.to_le_bytes());
        out.extend_from_slice(&PACKAGE_VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(code.len() as u32).to_le_bytes());
        out.extend_from_slice(&bss_size.to_le_bytes());
        out.extend_from_slice(&entry.to_le_bytes());
        out.extend_from_slice(&(relocs.len() as u32).to_le_bytes());
        out.extend_from_slice(code);
        for r in relocs {
            out.extend_from_slice(&r.to_le_bytes());
        }
        out
    }
}

/// Relocation-info block handed to the accelerator with a load command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PilInfo {
    /// Device address of the relocated code
    pub code_addr: u32,
    /// Code plus bss size
    pub code_size: u32,
    /// Device address of the entry point
    pub entry_addr: u32,
    /// Relocations applied
    pub reloc_count: u32,
}

impl PilInfo {
    /// Encode.
    #[must_use]
    pub fn encode(&self) -> [u8; PIL_INFO_SIZE] {
        let mut out = [0u8; PIL_INFO_SIZE];
        for (i, v) in [
            PIL_MAGIC,
            self.code_addr,
            self.code_size,
            self.entry_addr,
            self.reloc_count,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Decode.
    ///
    /// # Errors
    ///
    /// Returns an error for short input or bad magic.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if read_u32(bytes, 0, "pil info")? != PIL_MAGIC {
            return Err(FormatError::BadMagic { what: "pil info" });
        }
        Ok(Self {
            code_addr: read_u32(bytes, 4, "pil info")?,
            code_size: read_u32(bytes, 8, "pil info")?,
            entry_addr: read_u32(bytes, 12, "pil info")?,
            reloc_count: read_u32(bytes, 16, "pil info")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_nsid() {
        assert_eq!(nsid_name(&SYSTEM_NSID), "system cmd");
        assert_eq!(SYSTEM_NSID[10], 0);
    }

    #[test]
    fn test_command_layout() {
        let mut cmd = LibraryCommand::new(LibraryOp::Unload, "net.lib").unwrap();
        cmd.pil_info = 0x8060_0000;
        let bytes = cmd.encode();
        assert_eq!(bytes[0], UNLOAD_FLAG);
        assert_eq!(&bytes[1..8], b"net.lib");
        assert_eq!(bytes[8], 0);
        assert_eq!(&bytes[40..44], &0x8060_0000u32.to_le_bytes());
        assert_eq!(LibraryCommand::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_command_rejects_bad_input() {
        assert!(LibraryCommand::new(LibraryOp::Load, "").is_err());
        assert!(LibraryCommand::new(LibraryOp::Load, &"x".repeat(32)).is_err());
        let mut bytes = LibraryCommand::new(LibraryOp::Load, "a").unwrap().encode();
        bytes[0] = 7;
        assert!(matches!(
            LibraryCommand::decode(&bytes),
            Err(FormatError::Unsupported { .. })
        ));
        assert!(matches!(
            LibraryCommand::decode(&bytes[..20]),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_package_relocation() {
        // word 0 is relocated, word 1 is not
        let code = [0x10, 0, 0, 0, 0x20, 0, 0, 0];
        let bytes = LibraryPackage::build(&code, 8, 4, &[0]);
        let pkg = LibraryPackage::parse(&bytes).unwrap();
        assert_eq!(pkg.load_size(), 16);

        let mut dest = vec![0xAA; 16];
        let info = pkg.relocate_into(&mut dest, 0x9000_0000).unwrap();
        assert_eq!(&dest[0..4], &0x9000_0010u32.to_le_bytes());
        assert_eq!(&dest[4..8], &0x20u32.to_le_bytes());
        assert!(dest[8..].iter().all(|&b| b == 0));
        assert_eq!(info.entry_addr, 0x9000_0004);
        assert_eq!(PilInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn test_package_rejects_bad_relocation() {
        let bytes = LibraryPackage::build(&[0u8; 8], 0, 0, &[6]);
        assert!(matches!(
            LibraryPackage::parse(&bytes),
            Err(FormatError::OutOfBounds { .. })
        ));
        let mut bad = LibraryPackage::build(&[0u8; 8], 0, 0, &[]);
        bad[0] = b'X';
        assert!(matches!(
            LibraryPackage::parse(&bad),
            Err(FormatError::BadMagic { .. })
        ));
    }
}
