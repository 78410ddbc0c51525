// SPDX-License-Identifier: AGPL-3.0-only

//! Firmware image format: ELF32 little-endian Xtensa executables.
//!
//! The host copies every non-empty `PT_LOAD` segment to its physical address
//! (zero filling `memsz - filesz`) and patches the [`COMM_BASE_SYMBOL`] object
//! with the command region's device address before releasing the core.
//!
//! All offsets and sizes are bounds-checked against the image; nothing here
//! panics on malformed input.

use crate::error::{read_u16, read_u32, FormatError};

/// ELF magic.
pub const ELF_MAGIC: [u8; 4] = *b"\x7fELF";
/// 32-bit class.
pub const ELF_CLASS_32: u8 = 1;
/// Little endian data.
pub const ELF_DATA_LSB: u8 = 1;
/// Executable file type.
pub const ET_EXEC: u16 = 2;
/// Xtensa machine id.
pub const EM_XTENSA: u16 = 94;
/// Loadable segment.
pub const PT_LOAD: u32 = 1;
/// Symbol table section.
pub const SHT_SYMTAB: u32 = 2;
/// String table section.
pub const SHT_STRTAB: u32 = 3;
/// Program bits section.
pub const SHT_PROGBITS: u32 = 1;
/// Data object symbol type.
pub const STT_OBJECT: u8 = 1;
/// Segment permission bits.
pub const PF_X: u32 = 1;
/// Write.
pub const PF_W: u32 = 2;
/// Read.
pub const PF_R: u32 = 4;

/// Symbol the host patches with the command region's device address.
pub const COMM_BASE_SYMBOL: &str = "xrp_dsp_comm_base";

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;
const SYM_SIZE: usize = 16;

/// Loadable segment description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Physical load address
    pub paddr: u32,
    /// File offset of the data
    pub offset: u32,
    /// Bytes present in the file
    pub filesz: u32,
    /// Bytes occupied in memory
    pub memsz: u32,
    /// `PF_*` flags
    pub flags: u32,
}

/// Resolved object symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol address
    pub value: u32,
    /// Symbol size
    pub size: u32,
    /// File offset of the symbol's bytes
    pub file_offset: usize,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    entry: u32,
    phoff: u32,
    shoff: u32,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
}

#[derive(Debug, Clone, Copy)]
struct Section {
    kind: u32,
    addr: u32,
    offset: u32,
    size: u32,
    link: u32,
    entsize: u32,
}

/// A validated firmware image.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareImage<'a> {
    data: &'a [u8],
    header: Header,
}

impl<'a> FirmwareImage<'a> {
    /// Validate the ELF header and program header table.
    ///
    /// # Errors
    ///
    /// Returns an error for a bad magic, class, type or machine, or a program
    /// header table outside the image.
    pub fn parse(data: &'a [u8]) -> Result<Self, FormatError> {
        if data.len() < EHDR_SIZE {
            return Err(FormatError::Truncated {
                what: "ELF header",
                need: EHDR_SIZE,
                have: data.len(),
            });
        }
        if data[..4] != ELF_MAGIC {
            return Err(FormatError::BadMagic { what: "firmware ELF" });
        }
        if data[4] != ELF_CLASS_32 || data[5] != ELF_DATA_LSB {
            return Err(FormatError::Unsupported {
                what: "ELF class/data",
                value: u32::from(data[4]) << 8 | u32::from(data[5]),
            });
        }
        let e_type = read_u16(data, 16, "ELF header")?;
        if e_type != ET_EXEC {
            return Err(FormatError::Unsupported {
                what: "ELF type",
                value: u32::from(e_type),
            });
        }
        let machine = read_u16(data, 18, "ELF header")?;
        if machine != EM_XTENSA {
            return Err(FormatError::Unsupported {
                what: "ELF machine",
                value: u32::from(machine),
            });
        }

        let header = Header {
            entry: read_u32(data, 24, "ELF header")?,
            phoff: read_u32(data, 28, "ELF header")?,
            shoff: read_u32(data, 32, "ELF header")?,
            phentsize: read_u16(data, 42, "ELF header")?,
            phnum: read_u16(data, 44, "ELF header")?,
            shentsize: read_u16(data, 46, "ELF header")?,
            shnum: read_u16(data, 48, "ELF header")?,
        };

        let ph_end = u64::from(header.phoff)
            + u64::from(header.phentsize) * u64::from(header.phnum);
        if header.phoff as usize >= data.len()
            || ph_end > data.len() as u64
            || (header.phnum > 0 && (header.phentsize as usize) < PHDR_SIZE)
        {
            return Err(FormatError::OutOfBounds { what: "ELF program headers" });
        }

        Ok(Self { data, header })
    }

    /// Entry point.
    pub fn entry(&self) -> u32 {
        self.header.entry
    }

    /// Raw image bytes.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Non-empty loadable segments, each checked against the image.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::OutOfBounds`] if a segment's file range escapes
    /// the image or `filesz > memsz`.
    pub fn loadable_segments(&self) -> Result<Vec<Segment>, FormatError> {
        let mut out = Vec::new();
        for i in 0..usize::from(self.header.phnum) {
            let base = self.header.phoff as usize + i * usize::from(self.header.phentsize);
            let p_type = read_u32(self.data, base, "program header")?;
            let seg = Segment {
                offset: read_u32(self.data, base + 4, "program header")?,
                paddr: read_u32(self.data, base + 12, "program header")?,
                filesz: read_u32(self.data, base + 16, "program header")?,
                memsz: read_u32(self.data, base + 20, "program header")?,
                flags: read_u32(self.data, base + 24, "program header")?,
            };
            if p_type != PT_LOAD || seg.flags & (PF_X | PF_W | PF_R) == 0 || seg.memsz == 0 {
                continue;
            }
            let end = u64::from(seg.offset) + u64::from(seg.filesz);
            if seg.offset as usize >= self.data.len()
                || end > self.data.len() as u64
                || seg.filesz > seg.memsz
            {
                return Err(FormatError::OutOfBounds { what: "ELF segment" });
            }
            out.push(seg);
        }
        Ok(out)
    }

    /// File bytes of a segment returned by [`Self::loadable_segments`].
    pub fn segment_data(&self, seg: &Segment) -> &'a [u8] {
        let start = seg.offset as usize;
        self.data
            .get(start..start + seg.filesz as usize)
            .unwrap_or_default()
    }

    fn section(&self, index: usize) -> Result<Section, FormatError> {
        let base = self.header.shoff as usize + index * usize::from(self.header.shentsize);
        Ok(Section {
            kind: read_u32(self.data, base + 4, "section header")?,
            addr: read_u32(self.data, base + 12, "section header")?,
            offset: read_u32(self.data, base + 16, "section header")?,
            size: read_u32(self.data, base + 20, "section header")?,
            link: read_u32(self.data, base + 24, "section header")?,
            entsize: read_u32(self.data, base + 36, "section header")?,
        })
    }

    fn section_bad(&self, s: &Section) -> bool {
        s.offset as usize > self.data.len() || s.size as usize > self.data.len() - s.offset as usize
    }

    /// Look up a data object symbol by name.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::MissingSymbol`] if the image has no symbol table
    /// or no such object, and [`FormatError::OutOfBounds`] for inconsistent
    /// section or symbol data.
    pub fn find_object_symbol(&self, name: &str) -> Result<Symbol, FormatError> {
        let missing = || FormatError::MissingSymbol {
            name: name.to_owned(),
        };
        if self.header.shoff == 0 {
            return Err(missing());
        }
        let sh_end = u64::from(self.header.shoff)
            + u64::from(self.header.shentsize) * u64::from(self.header.shnum);
        if self.header.shoff as usize > self.data.len()
            || sh_end > self.data.len() as u64
            || (self.header.shnum > 0 && (self.header.shentsize as usize) < SHDR_SIZE)
        {
            return Err(FormatError::OutOfBounds { what: "ELF section headers" });
        }

        let shnum = usize::from(self.header.shnum);
        let mut symtab = None;
        for i in 0..shnum {
            let s = self.section(i)?;
            if s.kind == SHT_SYMTAB {
                symtab = Some(s);
                break;
            }
        }
        let symtab = symtab.ok_or_else(missing)?;
        if symtab.link as usize >= shnum {
            return Err(FormatError::OutOfBounds { what: "symbol table link" });
        }
        let strtab = self.section(symtab.link as usize)?;
        if strtab.kind != SHT_STRTAB {
            return Err(missing());
        }
        if self.section_bad(&symtab) || self.section_bad(&strtab) {
            return Err(FormatError::OutOfBounds { what: "symbol section" });
        }
        let entsize = if symtab.entsize == 0 {
            SYM_SIZE
        } else {
            symtab.entsize as usize
        };
        if entsize < SYM_SIZE {
            return Err(FormatError::OutOfBounds { what: "symbol entry size" });
        }

        let strings =
            &self.data[strtab.offset as usize..strtab.offset as usize + strtab.size as usize];
        let mut at = symtab.offset as usize;
        let end = at + symtab.size as usize;
        while at + SYM_SIZE <= end {
            let st_name = read_u32(self.data, at, "symbol")? as usize;
            let st_value = read_u32(self.data, at + 4, "symbol")?;
            let st_size = read_u32(self.data, at + 8, "symbol")?;
            let st_info = self.data[at + 12];
            let st_shndx = read_u16(self.data, at + 14, "symbol")?;
            at += entsize;

            if st_info & 0xf != STT_OBJECT || st_name >= strings.len() {
                continue;
            }
            let sym_name = &strings[st_name..];
            let sym_name = &sym_name[..sym_name.iter().position(|&b| b == 0).unwrap_or(sym_name.len())];
            if sym_name != name.as_bytes() {
                continue;
            }

            if st_shndx == 0 || usize::from(st_shndx) >= shnum {
                return Err(FormatError::Unsupported {
                    what: "symbol section index",
                    value: u32::from(st_shndx),
                });
            }
            let sec = self.section(usize::from(st_shndx))?;
            if self.section_bad(&sec) || st_value < sec.addr {
                return Err(FormatError::OutOfBounds { what: "symbol" });
            }
            let in_section = st_value - sec.addr;
            if in_section > sec.size || st_size > sec.size - in_section {
                return Err(FormatError::OutOfBounds { what: "symbol" });
            }
            return Ok(Symbol {
                value: st_value,
                size: st_size,
                file_offset: sec.offset as usize + in_section as usize,
            });
        }
        Err(missing())
    }
}

/// Builds small firmware images. Used by the simulated accelerator and tests.
#[derive(Debug, Default, Clone)]
pub struct ImageBuilder {
    entry: u32,
    segments: Vec<(u32, Vec<u8>, u32)>,
    symbols: Vec<(String, u32, u32)>,
}

impl ImageBuilder {
    /// Start an image with the given entry point.
    #[must_use]
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            ..Self::default()
        }
    }

    /// Add a loadable RWX segment.
    #[must_use]
    pub fn segment(mut self, paddr: u32, data: &[u8], memsz: u32) -> Self {
        self.segments.push((paddr, data.to_vec(), memsz));
        self
    }

    /// Add an object symbol. It must fall inside a segment's file data.
    #[must_use]
    pub fn object(mut self, name: &str, addr: u32, size: u32) -> Self {
        self.symbols.push((name.to_owned(), addr, size));
        self
    }

    /// Serialize.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len();
        let mut out = vec![0u8; EHDR_SIZE + phnum * PHDR_SIZE];

        let mut seg_offsets = Vec::with_capacity(phnum);
        for (_, data, _) in &self.segments {
            seg_offsets.push(out.len() as u32);
            out.extend_from_slice(data);
            while out.len() % 4 != 0 {
                out.push(0);
            }
        }

        // string table: leading NUL, then names
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _, _) in &self.symbols {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }

        // sections: null, one PROGBITS per segment, symtab, strtab
        let symtab_index = 1 + phnum;
        let strtab_index = symtab_index + 1;

        let mut symtab = vec![0u8; SYM_SIZE];
        for (i, (_, addr, size)) in self.symbols.iter().enumerate() {
            let shndx = self
                .segments
                .iter()
                .position(|(paddr, data, _)| {
                    *addr >= *paddr && (*addr - *paddr) as usize + *size as usize <= data.len()
                })
                .map_or(0, |p| p + 1) as u16;
            symtab.extend_from_slice(&name_offsets[i].to_le_bytes());
            symtab.extend_from_slice(&addr.to_le_bytes());
            symtab.extend_from_slice(&size.to_le_bytes());
            symtab.push(0x10 | STT_OBJECT);
            symtab.push(0);
            symtab.extend_from_slice(&shndx.to_le_bytes());
        }

        let symtab_off = out.len() as u32;
        out.extend_from_slice(&symtab);
        let strtab_off = out.len() as u32;
        out.extend_from_slice(&strtab);
        while out.len() % 4 != 0 {
            out.push(0);
        }

        let shoff = out.len() as u32;
        let mut shdrs = vec![0u8; SHDR_SIZE];
        let mut push_section = |kind: u32, addr: u32, offset: u32, size: u32, link: u32, entsize: u32| {
            let mut s = [0u8; SHDR_SIZE];
            s[4..8].copy_from_slice(&kind.to_le_bytes());
            s[12..16].copy_from_slice(&addr.to_le_bytes());
            s[16..20].copy_from_slice(&offset.to_le_bytes());
            s[20..24].copy_from_slice(&size.to_le_bytes());
            s[24..28].copy_from_slice(&link.to_le_bytes());
            s[36..40].copy_from_slice(&entsize.to_le_bytes());
            shdrs.extend_from_slice(&s);
        };
        for (i, (paddr, data, _)) in self.segments.iter().enumerate() {
            push_section(SHT_PROGBITS, *paddr, seg_offsets[i], data.len() as u32, 0, 0);
        }
        push_section(
            SHT_SYMTAB,
            0,
            symtab_off,
            symtab.len() as u32,
            strtab_index as u32,
            SYM_SIZE as u32,
        );
        push_section(SHT_STRTAB, 0, strtab_off, strtab.len() as u32, 0, 0);
        out.extend_from_slice(&shdrs);

        // ELF header
        out[..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELF_CLASS_32;
        out[5] = ELF_DATA_LSB;
        out[6] = 1;
        out[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        out[18..20].copy_from_slice(&EM_XTENSA.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..28].copy_from_slice(&self.entry.to_le_bytes());
        out[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes());
        out[32..36].copy_from_slice(&shoff.to_le_bytes());
        out[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out[44..46].copy_from_slice(&(phnum as u16).to_le_bytes());
        out[46..48].copy_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        out[48..50].copy_from_slice(&((strtab_index + 1) as u16).to_le_bytes());

        for (i, (paddr, data, memsz)) in self.segments.iter().enumerate() {
            let base = EHDR_SIZE + i * PHDR_SIZE;
            let fields = [
                PT_LOAD,
                seg_offsets[i],
                *paddr,
                *paddr,
                data.len() as u32,
                (*memsz).max(data.len() as u32),
                PF_R | PF_W | PF_X,
                4,
            ];
            for (j, v) in fields.iter().enumerate() {
                out[base + j * 4..base + j * 4 + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        ImageBuilder::new(0x8000_0000)
            .segment(0x8000_0000, &[0x11; 64], 128)
            .segment(0x8000_1000, &[0u8; 16], 16)
            .object(COMM_BASE_SYMBOL, 0x8000_1004, 4)
            .build()
    }

    #[test]
    fn test_parse_segments() {
        let bytes = sample();
        let image = FirmwareImage::parse(&bytes).unwrap();
        let segs = image.loadable_segments().unwrap();
        assert_eq!(image.entry(), 0x8000_0000);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].paddr, 0x8000_0000);
        assert_eq!(segs[0].filesz, 64);
        assert_eq!(segs[0].memsz, 128);
        assert_eq!(image.segment_data(&segs[0]), &[0x11; 64][..]);
    }

    #[test]
    fn test_find_symbol() {
        let bytes = sample();
        let image = FirmwareImage::parse(&bytes).unwrap();
        let sym = image.find_object_symbol(COMM_BASE_SYMBOL).unwrap();
        assert_eq!(sym.value, 0x8000_1004);
        assert_eq!(sym.size, 4);
        let segs = image.loadable_segments().unwrap();
        assert_eq!(sym.file_offset, segs[1].offset as usize + 4);
        assert!(matches!(
            image.find_object_symbol("nope"),
            Err(FormatError::MissingSymbol { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_headers() {
        let mut bytes = sample();
        bytes[0] = 0;
        assert_eq!(
            FirmwareImage::parse(&bytes).unwrap_err(),
            FormatError::BadMagic { what: "firmware ELF" }
        );

        let mut bytes = sample();
        bytes[18] = 3; // EM_386
        assert!(matches!(
            FirmwareImage::parse(&bytes),
            Err(FormatError::Unsupported { what: "ELF machine", .. })
        ));

        let mut bytes = sample();
        bytes[44] = 0xff; // phnum
        assert!(matches!(
            FirmwareImage::parse(&bytes),
            Err(FormatError::OutOfBounds { .. })
        ));

        assert!(matches!(
            FirmwareImage::parse(&bytes[..20]),
            Err(FormatError::Truncated { .. })
        ));
    }
}
