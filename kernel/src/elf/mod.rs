//! ELF32 parsing shared by the static loader and the dynamic linker
//! (§4.H). Only `EM_386`/`ELFCLASS32`/`ELFDATA2LSB` is accepted; anything
//! else is rejected at header validation rather than partially loaded.

pub mod dynlink;
pub mod loader;
pub mod reloc;

use crate::error::{KernelError, Result};

pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;
pub const EM_386: u16 = 3;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;

pub const DT_NULL: i32 = 0;
pub const DT_NEEDED: i32 = 1;
pub const DT_HASH: i32 = 4;
pub const DT_STRTAB: i32 = 5;
pub const DT_SYMTAB: i32 = 6;
pub const DT_RELA: i32 = 7;
pub const DT_STRSZ: i32 = 10;
pub const DT_REL: i32 = 17;
pub const DT_RELSZ: i32 = 18;
pub const DT_RELENT: i32 = 19;
pub const DT_JMPREL: i32 = 23;
pub const DT_PLTRELSZ: i32 = 2;
pub const DT_PLTREL: i32 = 20;
pub const DT_INIT: i32 = 12;
pub const DT_FINI: i32 = 13;
pub const DT_INIT_ARRAY: i32 = 25;
pub const DT_INIT_ARRAYSZ: i32 = 27;
pub const DT_FINI_ARRAY: i32 = 26;
pub const DT_FINI_ARRAYSZ: i32 = 28;
pub const DT_RPATH: i32 = 15;
pub const DT_RUNPATH: i32 = 29;
pub const DT_SONAME: i32 = 14;
pub const DT_TEXTREL: i32 = 22;
pub const DT_SYMENT: i32 = 11;

#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub e_type: u16,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Validates the magic/class/data/machine fields and parses the rest of
/// `Elf32_Ehdr` out of the image's first 52 bytes.
pub fn parse_header(image: &[u8]) -> Result<ElfHeader> {
    if image.len() < 52 || &image[0..4] != b"\x7FELF" {
        return Err(KernelError::InvalidArgument);
    }
    if image[EI_CLASS] != ELFCLASS32 || image[EI_DATA] != ELFDATA2LSB {
        return Err(KernelError::InvalidArgument);
    }
    let e_machine = u16_at(image, 18);
    if e_machine != EM_386 {
        return Err(KernelError::InvalidArgument);
    }
    let e_type = u16_at(image, 16);
    if e_type != ET_EXEC && e_type != ET_DYN {
        return Err(KernelError::InvalidArgument);
    }
    Ok(ElfHeader {
        e_type,
        e_entry: u32_at(image, 24),
        e_phoff: u32_at(image, 28),
        e_phentsize: u16_at(image, 42),
        e_phnum: u16_at(image, 44),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
}

pub fn program_headers(image: &[u8], header: &ElfHeader) -> Result<alloc::vec::Vec<ProgramHeader>> {
    let mut out = alloc::vec::Vec::with_capacity(header.e_phnum as usize);
    for i in 0..header.e_phnum as usize {
        let off = header.e_phoff as usize + i * header.e_phentsize as usize;
        if off + 32 > image.len() {
            return Err(KernelError::InvalidArgument);
        }
        let ph = &image[off..];
        out.push(ProgramHeader {
            p_type: u32_at(ph, 0),
            p_offset: u32_at(ph, 4),
            p_vaddr: u32_at(ph, 8),
            p_filesz: u32_at(ph, 16),
            p_memsz: u32_at(ph, 20),
            p_flags: u32_at(ph, 24),
        });
    }
    Ok(out)
}

/// One `Elf32_Dyn` entry: `{d_tag, d_val}` (a union of value/pointer in C,
/// always read as a plain integer here).
/// IA-32 REL relocation type codes (the low byte of `r_info`).
pub mod reloc_type {
    pub const NONE: u32 = 0;
    pub const R_32: u32 = 1;
    pub const PC32: u32 = 2;
    pub const COPY: u32 = 5;
    pub const GLOB_DAT: u32 = 6;
    pub const JMP_SLOT: u32 = 7;
    pub const RELATIVE: u32 = 8;
}

#[derive(Debug, Clone, Copy)]
pub struct DynEntry {
    pub tag: i32,
    pub val: u32,
}

pub fn parse_dynamic(image: &[u8], offset: u32) -> alloc::vec::Vec<DynEntry> {
    let mut out = alloc::vec::Vec::new();
    let mut off = offset as usize;
    while off + 8 <= image.len() {
        let tag = u32_at(image, off) as i32;
        let val = u32_at(image, off + 4);
        if tag == DT_NULL {
            break;
        }
        out.push(DynEntry { tag, val });
        off += 8;
    }
    out
}

/// One `Elf32_Sym`: `{st_name, st_value, st_size, st_info, st_other,
/// st_shndx}`.
#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    pub name_off: u32,
    pub value: u32,
    pub size: u32,
    pub shndx: u16,
}

pub fn read_symbol(image: &[u8], symtab_off: u32, index: u32) -> Option<Symbol> {
    let off = symtab_off as usize + index as usize * 16;
    if off + 16 > image.len() {
        return None;
    }
    Some(Symbol {
        name_off: u32_at(image, off),
        value: u32_at(image, off + 4),
        size: u32_at(image, off + 8),
        shndx: u16_at(image, off + 14),
    })
}

pub fn read_cstr(image: &[u8], offset: u32) -> &str {
    let start = offset as usize;
    if start >= image.len() {
        return "";
    }
    let end = image[start..].iter().position(|&b| b == 0).map(|p| start + p).unwrap_or(image.len());
    core::str::from_utf8(&image[start..end]).unwrap_or("")
}

/// One REL relocation: `{r_offset, r_info}` where `r_info` packs a symbol
/// index in the high 24 bits and a relocation type in the low 8.
#[derive(Debug, Clone, Copy)]
pub struct Rel {
    pub offset: u32,
    pub sym: u32,
    pub kind: u32,
}

pub fn read_rel_table(image: &[u8], table_off: u32, table_size: u32) -> alloc::vec::Vec<Rel> {
    let mut out = alloc::vec::Vec::with_capacity((table_size / 8) as usize);
    let mut off = table_off;
    let end = table_off + table_size;
    while off + 8 <= end && (off as usize + 8) <= image.len() {
        let r_offset = u32_at(image, off as usize);
        let r_info = u32_at(image, off as usize + 4);
        out.push(Rel { offset: r_offset, sym: r_info >> 8, kind: r_info & 0xFF });
        off += 8;
    }
    out
}
