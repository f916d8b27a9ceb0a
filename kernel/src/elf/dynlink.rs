//! Shared-object path (§4.H): loads `ET_DYN` images at a freely-chosen
//! base, resolves `DT_NEEDED` dependencies depth-first, and applies
//! relocations across the whole object set via [`crate::elf::reloc`].

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::config::{DYNLINK_MAX_OBJECTS, DYNLINK_MIN_BASE, PAGE_SIZE, USER_VIRTUAL_END};
use crate::elf::{self, reloc::{DynObject, Segment}};
use crate::error::{KernelError, Result};
use crate::mm::pmm;
use crate::mm::vmm::{self, PageFlags, ScopedScratch};

fn page_align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

fn page_align_up(addr: u32) -> u32 {
    page_align_down(addr.wrapping_add(PAGE_SIZE - 1))
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Reads an entire file into memory, used to load a library image before
/// it is mapped (mirrors `execve`'s caller reading the main image first).
pub fn read_whole_file(path: &str, cwd: &str) -> Result<Vec<u8>> {
    let node = crate::fs::open(path, cwd, false)?;
    let size = node.metadata().size as usize;
    let mut buf = alloc::vec![0u8; size];
    let read = node.read(0, &mut buf)?;
    buf.truncate(read);
    Ok(buf)
}

/// Tracks every object loaded into one process's address space across a
/// single `execve`'s worth of dynamic linking. `objects[0]` is always the
/// main binary, pushed by the caller before any `load_shared` call.
pub struct DynlinkCtx {
    dir_phys: u32,
    pub objects: Vec<DynObject>,
    ld_library_path: Option<String>,
}

impl DynlinkCtx {
    pub fn new(dir_phys: u32, ld_library_path: Option<String>) -> Self {
        DynlinkCtx { dir_phys, objects: Vec::new(), ld_library_path }
    }

    fn already_loaded(&self, name_or_soname: &str) -> bool {
        let base = basename(name_or_soname);
        self.objects.iter().any(|o| basename(&o.name) == base || o.soname.as_deref() == Some(name_or_soname))
    }

    pub fn find_loaded(&self, name_or_soname: &str) -> Option<usize> {
        let base = basename(name_or_soname);
        self.objects.iter().position(|o| basename(&o.name) == base || o.soname.as_deref() == Some(name_or_soname))
    }

    /// Scans `[DYNLINK_MIN_BASE, USER_VIRTUAL_END)` for the first
    /// page-aligned run of `length` bytes with nothing mapped in it.
    fn find_free_region(&self, length: u32) -> Result<u32> {
        let length = page_align_up(length);
        if length == 0 {
            return Ok(DYNLINK_MIN_BASE);
        }
        let mut base = DYNLINK_MIN_BASE;
        'outer: while base.saturating_add(length) <= USER_VIRTUAL_END {
            let mut off = 0u32;
            while off < length {
                if vmm::translate_in(self.dir_phys, base + off).is_some() {
                    base += PAGE_SIZE;
                    continue 'outer;
                }
                off += PAGE_SIZE;
            }
            return Ok(base);
        }
        Err(KernelError::OutOfMemory)
    }

    fn map_segment(&self, image: &[u8], ph: &elf::ProgramHeader, map_base: u32) -> Result<Segment> {
        let seg_start = page_align_down(map_base.wrapping_add(ph.p_vaddr));
        let seg_end = page_align_up(map_base.wrapping_add(ph.p_vaddr).wrapping_add(ph.p_memsz));
        let writable = ph.p_flags & elf::PF_W != 0;
        let flags =
            PageFlags::PRESENT | PageFlags::USER | if writable { PageFlags::WRITABLE } else { PageFlags::empty() };

        let mut va = seg_start;
        while va < seg_end {
            let phys = pmm::alloc_frame()?;
            {
                let scratch = ScopedScratch::map(phys)?;
                let dst = unsafe { core::slice::from_raw_parts_mut(scratch.as_ptr(), PAGE_SIZE as usize) };
                dst.fill(0);

                let seg_va_start = map_base.wrapping_add(ph.p_vaddr);
                let file_lo = seg_va_start;
                let file_hi = seg_va_start.wrapping_add(ph.p_filesz);
                let page_hi = va + PAGE_SIZE;
                let copy_lo = file_lo.max(va);
                let copy_hi = file_hi.min(page_hi);
                if copy_lo < copy_hi {
                    let page_off = (copy_lo - va) as usize;
                    let file_off = (ph.p_offset + (copy_lo - file_lo)) as usize;
                    let len = (copy_hi - copy_lo) as usize;
                    if file_off + len > image.len() {
                        pmm::free_frame(phys);
                        return Err(KernelError::InvalidArgument);
                    }
                    dst[page_off..page_off + len].copy_from_slice(&image[file_off..file_off + len]);
                }
            }
            if let Err(e) = vmm::map_in(self.dir_phys, va, phys, flags) {
                pmm::free_frame(phys);
                return Err(e);
            }
            va += PAGE_SIZE;
        }
        Ok(Segment { start: seg_start, end: seg_end, writable })
    }

    /// Loads one `ET_DYN` image, mapping its `PT_LOAD` segments into a
    /// freshly chosen window and parsing its `PT_DYNAMIC`. Returns the new
    /// object's index in `self.objects`.
    pub fn load_shared(&mut self, image: &[u8], path: &str) -> Result<usize> {
        if self.objects.len() >= DYNLINK_MAX_OBJECTS {
            return Err(KernelError::OutOfMemory);
        }
        let header = elf::parse_header(image)?;
        if header.e_type != elf::ET_DYN {
            return Err(KernelError::InvalidArgument);
        }
        let phdrs = elf::program_headers(image, &header)?;

        let mut min_vaddr = u32::MAX;
        let mut max_vaddr = 0u32;
        for ph in phdrs.iter().filter(|p| p.p_type == elf::PT_LOAD && p.p_memsz > 0) {
            min_vaddr = min_vaddr.min(ph.p_vaddr);
            max_vaddr = max_vaddr.max(ph.p_vaddr.saturating_add(ph.p_memsz));
        }
        if min_vaddr == u32::MAX {
            return Err(KernelError::InvalidArgument);
        }
        let min_aligned = page_align_down(min_vaddr);
        let span = page_align_up(max_vaddr - min_aligned);
        let block_base = self.find_free_region(span)?;
        let map_base = block_base - min_aligned;

        let mut segments = Vec::new();
        for ph in phdrs.iter().filter(|p| p.p_type == elf::PT_LOAD && p.p_memsz > 0) {
            segments.push(self.map_segment(image, ph, map_base)?);
        }

        let mut obj = DynObject {
            name: path.to_string(),
            soname: None,
            base: map_base,
            hash: 0,
            strtab: 0,
            symtab: 0,
            strsz: 0,
            rel: 0,
            relsz: 0,
            jmprel: 0,
            pltrelsz: 0,
            pltrel_is_rel: true,
            init: 0,
            fini: 0,
            init_array: 0,
            init_arraysz: 0,
            fini_array: 0,
            fini_arraysz: 0,
            textrel: false,
            segments,
        };

        let mut needed_offsets = Vec::new();
        let mut rpath_off = None;
        let mut runpath_off = None;
        let mut soname_off = None;

        if let Some(dynamic) = phdrs.iter().find(|p| p.p_type == elf::PT_DYNAMIC) {
            for entry in elf::parse_dynamic(image, dynamic.p_offset) {
                match entry.tag {
                    elf::DT_HASH => obj.hash = map_base + entry.val,
                    elf::DT_STRTAB => obj.strtab = map_base + entry.val,
                    elf::DT_SYMTAB => obj.symtab = map_base + entry.val,
                    elf::DT_STRSZ => obj.strsz = entry.val,
                    elf::DT_REL => obj.rel = map_base + entry.val,
                    elf::DT_RELSZ => obj.relsz = entry.val,
                    elf::DT_JMPREL => obj.jmprel = map_base + entry.val,
                    elf::DT_PLTRELSZ => obj.pltrelsz = entry.val,
                    elf::DT_PLTREL => obj.pltrel_is_rel = entry.val == elf::DT_REL as u32,
                    elf::DT_INIT => obj.init = map_base + entry.val,
                    elf::DT_FINI => obj.fini = map_base + entry.val,
                    elf::DT_INIT_ARRAY => obj.init_array = map_base + entry.val,
                    elf::DT_INIT_ARRAYSZ => obj.init_arraysz = entry.val,
                    elf::DT_FINI_ARRAY => obj.fini_array = map_base + entry.val,
                    elf::DT_FINI_ARRAYSZ => obj.fini_arraysz = entry.val,
                    elf::DT_RPATH => rpath_off = Some(entry.val),
                    elf::DT_RUNPATH => runpath_off = Some(entry.val),
                    elf::DT_SONAME => soname_off = Some(entry.val),
                    elf::DT_TEXTREL => obj.textrel = true,
                    elf::DT_NEEDED => needed_offsets.push(entry.val),
                    _ => {}
                }
            }
        }

        if obj.hash == 0 || obj.strtab == 0 || obj.symtab == 0 || obj.strsz == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(off) = soname_off {
            if off < obj.strsz {
                obj.soname = crate::elf::reloc::read_cstr(self.dir_phys, obj.strtab + off).ok();
            }
        }
        let rpath = rpath_off
            .filter(|&off| off < obj.strsz)
            .and_then(|off| crate::elf::reloc::read_cstr(self.dir_phys, obj.strtab + off).ok());
        let runpath = runpath_off
            .filter(|&off| off < obj.strsz)
            .and_then(|off| crate::elf::reloc::read_cstr(self.dir_phys, obj.strtab + off).ok());
        let needed: Vec<String> = needed_offsets
            .into_iter()
            .filter(|&off| off < obj.strsz)
            .filter_map(|off| crate::elf::reloc::read_cstr(self.dir_phys, obj.strtab + off).ok())
            .collect();

        self.objects.push(obj);
        let index = self.objects.len() - 1;

        for name in needed {
            if self.already_loaded(&name) {
                continue;
            }
            self.load_needed_by_name(&name, runpath.as_deref(), rpath.as_deref())?;
        }

        Ok(index)
    }

    /// Resolves one `DT_NEEDED` name through the search order §4.H
    /// specifies: `LD_LIBRARY_PATH`, then `DT_RUNPATH`, then `DT_RPATH`,
    /// then a fixed `/lib/` fallback. A name containing `/` is used as-is.
    fn load_needed_by_name(&mut self, name: &str, runpath: Option<&str>, rpath: Option<&str>) -> Result<usize> {
        if name.contains('/') {
            let image = read_whole_file(name, "/")?;
            return self.load_shared(&image, name);
        }

        let candidates = self
            .ld_library_path
            .clone()
            .into_iter()
            .chain(runpath.map(String::from))
            .chain(rpath.map(String::from))
            .chain(core::iter::once(String::from("/lib")));

        for dirlist in candidates {
            for dir in dirlist.split(':').filter(|d| !d.is_empty()) {
                let path = if dir.ends_with('/') { format!("{}{}", dir, name) } else { format!("{}/{}", dir, name) };
                if let Ok(image) = read_whole_file(&path, "/") {
                    if let Ok(idx) = self.load_shared(&image, &path) {
                        return Ok(idx);
                    }
                }
            }
        }
        Err(KernelError::NotFound)
    }

    pub fn apply_relocations(&self) -> Result<()> {
        crate::elf::reloc::apply_all(self.dir_phys, &self.objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn basename_strips_directory_components() {
        assert_eq!(basename("/lib/libc.so"), "libc.so");
        assert_eq!(basename("libc.so"), "libc.so");
    }
}
