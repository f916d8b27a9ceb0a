//! Static `execve` path (§4.H): maps a flat `ET_EXEC` image into a fresh
//! address space, builds the SysV-i386 argv/envp stack, and hands back
//! everything `syscall::dispatch`'s `execve` handler needs to either seed
//! a brand-new process or replace a running one's image.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::config::{PAGE_SIZE, USER_HEAP_BASE, USER_STACK_BASE, USER_STACK_PAGES};
use crate::elf::{self, ElfHeader, ProgramHeader};
use crate::error::{KernelError, Result};
use crate::mm::address_space::AddressSpace;
use crate::mm::pmm;
use crate::mm::vmm::{self, PageFlags, ScopedScratch};

/// Everything produced by loading an image, ready to be dropped into a
/// `Process` and eventually entered via `arch::context_switch`.
pub struct LoadedImage {
    pub address_space: AddressSpace,
    pub entry: u32,
    pub stack_top: u32,
    pub heap_start: u32,
    pub cmdline: String,
}

fn page_align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

fn page_align_up(addr: u32) -> u32 {
    page_align_down(addr.wrapping_add(PAGE_SIZE - 1))
}

/// Maps and fills one `PT_LOAD` segment page-by-page: every page in
/// `[p_vaddr, p_vaddr + p_memsz)` is allocated, zeroed, and loaded with
/// whatever part of `[p_offset, p_offset + p_filesz)` overlaps it (the bss
/// tail beyond `p_filesz` stays zero).
fn load_segment(space: &AddressSpace, image: &[u8], ph: &ProgramHeader) -> Result<()> {
    let seg_start = page_align_down(ph.p_vaddr);
    let seg_end = page_align_up(ph.p_vaddr.saturating_add(ph.p_memsz));
    let flags = PageFlags::PRESENT
        | PageFlags::USER
        | if ph.p_flags & elf::PF_W != 0 { PageFlags::WRITABLE } else { PageFlags::empty() };

    let mut va = seg_start;
    while va < seg_end {
        let phys = pmm::alloc_frame()?;
        {
            let scratch = ScopedScratch::map(phys)?;
            let dst = unsafe { core::slice::from_raw_parts_mut(scratch.as_ptr(), PAGE_SIZE as usize) };
            dst.fill(0);

            // Overlap of this page [va, va+PAGE_SIZE) with the file-backed
            // range [p_vaddr, p_vaddr+p_filesz) of the segment.
            let file_lo = ph.p_vaddr;
            let file_hi = ph.p_vaddr.saturating_add(ph.p_filesz);
            let page_hi = va + PAGE_SIZE;
            let copy_lo = file_lo.max(va);
            let copy_hi = file_hi.min(page_hi);
            if copy_lo < copy_hi {
                let page_off = (copy_lo - va) as usize;
                let file_off = (ph.p_offset + (copy_lo - ph.p_vaddr)) as usize;
                let len = (copy_hi - copy_lo) as usize;
                if file_off + len > image.len() {
                    return Err(KernelError::InvalidArgument);
                }
                dst[page_off..page_off + len].copy_from_slice(&image[file_off..file_off + len]);
            }
        }
        if let Err(e) = space.map(va, phys, flags) {
            pmm::free_frame(phys);
            return Err(e);
        }
        va += PAGE_SIZE;
    }
    Ok(())
}

/// Lays out the SysV-i386 initial stack contents for one page: in
/// ascending address order, `argc`, `argv[0..argc]`, NULL, `envp[0..envc]`,
/// NULL, then the string bytes. Returns the page bytes and the byte offset
/// within the page that ESP (pointing at `argc`) should land on. Pure and
/// allocation-light so it can be exercised without any paging machinery.
fn build_stack_page(argv: &[&str], envp: &[&str]) -> Result<([u8; PAGE_SIZE as usize], u32)> {
    let mut page = [0u8; PAGE_SIZE as usize];
    let base_va = USER_STACK_BASE - PAGE_SIZE;
    let mut cursor = PAGE_SIZE as i64;

    let mut place_string = |page: &mut [u8; PAGE_SIZE as usize], cursor: &mut i64, s: &str| -> Result<u32> {
        let len = s.len() as i64 + 1;
        *cursor -= len;
        if *cursor < 0 {
            return Err(KernelError::InvalidArgument);
        }
        let off = *cursor as usize;
        page[off..off + s.len()].copy_from_slice(s.as_bytes());
        page[off + s.len()] = 0;
        Ok(base_va + off as u32)
    };

    let mut argv_vas = Vec::with_capacity(argv.len());
    for s in argv {
        argv_vas.push(place_string(&mut page, &mut cursor, s)?);
    }
    let mut envp_vas = Vec::with_capacity(envp.len());
    for s in envp {
        envp_vas.push(place_string(&mut page, &mut cursor, s)?);
    }

    cursor &= !3; // 4-byte align before the pointer array

    let word_count = 1 + argv.len() + 1 + envp.len() + 1; // argc, argv.., NULL, envp.., NULL
    cursor -= (word_count * 4) as i64;
    cursor &= !15; // 16-align the final ESP

    if cursor < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let array_off = cursor as usize;
    let mut w = array_off;
    let mut put = |page: &mut [u8; PAGE_SIZE as usize], w: &mut usize, value: u32| {
        page[*w..*w + 4].copy_from_slice(&value.to_le_bytes());
        *w += 4;
    };
    put(&mut page, &mut w, argv.len() as u32);
    for va in &argv_vas {
        put(&mut page, &mut w, *va);
    }
    put(&mut page, &mut w, 0);
    for va in &envp_vas {
        put(&mut page, &mut w, *va);
    }
    put(&mut page, &mut w, 0);

    Ok((page, array_off as u32))
}

/// Builds the SysV-i386 argv/envp stack in `space` and maps it at
/// `USER_STACK_BASE`, returning the initial ESP. Shared by the static
/// `ET_EXEC` path below and `elf::dynlink`'s `ET_DYN` one, since the stack
/// layout does not depend on how the rest of the image was loaded.
pub fn build_user_stack(space: &AddressSpace, argv: &[&str], envp: &[&str]) -> Result<u32> {
    let (page, array_off) = build_stack_page(argv, envp)?;
    let stack_top_page_va = USER_STACK_BASE - PAGE_SIZE;
    let stack_phys = pmm::alloc_frame()?;
    {
        let scratch = ScopedScratch::map(stack_phys)?;
        unsafe { core::ptr::copy_nonoverlapping(page.as_ptr(), scratch.as_ptr(), PAGE_SIZE as usize) };
    }
    space.map(stack_top_page_va, stack_phys, PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE)?;

    for i in 1..USER_STACK_PAGES {
        let va = stack_top_page_va - i * PAGE_SIZE;
        let phys = pmm::alloc_frame()?;
        {
            let scratch = ScopedScratch::map(phys)?;
            unsafe { core::ptr::write_bytes(scratch.as_ptr(), 0, PAGE_SIZE as usize) };
        }
        space.map(va, phys, PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE)?;
    }

    Ok(stack_top_page_va + array_off)
}

/// Loads a flat `ET_EXEC` image: creates a fresh address space, maps every
/// `PT_LOAD` segment, builds the argv/envp stack, and records `cmdline` as
/// `argv[0]` (falling back to `path`). Does not touch the currently active
/// directory or transfer control — that is `arch::context_switch`'s job,
/// invoked by the caller once this returns `Ok`.
pub fn load_image(image: &[u8], path: &str, argv: &[&str], envp: &[&str]) -> Result<LoadedImage> {
    let header = elf::parse_header(image)?;
    if header.e_type != elf::ET_EXEC {
        return Err(KernelError::InvalidArgument);
    }
    let phdrs = elf::program_headers(image, &header)?;

    let space = AddressSpace::new()?;

    let mut max_end = 0u32;
    for ph in phdrs.iter().filter(|p| p.p_type == elf::PT_LOAD) {
        load_segment(&space, image, ph)?;
        max_end = max_end.max(page_align_up(ph.p_vaddr.saturating_add(ph.p_memsz)));
    }

    let stack_top = build_user_stack(&space, argv, envp)?;
    let cmdline = argv.first().map(|s| s.to_string()).unwrap_or_else(|| path.to_string());

    Ok(LoadedImage {
        address_space: space,
        entry: header.e_entry,
        stack_top,
        heap_start: max_end.max(USER_HEAP_BASE),
        cmdline,
    })
}

/// Switches CR3 to `space`'s directory and drops straight into user mode
/// at `entry`/`stack_top`. Never returns on success; the only way out is
/// through a trap. Takes `space` by reference rather than by value so the
/// caller keeps owning it (normally inside a `Process`, so `execve`
/// replacing a running process's image can drop the *old* address space
/// only after this switch lands, once its directory is no longer CR3).
pub fn enter(space: &AddressSpace, entry: u32, stack_top: u32) -> ! {
    space.switch_to();
    let frame = crate::arch::context_switch::TrapReturnFrame::for_user_entry(entry, stack_top);
    unsafe { crate::arch::context_switch::enter_user_mode(&frame) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn stack_layout_is_16_aligned_and_ascending() {
        let argv = ["init", "--verbose"];
        let envp = ["HOME=/", "PATH=/bin"];
        let (_, esp_off) = build_stack_page(&argv, &envp).unwrap();
        assert_eq!(esp_off % 16, 0);

        let base_va = USER_STACK_BASE - PAGE_SIZE;
        assert!(base_va + esp_off < USER_STACK_BASE);
    }

    #[test_case]
    fn stack_argc_matches_argv_len() {
        let argv = ["a", "b", "c"];
        let envp: [&str; 0] = [];
        let (page, esp_off) = build_stack_page(&argv, &envp).unwrap();
        let argc = u32::from_le_bytes(page[esp_off as usize..esp_off as usize + 4].try_into().unwrap());
        assert_eq!(argc, 3);
    }

    #[test_case]
    fn rejects_non_exec_type() {
        // A minimal ET_DYN-tagged header (e_type=3) with an otherwise
        // plausible ELF32/i386 prefix.
        let mut image = alloc::vec![0u8; 52];
        image[0..4].copy_from_slice(b"\x7FELF");
        image[elf::EI_CLASS] = elf::ELFCLASS32;
        image[elf::EI_DATA] = elf::ELFDATA2LSB;
        image[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        image[18..20].copy_from_slice(&elf::EM_386.to_le_bytes());
        assert!(load_image(&image, "/bin/test", &[], &[]).is_err());
    }
}
