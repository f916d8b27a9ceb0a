//! Two-level i386 paging, component B. A page directory is 1024 PDEs each
//! covering 4 MiB; this is a line-for-line generalization of the original
//! `vmm.c` into safe(r) Rust: the same scratch-VA trick for editing page
//! tables that live above the identity-mapped low 8 MiB, the same
//! kernel-PDE-mirroring scheme for user directories.

use bitflags::bitflags;
use spin::Mutex;

use crate::arch::cr::{invlpg, write_cr3};
use crate::config::*;
use crate::error::{KernelError, Result};
use crate::mm::pmm;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT  = 0x001;
        const WRITABLE = 0x002;
        const USER     = 0x004;
        const ACCESSED = 0x020;
        const DIRTY    = 0x040;
    }
}

pub const ENTRIES_PER_TABLE: usize = 1024;
pub const PDE_SIZE: u32 = 4 * 1024 * 1024;

fn pd_index(virt: u32) -> usize {
    (virt >> 22) as usize
}

fn pt_index(virt: u32) -> usize {
    ((virt >> 12) & 0x3FF) as usize
}

/// The page-directory-index boundary at which the higher half begins:
/// `KERNEL_VIRTUAL_BASE / PDE_SIZE`.
const KERNEL_PD_INDEX: usize = (KERNEL_VIRTUAL_BASE / PDE_SIZE) as usize;

struct State {
    kernel_directory_phys: u32,
    current_directory_phys: u32,
}

static STATE: Mutex<Option<State>> = Mutex::new(None);

/// A page table or directory, accessed through the scratch VA
/// [`PT_SCRATCH`] when its physical address lies above the identity-mapped
/// low 8 MiB, or directly at its physical==virtual address below it.
struct ScratchTable {
    ptr: *mut u32,
    needs_unmap: bool,
    saved_entry: u32,
}

impl ScratchTable {
    /// # Safety
    /// Caller holds the scratch-mapping lock (implicit via `without_interrupts`)
    /// for the duration this value is alive.
    unsafe fn map(table_phys: u32) -> Result<Self> {
        if table_phys < IDENTITY_MAP_END {
            return Ok(ScratchTable { ptr: table_phys as *mut u32, needs_unmap: false, saved_entry: 0 });
        }

        let dir_phys = current_directory_phys();
        let dir = dir_phys as *mut u32;
        let scratch_pd = pd_index(PT_SCRATCH);
        let scratch_pt = pt_index(PT_SCRATCH);

        unsafe {
            let pde = *dir.add(scratch_pd);
            if pde & PageFlags::PRESENT.bits() == 0 {
                return Err(KernelError::NotMapped);
            }
            let id_pt_phys = pde & !0xFFF;
            let id_pt = id_pt_phys as *mut u32;
            let old = *id_pt.add(scratch_pt);
            *id_pt.add(scratch_pt) = (table_phys & !0xFFF) | PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits();
            invlpg(PT_SCRATCH);
            Ok(ScratchTable { ptr: PT_SCRATCH as *mut u32, needs_unmap: true, saved_entry: old })
        }
    }

    fn as_ptr(&self) -> *mut u32 {
        self.ptr
    }
}

impl Drop for ScratchTable {
    fn drop(&mut self) {
        if !self.needs_unmap {
            return;
        }
        unsafe {
            let dir_phys = current_directory_phys();
            let dir = dir_phys as *mut u32;
            let scratch_pd = pd_index(PT_SCRATCH);
            let pde = *dir.add(scratch_pd);
            let id_pt_phys = pde & !0xFFF;
            let id_pt = id_pt_phys as *mut u32;
            *id_pt.add(pt_index(PT_SCRATCH)) = self.saved_entry;
            invlpg(PT_SCRATCH);
        }
    }
}

fn current_directory_phys() -> u32 {
    STATE.lock().as_ref().expect("vmm not initialized").current_directory_phys
}

fn kernel_directory_phys() -> u32 {
    STATE.lock().as_ref().expect("vmm not initialized").kernel_directory_phys
}

fn zero_phys_page(phys: u32) -> Result<()> {
    crate::arch::cr::without_interrupts(|| unsafe {
        let table = ScratchTable::map(phys)?;
        core::ptr::write_bytes(table.as_ptr(), 0, PAGE_SIZE as usize / 4);
        Ok(())
    })
}

/// Maps one 4 KiB page in `directory_phys`, allocating a page table if the
/// covering PDE is absent.
pub(crate) fn map_in(directory_phys: u32, virt: u32, phys: u32, flags: PageFlags) -> Result<()> {
    crate::arch::cr::without_interrupts(|| unsafe {
        let dir = directory_phys as *mut u32;
        let pd_i = pd_index(virt);
        let pt_i = pt_index(virt);

        if *dir.add(pd_i) & PageFlags::PRESENT.bits() == 0 {
            let pt_phys = pmm::alloc_frame()?;
            *dir.add(pd_i) =
                pt_phys | PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits() | (flags.bits() & PageFlags::USER.bits());
            if let Err(e) = zero_phys_page(pt_phys) {
                pmm::free_frame(pt_phys);
                return Err(e);
            }
        }

        let pt_phys = *dir.add(pd_i) & !0xFFF;
        let table = ScratchTable::map(pt_phys)?;
        *table.as_ptr().add(pt_i) = (phys & !0xFFF) | flags.bits();
        invlpg(virt);
        Ok(())
    })
}

pub(crate) fn unmap_in(directory_phys: u32, virt: u32, free_frame: bool) -> Result<u32> {
    crate::arch::cr::without_interrupts(|| unsafe {
        let dir = directory_phys as *mut u32;
        let pd_i = pd_index(virt);
        let pt_i = pt_index(virt);

        if *dir.add(pd_i) & PageFlags::PRESENT.bits() == 0 {
            return Err(KernelError::NotMapped);
        }
        let pt_phys = *dir.add(pd_i) & !0xFFF;
        let table = ScratchTable::map(pt_phys)?;
        let pte = *table.as_ptr().add(pt_i);
        if pte & PageFlags::PRESENT.bits() == 0 {
            return Err(KernelError::NotMapped);
        }
        let phys = pte & !0xFFF;
        *table.as_ptr().add(pt_i) = 0;
        invlpg(virt);

        if free_frame {
            pmm::free_frame(phys);
        }
        Ok(phys)
    })
}

pub(crate) fn translate_in(directory_phys: u32, virt: u32) -> Option<u32> {
    crate::arch::cr::without_interrupts(|| unsafe {
        let dir = directory_phys as *mut u32;
        let pd_i = pd_index(virt);
        if *dir.add(pd_i) & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        let pt_phys = *dir.add(pd_i) & !0xFFF;
        let table = ScratchTable::map(pt_phys).ok()?;
        let pte = *table.as_ptr().add(pt_index(virt));
        if pte & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some((pte & !0xFFF) | (virt & 0xFFF))
    })
}

/// Like [`translate_in`] but reports the PTE's USER/WRITABLE bits instead of
/// the physical address, so `syscall::uaccess` can reject a pointer into
/// kernel-only or read-only memory before copying through it.
pub(crate) fn page_perms_in(directory_phys: u32, virt: u32) -> Option<PageFlags> {
    crate::arch::cr::without_interrupts(|| unsafe {
        let dir = directory_phys as *mut u32;
        let pd_i = pd_index(virt);
        if *dir.add(pd_i) & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        let pt_phys = *dir.add(pd_i) & !0xFFF;
        let table = ScratchTable::map(pt_phys).ok()?;
        let pte = *table.as_ptr().add(pt_index(virt));
        if pte & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(PageFlags::from_bits_truncate(pte))
    })
}

/// Identity-maps the low 8 MiB and maps the first 128 MiB of RAM into the
/// higher half, then enables paging. Runs with physical addressing still in
/// effect, same two-pass approach as `vmm_init`.
///
/// # Safety
/// Must run once, with paging disabled, after the PMM is initialized.
pub unsafe fn init() -> Result<()> {
    let dir_phys = pmm::alloc_frame()?;
    unsafe {
        core::ptr::write_bytes(dir_phys as *mut u32, 0, PAGE_SIZE as usize / 4);

        let mut addr = 0u32;
        while addr < IDENTITY_MAP_END {
            map_page_before_paging(dir_phys, addr, addr, PageFlags::PRESENT | PageFlags::WRITABLE)?;
            addr += PAGE_SIZE;
        }

        let mut addr = 0u32;
        while addr < KERNEL_LINEAR_MAP_END {
            map_page_before_paging(
                dir_phys,
                KERNEL_VIRTUAL_BASE + addr,
                addr,
                PageFlags::PRESENT | PageFlags::WRITABLE,
            )?;
            addr += PAGE_SIZE;
        }

        *STATE.lock() = Some(State { kernel_directory_phys: dir_phys, current_directory_phys: dir_phys });
        write_cr3(dir_phys);
        crate::arch::cr::enable_paging();
    }
    Ok(())
}

/// Before paging is enabled every address is its own physical address, so
/// page tables can be written through directly rather than via scratch
/// mapping.
unsafe fn map_page_before_paging(dir_phys: u32, virt: u32, phys: u32, flags: PageFlags) -> Result<()> {
    unsafe {
        let dir = dir_phys as *mut u32;
        let pd_i = pd_index(virt);
        let pt_i = pt_index(virt);

        if *dir.add(pd_i) & PageFlags::PRESENT.bits() == 0 {
            let pt_phys = pmm::alloc_frame()?;
            *dir.add(pd_i) = pt_phys | PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits();
            core::ptr::write_bytes(pt_phys as *mut u32, 0, PAGE_SIZE as usize / 4);
        }
        let pt_phys = *dir.add(pd_i) & !0xFFF;
        let pt = pt_phys as *mut u32;
        *pt.add(pt_i) = (phys & !0xFFF) | flags.bits();
    }
    Ok(())
}

/// Maps a page in the currently active address space.
pub fn map(virt: u32, phys: u32, flags: PageFlags) -> Result<()> {
    map_in(current_directory_phys(), virt, phys, flags)
}

pub fn unmap(virt: u32) -> Result<u32> {
    unmap_in(current_directory_phys(), virt, true)
}

pub fn unmap_nofree(virt: u32) -> Result<u32> {
    unmap_in(current_directory_phys(), virt, false)
}

pub fn get_physical(virt: u32) -> Option<u32> {
    translate_in(current_directory_phys(), virt)
}

/// Creates a fresh page directory with the kernel's higher-half PDEs (and
/// the low 8 MiB identity PDEs the scratch-mapping helpers rely on)
/// mirrored in, ready to back a new process's address space.
pub fn create_directory() -> Result<u32> {
    let dir_phys = pmm::alloc_frame()?;
    zero_phys_page(dir_phys)?;

    crate::arch::cr::without_interrupts(|| unsafe {
        let kdir_phys = kernel_directory_phys();
        let kdir = kdir_phys as *mut u32;
        let table = ScratchTable::map(dir_phys)?;
        let new_dir = table.as_ptr();

        for i in KERNEL_PD_INDEX..ENTRIES_PER_TABLE {
            let pde = *kdir.add(i);
            if pde & PageFlags::PRESENT.bits() != 0 {
                *new_dir.add(i) = pde;
            }
        }
        for i in 0..2 {
            let pde = *kdir.add(i);
            if pde & PageFlags::PRESENT.bits() != 0 {
                *new_dir.add(i) = pde;
            }
        }
        Ok(())
    })?;

    Ok(dir_phys)
}

/// Frees every present user PDE (0..768) in `directory_phys` along with the
/// page tables and frames they reference, skipping the two low identity
/// PDEs shared with the kernel directory, then frees the directory itself.
/// Never called on the kernel's own directory.
pub fn destroy_directory(directory_phys: u32) {
    if directory_phys == kernel_directory_phys() {
        return;
    }

    crate::arch::cr::without_interrupts(|| {
        let kdir_phys = kernel_directory_phys();
        for i in 0..KERNEL_PD_INDEX {
            let Ok(dir_table) = (unsafe { ScratchTable::map(directory_phys) }) else { continue };
            let pde = unsafe { *dir_table.as_ptr().add(i) };
            if pde & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            if i < 2 {
                let kdir = unsafe { ScratchTable::map(kdir_phys) };
                if let Ok(kdir) = kdir {
                    if unsafe { *kdir.as_ptr().add(i) } == pde {
                        continue;
                    }
                }
            }

            let pt_phys = pde & !0xFFF;
            if let Ok(pt) = unsafe { ScratchTable::map(pt_phys) } {
                for j in 0..ENTRIES_PER_TABLE {
                    let pte = unsafe { *pt.as_ptr().add(j) };
                    if pte & PageFlags::PRESENT.bits() != 0 {
                        pmm::free_frame(pte & !0xFFF);
                        unsafe { *pt.as_ptr().add(j) = 0 };
                    }
                }
            }
            pmm::free_frame(pt_phys);
            if let Ok(dir_table) = unsafe { ScratchTable::map(directory_phys) } {
                unsafe { *dir_table.as_ptr().add(i) = 0 };
            }
        }
    });

    pmm::free_frame(directory_phys);
}

/// Duplicates every present, user-accessible page in the private range
/// (PDE indices `2..KERNEL_PD_INDEX`) from `src_dir_phys` into
/// `dst_dir_phys`: a fresh frame per page, contents copied byte for byte.
/// `fork`'s view of "copy the address space" — no copy-on-write, the same
/// choice the original `fork()` implementation this is modeled on makes.
/// The shared low-8MiB identity range and the kernel's own higher half are
/// already mirrored into `dst_dir_phys` by [`create_directory`] and are left
/// alone here, the same range [`destroy_directory`] knows not to free.
pub fn clone_user_mappings(src_dir_phys: u32, dst_dir_phys: u32) -> Result<()> {
    for i in 2..KERNEL_PD_INDEX {
        let src_pde = crate::arch::cr::without_interrupts(|| unsafe {
            let table = ScratchTable::map(src_dir_phys)?;
            Ok::<u32, KernelError>(*table.as_ptr().add(i))
        })?;
        if src_pde & PageFlags::PRESENT.bits() == 0 {
            continue;
        }
        let src_pt_phys = src_pde & !0xFFF;

        for j in 0..ENTRIES_PER_TABLE {
            let src_pte = crate::arch::cr::without_interrupts(|| unsafe {
                let table = ScratchTable::map(src_pt_phys)?;
                Ok::<u32, KernelError>(*table.as_ptr().add(j))
            })?;
            if src_pte & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let src_phys = src_pte & !0xFFF;
            let flags = PageFlags::from_bits_truncate(src_pte);

            // One VA at a time is available through ScopedScratch, so stage
            // the source page through a kernel buffer rather than holding
            // src and dst mapped simultaneously.
            let mut buf = alloc::vec![0u8; PAGE_SIZE as usize];
            {
                let scratch = ScopedScratch::map(src_phys)?;
                unsafe { core::ptr::copy_nonoverlapping(scratch.as_ptr(), buf.as_mut_ptr(), PAGE_SIZE as usize) };
            }

            let dst_phys = pmm::alloc_frame()?;
            {
                let scratch = match ScopedScratch::map(dst_phys) {
                    Ok(s) => s,
                    Err(e) => {
                        pmm::free_frame(dst_phys);
                        return Err(e);
                    }
                };
                unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), scratch.as_ptr(), PAGE_SIZE as usize) };
            }

            let virt = ((i as u32) << 22) | ((j as u32) << 12);
            if let Err(e) = map_in(dst_dir_phys, virt, dst_phys, flags) {
                pmm::free_frame(dst_phys);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Loads `directory_phys` into CR3 if it is not already active.
pub fn switch_directory(directory_phys: u32) {
    let mut state = STATE.lock();
    let state = state.as_mut().expect("vmm not initialized");
    if state.current_directory_phys == directory_phys {
        return;
    }
    state.current_directory_phys = directory_phys;
    unsafe { write_cr3(directory_phys) };
}

pub fn kernel_directory() -> u32 {
    kernel_directory_phys()
}

/// A scratch mapping of one arbitrary physical page at [`TEMP_MAP_VA`],
/// the general-purpose counterpart to the page-table-only [`ScratchTable`]
/// above it shares the same single-slot-under-interrupts-disabled
/// discipline as `vmm_map_temp_page`/`vmm_unmap_temp_page`. Used by code
/// that needs to read or write one physical frame it does not otherwise
/// have a virtual mapping for — zeroing a freshly allocated user page,
/// staging an ELF segment, walking a FAT cluster.
pub struct ScopedScratch {
    saved_entry: u32,
}

impl ScopedScratch {
    pub fn map(phys: u32) -> Result<Self> {
        crate::arch::cr::without_interrupts(|| unsafe {
            let dir_phys = current_directory_phys();
            let dir = dir_phys as *mut u32;
            let pd_i = pd_index(TEMP_MAP_VA);
            let pt_i = pt_index(TEMP_MAP_VA);
            if *dir.add(pd_i) & PageFlags::PRESENT.bits() == 0 {
                return Err(KernelError::NotMapped);
            }
            let pt_phys = *dir.add(pd_i) & !0xFFF;
            let pt = pt_phys as *mut u32;
            let old = *pt.add(pt_i);
            *pt.add(pt_i) = (phys & !0xFFF) | PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits();
            invlpg(TEMP_MAP_VA);
            Ok(ScopedScratch { saved_entry: old })
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        TEMP_MAP_VA as *mut u8
    }
}

impl Drop for ScopedScratch {
    fn drop(&mut self) {
        unsafe {
            let dir_phys = current_directory_phys();
            let dir = dir_phys as *mut u32;
            let pt_phys = *dir.add(pd_index(TEMP_MAP_VA)) & !0xFFF;
            let pt = pt_phys as *mut u32;
            *pt.add(pt_index(TEMP_MAP_VA)) = self.saved_entry;
            invlpg(TEMP_MAP_VA);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn pd_pt_index_roundtrip() {
        let virt = 0xC040_1234u32;
        assert_eq!(pd_index(virt), 0x301);
        assert_eq!(pt_index(virt), 0x001);
    }
}
