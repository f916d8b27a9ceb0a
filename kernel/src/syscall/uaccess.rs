//! User-pointer validation and copying, the part of component J the
//! original `uaccess.c`/`uaccess.h` pair exists for: every syscall argument
//! that is a pointer passes through here before the kernel trusts it.
//! Bounds are checked against the fixed user window (§3.2) and then,
//! page by page, against the current process's own page tables rather than
//! dereferencing the pointer directly — a page fault taken from ring 0
//! during a syscall would hit `arch::idt`'s kernel-mode path and panic, so
//! nothing here ever lets one happen.

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::{PAGE_SIZE, USER_VIRTUAL_END, USER_VIRTUAL_START};
use crate::error::{KernelError, Result};
use crate::mm::vmm::{self, PageFlags, ScopedScratch};
use crate::proc::process;

/// Longest a single `execve` argument/environment string or an argv/envp
/// vector is allowed to be; mirrors `UACCESS_MAX_STRING` from the original
/// header, a sanity bound rather than anything architectural.
pub const MAX_STRING_LEN: usize = 4096;
pub const MAX_ARRAY_ENTRIES: usize = 256;

fn current_dir_phys() -> Result<u32> {
    let pid = process::current_pid().ok_or(KernelError::InvalidArgument)?;
    let proc = process::get(pid).ok_or(KernelError::InvalidArgument)?;
    Ok(proc.lock().address_space.directory_phys())
}

/// Checks that `[va, va + len)` lies entirely within the user window and is
/// present and user-accessible (and, if `write`, writable) in every page it
/// spans. Zero-length ranges at an otherwise-valid address are accepted
/// without touching the page tables, matching `read(fd, buf, 0)` being a
/// no-op rather than an error.
pub fn check_range(va: u32, len: usize, write: bool) -> Result<()> {
    if len == 0 {
        return if (USER_VIRTUAL_START..=USER_VIRTUAL_END).contains(&va) {
            Ok(())
        } else {
            Err(KernelError::NotMapped)
        };
    }
    let end = va.checked_add(len as u32).ok_or(KernelError::NotMapped)?;
    if va < USER_VIRTUAL_START || end > USER_VIRTUAL_END {
        return Err(KernelError::NotMapped);
    }

    let dir_phys = current_dir_phys()?;
    let first_page = va & !(PAGE_SIZE - 1);
    let mut page = first_page;
    while page < end {
        let perms = vmm::page_perms_in(dir_phys, page).ok_or(KernelError::NotMapped)?;
        if !perms.contains(PageFlags::USER) {
            return Err(KernelError::PermissionDenied);
        }
        if write && !perms.contains(PageFlags::WRITABLE) {
            return Err(KernelError::PermissionDenied);
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Copies `len` bytes starting at the user virtual address `va` into a
/// freshly allocated kernel `Vec`, one physical page at a time through the
/// scratch mapping — never through a direct pointer into user space.
pub fn copy_from_user(va: u32, len: usize) -> Result<Vec<u8>> {
    check_range(va, len, false)?;
    let dir_phys = current_dir_phys()?;
    let mut out = alloc::vec![0u8; len];
    let mut copied = 0usize;
    while copied < len {
        let cur = va + copied as u32;
        let page_off = (cur & (PAGE_SIZE - 1)) as usize;
        let chunk = (PAGE_SIZE as usize - page_off).min(len - copied);
        let phys = vmm::translate_in(dir_phys, cur).ok_or(KernelError::NotMapped)?;
        let phys_page = phys & !(PAGE_SIZE - 1);
        let scratch = ScopedScratch::map(phys_page)?;
        let src = unsafe { core::slice::from_raw_parts(scratch.as_ptr().add(page_off), chunk) };
        out[copied..copied + chunk].copy_from_slice(src);
        copied += chunk;
    }
    Ok(out)
}

/// Copies `buf` into user memory starting at `va`, page by page.
pub fn copy_to_user(va: u32, buf: &[u8]) -> Result<()> {
    check_range(va, buf.len(), true)?;
    let dir_phys = current_dir_phys()?;
    let mut copied = 0usize;
    while copied < buf.len() {
        let cur = va + copied as u32;
        let page_off = (cur & (PAGE_SIZE - 1)) as usize;
        let chunk = (PAGE_SIZE as usize - page_off).min(buf.len() - copied);
        let phys = vmm::translate_in(dir_phys, cur).ok_or(KernelError::NotMapped)?;
        let phys_page = phys & !(PAGE_SIZE - 1);
        let scratch = ScopedScratch::map(phys_page)?;
        let dst = unsafe { core::slice::from_raw_parts_mut(scratch.as_ptr().add(page_off), chunk) };
        dst.copy_from_slice(&buf[copied..copied + chunk]);
        copied += chunk;
    }
    Ok(())
}

/// Copies a NUL-terminated string out of user memory, one byte at a time
/// (mirroring `uaccess_copy_str_from_user`'s byte loop rather than the
/// bulk-copy path above, since the length isn't known up front). Errors with
/// [`KernelError::InvalidArgument`] if no NUL appears within
/// [`MAX_STRING_LEN`] bytes.
pub fn copy_str_from_user(va: u32) -> Result<String> {
    let dir_phys = current_dir_phys()?;
    let mut bytes = Vec::new();
    for i in 0..MAX_STRING_LEN as u32 {
        let cur = va + i;
        if !(USER_VIRTUAL_START..USER_VIRTUAL_END).contains(&cur) {
            return Err(KernelError::NotMapped);
        }
        let perms = vmm::page_perms_in(dir_phys, cur).ok_or(KernelError::NotMapped)?;
        if !perms.contains(PageFlags::USER) {
            return Err(KernelError::PermissionDenied);
        }
        let phys = vmm::translate_in(dir_phys, cur).ok_or(KernelError::NotMapped)?;
        let phys_page = phys & !(PAGE_SIZE - 1);
        let page_off = (phys & (PAGE_SIZE - 1)) as usize;
        let scratch = ScopedScratch::map(phys_page)?;
        let byte = unsafe { *scratch.as_ptr().add(page_off) };
        if byte == 0 {
            return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument);
        }
        bytes.push(byte);
    }
    Err(KernelError::InvalidArgument)
}

/// Copies a NUL-terminated, NULL-terminated-pointer-array such as `argv` or
/// `envp`: `ptrs[i]` is itself a user pointer to a C string, and the array
/// ends at the first NULL entry. Used by `execve`.
pub fn copy_cstr_array_from_user(va: u32) -> Result<Vec<String>> {
    if va == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for i in 0..MAX_ARRAY_ENTRIES as u32 {
        let ptr_va = va + i * 4;
        let raw = copy_from_user(ptr_va, 4)?;
        let entry = u32::from_le_bytes(raw.try_into().unwrap());
        if entry == 0 {
            return Ok(out);
        }
        out.push(copy_str_from_user(entry)?);
    }
    Err(KernelError::InvalidArgument)
}
