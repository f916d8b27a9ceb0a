//! SysV shared memory (§4.I). Segments are tracked in a small global
//! table the way `shm.c`'s fixed `shm_segments[MAX_SHM_SEGMENTS]` array
//! is, generalized to a growable `Vec` since nothing here needs a static
//! address.

use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{PAGE_SIZE, SHM_ATTACH_BASE};
use crate::error::{KernelError, Result};
use crate::mm::address_space::AddressSpace;
use crate::mm::pmm;
use crate::mm::vmm::PageFlags;
use crate::proc::process::Pid;

pub const MAX_SEGMENTS: usize = 256;
pub const IPC_PRIVATE: i32 = 0;
pub const IPC_CREAT: u32 = 0o1000;
pub const IPC_EXCL: u32 = 0o2000;
pub const IPC_RMID: u32 = 0;
pub const SHM_RDONLY: u32 = 0o10000;
pub const SHM_RND: u32 = 0o20000;

struct Segment {
    shmid: u32,
    key: i32,
    size: u32,
    phys_addr: u32,
    nattch: u32,
    creator: Pid,
    pending_rmid: bool,
}

struct Table {
    segments: Vec<Segment>,
    next_shmid: u32,
    next_attach_va: u32,
}

static TABLE: Mutex<Table> = Mutex::new(Table { segments: Vec::new(), next_shmid: 1, next_attach_va: SHM_ATTACH_BASE });

/// `shmget(key, size, flags)`.
pub fn shmget(key: i32, size: u32, flags: u32, creator: Pid) -> Result<u32> {
    let mut table = TABLE.lock();

    if key != IPC_PRIVATE {
        if let Some(seg) = table.segments.iter().find(|s| s.key == key) {
            if flags & IPC_CREAT != 0 && flags & IPC_EXCL != 0 {
                return Err(KernelError::Exists);
            }
            return Ok(seg.shmid);
        }
    }

    if flags & IPC_CREAT == 0 {
        return Err(KernelError::NotFound);
    }

    let rounded = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let num_pages = rounded / PAGE_SIZE;
    let phys_addr = pmm::alloc_contiguous(num_pages)?;

    {
        use crate::mm::vmm::ScopedScratch;
        for i in 0..num_pages {
            let scratch = ScopedScratch::map(phys_addr + i * PAGE_SIZE)?;
            unsafe { core::ptr::write_bytes(scratch.as_ptr(), 0, PAGE_SIZE as usize) };
        }
    }

    let shmid = table.next_shmid;
    table.next_shmid += 1;
    table.segments.push(Segment { shmid, key, size: rounded, phys_addr, nattch: 0, creator, pending_rmid: false });
    Ok(shmid)
}

/// `shmat(shmid, addr, flags)`.
pub fn shmat(shmid: u32, addr: Option<u32>, flags: u32, space: &AddressSpace) -> Result<u32> {
    let mut table = TABLE.lock();
    let seg_idx = table.segments.iter().position(|s| s.shmid == shmid).ok_or(KernelError::InvalidArgument)?;

    let (size, phys_addr) = {
        let seg = &table.segments[seg_idx];
        (seg.size, seg.phys_addr)
    };

    let base_va = match addr {
        Some(a) if flags & SHM_RND != 0 => a & !(PAGE_SIZE - 1),
        Some(a) => a,
        None => {
            let va = table.next_attach_va;
            table.next_attach_va = (va + size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            va
        }
    };

    let num_pages = size / PAGE_SIZE;
    let map_flags =
        PageFlags::PRESENT | PageFlags::USER | if flags & SHM_RDONLY == 0 { PageFlags::WRITABLE } else { PageFlags::empty() };

    for i in 0..num_pages {
        let virt = base_va + i * PAGE_SIZE;
        let phys = phys_addr + i * PAGE_SIZE;
        if let Err(e) = space.map(virt, phys, map_flags) {
            for j in 0..i {
                let _ = space.unmap(base_va + j * PAGE_SIZE);
            }
            return Err(e);
        }
    }

    table.segments[seg_idx].nattch += 1;
    Ok(base_va)
}

/// `shmdt(addr)`: unmaps the region starting at `addr` in `space`. The
/// caller (syscall dispatch, which tracks per-process attachments) is
/// responsible for knowing which `shmid`/`size` that address belongs to;
/// this just does the unmap and accounting once told.
pub fn shmdt(shmid: u32, addr: u32, size: u32, space: &AddressSpace) -> Result<()> {
    let mut table = TABLE.lock();
    let seg_idx = table.segments.iter().position(|s| s.shmid == shmid).ok_or(KernelError::InvalidArgument)?;

    let num_pages = size / PAGE_SIZE;
    for i in 0..num_pages {
        let _ = space.unmap(addr + i * PAGE_SIZE);
    }

    let seg = &mut table.segments[seg_idx];
    seg.nattch = seg.nattch.saturating_sub(1);
    if seg.nattch == 0 && seg.pending_rmid {
        let phys_addr = seg.phys_addr;
        let pages = seg.size / PAGE_SIZE;
        table.segments.remove(seg_idx);
        drop(table);
        for i in 0..pages {
            pmm::free_frame(phys_addr + i * PAGE_SIZE);
        }
    }
    Ok(())
}

/// The rounded size `shmget` actually allocated for `shmid`, so callers that
/// only keep the `shmid`/`addr` pair around (`syscall::dispatch`'s
/// `shm_attachments`) can recover how many pages a later `shmdt` must unmap.
pub fn segment_size(shmid: u32) -> Option<u32> {
    TABLE.lock().segments.iter().find(|s| s.shmid == shmid).map(|s| s.size)
}

/// `shmctl(shmid, IPC_RMID, ...)`: frees the segment's frames immediately
/// if nothing is attached, otherwise defers until the last `shmdt`.
pub fn shmctl_rmid(shmid: u32) -> Result<()> {
    let mut table = TABLE.lock();
    let seg_idx = table.segments.iter().position(|s| s.shmid == shmid).ok_or(KernelError::InvalidArgument)?;

    if table.segments[seg_idx].nattch == 0 {
        let seg = table.segments.remove(seg_idx);
        drop(table);
        let pages = seg.size / PAGE_SIZE;
        for i in 0..pages {
            pmm::free_frame(seg.phys_addr + i * PAGE_SIZE);
        }
    } else {
        table.segments[seg_idx].pending_rmid = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn shmget_rejects_missing_without_creat() {
        let mut table = TABLE.lock();
        table.segments.clear();
        table.next_shmid = 1;
        drop(table);
        assert!(shmget(42, 4096, 0, 1).is_err());
    }

    #[test_case]
    fn shmget_dedups_by_key() {
        let mut table = TABLE.lock();
        table.segments.clear();
        table.next_shmid = 1;
        drop(table);
        let a = shmget(7, 4096, IPC_CREAT, 1).unwrap();
        let b = shmget(7, 4096, IPC_CREAT, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test_case]
    fn shmget_excl_conflict_errors() {
        let mut table = TABLE.lock();
        table.segments.clear();
        table.next_shmid = 1;
        drop(table);
        shmget(9, 4096, IPC_CREAT, 1).unwrap();
        assert!(shmget(9, 4096, IPC_CREAT | IPC_EXCL, 1).is_err());
    }
}
