//! Physical/virtual memory management, components A-C. Generalizes the
//! teacher's `memory.rs` (built on `x86_64::structures::paging` and
//! `linked_list_allocator`, both unavailable for a 2-level i386 address
//! space) into hand-rolled equivalents grounded directly on the original
//! kernel's `mm/pmm.c`, `mm/vmm.c`, and `mm/heap.c`.

pub mod address_space;
pub mod heap;
pub mod pmm;
pub mod vmm;

use crate::error::{KernelError, Result};

/// Brings memory management up: PMM bitmap seeded from the Multiboot memory
/// map, kernel page directory built and loaded, kernel heap mapped.
///
/// # Safety
/// Must run once, early in `kernel_main`, before any `kmalloc`/`Box`/`Vec`
/// use and before any user address space is created.
pub unsafe fn init(mem_low_kb: u32, mem_high_kb: u32, kernel_end_phys: u32) -> Result<()> {
    unsafe {
        pmm::init(mem_low_kb, mem_high_kb, kernel_end_phys);
        vmm::init()?;
        heap::init()?;
    }
    Ok(())
}

pub(crate) fn oom<T>() -> Result<T> {
    Err(KernelError::OutOfMemory)
}
