//! Kernel heap, component C: a singly-linked free-list allocator over a
//! span of pages mapped starting at [`KERNEL_HEAP_START`], generalized from
//! the original `heap.c`'s `heap_block_t` list (size/free/next/prev,
//! split-on-alloc, coalesce-on-free) into the teacher's
//! `#[global_allocator]` shape — in place of its `linked_list_allocator`
//! crate, which has no notion of "also hand me the physical address of
//! what you just gave me" that `kmalloc_physical` (needed for page tables
//! and process control blocks the PMM must be able to find later) requires.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use spin::Mutex;

use crate::config::{KERNEL_HEAP_END, KERNEL_HEAP_START, PAGE_SIZE};
use crate::error::{KernelError, Result};
use crate::mm::pmm;
use crate::mm::vmm::{self, PageFlags};

#[repr(C)]
struct Block {
    size: usize,
    free: bool,
    next: *mut Block,
    prev: *mut Block,
}

const BLOCK_HEADER: usize = core::mem::size_of::<Block>();

struct HeapState {
    start: *mut Block,
    end: u32,
    total_allocated: usize,
}

unsafe impl Send for HeapState {}

impl HeapState {
    const fn empty() -> Self {
        HeapState { start: core::ptr::null_mut(), end: KERNEL_HEAP_START, total_allocated: 0 }
    }

    fn expand(&mut self, needed: usize) -> Result<()> {
        let pages = (needed as u32 + PAGE_SIZE - 1) / PAGE_SIZE;
        for i in 0..pages {
            let phys = pmm::alloc_frame()?;
            if let Err(e) = vmm::map(self.end + i * PAGE_SIZE, phys, PageFlags::PRESENT | PageFlags::WRITABLE) {
                pmm::free_frame(phys);
                return Err(e);
            }
        }
        self.end += pages * PAGE_SIZE;
        Ok(())
    }

    unsafe fn alloc(&mut self, size: usize) -> *mut u8 {
        let size = (size + 7) & !7;

        unsafe {
            let mut current = self.start;
            while !current.is_null() {
                let block = &mut *current;
                if block.free && block.size >= size {
                    if block.size > size + BLOCK_HEADER + 8 {
                        let new_block = (current as *mut u8).add(BLOCK_HEADER + size) as *mut Block;
                        (*new_block).size = block.size - size - BLOCK_HEADER;
                        (*new_block).free = true;
                        (*new_block).next = block.next;
                        (*new_block).prev = current;
                        if !block.next.is_null() {
                            (*block.next).prev = new_block;
                        }
                        block.next = new_block;
                        block.size = size;
                    }
                    block.free = false;
                    self.total_allocated += block.size;
                    return (current as *mut u8).add(BLOCK_HEADER);
                }
                current = block.next;
            }

            let needed = size + BLOCK_HEADER;
            let old_end = self.end;
            if self.expand(needed).is_err() {
                return core::ptr::null_mut();
            }

            let new_block = old_end as *mut Block;
            (*new_block).size = size;
            (*new_block).free = false;
            (*new_block).next = core::ptr::null_mut();
            (*new_block).prev = core::ptr::null_mut();

            if self.start.is_null() {
                self.start = new_block;
            } else {
                let mut tail = self.start;
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                }
                (*tail).next = new_block;
                (*new_block).prev = tail;
            }

            self.total_allocated += size;
            (new_block as *mut u8).add(BLOCK_HEADER)
        }
    }

    unsafe fn free(&mut self, ptr: *mut u8) {
        unsafe {
            let block = ptr.sub(BLOCK_HEADER) as *mut Block;
            (*block).free = true;
            self.total_allocated -= (*block).size;

            let next = (*block).next;
            if !next.is_null() && (*next).free {
                (*block).size += BLOCK_HEADER + (*next).size;
                let next_next = (*next).next;
                (*block).next = next_next;
                if !next_next.is_null() {
                    (*next_next).prev = block;
                }
            }

            let prev = (*block).prev;
            if !prev.is_null() && (*prev).free {
                (*prev).size += BLOCK_HEADER + (*block).size;
                (*prev).next = (*block).next;
                if !(*block).next.is_null() {
                    (*(*block).next).prev = prev;
                }
            }
        }
    }

    fn stats(&self) -> HeapStats {
        let total_size = self.end - KERNEL_HEAP_START;
        let mut num_blocks = 0;
        unsafe {
            let mut current = self.start;
            while !current.is_null() {
                num_blocks += 1;
                current = (*current).next;
            }
        }
        HeapStats { total_size, used_size: self.total_allocated as u32, num_blocks }
    }
}

pub struct HeapStats {
    pub total_size: u32,
    pub used_size: u32,
    pub num_blocks: u32,
}

pub struct KernelHeap {
    inner: Mutex<HeapState>,
}

impl KernelHeap {
    pub const fn empty() -> Self {
        KernelHeap { inner: Mutex::new(HeapState::empty()) }
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { self.inner.lock().alloc(layout.size().max(1)) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.inner.lock().free(ptr) };
    }
}

#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap::empty();

/// Maps the first heap page and starts the free list, matching `heap_init`.
///
/// # Safety
/// Must run once, after the VMM is initialized, before any allocation.
pub unsafe fn init() -> Result<()> {
    let phys = pmm::alloc_frame()?;
    if let Err(e) = vmm::map(KERNEL_HEAP_START, phys, PageFlags::PRESENT | PageFlags::WRITABLE) {
        pmm::free_frame(phys);
        return Err(e);
    }

    let mut state = ALLOCATOR.inner.lock();
    unsafe {
        let start = KERNEL_HEAP_START as *mut Block;
        (*start).size = (PAGE_SIZE as usize) - BLOCK_HEADER;
        (*start).free = true;
        (*start).next = core::ptr::null_mut();
        (*start).prev = core::ptr::null_mut();
        state.start = start;
    }
    state.end = KERNEL_HEAP_START + PAGE_SIZE;
    Ok(())
}

pub fn stats() -> HeapStats {
    ALLOCATOR.inner.lock().stats()
}

/// Allocates `layout` and also reports the physical address backing the
/// first byte, for callers (page tables, DMA-visible buffers) that need to
/// hand a physical pointer to something outside the virtual-memory world.
pub fn alloc_physical(layout: Layout) -> Option<(NonNull<u8>, u32)> {
    let ptr = unsafe { ALLOCATOR.alloc(layout) };
    let ptr = NonNull::new(ptr)?;
    let phys = vmm::get_physical(ptr.as_ptr() as u32)?;
    Some((ptr, phys))
}

#[cfg(all(test, feature = "qemu-test"))]
mod tests {
    use super::*;
    extern crate alloc;
    use alloc::vec::Vec;

    #[test_case]
    fn alloc_and_free_does_not_panic() {
        let mut v: Vec<u32> = Vec::with_capacity(64);
        for i in 0..64 {
            v.push(i);
        }
        assert_eq!(v.len(), 64);
        drop(v);
    }
}
