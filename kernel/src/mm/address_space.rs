//! Owned wrapper around a user page directory. Every [`Process`] in
//! `proc::process` holds one; dropping it tears down every user mapping,
//! generalizing the teacher's RAII-around-a-resource style (seen in its
//! `memory.rs` frame allocator guard) to a page directory instead of a
//! single frame.

use crate::error::Result;
use crate::mm::vmm::{self, PageFlags};

pub struct AddressSpace {
    directory_phys: u32,
}

impl AddressSpace {
    /// A directory seeded with the kernel's higher-half + low-identity PDEs
    /// mirrored in, ready for a new process.
    pub fn new() -> Result<Self> {
        let directory_phys = vmm::create_directory()?;
        Ok(AddressSpace { directory_phys })
    }

    /// Wraps the kernel's own directory. Never torn down by `Drop`.
    pub fn kernel() -> Self {
        AddressSpace { directory_phys: vmm::kernel_directory() }
    }

    /// A fresh directory carrying a deep copy of every user mapping in
    /// `parent`, for `fork`.
    pub fn fork_from(parent: &AddressSpace) -> Result<Self> {
        let child = Self::new()?;
        vmm::clone_user_mappings(parent.directory_phys, child.directory_phys)?;
        Ok(child)
    }

    pub fn directory_phys(&self) -> u32 {
        self.directory_phys
    }

    pub fn switch_to(&self) {
        vmm::switch_directory(self.directory_phys);
    }

    pub fn map(&self, virt: u32, phys: u32, flags: PageFlags) -> Result<()> {
        vmm::map_in(self.directory_phys, virt, phys, flags)
    }

    pub fn unmap(&self, virt: u32) -> Result<u32> {
        vmm::unmap_in(self.directory_phys, virt, true)
    }

    pub fn get_physical(&self, virt: u32) -> Option<u32> {
        vmm::translate_in(self.directory_phys, virt)
    }

    fn is_kernel(&self) -> bool {
        self.directory_phys == vmm::kernel_directory()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if !self.is_kernel() {
            vmm::destroy_directory(self.directory_phys);
        }
    }
}
