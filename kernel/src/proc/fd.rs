//! Per-process file descriptor table, component G. The original `fd.c`
//! keeps one global 256-slot open-file array and has every process's
//! `fd_table[16]` hold an index into it, hand-rolling a `ref_count` so
//! `dup`/fork-sharing/close can tell when to actually call `vfs_close`.
//! `Arc` already is that refcount, so this collapses the indirection: a
//! slot directly holds `Arc<Mutex<OpenFile>>` and dropping the last `Arc`
//! closes the node.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::fs::vfs::VfsNode;

pub struct OpenFile {
    pub node: Arc<dyn VfsNode>,
    pub offset: u64,
    pub flags: u32,
}

pub type FileHandle = Arc<Mutex<OpenFile>>;

pub struct FdTable {
    slots: Vec<Option<FileHandle>>,
}

impl FdTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        FdTable { slots }
    }

    /// Binds fd 0/1/2 to the same open file (e.g. the controlling tty),
    /// matching `fd_init_process_stdio`'s "share one open-file for stdio".
    pub fn init_stdio(&mut self, tty: Arc<dyn VfsNode>) {
        let handle = Arc::new(Mutex::new(OpenFile { node: tty, offset: 0, flags: 0x3 }));
        for fd in 0..3.min(self.slots.len()) {
            self.slots[fd] = Some(handle.clone());
        }
    }

    /// Lowest free fd, matching `find_free_fd_slot`'s linear scan.
    pub fn alloc(&mut self, node: Arc<dyn VfsNode>, flags: u32) -> Result<i32> {
        let slot = self.slots.iter().position(|s| s.is_none()).ok_or(KernelError::OutOfMemory)?;
        self.slots[slot] = Some(Arc::new(Mutex::new(OpenFile { node, offset: 0, flags })));
        Ok(slot as i32)
    }

    /// Installs an existing handle at a specific slot, growing the table if
    /// necessary — backs `dup2`.
    pub fn install_at(&mut self, fd: i32, handle: FileHandle) -> Result<()> {
        let fd = usize::try_from(fd).map_err(|_| KernelError::InvalidArgument)?;
        if fd >= self.slots.len() {
            return Err(KernelError::InvalidArgument);
        }
        self.slots[fd] = Some(handle);
        Ok(())
    }

    pub fn get(&self, fd: i32) -> Option<FileHandle> {
        let fd = usize::try_from(fd).ok()?;
        self.slots.get(fd).and_then(|s| s.clone())
    }

    /// Drops the slot, running the node's `on_close` first if this was the
    /// last fd sharing the handle (two more references always exist at the
    /// check point: the slot itself and the local `handle` below).
    pub fn close(&mut self, fd: i32) -> Result<()> {
        let fd = usize::try_from(fd).map_err(|_| KernelError::InvalidArgument)?;
        let slot = self.slots.get_mut(fd).ok_or(KernelError::InvalidArgument)?;
        let Some(handle) = slot.take() else {
            return Err(KernelError::InvalidArgument);
        };
        if Arc::strong_count(&handle) == 1 {
            handle.lock().node.on_close();
        }
        Ok(())
    }

    /// Lowest free fd at or above `min_fd`, backing `dup2`'s "or the lowest
    /// available if `newfd` is already in use" and `fcntl(F_DUPFD)`.
    pub fn alloc_dup(&mut self, handle: FileHandle, min_fd: i32) -> Result<i32> {
        let min_fd = usize::try_from(min_fd).map_err(|_| KernelError::InvalidArgument)?;
        let slot = (min_fd..self.slots.len())
            .find(|&i| self.slots[i].is_none())
            .ok_or(KernelError::OutOfMemory)?;
        self.slots[slot] = Some(handle);
        Ok(slot as i32)
    }

    /// Shares every occupied slot with `child`, matching `fd_copy_on_fork`.
    pub fn fork_into(&self, child: &mut FdTable) {
        for (i, slot) in self.slots.iter().enumerate() {
            if i < child.slots.len() {
                child.slots[i] = slot.clone();
            }
        }
    }

    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(handle) = slot.take() {
                if Arc::strong_count(&handle) == 1 {
                    handle.lock().node.on_close();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::vfs::testing::null_node;

    #[test_case]
    fn alloc_picks_lowest_free_slot() {
        let mut t = FdTable::new(4);
        let a = t.alloc(null_node(), 0).unwrap();
        let b = t.alloc(null_node(), 0).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        t.close(a).unwrap();
        let c = t.alloc(null_node(), 0).unwrap();
        assert_eq!(c, 0);
    }

    #[test_case]
    fn fork_shares_handles() {
        let mut parent = FdTable::new(4);
        let mut child = FdTable::new(4);
        let fd = parent.alloc(null_node(), 0).unwrap();
        parent.fork_into(&mut child);
        assert!(child.get(fd).is_some());
    }
}
