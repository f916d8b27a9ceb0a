//! Node tree, component F. Generalizes the teacher's two-level
//! `Filesystem` + `Inode` indirection (a `BTreeMap<u32, Box<dyn
//! Filesystem>>` keyed by device, each filesystem doing its own
//! dev/inode-number lookups) into one trait object per node: `VfsNode`
//! bundles the metadata spec.md's `VfsNode` struct lists with the
//! operations its `ops` function-pointer table would have dispatched
//! through. `ref_count` becomes the strong count of the `Arc` holding the
//! node — there is no separate field to keep in sync.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Device,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Metadata {
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// One filesystem node, reached through an `Arc<dyn VfsNode>` everywhere
/// (mount table, open-file table, directory parents). Every method takes
/// `&self`: a filesystem that needs interior mutability for its own state
/// (tmpfs's byte storage, the FAT cluster cache) holds its own lock, the
/// same way the teacher's `Devfs` wraps its console in a `Mutex` rather
/// than the trait demanding `&mut self`.
pub trait VfsNode: Send + Sync {
    fn kind(&self) -> NodeKind;
    fn metadata(&self) -> Metadata;

    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(KernelError::InvalidArgument)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(KernelError::InvalidArgument)
    }

    fn truncate(&self, _len: u64) -> Result<()> {
        Err(KernelError::InvalidArgument)
    }

    fn readdir(&self) -> Result<Vec<DirEntry>> {
        Err(KernelError::NotDirectory)
    }

    /// Looks up a single component within this directory node. Path
    /// resolution (`fs::path::resolve`) is built entirely out of repeated
    /// calls to this, mirroring `finddir` in the original.
    fn lookup(&self, _name: &str) -> Result<Arc<dyn VfsNode>> {
        Err(KernelError::NotDirectory)
    }

    fn readlink(&self) -> Result<String> {
        Err(KernelError::InvalidArgument)
    }

    fn create(&self, _name: &str, _kind: NodeKind) -> Result<Arc<dyn VfsNode>> {
        Err(KernelError::PermissionDenied)
    }

    fn unlink(&self, _name: &str) -> Result<()> {
        Err(KernelError::PermissionDenied)
    }

    /// §6.2's device capability proxied through a node (devfs) or a
    /// node-specific control channel (TTY mode, procfs `/proc/vga`-style
    /// write commands implement these as plain `write` instead).
    fn ioctl(&self, _cmd: u32, _arg: usize) -> Result<i32> {
        Err(KernelError::InvalidArgument)
    }

    /// Socket/TTY poll hooks (§4.I "Polling"); plain files are always
    /// ready both ways.
    fn poll_can_read(&self) -> bool {
        true
    }

    fn poll_can_write(&self) -> bool {
        true
    }

    /// Run by `close(2)`'s handler before the last `Arc` to this node is
    /// dropped — a node with cleanup that must happen promptly rather than
    /// whenever the refcount happens to reach zero (a socket disconnecting
    /// its peer) overrides this; everything else is fine with the default.
    fn on_close(&self) {}
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use spin::Mutex;

    /// A node with no backing storage, useful wherever a test needs *a*
    /// `Arc<dyn VfsNode>` and doesn't care what reading or writing it does.
    struct NullNode {
        bytes: Mutex<Vec<u8>>,
    }

    impl VfsNode for NullNode {
        fn kind(&self) -> NodeKind {
            NodeKind::File
        }

        fn metadata(&self) -> Metadata {
            Metadata { size: self.bytes.lock().len() as u64, ..Metadata::default() }
        }

        fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            let bytes = self.bytes.lock();
            let offset = offset as usize;
            if offset >= bytes.len() {
                return Ok(0);
            }
            let n = buf.len().min(bytes.len() - offset);
            buf[..n].copy_from_slice(&bytes[offset..offset + n]);
            Ok(n)
        }

        fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
            let mut bytes = self.bytes.lock();
            let offset = offset as usize;
            if bytes.len() < offset + buf.len() {
                bytes.resize(offset + buf.len(), 0);
            }
            bytes[offset..offset + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    pub fn null_node() -> Arc<dyn VfsNode> {
        Arc::new(NullNode { bytes: Mutex::new(Vec::new()) })
    }
}
