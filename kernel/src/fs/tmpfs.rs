//! In-memory read/write filesystem (§4.F "tmpfs. In-memory read/write FS
//! with up to 256 entries per directory; grows file storage
//! geometrically."). Backed by plain `Vec<u8>`s behind a lock per node,
//! the same shape `fs::vfs::testing::NullNode` uses for its scratch
//! storage, generalized to a full directory tree.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::fs::vfs::{DirEntry, Metadata, NodeKind, VfsNode};

const MAX_ENTRIES_PER_DIR: usize = 256;
const MODE_DIR: u32 = 0o040777;
const MODE_FILE: u32 = 0o100666;

enum Storage {
    File(Mutex<Vec<u8>>),
    Directory(Mutex<BTreeMap<String, Arc<TmpNode>>>),
}

struct TmpNode {
    storage: Storage,
}

impl TmpNode {
    fn new_file() -> Arc<TmpNode> {
        Arc::new(TmpNode { storage: Storage::File(Mutex::new(Vec::new())) })
    }

    fn new_dir() -> Arc<TmpNode> {
        Arc::new(TmpNode { storage: Storage::Directory(Mutex::new(BTreeMap::new())) })
    }
}

impl VfsNode for TmpNode {
    fn kind(&self) -> NodeKind {
        match &self.storage {
            Storage::File(_) => NodeKind::File,
            Storage::Directory(_) => NodeKind::Directory,
        }
    }

    fn metadata(&self) -> Metadata {
        match &self.storage {
            Storage::File(bytes) => Metadata { size: bytes.lock().len() as u64, mode: MODE_FILE, ..Metadata::default() },
            Storage::Directory(children) => {
                Metadata { size: children.lock().len() as u64, mode: MODE_DIR, ..Metadata::default() }
            }
        }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let Storage::File(bytes) = &self.storage else { return Err(KernelError::IsDirectory) };
        let bytes = bytes.lock();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }

    /// Grows the backing `Vec` geometrically (doubling, like `Vec::push`'s
    /// own amortized growth) rather than to the exact byte needed, per
    /// spec's "grows file storage geometrically".
    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let Storage::File(bytes) = &self.storage else { return Err(KernelError::IsDirectory) };
        let mut bytes = bytes.lock();
        let offset = offset as usize;
        let needed = offset + buf.len();
        if bytes.capacity() < needed {
            let mut new_cap = bytes.capacity().max(64);
            while new_cap < needed {
                new_cap *= 2;
            }
            bytes.reserve(new_cap - bytes.len());
        }
        if bytes.len() < needed {
            bytes.resize(needed, 0);
        }
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let Storage::File(bytes) = &self.storage else { return Err(KernelError::IsDirectory) };
        bytes.lock().resize(len as usize, 0);
        Ok(())
    }

    fn readdir(&self) -> Result<Vec<DirEntry>> {
        let Storage::Directory(children) = &self.storage else { return Err(KernelError::NotDirectory) };
        Ok(children.lock().iter().map(|(name, node)| DirEntry { name: name.clone(), kind: node.kind() }).collect())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>> {
        let Storage::Directory(children) = &self.storage else { return Err(KernelError::NotDirectory) };
        children.lock().get(name).cloned().map(|n| n as Arc<dyn VfsNode>).ok_or(KernelError::NotFound)
    }

    fn create(&self, name: &str, kind: NodeKind) -> Result<Arc<dyn VfsNode>> {
        let Storage::Directory(children) = &self.storage else { return Err(KernelError::NotDirectory) };
        let mut children = children.lock();
        if children.len() >= MAX_ENTRIES_PER_DIR {
            return Err(KernelError::OutOfMemory);
        }
        if children.contains_key(name) {
            return Err(KernelError::Exists);
        }
        let node = match kind {
            NodeKind::Directory => TmpNode::new_dir(),
            NodeKind::File => TmpNode::new_file(),
            _ => return Err(KernelError::InvalidArgument),
        };
        children.insert(name.to_string(), node.clone());
        Ok(node)
    }

    fn unlink(&self, name: &str) -> Result<()> {
        let Storage::Directory(children) = &self.storage else { return Err(KernelError::NotDirectory) };
        children.lock().remove(name).map(|_| ()).ok_or(KernelError::NotFound)
    }
}

pub fn root() -> Arc<dyn VfsNode> {
    TmpNode::new_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn create_write_read_roundtrip() {
        let r = root();
        let file = r.create("a.txt", NodeKind::File).unwrap();
        assert_eq!(file.write(0, b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(file.read(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test_case]
    fn directory_entry_cap_enforced() {
        let r = root();
        for i in 0..MAX_ENTRIES_PER_DIR {
            r.create(&alloc::format!("f{}", i), NodeKind::File).unwrap();
        }
        assert!(r.create("overflow", NodeKind::File).is_err());
    }

    #[test_case]
    fn unlink_removes_entry() {
        let r = root();
        r.create("x", NodeKind::File).unwrap();
        r.unlink("x").unwrap();
        assert!(r.lookup("x").is_err());
    }
}
