//! In-memory read-only tree built from a newc cpio archive, installed as
//! the process-wide root (§4.F). Every file node borrows straight out of
//! the archive's `'static` bytes — there is no point copying a read-only
//! blob the kernel image already holds — the same zero-copy shape the
//! teacher's `Ramdisk` uses over its embedded tar.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::fs::cpio;
use crate::fs::vfs::{DirEntry, Metadata, NodeKind, VfsNode};

const MODE_DIR: u32 = 0o040755;
const MODE_FILE: u32 = 0o100644;
const MODE_SYMLINK: u32 = 0o120777;

/// Per-path mode/uid/gid override, applied on resolve since cpio's only
/// metadata is a 32-bit mode field and initramfs otherwise has no uid/gid
/// concept of its own (§4.F "Metadata overlay").
static OVERLAY: Mutex<BTreeMap<String, Metadata>> = Mutex::new(BTreeMap::new());

pub fn set_overlay(path: &str, meta: Metadata) {
    OVERLAY.lock().insert(path.to_string(), meta);
}

enum Entry {
    File { data: &'static [u8], mode: u32 },
    Symlink { target: String },
    Directory { children: BTreeMap<String, Entry> },
}

struct Node {
    path: String,
    entry: Entry,
}

impl VfsNode for Node {
    fn kind(&self) -> NodeKind {
        match &self.entry {
            Entry::File { .. } => NodeKind::File,
            Entry::Symlink { .. } => NodeKind::Symlink,
            Entry::Directory { .. } => NodeKind::Directory,
        }
    }

    fn metadata(&self) -> Metadata {
        let base = match &self.entry {
            Entry::File { data, mode } => Metadata { size: data.len() as u64, mode: *mode, ..Metadata::default() },
            Entry::Symlink { target } => {
                Metadata { size: target.len() as u64, mode: MODE_SYMLINK, ..Metadata::default() }
            }
            Entry::Directory { .. } => Metadata { size: 0, mode: MODE_DIR, ..Metadata::default() },
        };
        match OVERLAY.lock().get(&self.path) {
            Some(over) => Metadata { mode: over.mode, uid: over.uid, gid: over.gid, ..base },
            None => base,
        }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let Entry::File { data, .. } = &self.entry else { return Err(KernelError::IsDirectory) };
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn readdir(&self) -> Result<Vec<DirEntry>> {
        let Entry::Directory { children } = &self.entry else { return Err(KernelError::NotDirectory) };
        Ok(children
            .iter()
            .map(|(name, entry)| DirEntry {
                name: name.clone(),
                kind: match entry {
                    Entry::File { .. } => NodeKind::File,
                    Entry::Symlink { .. } => NodeKind::Symlink,
                    Entry::Directory { .. } => NodeKind::Directory,
                },
            })
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>> {
        let Entry::Directory { children } = &self.entry else { return Err(KernelError::NotDirectory) };
        // Entry is not `Clone`-friendly (it may hold a subtree), so re-borrow
        // a fresh Node wrapping a clone of the matched child's data instead
        // of trying to return a reference into `self`.
        let child = children.get(name).ok_or(KernelError::NotFound)?;
        let child_path = if self.path == "/" {
            alloc::format!("/{}", name)
        } else {
            alloc::format!("{}/{}", self.path, name)
        };
        Ok(clone_node(child_path, child))
    }

    fn readlink(&self) -> Result<String> {
        match &self.entry {
            Entry::Symlink { target } => Ok(target.clone()),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

impl Clone for Entry {
    fn clone(&self) -> Self {
        match self {
            Entry::File { data, mode } => Entry::File { data, mode: *mode },
            Entry::Symlink { target } => Entry::Symlink { target: target.clone() },
            Entry::Directory { children } => Entry::Directory { children: children.clone() },
        }
    }
}

fn clone_node(path: String, entry: &Entry) -> Arc<dyn VfsNode> {
    Arc::new(Node { path, entry: entry.clone() })
}

fn insert_path(root: &mut BTreeMap<String, Entry>, components: &[&str], leaf: Entry) {
    let (head, rest) = match components.split_first() {
        Some(pair) => pair,
        None => return,
    };
    if rest.is_empty() {
        root.insert((*head).to_string(), leaf);
        return;
    }
    let dir = root
        .entry((*head).to_string())
        .or_insert_with(|| Entry::Directory { children: BTreeMap::new() });
    if let Entry::Directory { children } = dir {
        insert_path(children, rest, leaf);
    }
}

/// Mode bits in the high byte of cpio's ASCII-hex mode field that
/// distinguish regular files / directories / symlinks (POSIX `S_IFMT`).
const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// Parses the archive and builds the tree it represents, rooted at `/`.
pub fn build(archive: &'static [u8]) -> Result<Arc<dyn VfsNode>> {
    let mut children = BTreeMap::new();

    for entry in cpio::entries(archive) {
        let path = entry.name.trim_start_matches('/').trim_start_matches("./");
        if path.is_empty() {
            continue;
        }
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            continue;
        }

        let kind = entry.mode & S_IFMT;
        let leaf = if kind == S_IFDIR {
            Entry::Directory { children: BTreeMap::new() }
        } else if kind == S_IFLNK {
            let target = core::str::from_utf8(entry.data).unwrap_or("").to_string();
            Entry::Symlink { target }
        } else {
            Entry::File { data: entry.data, mode: if entry.mode == 0 { MODE_FILE } else { entry.mode } }
        };

        insert_path(&mut children, &components, leaf);
    }

    Ok(Arc::new(Node { path: String::from("/"), entry: Entry::Directory { children } }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpio_entry(name: &str, mode: u32, data: &[u8]) -> Vec<u8> {
        let namesize = name.len() + 1;
        let mut out = Vec::new();
        out.extend_from_slice(b"070701");
        out.extend_from_slice(format!("{:08x}", 0u32).as_bytes()); // ino
        out.extend_from_slice(format!("{:08x}", mode).as_bytes());
        for _ in 0..11 {
            out.extend_from_slice(b"00000000");
        }
        out.extend_from_slice(format!("{:08x}", data.len()).as_bytes());
        for _ in 0..2 {
            out.extend_from_slice(b"00000000");
        }
        out.extend_from_slice(format!("{:08x}", namesize).as_bytes());
        out.extend_from_slice(b"00000000");
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    #[test_case]
    fn builds_nested_file_tree() {
        let mut archive = Vec::new();
        archive.extend(cpio_entry("bin", S_IFDIR | 0o755, &[]));
        archive.extend(cpio_entry("bin/init", S_IFMT & 0o100000 | 0o755, b"hello"));
        archive.extend(cpio_entry("TRAILER!!!", 0, &[]));

        let leaked: &'static [u8] = Vec::leak(archive);
        let root = build(leaked).unwrap();
        let bin = root.lookup("bin").unwrap();
        assert_eq!(bin.kind(), NodeKind::Directory);
        let init = bin.lookup("init").unwrap();
        assert_eq!(init.kind(), NodeKind::File);
        let mut buf = [0u8; 5];
        assert_eq!(init.read(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }
}
