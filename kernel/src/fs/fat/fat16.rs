//! FAT16 mount and node implementation, grounded on `fat16.c`/`fat16_vfs.c`.
//! FAT16's root directory lives in a fixed-size area ahead of the data
//! region rather than as a normal cluster chain — `RootArea` below models
//! that distinction so `Fat16Node` can share one `lookup`/`readdir`/`write`
//! implementation across both shapes.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::fs::fat::bpb::{self, BlockDevice};
use crate::fs::fat::{self, RawDirEntry};
use crate::fs::vfs::{DirEntry, Metadata, NodeKind, VfsNode};

const CLUSTER_FREE: u16 = 0x0000;
const CLUSTER_END_MIN: u16 = 0xFFF8;
const CLUSTER_BAD: u16 = 0xFFF7;

pub struct Fat16Fs {
    device: Arc<dyn BlockDevice>,
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    fat_start: u64,
    fat_size_bytes: u64,
    num_fats: u32,
    root_dir_start: u64,
    root_entry_count: u32,
    data_start: u64,
    total_clusters: u32,
}

impl Fat16Fs {
    fn cluster_size(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_start + ((cluster - 2) as u64) * self.cluster_size() as u64
    }

    fn fat_entry_offset(&self, cluster: u32, fat_index: u32) -> u64 {
        self.fat_start + (fat_index as u64) * self.fat_size_bytes + (cluster as u64) * 2
    }

    fn read_fat_entry(&self, cluster: u32) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.device.read_at(self.fat_entry_offset(cluster, 0), &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Both FAT copies are kept identical, per spec's bit-exact contract.
    fn write_fat_entry(&self, cluster: u32, value: u16) -> Result<()> {
        let bytes = value.to_le_bytes();
        for fat in 0..self.num_fats {
            self.device.write_at(self.fat_entry_offset(cluster, fat), &bytes)?;
        }
        Ok(())
    }

    fn is_end(entry: u16) -> bool {
        entry >= CLUSTER_END_MIN
    }

    fn chain(&self, first_cluster: u32) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        let mut cluster = first_cluster;
        while cluster >= 2 && !Fat16Fs::is_end(cluster as u16) && cluster != CLUSTER_BAD as u32 {
            clusters.push(cluster);
            cluster = self.read_fat_entry(cluster)? as u32;
        }
        Ok(clusters)
    }

    fn alloc_cluster(&self) -> Result<u32> {
        for cluster in 2..self.total_clusters + 2 {
            if self.read_fat_entry(cluster)? == CLUSTER_FREE {
                self.write_fat_entry(cluster, CLUSTER_END_MIN)?;
                return Ok(cluster);
            }
        }
        Err(KernelError::OutOfMemory)
    }

    fn free_chain(&self, first_cluster: u32) -> Result<()> {
        for cluster in self.chain(first_cluster)? {
            self.write_fat_entry(cluster, CLUSTER_FREE)?;
        }
        Ok(())
    }

    fn read_cluster(&self, cluster: u32, buf: &mut [u8]) -> Result<()> {
        self.device.read_at(self.cluster_offset(cluster), buf)
    }

    fn write_cluster(&self, cluster: u32, buf: &[u8]) -> Result<()> {
        self.device.write_at(self.cluster_offset(cluster), buf)
    }
}

/// Mounts a FAT16 volume over `device`, validating the cluster-count
/// range spec requires ("FAT16 rejects cluster count outside
/// [4085, 65525)").
pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<dyn VfsNode>> {
    let mut sector = [0u8; bpb::SECTOR_SIZE as usize];
    device.read_at(0, &mut sector)?;
    let bpb = bpb::parse(&sector)?;

    let bytes_per_sector = bpb.bytes_per_sector as u32;
    let fat_start = (bpb.reserved_sectors as u64) * bytes_per_sector as u64;
    let fat_size_bytes = (bpb.fat_size_16 as u64) * bytes_per_sector as u64;
    let root_dir_start = fat_start + (bpb.num_fats as u64) * fat_size_bytes;
    let root_dir_sectors =
        ((bpb.root_entry_count as u32 * fat::DIR_ENTRY_SIZE as u32) + bytes_per_sector - 1) / bytes_per_sector;
    let data_start = root_dir_start + (root_dir_sectors as u64) * bytes_per_sector as u64;

    let total_sectors = bpb::total_sectors(&bpb);
    let data_sectors = total_sectors - (bpb.reserved_sectors as u32)
        - (bpb.num_fats as u32) * (bpb.fat_size_16 as u32)
        - root_dir_sectors;
    let total_clusters = data_sectors / (bpb.sectors_per_cluster as u32);

    if !(4085..65525).contains(&total_clusters) {
        return Err(KernelError::InvalidArgument);
    }

    let fs = Arc::new(Fat16Fs {
        device,
        bytes_per_sector,
        sectors_per_cluster: bpb.sectors_per_cluster as u32,
        fat_start,
        fat_size_bytes,
        num_fats: bpb.num_fats as u32,
        root_dir_start,
        root_entry_count: bpb.root_entry_count as u32,
        data_start,
        total_clusters,
    });

    Ok(Arc::new(Fat16Node { fs, location: NodeLocation::RootArea, first_cluster: Mutex::new(0), is_dir: true, size: Mutex::new(0) }))
}

/// Where a node's 32-byte directory entry physically lives, so a size or
/// first-cluster update from `write`/`create`/`unlink` can be written
/// straight back.
#[derive(Clone, Copy)]
enum NodeLocation {
    RootArea,
    Entry { byte_offset: u64 },
}

struct Fat16Node {
    fs: Arc<Fat16Fs>,
    location: NodeLocation,
    first_cluster: Mutex<u32>,
    is_dir: bool,
    size: Mutex<u32>,
}

impl Fat16Node {
    fn directory_bytes(&self) -> Result<(Vec<u8>, bool)> {
        match self.location {
            NodeLocation::RootArea => {
                let len = (self.fs.root_entry_count as usize) * fat::DIR_ENTRY_SIZE;
                let mut buf = alloc::vec![0u8; len];
                self.fs.device.read_at(self.fs.root_dir_start, &mut buf)?;
                Ok((buf, true))
            }
            _ => {
                let first = *self.first_cluster.lock();
                let chain = self.fs.chain(first)?;
                let mut buf = Vec::with_capacity(chain.len() * self.fs.cluster_size() as usize);
                for cluster in chain {
                    let mut cbuf = alloc::vec![0u8; self.fs.cluster_size() as usize];
                    self.fs.read_cluster(cluster, &mut cbuf)?;
                    buf.extend_from_slice(&cbuf);
                }
                Ok((buf, false))
            }
        }
    }

    fn is_dir_is_root(&self) -> bool {
        matches!(self.location, NodeLocation::RootArea)
    }

    fn entries(&self) -> Result<Vec<(usize, RawDirEntry)>> {
        let (bytes, _) = self.directory_bytes()?;
        let mut out = Vec::new();
        for (i, chunk) in bytes.chunks(fat::DIR_ENTRY_SIZE).enumerate() {
            if chunk.len() < fat::DIR_ENTRY_SIZE {
                break;
            }
            let entry = RawDirEntry::parse(chunk);
            if entry.is_end() {
                break;
            }
            if entry.is_deleted() || entry.is_volume_label() || entry.attr == fat::ATTR_LONG_NAME {
                continue;
            }
            out.push((i, entry));
        }
        Ok(out)
    }

    fn find_entry(&self, name: &str) -> Option<(usize, RawDirEntry)> {
        self.entries().ok()?.into_iter().find(|(_, e)| e.short_display_name().eq_ignore_ascii_case(name))
    }

    /// Absolute device byte offset of directory-entry slot `index` within
    /// this directory, whether it's the fixed root area or a cluster chain.
    fn entry_absolute_offset(&self, index: usize) -> Result<u64> {
        let byte_offset = index as u64 * fat::DIR_ENTRY_SIZE as u64;
        if self.is_dir_is_root() {
            Ok(self.fs.root_dir_start + byte_offset)
        } else {
            let first = *self.first_cluster.lock();
            let chain = self.fs.chain(first)?;
            let cluster_size = self.fs.cluster_size() as u64;
            let cluster_idx = (byte_offset / cluster_size) as usize;
            let within = byte_offset % cluster_size;
            let cluster = *chain.get(cluster_idx).ok_or(KernelError::IoError)?;
            Ok(self.fs.cluster_offset(cluster) + within)
        }
    }

    fn write_entry_at(&self, index: usize, entry: &RawDirEntry) -> Result<()> {
        let mut raw = [0u8; fat::DIR_ENTRY_SIZE];
        entry.write(&mut raw);
        let absolute = self.entry_absolute_offset(index)?;
        self.fs.device.write_at(absolute, &raw)
    }

    fn node_from_entry(&self, index: usize, entry: RawDirEntry) -> Result<Arc<dyn VfsNode>> {
        let byte_offset = self.entry_absolute_offset(index)?;
        Ok(Arc::new(Fat16Node {
            fs: self.fs.clone(),
            location: NodeLocation::Entry { byte_offset },
            first_cluster: Mutex::new(entry.first_cluster()),
            is_dir: entry.is_directory(),
            size: Mutex::new(entry.file_size),
        }))
    }
}

impl VfsNode for Fat16Node {
    fn kind(&self) -> NodeKind {
        if self.is_dir {
            NodeKind::Directory
        } else {
            NodeKind::File
        }
    }

    fn metadata(&self) -> Metadata {
        let mode = if self.is_dir { 0o040755 } else { 0o100644 };
        Metadata { size: *self.size.lock() as u64, mode, ..Metadata::default() }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.is_dir {
            return Err(KernelError::IsDirectory);
        }
        let size = *self.size.lock() as u64;
        if offset >= size {
            return Ok(0);
        }
        let first = *self.first_cluster.lock();
        let chain = self.fs.chain(first)?;
        let cluster_size = self.fs.cluster_size() as u64;
        let want = buf.len().min((size - offset) as usize);
        let mut produced = 0;
        while produced < want {
            let abs = offset + produced as u64;
            let cluster_idx = (abs / cluster_size) as usize;
            let within = (abs % cluster_size) as usize;
            let Some(&cluster) = chain.get(cluster_idx) else { break };
            let mut cbuf = alloc::vec![0u8; cluster_size as usize];
            self.fs.read_cluster(cluster, &mut cbuf)?;
            let n = (want - produced).min(cluster_size as usize - within);
            buf[produced..produced + n].copy_from_slice(&cbuf[within..within + n]);
            produced += n;
        }
        Ok(produced)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if self.is_dir {
            return Err(KernelError::IsDirectory);
        }
        let cluster_size = self.fs.cluster_size() as u64;
        let mut first = *self.first_cluster.lock();
        if first == 0 {
            first = self.fs.alloc_cluster()?;
            *self.first_cluster.lock() = first;
        }
        let mut chain = self.fs.chain(first)?;

        let needed_clusters = ((offset + buf.len() as u64 + cluster_size - 1) / cluster_size) as usize;
        while chain.len() < needed_clusters {
            let new_cluster = self.fs.alloc_cluster()?;
            let last = *chain.last().unwrap();
            self.fs.write_fat_entry(last, new_cluster as u16)?;
            chain.push(new_cluster);
        }

        let mut written = 0;
        while written < buf.len() {
            let abs = offset + written as u64;
            let cluster_idx = (abs / cluster_size) as usize;
            let within = (abs % cluster_size) as usize;
            let cluster = chain[cluster_idx];
            let mut cbuf = alloc::vec![0u8; cluster_size as usize];
            self.fs.read_cluster(cluster, &mut cbuf)?;
            let n = (buf.len() - written).min(cluster_size as usize - within);
            cbuf[within..within + n].copy_from_slice(&buf[written..written + n]);
            self.fs.write_cluster(cluster, &cbuf)?;
            written += n;
        }

        let new_size = (*self.size.lock()).max((offset + buf.len() as u64) as u32);
        *self.size.lock() = new_size;
        self.sync_entry()?;
        Ok(written)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        *self.size.lock() = len as u32;
        self.sync_entry()
    }

    fn readdir(&self) -> Result<Vec<DirEntry>> {
        if !self.is_dir {
            return Err(KernelError::NotDirectory);
        }
        Ok(self
            .entries()?
            .into_iter()
            .map(|(_, e)| DirEntry {
                name: e.short_display_name(),
                kind: if e.is_directory() { NodeKind::Directory } else { NodeKind::File },
            })
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>> {
        if !self.is_dir {
            return Err(KernelError::NotDirectory);
        }
        let (index, entry) = self.find_entry(name).ok_or(KernelError::NotFound)?;
        self.node_from_entry(index, entry)
    }

    fn create(&self, name: &str, kind: NodeKind) -> Result<Arc<dyn VfsNode>> {
        if !self.is_dir {
            return Err(KernelError::NotDirectory);
        }
        if self.find_entry(name).is_some() {
            return Err(KernelError::Exists);
        }

        let (bytes, _) = self.directory_bytes()?;
        let free_index = bytes
            .chunks(fat::DIR_ENTRY_SIZE)
            .position(|c| c.len() == fat::DIR_ENTRY_SIZE && (c[0] == fat::END_OF_DIRECTORY || c[0] == fat::DELETED_MARKER))
            .ok_or(KernelError::OutOfMemory)?;

        let short = bpb::to_short_name(name, 0);
        let (fat_time, fat_date) = fat::rtc_now();
        let mut entry = RawDirEntry {
            name: short,
            attr: if kind == NodeKind::Directory { fat::ATTR_DIRECTORY } else { fat::ATTR_ARCHIVE },
            first_cluster_hi: 0,
            write_time: fat_time,
            write_date: fat_date,
            first_cluster_lo: 0,
            file_size: 0,
        };
        if kind == NodeKind::Directory {
            let cluster = self.fs.alloc_cluster()?;
            entry.set_first_cluster(cluster);
            let zeros = alloc::vec![0u8; self.fs.cluster_size() as usize];
            self.fs.write_cluster(cluster, &zeros)?;
        }

        self.write_entry_at(free_index, &entry)?;
        self.node_from_entry(free_index, entry)
    }

    /// §4.F "`delete_file` marks the short entry ... with first byte
    /// 0xE5 and frees the cluster chain".
    fn unlink(&self, name: &str) -> Result<()> {
        if !self.is_dir {
            return Err(KernelError::NotDirectory);
        }
        let (index, mut entry) = self.find_entry(name).ok_or(KernelError::NotFound)?;
        if entry.first_cluster() != 0 {
            self.fs.free_chain(entry.first_cluster())?;
        }
        entry.name[0] = fat::DELETED_MARKER;
        self.write_entry_at(index, &entry)
    }
}

impl Fat16Node {
    fn sync_entry(&self) -> Result<()> {
        let NodeLocation::Entry { byte_offset } = self.location else { return Ok(()) };
        let mut raw = [0u8; fat::DIR_ENTRY_SIZE];
        self.fs.device.read_at(byte_offset, &mut raw)?;
        let mut entry = RawDirEntry::parse(&raw);
        entry.set_first_cluster(*self.first_cluster.lock());
        entry.file_size = *self.size.lock();
        let (fat_time, fat_date) = fat::rtc_now();
        entry.write_time = fat_time;
        entry.write_date = fat_date;
        entry.write(&mut raw);
        self.fs.device.write_at(byte_offset, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    struct MemBlock {
        sectors: Mutex<BTreeMap<u64, [u8; 512]>>,
    }

    impl MemBlock {
        fn new() -> Self {
            MemBlock { sectors: Mutex::new(BTreeMap::new()) }
        }
    }

    impl BlockDevice for MemBlock {
        fn read_at(&self, byte_offset: u64, buf: &mut [u8]) -> Result<()> {
            let mut remaining = buf;
            let mut offset = byte_offset;
            while !remaining.is_empty() {
                let sector_no = offset / 512;
                let within = (offset % 512) as usize;
                let n = remaining.len().min(512 - within);
                let sectors = self.sectors.lock();
                if let Some(sector) = sectors.get(&sector_no) {
                    remaining[..n].copy_from_slice(&sector[within..within + n]);
                } else {
                    remaining[..n].fill(0);
                }
                remaining = &mut remaining[n..];
                offset += n as u64;
            }
            Ok(())
        }

        fn write_at(&self, byte_offset: u64, buf: &[u8]) -> Result<()> {
            let mut remaining = buf;
            let mut offset = byte_offset;
            while !remaining.is_empty() {
                let sector_no = offset / 512;
                let within = (offset % 512) as usize;
                let n = remaining.len().min(512 - within);
                let mut sectors = self.sectors.lock();
                let sector = sectors.entry(sector_no).or_insert([0u8; 512]);
                sector[within..within + n].copy_from_slice(&remaining[..n]);
                remaining = &remaining[n..];
                offset += n as u64;
            }
            Ok(())
        }
    }

    fn format_volume(total_clusters: u32) -> Arc<MemBlock> {
        let block = Arc::new(MemBlock::new());
        let sectors_per_cluster = 1u8;
        let num_fats = 2u8;
        let root_entries = 16u16;
        let fat_size_16 = 4u16;
        let reserved_sectors = 1u16;
        let root_dir_sectors = (root_entries as u32 * 32 + 511) / 512;
        let data_sectors = total_clusters * sectors_per_cluster as u32;
        let total_sectors = reserved_sectors as u32 + (num_fats as u32) * fat_size_16 as u32 + root_dir_sectors + data_sectors;

        let mut boot = [0u8; 512];
        boot[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        boot[0x0D] = sectors_per_cluster;
        boot[0x0E..0x10].copy_from_slice(&reserved_sectors.to_le_bytes());
        boot[0x10] = num_fats;
        boot[0x11..0x13].copy_from_slice(&root_entries.to_le_bytes());
        boot[0x13..0x15].copy_from_slice(&(total_sectors as u16).to_le_bytes());
        boot[0x16..0x18].copy_from_slice(&fat_size_16.to_le_bytes());
        block.write_at(0, &boot).unwrap();
        block
    }

    #[test_case]
    fn mounts_and_creates_a_file() {
        let block = format_volume(4085);
        let root = mount(block).unwrap();
        assert_eq!(root.kind(), NodeKind::Directory);
        let file = root.create("hello.txt", NodeKind::File).unwrap();
        assert_eq!(file.write(0, b"hi").unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(file.read(0, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
        let listed = root.readdir().unwrap();
        assert!(listed.iter().any(|e| e.name == "HELLO.TXT"));
    }

    #[test_case]
    fn unlink_marks_entry_deleted() {
        let block = format_volume(4085);
        let root = mount(block).unwrap();
        root.create("a.txt", NodeKind::File).unwrap();
        root.unlink("a.txt").unwrap();
        assert!(root.lookup("a.txt").is_err());
    }
}
