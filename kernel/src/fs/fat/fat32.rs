//! FAT32 mount and node implementation, grounded on `fat32.c`/`fat32_vfs.c`.
//! Unlike FAT16, the root directory is just another cluster chain and
//! directories may carry LFN entries ahead of their 8.3 short entry.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::fs::fat::bpb::{self, BlockDevice};
use crate::fs::fat::{self, RawDirEntry};
use crate::fs::vfs::{DirEntry, Metadata, NodeKind, VfsNode};

const CLUSTER_FREE: u32 = 0x0000_0000;
const CLUSTER_END_MIN: u32 = 0x0FFF_FFF8;
const CLUSTER_BAD: u32 = 0x0FFF_FFF7;
const CLUSTER_MASK: u32 = 0x0FFF_FFFF;

const FSINFO_LEAD: u32 = 0x4161_5252;
const FSINFO_STRUCT: u32 = 0x6141_7272;
const FSINFO_TRAIL: u32 = 0xAA55_0000;

struct FsInfo {
    sector: u32,
    free_count: u32,
    next_free: u32,
    valid: bool,
}

pub struct Fat32Fs {
    device: Arc<dyn BlockDevice>,
    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    fat_start: u64,
    fat_size_bytes: u64,
    num_fats: u32,
    root_cluster: u32,
    data_start: u64,
    fsinfo: Mutex<FsInfo>,
}

impl Fat32Fs {
    fn cluster_size(&self) -> u32 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_start + ((cluster - 2) as u64) * self.cluster_size() as u64
    }

    fn fat_entry_offset(&self, cluster: u32, fat_index: u32) -> u64 {
        self.fat_start + (fat_index as u64) * self.fat_size_bytes + (cluster as u64) * 4
    }

    fn read_fat_entry(&self, cluster: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.device.read_at(self.fat_entry_offset(cluster, 0), &mut buf)?;
        Ok(u32::from_le_bytes(buf) & CLUSTER_MASK)
    }

    /// Only the low 28 bits are ever written; the top 4 reserved bits of
    /// whatever was already there are preserved, per spec's bit-exact
    /// contract, and both FAT copies stay identical.
    fn write_fat_entry(&self, cluster: u32, value: u32) -> Result<()> {
        for fat in 0..self.num_fats {
            let offset = self.fat_entry_offset(cluster, fat);
            let mut buf = [0u8; 4];
            self.device.read_at(offset, &mut buf)?;
            let preserved = u32::from_le_bytes(buf) & !CLUSTER_MASK;
            let merged = preserved | (value & CLUSTER_MASK);
            self.device.write_at(offset, &merged.to_le_bytes())?;
        }
        Ok(())
    }

    fn is_end(entry: u32) -> bool {
        entry >= CLUSTER_END_MIN
    }

    fn chain(&self, first_cluster: u32) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        let mut cluster = first_cluster;
        while cluster >= 2 && !Fat32Fs::is_end(cluster) && cluster != CLUSTER_BAD {
            clusters.push(cluster);
            cluster = self.read_fat_entry(cluster)?;
        }
        Ok(clusters)
    }

    /// Uses FSInfo's `next_free` hint as a starting point, per spec
    /// ("Allocation uses FSInfo's `next_free` hint (FAT32) and decrements
    /// `free_count` on alloc / increments on free").
    fn alloc_cluster(&self) -> Result<u32> {
        let start = {
            let info = self.fsinfo.lock();
            if info.valid && info.next_free >= 2 { info.next_free } else { 2 }
        };

        let mut cluster = start;
        loop {
            if self.read_fat_entry(cluster)? == CLUSTER_FREE {
                self.write_fat_entry(cluster, CLUSTER_END_MIN)?;
                let mut info = self.fsinfo.lock();
                if info.free_count != 0xFFFF_FFFF && info.free_count > 0 {
                    info.free_count -= 1;
                }
                info.next_free = cluster + 1;
                self.flush_fsinfo(&info)?;
                return Ok(cluster);
            }
            cluster += 1;
            if cluster == start {
                return Err(KernelError::OutOfMemory);
            }
            if self.read_fat_entry(cluster).is_err() {
                cluster = 2;
            }
        }
    }

    fn free_chain(&self, first_cluster: u32) -> Result<()> {
        let mut freed = 0u32;
        for cluster in self.chain(first_cluster)? {
            self.write_fat_entry(cluster, CLUSTER_FREE)?;
            freed += 1;
        }
        let mut info = self.fsinfo.lock();
        if info.free_count != 0xFFFF_FFFF {
            info.free_count += freed;
        }
        self.flush_fsinfo(&info)
    }

    fn flush_fsinfo(&self, info: &FsInfo) -> Result<()> {
        if !info.valid {
            return Ok(());
        }
        let offset = (info.sector as u64) * self.bytes_per_sector as u64;
        self.device.write_at(offset + 488, &info.free_count.to_le_bytes())?;
        self.device.write_at(offset + 492, &info.next_free.to_le_bytes())?;
        Ok(())
    }

    fn read_cluster(&self, cluster: u32, buf: &mut [u8]) -> Result<()> {
        self.device.read_at(self.cluster_offset(cluster), buf)
    }

    fn write_cluster(&self, cluster: u32, buf: &[u8]) -> Result<()> {
        self.device.write_at(self.cluster_offset(cluster), buf)
    }
}

/// Mounts a FAT32 volume, rejecting the FAT16-only BPB fields per spec
/// ("FAT32 mount rejects `root_entry_count != 0` or `fat_size_16 != 0`").
pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Arc<dyn VfsNode>> {
    let mut sector = [0u8; bpb::SECTOR_SIZE as usize];
    device.read_at(0, &mut sector)?;
    let common = bpb::parse(&sector)?;

    if common.root_entry_count != 0 || common.fat_size_16 != 0 {
        return Err(KernelError::InvalidArgument);
    }

    let fat_size_32 = bpb::u32_field(&sector, 0x24);
    let root_cluster = bpb::u32_field(&sector, 0x2C);
    let fsinfo_sector = bpb::u16_field(&sector, 0x30) as u32;

    let bytes_per_sector = common.bytes_per_sector as u32;
    let fat_start = (common.reserved_sectors as u64) * bytes_per_sector as u64;
    let fat_size_bytes = (fat_size_32 as u64) * bytes_per_sector as u64;
    let data_start = fat_start + (common.num_fats as u64) * fat_size_bytes;

    let mut fsinfo_sector_buf = [0u8; bpb::SECTOR_SIZE as usize];
    device.read_at((fsinfo_sector as u64) * bytes_per_sector as u64, &mut fsinfo_sector_buf)?;
    let lead = bpb::u32_field(&fsinfo_sector_buf, 0);
    let struct_sig = bpb::u32_field(&fsinfo_sector_buf, 484);
    let trail = bpb::u32_field(&fsinfo_sector_buf, 508);
    let valid = lead == FSINFO_LEAD && struct_sig == FSINFO_STRUCT && trail == FSINFO_TRAIL;
    let fsinfo = FsInfo {
        sector: fsinfo_sector,
        free_count: if valid { bpb::u32_field(&fsinfo_sector_buf, 488) } else { 0xFFFF_FFFF },
        next_free: if valid { bpb::u32_field(&fsinfo_sector_buf, 492) } else { 0xFFFF_FFFF },
        valid,
    };

    let fs = Arc::new(Fat32Fs {
        device,
        bytes_per_sector,
        sectors_per_cluster: common.sectors_per_cluster as u32,
        fat_start,
        fat_size_bytes,
        num_fats: common.num_fats as u32,
        root_cluster,
        data_start,
        fsinfo: Mutex::new(fsinfo),
    });

    Ok(Arc::new(Fat32Node {
        fs,
        entry_location: None,
        first_cluster: Mutex::new(root_cluster),
        is_dir: true,
        size: Mutex::new(0),
    }))
}

struct Fat32Node {
    fs: Arc<Fat32Fs>,
    /// Absolute byte offset of this node's own short directory entry;
    /// `None` for the volume root, which has no entry of its own.
    entry_location: Option<Mutex<u64>>,
    first_cluster: Mutex<u32>,
    is_dir: bool,
    size: Mutex<u32>,
}

/// One directory slot after LFN reassembly: a long name (if any LFN
/// entries preceded the short entry) plus the short entry itself and the
/// byte offset of that short entry.
struct Slot {
    name: String,
    entry: RawDirEntry,
    short_entry_offset: u64,
    /// Offsets of every entry (LFN run + short entry) spanned by this
    /// slot, oldest-first, for delete's "mark all preceding LFN entries".
    span_offsets: Vec<u64>,
}

fn utf16_char(unit: u16) -> Option<char> {
    if unit == 0xFFFF || unit == 0x0000 {
        None
    } else {
        char::from_u32(unit as u32)
    }
}

impl Fat32Node {
    fn chain_bytes(&self) -> Result<Vec<u8>> {
        let first = *self.first_cluster.lock();
        let chain = self.fs.chain(first)?;
        let mut buf = Vec::with_capacity(chain.len() * self.fs.cluster_size() as usize);
        for cluster in &chain {
            let mut cbuf = alloc::vec![0u8; self.fs.cluster_size() as usize];
            self.fs.read_cluster(*cluster, &mut cbuf)?;
            buf.extend_from_slice(&cbuf);
        }
        Ok(buf)
    }

    fn base_offset(&self) -> Result<u64> {
        let first = *self.first_cluster.lock();
        Ok(self.fs.cluster_offset(*self.fs.chain(first)?.first().ok_or(KernelError::IoError)?))
    }

    /// Walks raw 32-byte slots, reassembling any LFN run that precedes a
    /// short entry into a single [`Slot`]. Mirrors `fat32_extract_lfn`'s
    /// reverse-order accumulation.
    fn slots(&self) -> Result<Vec<Slot>> {
        let bytes = self.chain_bytes()?;
        let first = *self.first_cluster.lock();
        let chain = self.fs.chain(first)?;
        let cluster_size = self.fs.cluster_size() as u64;

        let offset_of = |index: usize| -> u64 {
            let byte_offset = index as u64 * fat::DIR_ENTRY_SIZE as u64;
            let cluster_idx = (byte_offset / cluster_size) as usize;
            let within = byte_offset % cluster_size;
            self.fs.cluster_offset(chain[cluster_idx]) + within
        };

        let mut out = Vec::new();
        let mut lfn_parts: Vec<(u8, String)> = Vec::new();
        let mut span: Vec<u64> = Vec::new();

        for (i, chunk) in bytes.chunks(fat::DIR_ENTRY_SIZE).enumerate() {
            if chunk.len() < fat::DIR_ENTRY_SIZE || chunk[0] == fat::END_OF_DIRECTORY {
                break;
            }
            if chunk[0] == fat::DELETED_MARKER {
                lfn_parts.clear();
                span.clear();
                continue;
            }
            if chunk[11] == fat::ATTR_LONG_NAME {
                let order = chunk[0] & 0x1F;
                let mut part = String::new();
                for word in [&chunk[1..11], &chunk[14..26], &chunk[28..32]] {
                    for pair in word.chunks(2) {
                        if let Some(c) = utf16_char(u16::from_le_bytes([pair[0], pair[1]])) {
                            part.push(c);
                        }
                    }
                }
                lfn_parts.push((order, part));
                span.push(offset_of(i));
                continue;
            }

            let entry = RawDirEntry::parse(chunk);
            if entry.is_volume_label() {
                lfn_parts.clear();
                span.clear();
                continue;
            }

            let short_offset = offset_of(i);
            span.push(short_offset);

            let long_name = if lfn_parts.is_empty() {
                entry.short_display_name()
            } else {
                lfn_parts.sort_by_key(|(order, _)| *order);
                lfn_parts.iter().map(|(_, s)| s.as_str()).collect()
            };

            out.push(Slot { name: long_name, entry, short_entry_offset: short_offset, span_offsets: core::mem::take(&mut span) });
            lfn_parts.clear();
        }

        Ok(out)
    }

    fn find_slot(&self, name: &str) -> Option<Slot> {
        self.slots().ok()?.into_iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn write_raw(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.fs.device.write_at(offset, bytes)
    }

    fn node_from_slot(&self, slot: &Slot) -> Fat32Node {
        Fat32Node {
            fs: self.fs.clone(),
            entry_location: Some(Mutex::new(slot.short_entry_offset)),
            first_cluster: Mutex::new(slot.entry.first_cluster()),
            is_dir: slot.entry.is_directory(),
            size: Mutex::new(slot.entry.file_size),
        }
    }

    fn sync_entry(&self) -> Result<()> {
        let Some(loc) = &self.entry_location else { return Ok(()) };
        let offset = *loc.lock();
        let mut raw = [0u8; fat::DIR_ENTRY_SIZE];
        self.fs.device.read_at(offset, &mut raw)?;
        let mut entry = RawDirEntry::parse(&raw);
        entry.set_first_cluster(*self.first_cluster.lock());
        entry.file_size = *self.size.lock();
        let (fat_time, fat_date) = fat::rtc_now();
        entry.write_time = fat_time;
        entry.write_date = fat_date;
        entry.write(&mut raw);
        self.fs.device.write_at(offset, &raw)
    }
}

impl VfsNode for Fat32Node {
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
            self.fs.write_fat_entry(last, new_cluster)?;
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
            .slots()?
            .into_iter()
            .map(|s| DirEntry { name: s.name, kind: if s.entry.is_directory() { NodeKind::Directory } else { NodeKind::File } })
            .collect())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>> {
        if !self.is_dir {
            return Err(KernelError::NotDirectory);
        }
        let slot = self.find_slot(name).ok_or(KernelError::NotFound)?;
        Ok(Arc::new(self.node_from_slot(&slot)))
    }

    fn create(&self, name: &str, kind: NodeKind) -> Result<Arc<dyn VfsNode>> {
        if !self.is_dir {
            return Err(KernelError::NotDirectory);
        }
        if self.find_slot(name).is_some() {
            return Err(KernelError::Exists);
        }

        let short = bpb::to_short_name(name, 0);
        let checksum = bpb::lfn_checksum(&short);
        let needs_lfn = name.len() > 12 || name.to_uppercase() != name;
        let lfn_chunks = if needs_lfn { build_lfn_entries(name, checksum) } else { Vec::new() };

        let bytes = self.chain_bytes()?;
        let total_slots = lfn_chunks.len() + 1;
        let mut free_run_start = None;
        let mut run_len = 0;
        for (i, chunk) in bytes.chunks(fat::DIR_ENTRY_SIZE).enumerate() {
            let free = chunk.len() < fat::DIR_ENTRY_SIZE
                || chunk[0] == fat::END_OF_DIRECTORY
                || chunk[0] == fat::DELETED_MARKER;
            if free {
                if run_len == 0 {
                    free_run_start = Some(i);
                }
                run_len += 1;
                if run_len >= total_slots {
                    break;
                }
            } else {
                run_len = 0;
                free_run_start = None;
            }
        }
        let start_index = free_run_start.ok_or(KernelError::OutOfMemory)?;

        let first = *self.first_cluster.lock();
        let chain = self.fs.chain(first)?;
        let cluster_size = self.fs.cluster_size() as u64;
        let offset_of = |index: usize| -> u64 {
            let byte_offset = index as u64 * fat::DIR_ENTRY_SIZE as u64;
            let cluster_idx = (byte_offset / cluster_size) as usize;
            let within = byte_offset % cluster_size;
            self.fs.cluster_offset(chain[cluster_idx]) + within
        };

        for (i, chunk) in lfn_chunks.iter().enumerate() {
            self.write_raw(offset_of(start_index + i), chunk)?;
        }

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

        let short_offset = offset_of(start_index + lfn_chunks.len());
        let mut raw = [0u8; fat::DIR_ENTRY_SIZE];
        entry.write(&mut raw);
        self.write_raw(short_offset, &raw)?;

        Ok(Arc::new(Fat32Node {
            fs: self.fs.clone(),
            entry_location: Some(Mutex::new(short_offset)),
            first_cluster: Mutex::new(entry.first_cluster()),
            is_dir: kind == NodeKind::Directory,
            size: Mutex::new(0),
        }))
    }

    /// §4.F "`delete_file` marks the short entry and all preceding LFN
    /// entries with first byte 0xE5 and frees the cluster chain."
    fn unlink(&self, name: &str) -> Result<()> {
        if !self.is_dir {
            return Err(KernelError::NotDirectory);
        }
        let slot = self.find_slot(name).ok_or(KernelError::NotFound)?;
        if slot.entry.first_cluster() != 0 {
            self.fs.free_chain(slot.entry.first_cluster())?;
        }
        for offset in slot.span_offsets {
            self.write_raw(offset, &[fat::DELETED_MARKER])?;
        }
        Ok(())
    }
}

/// Builds the LFN entry chain for `name`, reverse order (highest sequence
/// number first, bit `0x40` set on the first stored entry), matching
/// `fat32_lfn_entry_t`'s 13-UTF16-char-per-entry layout.
fn build_lfn_entries(name: &str, checksum: u8) -> Vec<[u8; fat::DIR_ENTRY_SIZE]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let chunk_count = (units.len() + 12) / 13;
    let mut out = Vec::with_capacity(chunk_count);

    for chunk_idx in 0..chunk_count {
        let mut raw = [0xFFu8; fat::DIR_ENTRY_SIZE];
        let order = (chunk_idx + 1) as u8 | if chunk_idx == chunk_count - 1 { 0x40 } else { 0 };
        raw[0] = order;
        raw[11] = fat::ATTR_LONG_NAME;
        raw[12] = 0;
        raw[13] = checksum;
        raw[26] = 0;
        raw[27] = 0;

        let start = chunk_idx * 13;
        let mut put = |field: &mut [u8], slot: usize| {
            let idx = start + slot;
            let unit = units.get(idx).copied().unwrap_or(if idx == units.len() { 0x0000 } else { 0xFFFF });
            field.copy_from_slice(&unit.to_le_bytes());
        };
        for slot in 0..5 {
            let mut buf = [0u8; 2];
            put(&mut buf, slot);
            raw[1 + slot * 2..3 + slot * 2].copy_from_slice(&buf);
        }
        for slot in 5..11 {
            let mut buf = [0u8; 2];
            put(&mut buf, slot);
            raw[14 + (slot - 5) * 2..16 + (slot - 5) * 2].copy_from_slice(&buf);
        }
        for slot in 11..13 {
            let mut buf = [0u8; 2];
            put(&mut buf, slot);
            raw[28 + (slot - 11) * 2..30 + (slot - 11) * 2].copy_from_slice(&buf);
        }
        out.push(raw);
    }

    out.reverse();
    out
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
        let fat_size_32 = 16u32;
        let reserved_sectors = 32u16;
        let root_cluster = 2u32;
        let data_sectors = total_clusters * sectors_per_cluster as u32;
        let total_sectors = reserved_sectors as u32 + num_fats as u32 * fat_size_32 + data_sectors;

        let mut boot = [0u8; 512];
        boot[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        boot[0x0D] = sectors_per_cluster;
        boot[0x0E..0x10].copy_from_slice(&reserved_sectors.to_le_bytes());
        boot[0x10] = num_fats;
        boot[0x11..0x13].copy_from_slice(&0u16.to_le_bytes());
        boot[0x13..0x15].copy_from_slice(&0u16.to_le_bytes());
        boot[0x16..0x18].copy_from_slice(&0u16.to_le_bytes());
        boot[0x20..0x24].copy_from_slice(&total_sectors.to_le_bytes());
        boot[0x24..0x28].copy_from_slice(&fat_size_32.to_le_bytes());
        boot[0x2C..0x30].copy_from_slice(&root_cluster.to_le_bytes());
        boot[0x30..0x32].copy_from_slice(&1u16.to_le_bytes());
        block.write_at(0, &boot).unwrap();

        let mut fsinfo = [0u8; 512];
        fsinfo[0..4].copy_from_slice(&FSINFO_LEAD.to_le_bytes());
        fsinfo[484..488].copy_from_slice(&FSINFO_STRUCT.to_le_bytes());
        fsinfo[488..492].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        fsinfo[492..496].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        fsinfo[508..512].copy_from_slice(&FSINFO_TRAIL.to_le_bytes());
        block.write_at(512, &fsinfo).unwrap();

        // Mark the root directory's own cluster as end-of-chain.
        let fat_start = (reserved_sectors as u64) * 512;
        block.write_at(fat_start + 2 * 4, &CLUSTER_END_MIN.to_le_bytes()).unwrap();

        block
    }

    #[test_case]
    fn mounts_and_creates_a_file() {
        let block = format_volume(200);
        let root = mount(block).unwrap();
        assert_eq!(root.kind(), NodeKind::Directory);
        let file = root.create("hello.txt", NodeKind::File).unwrap();
        assert_eq!(file.write(0, b"hi").unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(file.read(0, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test_case]
    fn long_name_round_trips_through_lfn() {
        let block = format_volume(200);
        let root = mount(block).unwrap();
        root.create("a rather long filename.txt", NodeKind::File).unwrap();
        let listed = root.readdir().unwrap();
        assert!(listed.iter().any(|e| e.name == "a rather long filename.txt"));
    }

    #[test_case]
    fn unlink_frees_chain_and_marks_deleted() {
        let block = format_volume(200);
        let root = mount(block).unwrap();
        let file = root.create("a.txt", NodeKind::File).unwrap();
        file.write(0, b"data").unwrap();
        root.unlink("a.txt").unwrap();
        assert!(root.lookup("a.txt").is_err());
    }
}
