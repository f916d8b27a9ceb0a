//! BIOS Parameter Block parsing shared by FAT16 and FAT32, grounded on
//! `fat16.h`'s `fat16_boot_sector_t` and `fat32.h`'s `fat32_bpb_t`. Both
//! variants share the first 36 bytes; only fields past that point differ,
//! so this reads the common prefix once and each variant's mount routine
//! reads its own fields out of the raw sector past offset 0x24.

use crate::error::{KernelError, Result};

pub const SECTOR_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy)]
pub struct Bpb {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors_16: u16,
    pub fat_size_16: u16,
    pub total_sectors_32: u32,
}

fn u16_at(sector: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([sector[off], sector[off + 1]])
}

fn u32_at(sector: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([sector[off], sector[off + 1], sector[off + 2], sector[off + 3]])
}

/// Parses the common BPB prefix (offsets 0x0B..0x24) out of a raw, already
/// read 512-byte boot sector. Rejects anything but 512-byte sectors, per
/// spec's "Sector size must be 512".
pub fn parse(sector: &[u8]) -> Result<Bpb> {
    if sector.len() < 36 {
        return Err(KernelError::IoError);
    }
    let bytes_per_sector = u16_at(sector, 0x0B);
    if bytes_per_sector != SECTOR_SIZE as u16 {
        return Err(KernelError::InvalidArgument);
    }
    Ok(Bpb {
        bytes_per_sector,
        sectors_per_cluster: sector[0x0D],
        reserved_sectors: u16_at(sector, 0x0E),
        num_fats: sector[0x10],
        root_entry_count: u16_at(sector, 0x11),
        total_sectors_16: u16_at(sector, 0x13),
        fat_size_16: u16_at(sector, 0x16),
        total_sectors_32: u32_at(sector, 0x20),
    })
}

pub fn total_sectors(bpb: &Bpb) -> u32 {
    if bpb.total_sectors_16 != 0 {
        bpb.total_sectors_16 as u32
    } else {
        bpb.total_sectors_32
    }
}

pub fn u16_field(sector: &[u8], off: usize) -> u16 {
    u16_at(sector, off)
}

pub fn u32_field(sector: &[u8], off: usize) -> u32 {
    u32_at(sector, off)
}

/// Block-device seam both FAT variants read/write sectors through.
/// Implemented by a wrapper around a registered `device::Device` of
/// subtype `Ata` (out of scope driver, §1) so the FAT code itself never
/// depends on a concrete storage driver.
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, byte_offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, byte_offset: u64, buf: &[u8]) -> Result<()>;
}

pub struct DeviceBackedBlockDevice {
    device: alloc::sync::Arc<dyn crate::device::Device>,
}

impl DeviceBackedBlockDevice {
    pub fn new(device: alloc::sync::Arc<dyn crate::device::Device>) -> Self {
        DeviceBackedBlockDevice { device }
    }
}

impl BlockDevice for DeviceBackedBlockDevice {
    fn read_at(&self, byte_offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.device.read(byte_offset, buf)?;
        if n != buf.len() {
            return Err(KernelError::IoError);
        }
        Ok(())
    }

    fn write_at(&self, byte_offset: u64, buf: &[u8]) -> Result<()> {
        let n = self.device.write(byte_offset, buf)?;
        if n != buf.len() {
            return Err(KernelError::IoError);
        }
        Ok(())
    }
}

/// 8.3 short-name generation: uppercases ASCII, drops anything not
/// alphanumeric or in a small punctuation allowlist, and pads with spaces
/// to an 11-byte `name[8]+ext[3]` field. Names that don't fit get a
/// `~1`-style numeric tail, keyed by `ordinal`.
pub fn to_short_name(name: &str, ordinal: u32) -> [u8; 11] {
    let mut out = [b' '; 11];
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) if !b.is_empty() => (b, e),
        _ => (name, ""),
    };

    let valid = |c: char| c.is_ascii_alphanumeric() || "!#$%&'()-@^_`{}~".contains(c);
    let clean: alloc::string::String =
        base.chars().filter(|&c| valid(c)).map(|c| c.to_ascii_uppercase()).collect();
    let clean_ext: alloc::string::String =
        ext.chars().filter(|&c| valid(c)).map(|c| c.to_ascii_uppercase()).collect();

    let needs_tail = clean.len() > 8 || base.chars().any(|c| !valid(c)) || ordinal > 0;
    let name_bytes = clean.as_bytes();
    if needs_tail {
        let tail = alloc::format!("~{}", ordinal.max(1));
        let keep = 8 - tail.len().min(8);
        let keep = keep.min(name_bytes.len());
        out[..keep].copy_from_slice(&name_bytes[..keep]);
        out[keep..keep + tail.len().min(8 - keep)].copy_from_slice(tail.as_bytes());
    } else {
        let keep = name_bytes.len().min(8);
        out[..keep].copy_from_slice(&name_bytes[..keep]);
    }

    let ext_bytes = clean_ext.as_bytes();
    let keep_ext = ext_bytes.len().min(3);
    out[8..8 + keep_ext].copy_from_slice(&ext_bytes[..keep_ext]);

    out
}

/// Checksum of an 11-byte short name, used to tie LFN entries to their
/// short-entry sibling (`fat32_lfn_checksum` in the original).
pub fn lfn_checksum(short_name: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in short_name {
        sum = (sum >> 1).wrapping_add(sum << 7).wrapping_add(b);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn short_name_uppercases_and_pads() {
        let short = to_short_name("readme.txt", 0);
        assert_eq!(&short[..6], b"README");
        assert_eq!(&short[8..11], b"TXT");
    }

    #[test_case]
    fn checksum_is_stable() {
        let short = to_short_name("FILE", 0);
        assert_eq!(lfn_checksum(&short), lfn_checksum(&short));
    }
}
