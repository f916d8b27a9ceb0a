//! newc cpio archive parsing, spec §6.4: "cpio newc archive format is the
//! sole on-disk initramfs format; trailer record name is `TRAILER!!!`."
//! Packed binary format, so this reads the ASCII hex header fields
//! directly rather than pointer-casting into a `#[repr(C)]` struct — the
//! same discipline the teacher's `Ramdisk::from_tar` uses for tar headers,
//! required here per spec §7's "never by pointer-casting" rule since the
//! header is ASCII-hex, not raw binary, and isn't struct-shaped at all.

use alloc::string::String;
use alloc::vec::Vec;

const MAGIC: &[u8; 6] = b"070701";
const HEADER_LEN: usize = 110;
const TRAILER_NAME: &str = "TRAILER!!!";

pub struct CpioEntry<'a> {
    pub name: String,
    pub mode: u32,
    pub size: u32,
    pub data: &'a [u8],
}

fn hex8(field: &[u8]) -> Option<u32> {
    core::str::from_utf8(field).ok().and_then(|s| u32::from_str_radix(s, 16).ok())
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Iterates every file entry in a newc cpio archive, stopping at (and not
/// yielding) the `TRAILER!!!` record.
pub fn entries(archive: &[u8]) -> impl Iterator<Item = CpioEntry<'_>> {
    CpioIter { archive, offset: 0 }
}

struct CpioIter<'a> {
    archive: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for CpioIter<'a> {
    type Item = CpioEntry<'a>;

    fn next(&mut self) -> Option<CpioEntry<'a>> {
        loop {
            if self.offset + HEADER_LEN > self.archive.len() {
                return None;
            }
            let header = &self.archive[self.offset..self.offset + HEADER_LEN];
            if &header[0..6] != MAGIC {
                return None;
            }

            let mode = hex8(&header[14..22])?;
            let namesize = hex8(&header[94..102])? as usize;
            let filesize = hex8(&header[54..62])?;

            let name_start = self.offset + HEADER_LEN;
            let name_end = name_start + namesize;
            if name_end > self.archive.len() {
                return None;
            }
            let name = core::str::from_utf8(&self.archive[name_start..name_end - 1]).ok()?;
            let name = String::from(name);

            let data_start = align4(name_end);
            let data_end = data_start + filesize as usize;
            if data_end > self.archive.len() {
                return None;
            }
            let data = &self.archive[data_start..data_end];

            self.offset = align4(data_end);

            if name == TRAILER_NAME {
                return None;
            }

            return Some(CpioEntry { name, mode, size: filesize, data });
        }
    }
}
