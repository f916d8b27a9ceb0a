//! `/proc` — read-only status files plus the handful of write-to-act
//! files spec §4.F/§6.5 name explicitly. Each entry is synthesized on
//! read/write rather than materialized once, since the data (process
//! table, meminfo, uptime) changes under it constantly.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::pit;
use crate::device::{self, DeviceSubtype};
use crate::error::{KernelError, Result};
use crate::fs::vfs::{DirEntry, Metadata, NodeKind, VfsNode};
use crate::mm::{heap, pmm};
use crate::proc::process::{self, Pid};

const STATIC_FILES: &[&str] =
    &["mounts", "meminfo", "devices", "cmdline", "uptime", "tty", "rescan", "vga"];

fn file_metadata(size: usize) -> Metadata {
    Metadata { size: size as u64, mode: 0o100444, ..Metadata::default() }
}

fn read_from_string(content: String, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let bytes = content.as_bytes();
    let offset = offset as usize;
    if offset >= bytes.len() {
        return Ok(0);
    }
    let n = buf.len().min(bytes.len() - offset);
    buf[..n].copy_from_slice(&bytes[offset..offset + n]);
    Ok(n)
}

fn mounts_content() -> String {
    let mut s = String::new();
    for (point, fs_name) in crate::fs::mount::list() {
        s.push_str(&format!("{} {} {} rw 0 0\n", fs_name, point, fs_name));
    }
    s
}

fn meminfo_content() -> String {
    let stats = heap::stats();
    format!(
        "MemTotal:\t{} kB\nMemFree:\t{} kB\nKernelHeap:\t{} kB\nKernelHeapUsed:\t{} kB\n",
        (pmm::total_frames() as u64) * 4,
        (pmm::free_frames() as u64) * 4,
        stats.total_size / 1024,
        stats.used_size / 1024,
    )
}

fn devices_content() -> String {
    let mut s = String::new();
    for (name, ty) in device::list() {
        s.push_str(&format!("{:?} {}\n", ty, name));
    }
    s
}

fn uptime_content() -> String {
    let ms = pit::uptime_ms();
    format!("{}.{:02}\n", ms / 1000, (ms % 1000) / 10)
}

fn current_tty_name() -> String {
    process::current_pid()
        .and_then(|pid| process::with_process_mut(pid, |p| p.tty.clone()))
        .unwrap_or_else(|| String::from("tty0"))
}

/// Static, always-present entries: mounts/meminfo/devices/cmdline/uptime
/// (read-only) and tty/rescan/vga (read-write or write-triggered).
struct StaticFile {
    name: &'static str,
}

impl VfsNode for StaticFile {
    fn kind(&self) -> NodeKind {
        NodeKind::File
    }

    fn metadata(&self) -> Metadata {
        file_metadata(0)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let content = match self.name {
            "mounts" => mounts_content(),
            "meminfo" => meminfo_content(),
            "devices" => devices_content(),
            "cmdline" => crate::config::boot_cmdline(),
            "uptime" => uptime_content(),
            "tty" => format!("{}\n", current_tty_name()),
            _ => return Err(KernelError::PermissionDenied),
        };
        read_from_string(content, offset, buf)
    }

    /// §6.5: `/proc/tty` switches the current process's controlling tty;
    /// `/proc/rescan`'s content is ignored, the write itself triggers a
    /// rescan; `/proc/vga` accepts exactly one of a fixed string set.
    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize> {
        match self.name {
            "tty" => {
                let name = core::str::from_utf8(buf).map_err(|_| KernelError::InvalidArgument)?.trim();
                let dev = device::get(name).ok_or(KernelError::NotFound)?;
                if dev.subtype() != DeviceSubtype::Tty {
                    return Err(KernelError::InvalidArgument);
                }
                if let Some(pid) = process::current_pid() {
                    process::with_process_mut(pid, |p| p.tty = name.to_string());
                }
                Ok(buf.len())
            }
            "rescan" => {
                if let Some(ata) = device::get("ata0") {
                    let _ = ata.ioctl(RESCAN_IOCTL, 0);
                } else {
                    crate::klog::warn!("procfs: /proc/rescan with no ATA device registered");
                }
                Ok(buf.len())
            }
            "vga" => {
                let mode = core::str::from_utf8(buf).map_err(|_| KernelError::InvalidArgument)?.trim();
                let code = match mode {
                    "13h" => 0x13,
                    "12h" => 0x12,
                    "text" | "03h" => 0x03,
                    _ => return Err(KernelError::InvalidArgument),
                };
                if let Some(vga) = device::get("vga0") {
                    let _ = vga.ioctl(VGA_SET_MODE_IOCTL, code);
                }
                Ok(buf.len())
            }
            _ => Err(KernelError::PermissionDenied),
        }
    }
}

const RESCAN_IOCTL: u32 = 0x5200;
const VGA_SET_MODE_IOCTL: u32 = 0x5300;

struct StatusFile {
    pid: Pid,
}

impl VfsNode for StatusFile {
    fn kind(&self) -> NodeKind {
        NodeKind::File
    }

    fn metadata(&self) -> Metadata {
        file_metadata(0)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let content = process::with_process_mut(self.pid, |p| {
            format!("Name:\t{}\nPid:\t{}\nState:\t{}\n", p.name, p.pid, p.state.as_str())
        })
        .ok_or(KernelError::NotFound)?;
        read_from_string(content, offset, buf)
    }
}

struct CmdlineFile {
    pid: Pid,
}

impl VfsNode for CmdlineFile {
    fn kind(&self) -> NodeKind {
        NodeKind::File
    }

    fn metadata(&self) -> Metadata {
        file_metadata(0)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let content = process::with_process_mut(self.pid, |p| format!("{}\n", p.cmdline))
            .ok_or(KernelError::NotFound)?;
        read_from_string(content, offset, buf)
    }
}

struct PidDir {
    pid: Pid,
}

impl VfsNode for PidDir {
    fn kind(&self) -> NodeKind {
        NodeKind::Directory
    }

    fn metadata(&self) -> Metadata {
        Metadata { size: 0, mode: 0o040555, ..Metadata::default() }
    }

    fn readdir(&self) -> Result<Vec<DirEntry>> {
        Ok(alloc::vec![
            DirEntry { name: "status".to_string(), kind: NodeKind::File },
            DirEntry { name: "cmdline".to_string(), kind: NodeKind::File },
        ])
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>> {
        match name {
            "status" => Ok(Arc::new(StatusFile { pid: self.pid })),
            "cmdline" => Ok(Arc::new(CmdlineFile { pid: self.pid })),
            _ => Err(KernelError::NotFound),
        }
    }
}

struct SelfLink;

impl VfsNode for SelfLink {
    fn kind(&self) -> NodeKind {
        NodeKind::Symlink
    }

    fn metadata(&self) -> Metadata {
        Metadata { size: 2, mode: 0o120777, ..Metadata::default() }
    }

    fn readlink(&self) -> Result<String> {
        let pid = process::current_pid().ok_or(KernelError::NotFound)?;
        Ok(format!("/proc/{}", pid))
    }
}

struct ProcRoot;

impl VfsNode for ProcRoot {
    fn kind(&self) -> NodeKind {
        NodeKind::Directory
    }

    fn metadata(&self) -> Metadata {
        Metadata { size: 0, mode: 0o040555, ..Metadata::default() }
    }

    fn readdir(&self) -> Result<Vec<DirEntry>> {
        let mut entries: Vec<DirEntry> =
            STATIC_FILES.iter().map(|&name| DirEntry { name: name.to_string(), kind: NodeKind::File }).collect();
        entries.push(DirEntry { name: "self".to_string(), kind: NodeKind::Symlink });
        for pid in process::all_pids() {
            entries.push(DirEntry { name: pid.to_string(), kind: NodeKind::Directory });
        }
        Ok(entries)
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>> {
        if let Some(&static_name) = STATIC_FILES.iter().find(|&&n| n == name) {
            return Ok(Arc::new(StaticFile { name: static_name }));
        }
        if name == "self" {
            return Ok(Arc::new(SelfLink));
        }
        if let Ok(pid) = name.parse::<Pid>() {
            if process::get(pid).is_some() {
                return Ok(Arc::new(PidDir { pid }));
            }
        }
        Err(KernelError::NotFound)
    }
}

pub fn root() -> Arc<dyn VfsNode> {
    Arc::new(ProcRoot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn vga_rejects_unknown_mode() {
        let file = StaticFile { name: "vga" };
        assert!(file.write(0, b"640x480").is_err());
    }

    #[test_case]
    fn vga_accepts_known_modes() {
        let file = StaticFile { name: "vga" };
        assert!(file.write(0, b"13h").is_ok());
        assert!(file.write(0, b"12h").is_ok());
        assert!(file.write(0, b"text").is_ok());
        assert!(file.write(0, b"03h").is_ok());
        assert!(file.write(0, b"bogus").is_err());
    }
}
