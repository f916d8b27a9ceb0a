//! VFS + FS drivers, component F. `vfs` is the node trait and metadata
//! types every filesystem implements against; `mount`/`path` are the
//! mount table and resolver that sit above any one filesystem; the rest
//! are the in-tree filesystems themselves.

pub mod cpio;
pub mod devfs;
pub mod fat;
pub mod initramfs;
pub mod mount;
pub mod path;
pub mod procfs;
pub mod tmpfs;
pub mod vfs;

use alloc::sync::Arc;

use crate::error::Result;
use vfs::VfsNode;

/// Brings the VFS up: installs the initramfs archive as `/`, then mounts
/// the always-present virtual filesystems alongside it. ATA-backed FAT
/// volumes are mounted later, on demand (§2's "any ATA-backed FAT mounted
/// on demand"), once the owning device has been probed.
pub fn init(initramfs_archive: &'static [u8]) -> Result<()> {
    let root = initramfs::build(initramfs_archive)?;
    mount::mount("/", root, "initramfs");
    mount::mount("/dev", devfs::root(), "devfs");
    mount::mount("/proc", procfs::root(), "procfs");
    mount::mount("/tmp", tmpfs::root(), "tmpfs");
    Ok(())
}

/// Opens `path` relative to `cwd`, used by syscall dispatch and by kernel
/// code (e.g. `execve`) that needs a node without going through a process's
/// fd table.
pub fn open(path: &str, cwd: &str, nofollow: bool) -> Result<Arc<dyn VfsNode>> {
    Ok(path::resolve(path, cwd, nofollow)?.node)
}

/// Probes `device_name` (an ATA device already registered in
/// `crate::device`) as FAT32, falling back to FAT16, and mounts whichever
/// succeeds at `mount_point`. Called once the device has been detected, on
/// demand rather than unconditionally at boot (§2).
pub fn mount_fat(device_name: &str, mount_point: &str) -> Result<()> {
    let device = crate::device::get(device_name).ok_or(crate::error::KernelError::NotFound)?;
    let block: Arc<dyn fat::bpb::BlockDevice> = Arc::new(fat::bpb::DeviceBackedBlockDevice::new(device));

    let (root, fs_name) = match fat::fat32::mount(block.clone()) {
        Ok(root) => (root, "fat32"),
        Err(_) => (fat::fat16::mount(block)?, "fat16"),
    };
    mount::mount(mount_point, root, fs_name);
    Ok(())
}
