//! §6.2's device capability: the uniform interface the out-of-scope
//! drivers (ATA, PS/2, RTC, SB16, serial, timer, VGA) implement and
//! `fs::devfs` proxies VFS reads/writes/ioctls through. Generalizes the
//! teacher's per-driver ad hoc init/cleanup pairs into one object-safe
//! trait plus a registry, the same shape `fs::vfs::VfsNode` gives
//! filesystems.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KernelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Storage,
    Input,
    Output,
    Network,
    Timer,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSubtype {
    Keyboard,
    Mouse,
    Display,
    Ata,
    Tty,
    Rtc,
    Audio,
    Serial,
    None,
}

/// Implemented by every driver this core treats as an external
/// collaborator (§1). Devices are registered once and proxied through
/// devfs; nothing in the core depends on a concrete driver type.
pub trait Device: Send + Sync {
    fn device_type(&self) -> DeviceType;
    fn subtype(&self) -> DeviceSubtype {
        DeviceSubtype::None
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _ = (offset, buf);
        Err(KernelError::IoError)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let _ = (offset, buf);
        Err(KernelError::IoError)
    }

    fn ioctl(&self, cmd: u32, arg: usize) -> Result<i32> {
        let _ = (cmd, arg);
        Err(KernelError::InvalidArgument)
    }

    fn cleanup(&self) {}
}

struct Registered {
    name: String,
    device: Arc<dyn Device>,
}

lazy_static! {
    static ref DEVICES: Mutex<Vec<Registered>> = Mutex::new(Vec::new());
}

/// Registers `device` under `/dev/<name>`, calling its `init` once.
/// Re-registering an existing name replaces and cleans up the old one.
pub fn register(name: &str, device: Arc<dyn Device>) -> Result<()> {
    device.init()?;
    let mut devices = DEVICES.lock();
    if let Some(pos) = devices.iter().position(|d| d.name == name) {
        devices.remove(pos).device.cleanup();
    }
    devices.push(Registered { name: String::from(name), device });
    Ok(())
}

pub fn unregister(name: &str) {
    let mut devices = DEVICES.lock();
    if let Some(pos) = devices.iter().position(|d| d.name == name) {
        devices.remove(pos).device.cleanup();
    }
}

pub fn get(name: &str) -> Option<Arc<dyn Device>> {
    DEVICES.lock().iter().find(|d| d.name == name).map(|d| d.device.clone())
}

pub fn names() -> Vec<String> {
    DEVICES.lock().iter().map(|d| d.name.clone()).collect()
}

pub fn list() -> Vec<(String, DeviceType)> {
    DEVICES.lock().iter().map(|d| (d.name.clone(), d.device.device_type())).collect()
}
