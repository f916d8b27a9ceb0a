//! `/dev` — exposes every registered [`crate::device::Device`] as a VFS
//! node proxying straight through to its capability methods (§4.F
//! "devfs. Exposes registered devices at `/dev/<name>` with capability
//! proxying to the device's ops.").

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::device::{self, Device, DeviceSubtype, DeviceType};
use crate::error::{KernelError, Result};
use crate::fs::vfs::{DirEntry, Metadata, NodeKind, VfsNode};

const IOCTL_TTY_SET_MODE: u32 = 1;
const IOCTL_TTY_GET_MODE: u32 = 2;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TtyMode: u32 {
        const CANON = 0x1;
        const ECHO  = 0x2;
    }
}

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7F;

/// A TTY's line discipline, sitting above whatever raw byte stream a
/// keyboard/serial driver feeds it (out of scope, §1) and below
/// `tty_read_mode` (§6.3). `input` is pushed to by that driver via
/// [`Tty::push_input`]; everything else — canonical editing, echo,
/// raw-mode draining — lives here.
pub struct Tty {
    input: Mutex<VecDeque<u8>>,
    mode: Mutex<TtyMode>,
}

impl Tty {
    pub fn new() -> Self {
        Tty { input: Mutex::new(VecDeque::new()), mode: Mutex::new(TtyMode::CANON | TtyMode::ECHO) }
    }

    /// Called by the (out-of-scope) input driver for each byte received.
    pub fn push_input(&self, byte: u8) {
        self.input.lock().push_back(byte);
    }

    fn echo(&self, byte: u8) {
        if self.mode.lock().contains(TtyMode::ECHO) {
            crate::klog::_log(crate::klog::Level::Trace, format_args!("{}", byte as char));
        }
    }

    /// §6.3 `tty_read_mode`. Canonical mode blocks (spins, in this
    /// single-CPU core with no true blocking I/O wait queue wired to a
    /// real driver yet) until `\n` or `buf` is full, translating CR to LF,
    /// honoring backspace/DEL as line edits, Ctrl-C as "abandon this read
    /// and return 0", and Ctrl-D as "end the read here". Raw mode reads one
    /// byte, then drains whatever else is immediately queued.
    pub fn read_mode(&self, buf: &mut [u8]) -> usize {
        let canonical = self.mode.lock().contains(TtyMode::CANON);
        if !canonical {
            let mut input = self.input.lock();
            let Some(first) = input.pop_front() else { return 0 };
            buf[0] = first;
            let mut n = 1;
            while n < buf.len() {
                let Some(b) = input.pop_front() else { break };
                buf[n] = b;
                n += 1;
            }
            return n;
        }

        let mut n = 0;
        loop {
            let byte = match self.input.lock().pop_front() {
                Some(b) => b,
                None => {
                    crate::proc::scheduler::yield_now();
                    continue;
                }
            };
            match byte {
                CTRL_C => return 0,
                CTRL_D => return n,
                b'\r' => {
                    self.echo(b'\n');
                    if n < buf.len() {
                        buf[n] = b'\n';
                        n += 1;
                    }
                    return n;
                }
                b'\n' => {
                    self.echo(b'\n');
                    if n < buf.len() {
                        buf[n] = b'\n';
                        n += 1;
                    }
                    return n;
                }
                BACKSPACE | DEL => {
                    if n > 0 {
                        n -= 1;
                    }
                }
                b => {
                    self.echo(b);
                    if n < buf.len() {
                        buf[n] = b;
                        n += 1;
                    } else {
                        return n;
                    }
                }
            }
        }
    }
}

impl Device for Tty {
    fn device_type(&self) -> DeviceType {
        DeviceType::Input
    }

    fn subtype(&self) -> DeviceSubtype {
        DeviceSubtype::Tty
    }

    fn read(&self, _offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self.read_mode(buf))
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize> {
        for &b in buf {
            crate::klog::_log(crate::klog::Level::Trace, format_args!("{}", b as char));
        }
        Ok(buf.len())
    }

    fn ioctl(&self, cmd: u32, arg: usize) -> Result<i32> {
        match cmd {
            IOCTL_TTY_SET_MODE => {
                *self.mode.lock() = TtyMode::from_bits_truncate(arg as u32);
                Ok(0)
            }
            IOCTL_TTY_GET_MODE => Ok(self.mode.lock().bits() as i32),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

struct DeviceNode {
    name: String,
}

impl VfsNode for DeviceNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Device
    }

    fn metadata(&self) -> Metadata {
        Metadata { size: 0, mode: 0o020666, ..Metadata::default() }
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        device::get(&self.name).ok_or(KernelError::NotFound)?.read(offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        device::get(&self.name).ok_or(KernelError::NotFound)?.write(offset, buf)
    }

    fn ioctl(&self, cmd: u32, arg: usize) -> Result<i32> {
        device::get(&self.name).ok_or(KernelError::NotFound)?.ioctl(cmd, arg)
    }
}

struct DevRoot;

impl VfsNode for DevRoot {
    fn kind(&self) -> NodeKind {
        NodeKind::Directory
    }

    fn metadata(&self) -> Metadata {
        Metadata { size: 0, mode: 0o040755, ..Metadata::default() }
    }

    fn readdir(&self) -> Result<Vec<DirEntry>> {
        Ok(device::names().into_iter().map(|name| DirEntry { name, kind: NodeKind::Device }).collect())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn VfsNode>> {
        device::get(name).ok_or(KernelError::NotFound)?;
        Ok(Arc::new(DeviceNode { name: String::from(name) }))
    }
}

pub fn root() -> Arc<dyn VfsNode> {
    Arc::new(DevRoot)
}

/// Registers the default TTY as `/dev/tty0`, matching the always-on stdio
/// device §4.G's fd-table init binds fd 0/1/2 to.
pub fn init_default_tty() -> Arc<Tty> {
    let tty = Arc::new(Tty::new());
    let _ = device::register("tty0", tty.clone() as Arc<dyn Device>);
    tty
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn canonical_read_stops_at_newline() {
        let tty = Tty::new();
        for &b in b"hi\n" {
            tty.push_input(b);
        }
        let mut buf = [0u8; 16];
        let n = tty.read_mode(&mut buf);
        assert_eq!(&buf[..n], b"hi\n");
    }

    #[test_case]
    fn ctrl_c_cancels_read() {
        let tty = Tty::new();
        tty.push_input(b'a');
        tty.push_input(CTRL_C);
        let mut buf = [0u8; 16];
        assert_eq!(tty.read_mode(&mut buf), 0);
    }

    #[test_case]
    fn backspace_edits_line() {
        let tty = Tty::new();
        for &b in b"hx\x08i\n" {
            tty.push_input(b);
        }
        let mut buf = [0u8; 16];
        let n = tty.read_mode(&mut buf);
        assert_eq!(&buf[..n], b"hi\n");
    }
}
