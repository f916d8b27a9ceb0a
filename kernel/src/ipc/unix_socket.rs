//! UNIX-domain sockets (§4.I). Modeled the way `fs::devfs::Tty` models a
//! line discipline: a plain struct behind an `Arc`, reached through the fd
//! table as an `Arc<dyn VfsNode>`, with its own interior-mutable state
//! instead of the original's fixed `sockets[MAX_SOCKETS]` array searched
//! by pointer.

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::{SOCKET_MAX_BACKLOG, SOCKET_RING_SIZE};
use crate::error::{KernelError, Result};
use crate::fs::vfs::{Metadata, NodeKind, VfsNode};
use crate::proc::wait_queue::WaitQueue;

pub const MAX_SOCKETS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Dgram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockState {
    Unbound,
    Bound,
    Listening,
    Connected,
    Closed,
}

struct Inner {
    state: SockState,
    path: Option<String>,
    nonblocking: bool,
    peer: Option<Arc<Socket>>,
    listen_queue: VecDeque<Arc<Socket>>,
    max_backlog: usize,
}

/// A ring buffer of up to [`SOCKET_RING_SIZE`] bytes. A `VecDeque` already
/// behaves as a ring; the explicit capacity is enforced on push rather
/// than relied on from the allocator.
struct RingBuffer(Mutex<VecDeque<u8>>);

impl RingBuffer {
    fn new() -> Self {
        RingBuffer(Mutex::new(VecDeque::with_capacity(SOCKET_RING_SIZE)))
    }
}

pub struct Socket {
    pub kind: SockType,
    inner: Mutex<Inner>,
    recv_buffer: RingBuffer,
    accept_wq: WaitQueue,
    recv_wq: WaitQueue,
    send_wq: WaitQueue,
}

static REGISTRY: Mutex<Vec<Arc<Socket>>> = Mutex::new(Vec::new());

fn prune_and_count() -> usize {
    let mut registry = REGISTRY.lock();
    registry.retain(|s| Arc::strong_count(s) > 1);
    registry.len()
}

/// `socket(AF_UNIX, SOCK_STREAM|SOCK_DGRAM, 0)`: allocates a fresh,
/// unbound socket and registers it.
pub fn create(kind: SockType) -> Result<Arc<Socket>> {
    if prune_and_count() >= MAX_SOCKETS {
        return Err(KernelError::OutOfMemory);
    }
    let sock = Arc::new(Socket {
        kind,
        inner: Mutex::new(Inner {
            state: SockState::Unbound,
            path: None,
            nonblocking: false,
            peer: None,
            listen_queue: VecDeque::new(),
            max_backlog: 0,
        }),
        recv_buffer: RingBuffer::new(),
        accept_wq: WaitQueue::new(),
        recv_wq: WaitQueue::new(),
        send_wq: WaitQueue::new(),
    });
    REGISTRY.lock().push(sock.clone());
    Ok(sock)
}

fn find_listening(path: &str) -> Option<Arc<Socket>> {
    REGISTRY
        .lock()
        .iter()
        .find(|s| {
            let inner = s.inner.lock();
            inner.state == SockState::Listening && inner.path.as_deref() == Some(path)
        })
        .cloned()
}

/// Best-effort VFS file creation at `path` so `connect` (and any plain
/// `open`) can find the bound name; failure to create it is not fatal, a
/// socket can still be connected to by an in-kernel caller that already
/// holds the `Arc`.
fn create_vfs_entry(path: &str) {
    let Some((parent, name)) = path.rsplit_once('/') else { return };
    let parent = if parent.is_empty() { "/" } else { parent };
    if let Ok(dir) = crate::fs::open(parent, "/", false) {
        let _ = dir.create(name, NodeKind::File);
    }
}

impl Socket {
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.inner.lock().nonblocking = nonblocking;
    }

    /// `bind(fd, sockaddr_un)`.
    pub fn bind(self: &Arc<Self>, path: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SockState::Unbound {
            return Err(KernelError::InvalidArgument);
        }
        inner.path = Some(path.to_string());
        inner.state = SockState::Bound;
        drop(inner);
        create_vfs_entry(path);
        Ok(())
    }

    /// `listen(fd, backlog)`.
    pub fn listen(self: &Arc<Self>, backlog: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != SockState::Bound || self.kind != SockType::Stream {
            return Err(KernelError::InvalidArgument);
        }
        inner.state = SockState::Listening;
        inner.max_backlog = backlog.min(SOCKET_MAX_BACKLOG);
        Ok(())
    }

    /// `connect(fd, addr)`: finds the listener, enqueues self, wakes one
    /// acceptor, then (blocking sockets) sleeps until a peer is set.
    pub fn connect(self: &Arc<Self>, path: &str) -> Result<()> {
        let listener = find_listening(path).ok_or(KernelError::ConnectionRefused)?;
        {
            let mut l = listener.inner.lock();
            if l.listen_queue.len() >= l.max_backlog {
                return Err(KernelError::ConnectionRefused);
            }
            l.listen_queue.push_back(self.clone());
        }
        listener.accept_wq.wake_one();

        let nonblocking = self.inner.lock().nonblocking;
        if nonblocking {
            return Ok(());
        }
        loop {
            if self.inner.lock().peer.is_some() {
                return Ok(());
            }
            self.recv_wq.wait();
        }
    }

    /// `accept(fd)`: blocks until a connection is queued, then wires up
    /// both peers and returns the new server-side socket.
    pub fn accept(self: &Arc<Self>) -> Result<Arc<Socket>> {
        loop {
            {
                let state = self.inner.lock().state;
                if state != SockState::Listening {
                    return Err(KernelError::InvalidArgument);
                }
            }
            let client = {
                let mut inner = self.inner.lock();
                inner.listen_queue.pop_front()
            };
            let Some(client) = client else {
                if self.inner.lock().nonblocking {
                    return Err(KernelError::WouldBlock);
                }
                self.accept_wq.wait();
                continue;
            };

            let server = create(self.kind)?;
            {
                let mut s = server.inner.lock();
                s.state = SockState::Connected;
                s.peer = Some(client.clone());
            }
            {
                let mut c = client.inner.lock();
                c.state = SockState::Connected;
                c.peer = Some(server.clone());
            }
            client.recv_wq.wake_all();
            client.send_wq.wake_all();
            return Ok(server);
        }
    }

    fn peer(&self) -> Option<Arc<Socket>> {
        self.inner.lock().peer.clone()
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().state == SockState::Connected
    }

    /// True once the socket has been through `Connected`, whether or not
    /// the peer has since closed it — `read` uses this to distinguish "no
    /// peer yet" (an error) from "peer closed" (drain then `Ok(0)`).
    fn ever_connected(&self) -> bool {
        matches!(self.inner.lock().state, SockState::Connected | SockState::Closed)
    }
}

impl VfsNode for Socket {
    fn kind(&self) -> NodeKind {
        NodeKind::Device
    }

    fn metadata(&self) -> Metadata {
        Metadata::default()
    }

    /// `read(fd)`: drains `recv_buffer`, even after the local side has been
    /// marked `Closed` by a peer disconnect — bytes the peer wrote before
    /// closing must still be delivered (§4.I, §8 property 7). Blocks while
    /// empty and the peer is still alive; returns 0 once the buffer is
    /// empty and there is no live peer to ever refill it.
    fn read(&self, _offset: u64, buf: &mut [u8]) -> Result<usize> {
        if !self.ever_connected() {
            return Err(KernelError::InvalidArgument);
        }
        loop {
            {
                let mut rb = self.recv_buffer.0.lock();
                if !rb.is_empty() {
                    let n = buf.len().min(rb.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = rb.pop_front().unwrap();
                    }
                    drop(rb);
                    if let Some(peer) = self.peer() {
                        peer.send_wq.wake_all();
                    }
                    return Ok(n);
                }
            }
            let peer_alive = self.peer().is_some();
            if !peer_alive {
                return Ok(0);
            }
            if self.inner.lock().nonblocking {
                return Err(KernelError::WouldBlock);
            }
            self.recv_wq.wait();
            if !self.is_connected() && self.recv_buffer.0.lock().is_empty() {
                return Ok(0);
            }
        }
    }

    /// `write(fd)`: pushes into the peer's `recv_buffer` byte by byte;
    /// blocks on the peer's `send_wq` when full.
    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize> {
        let Some(peer) = self.peer() else {
            return Err(KernelError::BrokenPipe);
        };
        if !self.is_connected() {
            return Err(KernelError::BrokenPipe);
        }

        let mut written = 0;
        for &byte in buf {
            loop {
                if !peer.is_connected() {
                    return if written > 0 { Ok(written) } else { Err(KernelError::BrokenPipe) };
                }
                let mut rb = peer.recv_buffer.0.lock();
                if rb.len() < SOCKET_RING_SIZE {
                    rb.push_back(byte);
                    drop(rb);
                    peer.recv_wq.wake_all();
                    written += 1;
                    break;
                }
                drop(rb);
                if self.inner.lock().nonblocking {
                    return if written > 0 { Ok(written) } else { Err(KernelError::WouldBlock) };
                }
                self.send_wq.wait();
            }
        }
        Ok(written)
    }

    /// Closes this socket: disconnects and closes its peer too, waking
    /// every wait queue on both sides.
    fn truncate(&self, _len: u64) -> Result<()> {
        Err(KernelError::InvalidArgument)
    }

    fn poll_can_read(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            SockState::Listening => !inner.listen_queue.is_empty(),
            SockState::Connected => {
                if !self.recv_buffer.0.lock().is_empty() {
                    return true;
                }
                inner.peer.as_ref().map(|p| !p.is_connected()).unwrap_or(true)
            }
            _ => true,
        }
    }

    fn poll_can_write(&self) -> bool {
        let inner = self.inner.lock();
        if inner.state != SockState::Connected {
            return true;
        }
        match &inner.peer {
            Some(peer) if peer.is_connected() => peer.recv_buffer.0.lock().len() < SOCKET_RING_SIZE,
            _ => true,
        }
    }

    /// Matches `socket_vfs_close`'s "disconnect peer, mark both closed,
    /// wake every queue on both sides" — run promptly by `close(2)` rather
    /// than waiting on whichever `Arc` drop happens to be last.
    fn on_close(&self) {
        close_inner(self);
    }
}

fn close_inner(sock: &Socket) {
    let peer = {
        let mut inner = sock.inner.lock();
        inner.state = SockState::Closed;
        inner.peer.take()
    };
    if let Some(peer) = peer {
        let mut p = peer.inner.lock();
        p.peer = None;
        p.state = SockState::Closed;
        drop(p);
        peer.accept_wq.wake_all();
        peer.recv_wq.wake_all();
        peer.send_wq.wake_all();
    }
    sock.accept_wq.wake_all();
    sock.recv_wq.wake_all();
    sock.send_wq.wake_all();
}

/// Closes `sock` from in-kernel code that already holds the `Arc` (tests,
/// and anywhere not going through the generic `VfsNode::on_close` path).
pub fn close(sock: &Arc<Socket>) {
    close_inner(sock);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn bind_requires_unbound_state() {
        let sock = create(SockType::Stream).unwrap();
        sock.bind("/tmp/test.sock").unwrap();
        assert!(sock.bind("/tmp/test.sock").is_err());
    }

    #[test_case]
    fn listen_rejects_dgram() {
        let sock = create(SockType::Dgram).unwrap();
        sock.bind("/tmp/dgram.sock").unwrap();
        assert!(sock.listen(8).is_err());
    }

    #[test_case]
    fn listen_caps_backlog() {
        let sock = create(SockType::Stream).unwrap();
        sock.bind("/tmp/cap.sock").unwrap();
        sock.listen(9999).unwrap();
        assert_eq!(sock.inner.lock().max_backlog, SOCKET_MAX_BACKLOG);
    }

    /// Regression for draining leftover bytes after the peer closes:
    /// writer sends then closes, reader must still see the bytes before
    /// its read finally reports end-of-stream as `Ok(0)`.
    #[test_case]
    fn read_drains_buffer_after_peer_close() {
        let listener = create(SockType::Stream).unwrap();
        listener.bind("/tmp/drain.sock").unwrap();
        listener.listen(1).unwrap();

        let client = create(SockType::Stream).unwrap();
        client.set_nonblocking(true);
        client.connect("/tmp/drain.sock").unwrap();
        let server = listener.accept().unwrap();

        assert_eq!(client.write(0, b"hi").unwrap(), 2);
        close(&client);

        let mut buf = [0u8; 8];
        assert_eq!(server.read(0, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(server.read(0, &mut buf).unwrap(), 0);
    }
}
