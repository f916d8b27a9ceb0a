//! Syscall dispatcher, component J. Routes `SyscallRegs.eax` (the number
//! `int 0x80`'s caller loaded) through `syscall::table`'s constants into
//! whichever subsystem owns that operation, the same switch-on-number shape
//! as the original `syscall_dispatch`, generalized to Rust's `Result` +
//! `KernelError::as_syscall_ret()` instead of returning a bare negative
//! `int` by convention at every call site.
//!
//! Argument convention (not part of any existing ABI — this core is not
//! binary-compatible with anything): `ebx`, `ecx`, `edx`, `esi`, `edi` carry
//! up to five arguments in that order, mirroring the order `pushad` already
//! leaves them in `SyscallRegs`.

use alloc::format;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::context_switch::{TrapReturnFrame, UserRegs};
use crate::arch::syscall_entry::SyscallRegs;
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, Result};
use crate::fs::vfs::{NodeKind, VfsNode};
use crate::ipc::shm;
use crate::ipc::unix_socket::{self, SockType};
use crate::mm::address_space::AddressSpace;
use crate::mm::pmm;
use crate::mm::vmm::{self, PageFlags, ScopedScratch};
use crate::proc::process::{self, Process};
use crate::proc::scheduler;
use crate::proc::signal::{self, Signal};
use crate::proc::wait_queue;
use crate::syscall::table;
use crate::syscall::uaccess;

/// Entry point called from `arch::syscall_entry`'s `int 0x80` handler.
/// Always runs a pending-signal check on the way out, matching §4.E's "the
/// default action runs the next time pending signals are checked... on
/// return from a syscall or interrupt".
pub fn dispatch(regs: &mut SyscallRegs, frame: &TrapReturnFrame) -> isize {
    let ret: Result<isize> = match regs.eax {
        table::SYS_EXIT => sys_exit(regs),
        table::SYS_FORK => sys_fork(regs, frame),
        table::SYS_EXECVE => sys_execve(regs),
        table::SYS_WAITPID => sys_waitpid(regs),
        table::SYS_GETPID => sys_getpid(),
        table::SYS_GETPPID => sys_getppid(),
        table::SYS_KILL => sys_kill(regs),
        table::SYS_READ => sys_read(regs),
        table::SYS_WRITE => sys_write(regs),
        table::SYS_OPEN => sys_open(regs),
        table::SYS_CLOSE => sys_close(regs),
        table::SYS_LSEEK => sys_lseek(regs),
        table::SYS_DUP => sys_dup(regs),
        table::SYS_DUP2 => sys_dup2(regs),
        table::SYS_IOCTL => sys_ioctl(regs),
        table::SYS_UNLINK => sys_unlink(regs),
        table::SYS_MKDIR => sys_mkdir(regs),
        table::SYS_GETDENTS => sys_getdents(regs),
        table::SYS_CHDIR => sys_chdir(regs),
        table::SYS_GETCWD => sys_getcwd(regs),
        table::SYS_TRUNCATE => sys_truncate(regs),
        table::SYS_SBRK => sys_sbrk(regs),
        table::SYS_SOCKET => sys_socket(regs),
        table::SYS_BIND => sys_bind(regs),
        table::SYS_LISTEN => sys_listen(regs),
        table::SYS_CONNECT => sys_connect(regs),
        table::SYS_ACCEPT => sys_accept(regs),
        table::SYS_SHMGET => sys_shmget(regs),
        table::SYS_SHMAT => sys_shmat(regs),
        table::SYS_SHMDT => sys_shmdt(regs),
        table::SYS_SHMCTL => sys_shmctl(regs),
        table::SYS_POWER => sys_power(regs),
        _ => Err(KernelError::InvalidArgument),
    };
    signal::check_current();
    match ret {
        Ok(v) => v,
        Err(e) => e.as_syscall_ret(),
    }
}

fn current() -> Result<Arc<Mutex<Process>>> {
    let pid = process::current_pid().ok_or(KernelError::InvalidArgument)?;
    process::get(pid).ok_or(KernelError::InvalidArgument)
}

fn current_cwd() -> Result<alloc::string::String> {
    Ok(current()?.lock().cwd.clone())
}

fn resolve_path(path: &str, cwd: &str) -> alloc::string::String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd.trim_end_matches('/'), path)
    }
}

fn split_parent(full: &str) -> Result<(&str, &str)> {
    let (parent, name) = full.rsplit_once('/').ok_or(KernelError::InvalidArgument)?;
    Ok((if parent.is_empty() { "/" } else { parent }, name))
}

// --- process lifecycle -----------------------------------------------

/// Terminates the calling process. `process::exit` reschedules away from
/// it immediately, so the `Ok` below is never actually observed — it only
/// exists because every handler in this file returns `Result<isize>`.
fn sys_exit(regs: &SyscallRegs) -> Result<isize> {
    let code = regs.ebx as i32;
    if let Some(pid) = process::current_pid() {
        process::exit(pid, code);
    }
    Ok(0)
}

/// Duplicates the calling process: a fresh address space carrying a deep
/// copy of every user mapping, a shared fd table, and a `kcontext` primed
/// to resume exactly where the parent trapped in, with `eax` forced to 0.
fn sys_fork(regs: &SyscallRegs, frame: &TrapReturnFrame) -> Result<isize> {
    let parent_pid = process::current_pid().ok_or(KernelError::InvalidArgument)?;
    let parent = process::get(parent_pid).ok_or(KernelError::InvalidArgument)?;

    let (child_space, kernel_stack_len, name) = {
        let p = parent.lock();
        (AddressSpace::fork_from(&p.address_space)?, p.kernel_stack.len(), p.name.clone())
    };

    let child = process::create(&name, parent_pid, kernel_stack_len)?;
    let child_pid = child.lock().pid;

    let user_regs =
        UserRegs { ebx: regs.ebx, ecx: regs.ecx, edx: regs.edx, esi: regs.esi, edi: regs.edi, ebp: regs.ebp };

    {
        let mut p = parent.lock();
        let mut c = child.lock();
        c.address_space = child_space;
        c.heap_start = p.heap_start;
        c.heap_end = p.heap_end;
        c.user_stack_top = p.user_stack_top;
        c.user_entry = p.user_entry;
        c.cwd = p.cwd.clone();
        c.cmdline = p.cmdline.clone();
        c.tty = p.tty.clone();
        c.credentials = p.credentials;
        c.fork_return = Some((user_regs, *frame));
        p.fds.fork_into(&mut c.fds);
    }

    scheduler::spawn_entry(child_pid);
    scheduler::make_runnable(child_pid);
    Ok(child_pid as isize)
}

/// Replaces the calling process's image in place. On success this never
/// returns to its caller — control drops straight into the new image's
/// entry point through `enter_user_mode`.
fn sys_execve(regs: &SyscallRegs) -> Result<isize> {
    let path = uaccess::copy_str_from_user(regs.ebx)?;
    let argv = uaccess::copy_cstr_array_from_user(regs.ecx)?;
    let envp = uaccess::copy_cstr_array_from_user(regs.edx)?;

    let cwd = current_cwd()?;
    let node = crate::fs::open(&path, &cwd, false)?;
    let size = node.metadata().size as usize;
    let mut image = alloc::vec![0u8; size];
    let n = node.read(0, &mut image)?;
    image.truncate(n);

    let argv_refs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
    let envp_refs: Vec<&str> = envp.iter().map(|s| s.as_str()).collect();
    let loaded = crate::elf::loader::load_image(&image, &path, &argv_refs, &envp_refs)?;

    let proc = current()?;
    let (dir_phys, entry, stack_top) = {
        let mut p = proc.lock();
        p.address_space = loaded.address_space;
        p.user_entry = loaded.entry;
        p.user_stack_top = loaded.stack_top;
        p.heap_start = loaded.heap_start;
        p.heap_end = loaded.heap_start;
        p.cmdline = loaded.cmdline;
        p.name = path.rsplit('/').next().unwrap_or(&path).to_string();
        (p.address_space.directory_phys(), p.user_entry, p.user_stack_top)
    };

    vmm::switch_directory(dir_phys);
    let trap_frame = TrapReturnFrame::for_user_entry(entry, stack_top);
    unsafe { crate::arch::context_switch::enter_user_mode(&trap_frame) }
}

/// Blocks until a child matching `pid` (-1 for any) has gone zombie, then
/// reports its exit code and reaps it.
fn sys_waitpid(regs: &SyscallRegs) -> Result<isize> {
    let target = regs.ebx as i32;
    let status_va = regs.ecx;
    let parent_pid = process::current_pid().ok_or(KernelError::InvalidArgument)?;

    loop {
        let mut zombie = None;
        let mut any_child = false;
        for pid in process::all_pids() {
            let Some((ppid, state, code)) =
                process::with_process_mut(pid, |p| (p.ppid, p.state, p.exit_code))
            else {
                continue;
            };
            if ppid != parent_pid || (target != -1 && target as u32 != pid) {
                continue;
            }
            any_child = true;
            if state == process::ProcState::Zombie {
                zombie = Some((pid, code));
                break;
            }
        }

        if let Some((pid, code)) = zombie {
            if status_va != 0 {
                uaccess::copy_to_user(status_va, &(code as u32).to_le_bytes())?;
            }
            process::reap(pid);
            return Ok(pid as isize);
        }
        if !any_child {
            return Err(KernelError::NotFound);
        }
        wait_queue::child_exit_queue(parent_pid).wait();
    }
}

fn sys_getpid() -> Result<isize> {
    process::current_pid().map(|p| p as isize).ok_or(KernelError::InvalidArgument)
}

fn sys_getppid() -> Result<isize> {
    Ok(current()?.lock().ppid as isize)
}

fn sys_kill(regs: &SyscallRegs) -> Result<isize> {
    let pid = regs.ebx;
    let sig = match regs.ecx {
        2 => Signal::SIGINT,
        4 => Signal::SIGILL,
        7 => Signal::SIGBUS,
        8 => Signal::SIGFPE,
        9 => Signal::SIGKILL,
        11 => Signal::SIGSEGV,
        15 => Signal::SIGTERM,
        17 => Signal::SIGCHLD,
        _ => return Err(KernelError::InvalidArgument),
    };
    if process::get(pid).is_none() {
        return Err(KernelError::NotFound);
    }
    signal::raise(pid, sig);
    Ok(0)
}

// --- files --------------------------------------------------------------

fn sys_read(regs: &SyscallRegs) -> Result<isize> {
    let fd = regs.ebx as i32;
    let buf_va = regs.ecx;
    let len = regs.edx as usize;

    let handle = current()?.lock().fds.get(fd).ok_or(KernelError::InvalidArgument)?;
    let mut local = alloc::vec![0u8; len];
    let n = {
        let mut h = handle.lock();
        let n = h.node.read(h.offset, &mut local)?;
        h.offset += n as u64;
        n
    };
    uaccess::copy_to_user(buf_va, &local[..n])?;
    Ok(n as isize)
}

fn sys_write(regs: &SyscallRegs) -> Result<isize> {
    let fd = regs.ebx as i32;
    let buf_va = regs.ecx;
    let len = regs.edx as usize;

    let handle = current()?.lock().fds.get(fd).ok_or(KernelError::InvalidArgument)?;
    let local = uaccess::copy_from_user(buf_va, len)?;
    let mut h = handle.lock();
    let n = h.node.write(h.offset, &local)?;
    h.offset += n as u64;
    Ok(n as isize)
}

fn create_file(path: &str, cwd: &str, kind: NodeKind) -> Result<Arc<dyn VfsNode>> {
    let full = resolve_path(path, cwd);
    let (parent, name) = split_parent(&full)?;
    crate::fs::open(parent, "/", false)?.create(name, kind)
}

fn sys_open(regs: &SyscallRegs) -> Result<isize> {
    let path = uaccess::copy_str_from_user(regs.ebx)?;
    let flags = regs.ecx;
    let cwd = current_cwd()?;

    let node = match crate::fs::open(&path, &cwd, false) {
        Ok(n) => n,
        Err(KernelError::NotFound) if flags & table::O_CREAT != 0 => create_file(&path, &cwd, NodeKind::File)?,
        Err(e) => return Err(e),
    };
    if flags & table::O_TRUNC != 0 {
        node.truncate(0)?;
    }
    let fd = current()?.lock().fds.alloc(node, flags)?;
    Ok(fd as isize)
}

fn sys_close(regs: &SyscallRegs) -> Result<isize> {
    current()?.lock().fds.close(regs.ebx as i32)?;
    Ok(0)
}

fn sys_lseek(regs: &SyscallRegs) -> Result<isize> {
    let fd = regs.ebx as i32;
    let offset = regs.ecx as i32 as i64;
    let whence = regs.edx;

    let handle = current()?.lock().fds.get(fd).ok_or(KernelError::InvalidArgument)?;
    let mut h = handle.lock();
    let base = match whence {
        table::SEEK_SET => 0i64,
        table::SEEK_CUR => h.offset as i64,
        table::SEEK_END => h.node.metadata().size as i64,
        _ => return Err(KernelError::InvalidArgument),
    };
    let new_off = base + offset;
    if new_off < 0 {
        return Err(KernelError::InvalidArgument);
    }
    h.offset = new_off as u64;
    Ok(h.offset as isize)
}

fn sys_dup(regs: &SyscallRegs) -> Result<isize> {
    let proc = current()?;
    let mut p = proc.lock();
    let handle = p.fds.get(regs.ebx as i32).ok_or(KernelError::InvalidArgument)?;
    Ok(p.fds.alloc_dup(handle, 0)? as isize)
}

fn sys_dup2(regs: &SyscallRegs) -> Result<isize> {
    let newfd = regs.ecx as i32;
    let proc = current()?;
    let mut p = proc.lock();
    let handle = p.fds.get(regs.ebx as i32).ok_or(KernelError::InvalidArgument)?;
    p.fds.install_at(newfd, handle)?;
    Ok(newfd as isize)
}

fn sys_ioctl(regs: &SyscallRegs) -> Result<isize> {
    let handle = current()?.lock().fds.get(regs.ebx as i32).ok_or(KernelError::InvalidArgument)?;
    Ok(handle.lock().node.ioctl(regs.ecx, regs.edx as usize)? as isize)
}

fn sys_unlink(regs: &SyscallRegs) -> Result<isize> {
    let path = uaccess::copy_str_from_user(regs.ebx)?;
    let cwd = current_cwd()?;
    let full = resolve_path(&path, &cwd);
    let (parent, name) = split_parent(&full)?;
    crate::fs::open(parent, "/", false)?.unlink(name)?;
    Ok(0)
}

fn sys_mkdir(regs: &SyscallRegs) -> Result<isize> {
    let path = uaccess::copy_str_from_user(regs.ebx)?;
    let cwd = current_cwd()?;
    create_file(&path, &cwd, NodeKind::Directory)?;
    Ok(0)
}

const DIRENT_NAME_MAX: usize = 55;
const DIRENT_SIZE: usize = DIRENT_NAME_MAX + 1;

/// Packs each directory entry as a fixed `[name; 55][kind tag; 1]` record —
/// this core has no `userland` struct `dirent` to match, so the layout is
/// its own, sized to fit a page-sized readdir buffer in round numbers.
fn sys_getdents(regs: &SyscallRegs) -> Result<isize> {
    let fd = regs.ebx as i32;
    let buf_va = regs.ecx;
    let buf_len = regs.edx as usize;

    let handle = current()?.lock().fds.get(fd).ok_or(KernelError::InvalidArgument)?;
    let entries = handle.lock().node.readdir()?;

    let max_entries = buf_len / DIRENT_SIZE;
    let take = entries.len().min(max_entries);
    let mut out = alloc::vec![0u8; take * DIRENT_SIZE];

    for (i, entry) in entries.iter().take(take).enumerate() {
        let rec = &mut out[i * DIRENT_SIZE..(i + 1) * DIRENT_SIZE];
        let name_bytes = entry.name.as_bytes();
        let n = name_bytes.len().min(DIRENT_NAME_MAX - 1);
        rec[..n].copy_from_slice(&name_bytes[..n]);
        rec[DIRENT_NAME_MAX] = match entry.kind {
            NodeKind::File => 1,
            NodeKind::Directory => 2,
            NodeKind::Device => 3,
            NodeKind::Symlink => 4,
        };
    }

    uaccess::copy_to_user(buf_va, &out)?;
    Ok(out.len() as isize)
}

fn sys_chdir(regs: &SyscallRegs) -> Result<isize> {
    let path = uaccess::copy_str_from_user(regs.ebx)?;
    let cwd = current_cwd()?;
    let node = crate::fs::open(&path, &cwd, false)?;
    if node.kind() != NodeKind::Directory {
        return Err(KernelError::NotDirectory);
    }
    let full = resolve_path(&path, &cwd);
    let pid = process::current_pid().ok_or(KernelError::InvalidArgument)?;
    process::with_process_mut(pid, |p| p.cwd = full);
    Ok(0)
}

fn sys_getcwd(regs: &SyscallRegs) -> Result<isize> {
    let mut bytes = current_cwd()?.into_bytes();
    bytes.push(0);
    if bytes.len() > regs.ecx as usize {
        return Err(KernelError::InvalidArgument);
    }
    uaccess::copy_to_user(regs.ebx, &bytes)?;
    Ok(bytes.len() as isize)
}

fn sys_truncate(regs: &SyscallRegs) -> Result<isize> {
    let handle = current()?.lock().fds.get(regs.ebx as i32).ok_or(KernelError::InvalidArgument)?;
    handle.lock().node.truncate(regs.ecx as u64)?;
    Ok(0)
}

fn page_align_up(v: u32) -> u32 {
    (v + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Grows or shrinks the calling process's heap by `increment` bytes,
/// mapping/unmapping whole pages as the rounded break crosses page
/// boundaries; returns the break's value before the call, matching libc's
/// `sbrk`.
fn sys_sbrk(regs: &SyscallRegs) -> Result<isize> {
    let increment = regs.ebx as i32;
    let proc = current()?;
    let mut p = proc.lock();

    let old_brk = p.heap_end;
    if increment == 0 {
        return Ok(old_brk as isize);
    }
    let new_brk = if increment > 0 {
        old_brk.checked_add(increment as u32)
    } else {
        old_brk.checked_sub((-increment) as u32)
    }
    .ok_or(KernelError::InvalidArgument)?;
    if new_brk < p.heap_start {
        return Err(KernelError::InvalidArgument);
    }

    let old_mapped_end = page_align_up(old_brk.max(p.heap_start));
    let new_mapped_end = page_align_up(new_brk.max(p.heap_start));

    if new_mapped_end > old_mapped_end {
        let mut va = old_mapped_end;
        while va < new_mapped_end {
            let phys = pmm::alloc_frame()?;
            {
                let scratch = ScopedScratch::map(phys)?;
                unsafe { core::ptr::write_bytes(scratch.as_ptr(), 0, PAGE_SIZE as usize) };
            }
            if let Err(e) = p.address_space.map(va, phys, PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE)
            {
                pmm::free_frame(phys);
                return Err(e);
            }
            va += PAGE_SIZE;
        }
    } else {
        let mut va = new_mapped_end;
        while va < old_mapped_end {
            if let Ok(phys) = p.address_space.unmap(va) {
                pmm::free_frame(phys);
            }
            va += PAGE_SIZE;
        }
    }

    p.heap_end = new_brk;
    Ok(old_brk as isize)
}

// --- IPC: UNIX sockets ----------------------------------------------------

fn find_socket(fd: i32) -> Result<Arc<unix_socket::Socket>> {
    let proc = current()?;
    let p = proc.lock();
    p.sockets.iter().find(|(f, _)| *f == fd).map(|(_, s)| s.clone()).ok_or(KernelError::InvalidArgument)
}

fn sys_socket(regs: &SyscallRegs) -> Result<isize> {
    let kind = match regs.ebx {
        0 => SockType::Stream,
        1 => SockType::Dgram,
        _ => return Err(KernelError::InvalidArgument),
    };
    let sock = unix_socket::create(kind)?;
    let proc = current()?;
    let mut p = proc.lock();
    let node: Arc<dyn VfsNode> = sock.clone();
    let fd = p.fds.alloc(node, 0)?;
    p.sockets.push((fd, sock));
    Ok(fd as isize)
}

fn sys_bind(regs: &SyscallRegs) -> Result<isize> {
    let path = uaccess::copy_str_from_user(regs.ecx)?;
    find_socket(regs.ebx as i32)?.bind(&path)?;
    Ok(0)
}

fn sys_listen(regs: &SyscallRegs) -> Result<isize> {
    find_socket(regs.ebx as i32)?.listen(regs.ecx as usize)?;
    Ok(0)
}

fn sys_connect(regs: &SyscallRegs) -> Result<isize> {
    let path = uaccess::copy_str_from_user(regs.ecx)?;
    find_socket(regs.ebx as i32)?.connect(&path)?;
    Ok(0)
}

fn sys_accept(regs: &SyscallRegs) -> Result<isize> {
    let client = find_socket(regs.ebx as i32)?.accept()?;
    let proc = current()?;
    let mut p = proc.lock();
    let node: Arc<dyn VfsNode> = client.clone();
    let newfd = p.fds.alloc(node, 0)?;
    p.sockets.push((newfd, client));
    Ok(newfd as isize)
}

// --- IPC: SysV shared memory ----------------------------------------------

fn sys_shmget(regs: &SyscallRegs) -> Result<isize> {
    let pid = process::current_pid().ok_or(KernelError::InvalidArgument)?;
    Ok(shm::shmget(regs.ebx as i32, regs.ecx, regs.edx, pid)? as isize)
}

fn sys_shmat(regs: &SyscallRegs) -> Result<isize> {
    let shmid = regs.ebx;
    let addr = if regs.ecx == 0 { None } else { Some(regs.ecx) };
    let proc = current()?;
    let mut p = proc.lock();
    let va = shm::shmat(shmid, addr, regs.edx, &p.address_space)?;
    let size = shm::segment_size(shmid).unwrap_or(0);
    p.shm_attachments.push((va, shmid, size));
    Ok(va as isize)
}

fn sys_shmdt(regs: &SyscallRegs) -> Result<isize> {
    let addr = regs.ebx;
    let proc = current()?;
    let mut p = proc.lock();
    let idx = p.shm_attachments.iter().position(|&(va, _, _)| va == addr).ok_or(KernelError::InvalidArgument)?;
    let (va, shmid, size) = p.shm_attachments.remove(idx);
    shm::shmdt(shmid, va, size, &p.address_space)?;
    Ok(0)
}

fn sys_shmctl(regs: &SyscallRegs) -> Result<isize> {
    if regs.ecx != shm::IPC_RMID {
        return Err(KernelError::InvalidArgument);
    }
    shm::shmctl_rmid(regs.ebx)?;
    Ok(0)
}

// --- power ----------------------------------------------------------------

/// `SYS_POWER`: reserved for `kreboot`/`kshutdown`-style requests, both of
/// which call into the ACPI/PIC layer that §1 places out of scope. The
/// syscall number is claimed rather than left unassigned, so userland that
/// probes for it gets a defined answer instead of an unrelated fault; there
/// is no collaborator yet to carry out the request.
fn sys_power(_regs: &SyscallRegs) -> Result<isize> {
    Err(KernelError::InvalidArgument)
}
