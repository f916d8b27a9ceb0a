//! Process control blocks, component of §3.3. Generalizes the teacher's
//! `Thread`/`UserProcess` split (a `Thread` holding a `Context` plus a
//! `Weak<Mutex<UserProcess>>` back-pointer) into a single `Process` that
//! also carries the fields the original kernel's `process_t` has and this
//! target's spec keeps: both CPU contexts, fd table, cwd, signal state,
//! credentials, dynamic-linking context, wait-queue linkage.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::arch::context_switch::{CpuContext, TrapReturnFrame, UserRegs};
use crate::config::{CMDLINE_MAX, CWD_MAX, MAX_FDS_PER_PROCESS, PROCESS_NAME_MAX, SCHED_PRIORITY_DEFAULT};
use crate::error::{KernelError, Result};
use crate::mm::address_space::AddressSpace;
use crate::proc::fd::FdTable;
use crate::proc::signal::SignalState;

pub type Pid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Embryo,
    Runnable,
    Running,
    Sleeping,
    Zombie,
}

impl ProcState {
    /// Matches `/proc/<pid>/status`'s `State:` line (§4.F): one of
    /// `{UNUSED, EMBRYO, RUNNABLE, RUNNING, SLEEPING, ZOMBIE}`. `Unused`
    /// itself is never held by a live `Process` — a pid with no table
    /// entry at all is what spec.md calls `Unused`.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcState::Embryo => "EMBRYO",
            ProcState::Runnable => "RUNNABLE",
            ProcState::Running => "RUNNING",
            ProcState::Sleeping => "SLEEPING",
            ProcState::Zombie => "ZOMBIE",
        }
    }
}

/// Credentials, carried even though this core has no user/group
/// enforcement surface of its own — `syscall::dispatch` checks against
/// these for the handful of operations that need them (signal delivery
/// across uid boundaries is out of scope; these exist for `/proc/<pid>`
/// reporting and future enforcement).
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub umask: u32,
}

pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub state: ProcState,
    pub name: String,
    pub cmdline: String,

    pub address_space: AddressSpace,
    pub kernel_stack: Vec<u8>,
    pub user_stack_top: u32,
    pub heap_start: u32,
    pub heap_end: u32,
    pub user_entry: u32,

    /// Saved kernel-stack context driving the cooperative switch in
    /// `proc::scheduler`; see `arch::context_switch`.
    pub kcontext: CpuContext,
    pub started: bool,
    pub in_kernel: bool,

    pub time_slice: u32,
    pub priority: u8,
    pub base_priority: u8,
    pub aging_score: i32,
    pub wakeup_tick: u64,

    pub children: Vec<Pid>,
    pub exit_code: i32,

    pub fds: FdTable,

    pub tty: String,
    pub tty_mode: u32,
    pub cwd: String,

    pub signals: SignalState,

    pub credentials: Credentials,

    pub wait_next: Option<Pid>,

    /// Set by `sys_fork` on the child right after it's created, cleared by
    /// the scheduler's first-run trampoline once consumed. `None` for every
    /// process that reached user mode through `execve`/the ELF loader
    /// instead.
    pub fork_return: Option<(UserRegs, TrapReturnFrame)>,

    /// `(addr, shmid, size)` for every live `shmat` this process holds, so
    /// `shmdt(addr)` can recover the `shmid`/`size` `ipc::shm` needs without
    /// the syscall itself having to carry them.
    pub shm_attachments: Vec<(u32, u32, u32)>,

    /// `(fd, socket)` for every `AF_UNIX` socket fd this process has open.
    /// `fds` only stores each socket as an `Arc<dyn VfsNode>` (for generic
    /// `read`/`write`/`close`), which can't be downcast back to the
    /// concrete `Socket` that `bind`/`listen`/`connect`/`accept` need —
    /// this side table is what `syscall::dispatch` looks those up through,
    /// the same reason `shm_attachments` exists alongside `fds`.
    pub sockets: Vec<(i32, Arc<crate::ipc::unix_socket::Socket>)>,
}

impl Process {
    pub fn name_truncated(&self) -> &str {
        let end = self.name.len().min(PROCESS_NAME_MAX - 1);
        &self.name[..end]
    }
}

struct Table {
    processes: BTreeMap<Pid, Arc<Mutex<Process>>>,
    next_pid: Pid,
    current: Option<Pid>,
}

static TABLE: OnceCell<Mutex<Table>> = OnceCell::uninit();

pub fn init() {
    let _ = TABLE.try_init_once(|| Mutex::new(Table { processes: BTreeMap::new(), next_pid: 1, current: None }));
}

fn table() -> &'static Mutex<Table> {
    TABLE.get().expect("proc::process::init must run first")
}

/// Allocates a PCB and a fresh address space for it. The caller (the ELF
/// loader, for an `execve`-driven spawn, or `fork`) is responsible for
/// populating the address space's mappings and `context`/`kcontext` before
/// making the process runnable.
pub fn create(name: &str, ppid: Pid, kernel_stack_size: usize) -> Result<Arc<Mutex<Process>>> {
    let mut table = table().lock();
    if table.processes.len() >= crate::config::MAX_PROCESSES {
        return Err(KernelError::OutOfMemory);
    }

    let pid = table.next_pid;
    table.next_pid += 1;

    let process = Process {
        pid,
        ppid,
        state: ProcState::Embryo,
        name: String::from(name),
        cmdline: String::new(),
        address_space: AddressSpace::new()?,
        kernel_stack: alloc::vec![0u8; kernel_stack_size],
        user_stack_top: 0,
        heap_start: 0,
        heap_end: 0,
        user_entry: 0,
        kcontext: CpuContext::default(),
        started: false,
        in_kernel: false,
        time_slice: crate::config::DEFAULT_TIME_SLICE,
        priority: SCHED_PRIORITY_DEFAULT,
        base_priority: SCHED_PRIORITY_DEFAULT,
        aging_score: 0,
        wakeup_tick: 0,
        children: Vec::new(),
        exit_code: 0,
        fds: FdTable::new(MAX_FDS_PER_PROCESS),
        tty: String::from("tty0"),
        tty_mode: 0,
        cwd: String::from("/"),
        signals: SignalState::new(),
        credentials: Credentials::default(),
        wait_next: None,
        fork_return: None,
        shm_attachments: Vec::new(),
        sockets: Vec::new(),
    };

    let arc = Arc::new(Mutex::new(process));
    table.processes.insert(pid, arc.clone());

    if let Some(parent) = table.processes.get(&ppid) {
        parent.lock().children.push(pid);
    }

    Ok(arc)
}

pub fn get(pid: Pid) -> Option<Arc<Mutex<Process>>> {
    table().lock().processes.get(&pid).cloned()
}

pub fn with_process_mut<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let proc = get(pid)?;
    let mut guard = proc.lock();
    Some(f(&mut guard))
}

pub fn current_pid() -> Option<Pid> {
    table().lock().current
}

pub fn set_current(pid: Option<Pid>) {
    table().lock().current = pid;
}

pub fn all_pids() -> Vec<Pid> {
    table().lock().processes.keys().copied().collect()
}

/// Reaps a zombie: removes it from the table once its parent has collected
/// its exit code (via `wait`), detaching it from its parent's child list.
pub fn reap(pid: Pid) {
    let mut table = table().lock();
    if let Some(proc) = table.processes.remove(&pid) {
        let ppid = proc.lock().ppid;
        if let Some(parent) = table.processes.get(&ppid) {
            parent.lock().children.retain(|&c| c != pid);
        }
    }
}

/// Marks `pid` zombie with `code`, reparents its children to pid 1 (the
/// init process, conventionally the first one created), and wakes whatever
/// is waiting on it. Does not reap — that happens when the parent calls
/// `wait`.
pub fn exit(pid: Pid, code: i32) {
    let children = with_process_mut(pid, |p| {
        p.fds.close_all();
        p.sockets.clear();
        p.state = ProcState::Zombie;
        p.exit_code = code;
        core::mem::take(&mut p.children)
    })
    .unwrap_or_default();

    for child in children {
        with_process_mut(child, |c| c.ppid = 1);
    }

    crate::proc::wait_queue::wake_parent_of(pid);

    if current_pid() == Some(pid) {
        crate::proc::scheduler::reschedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn pid_allocation_is_monotonic_and_unique() {
        init();
        let a = create("a", 0, 4096).unwrap();
        let b = create("b", 0, 4096).unwrap();
        assert_ne!(a.lock().pid, b.lock().pid);
    }
}
