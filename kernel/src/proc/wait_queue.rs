//! Blocking wait queues. The original links sleepers through a
//! `wait_next` field on `process_t` to avoid a heap allocation; this
//! kernel already has one (component C), so a queue is just a `Vec<Pid>`
//! protected by a spinlock — same externally observable semantics
//! (`process_wait_on`/`wake_one`/`wake_all`), simpler internals.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::proc::process::{self, Pid, ProcState};
use crate::proc::scheduler;

pub struct WaitQueue {
    sleepers: Mutex<Vec<Pid>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue { sleepers: Mutex::new(Vec::new()) }
    }

    /// Blocks the current process on this queue until woken. Must be
    /// called with the caller not already holding any lock this queue's
    /// waker needs, since `scheduler::reschedule` may switch away for an
    /// arbitrarily long time.
    pub fn wait(&self) {
        let Some(pid) = process::current_pid() else { return };
        self.sleepers.lock().push(pid);
        process::with_process_mut(pid, |p| p.state = ProcState::Sleeping);
        scheduler::reschedule();
    }

    pub fn wake_one(&self) {
        let mut sleepers = self.sleepers.lock();
        if !sleepers.is_empty() {
            let pid = sleepers.remove(0);
            scheduler::make_runnable(pid);
        }
    }

    pub fn wake_all(&self) {
        let mut sleepers = self.sleepers.lock();
        for pid in sleepers.drain(..) {
            scheduler::make_runnable(pid);
        }
    }
}

static CHILD_EXIT_QUEUES: OnceCell<Mutex<BTreeMap<Pid, Arc<WaitQueue>>>> = OnceCell::uninit();

fn child_exit_queues() -> &'static Mutex<BTreeMap<Pid, Arc<WaitQueue>>> {
    CHILD_EXIT_QUEUES.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// The queue a `wait`/`waitpid` syscall blocks a parent on.
pub fn child_exit_queue(parent: Pid) -> Arc<WaitQueue> {
    let mut queues = child_exit_queues().lock();
    queues.entry(parent).or_insert_with(|| Arc::new(WaitQueue::new())).clone()
}

/// Wakes whatever is blocked in `wait`/`waitpid` on `pid`'s parent, called
/// once `pid` has gone zombie.
pub fn wake_parent_of(pid: Pid) {
    if let Some(proc) = process::get(pid) {
        let ppid = proc.lock().ppid;
        child_exit_queue(ppid).wake_all();
    }
}
