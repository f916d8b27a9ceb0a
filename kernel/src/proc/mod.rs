//! Process table, scheduler, wait queues and signals — component E.
//! Generalizes the teacher's `scheduler.rs` (a single ready queue of
//! `Arc<Mutex<Thread>>` plus a separate `UserProcess` for the address
//! space) into the one spec'd `Process` struct split across these files:
//! `process` owns the table and PCB fields, `scheduler` the ready queues
//! and context switch, `wait_queue` blocking, `signal` default
//! dispositions, `fd` the per-process descriptor table.

pub mod fd;
pub mod process;
pub mod scheduler;
pub mod signal;
pub mod wait_queue;

/// Brings up the process subsystem: the process table and the scheduler's
/// idle context. Must run after `mm::init` (process creation allocates
/// address spaces and kernel stacks) and before the first `schedule`.
///
/// # Safety
/// `idle_stack_top` must be the one-past-the-end address of a mapped,
/// writable, otherwise-unused kernel stack reserved for the idle loop.
pub unsafe fn init(idle_stack_top: u32) {
    process::init();
    unsafe { scheduler::init(idle_stack_top) };
}
