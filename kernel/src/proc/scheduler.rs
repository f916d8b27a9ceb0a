//! Priority + aging scheduler, §4.E. Generalizes the teacher's
//! `READY: OnceCell<Mutex<VecDeque<Arc<Mutex<Thread>>>>>` single run queue
//! into `SCHED_PRIORITY_LEVELS` queues (one per priority, matching
//! `scheduler.h`'s 0..=7 range), picked highest-priority-first, with a
//! per-tick aging pass so starved low-priority processes climb toward the
//! front instead of waiting forever.

use alloc::collections::VecDeque;
use conquer_once::spin::OnceCell;
use spin::Mutex;

use crate::arch::context_switch::{enter_user_mode, resume_forked_child, switch_to, CpuContext, TrapReturnFrame};
use crate::config::{MAX_AGING_SCORE, SCHED_PRIORITY_LEVELS};
use crate::proc::process::{self, Pid, ProcState};

struct Scheduler {
    ready: [VecDeque<Pid>; SCHED_PRIORITY_LEVELS],
    /// A dedicated kernel thread that loops calling `hlt`; the scheduler
    /// switches here whenever every ready queue is empty. Not a `Process`
    /// (it is never runnable/schedulable on its own terms, never exits,
    /// never appears in `/proc`), so it gets its own context slot.
    idle: CpuContext,
}

static SCHEDULER: OnceCell<Mutex<Scheduler>> = OnceCell::uninit();

/// # Safety
/// Must run once during boot, before the first `reschedule`. `idle_stack_top`
/// is the address one past the end of a dedicated, otherwise-unused kernel
/// stack for the idle loop.
pub unsafe fn init(idle_stack_top: u32) {
    let _ = SCHEDULER.try_init_once(|| {
        let idle = unsafe { CpuContext::bootstrap(idle_stack_top, idle_loop) };
        Mutex::new(Scheduler { ready: core::array::from_fn(|_| VecDeque::new()), idle })
    });
}

extern "C" fn idle_loop() -> ! {
    loop {
        crate::arch::cr::enable_interrupts();
        crate::arch::cr::halt();
    }
}

/// The entry every freshly created process's `kcontext` is bootstrapped to
/// (see [`spawn_entry`]): runs once, on that process's own kernel stack,
/// the first time `reschedule` ever switches to it, and drops straight into
/// user mode. Takes its process's identity from `process::current_pid`
/// (already set by `reschedule` before `switch_to` lands here) rather than
/// from an argument — `CpuContext::bootstrap` has nowhere to stash one.
extern "C" fn first_run_trampoline() -> ! {
    let pid = current_pid().expect("first_run_trampoline reached with no current process");

    let fork_return = process::with_process_mut(pid, |p| p.fork_return.take()).flatten();
    if let Some((regs, frame)) = fork_return {
        unsafe { resume_forked_child(&regs, &frame) }
    }

    let (entry, stack_top) = process::with_process_mut(pid, |p| (p.user_entry, p.user_stack_top))
        .expect("current process vanished before its first run");
    let frame = TrapReturnFrame::for_user_entry(entry, stack_top);
    unsafe { enter_user_mode(&frame) }
}

/// Bootstraps `pid`'s `kcontext` so its first scheduled run lands in
/// [`first_run_trampoline`] instead of resuming some other process's saved
/// registers. Called once per process, by whichever of `fork`/`execve`/the
/// initial boot spawn created it, after `user_entry`/`user_stack_top` (or
/// `fork_return`) have been filled in but before [`make_runnable`].
pub fn spawn_entry(pid: Pid) {
    process::with_process_mut(pid, |p| {
        let stack_top = p.kernel_stack.as_ptr() as u32 + p.kernel_stack.len() as u32;
        p.kcontext = unsafe { CpuContext::bootstrap(stack_top, first_run_trampoline) };
    });
}

fn scheduler() -> &'static Mutex<Scheduler> {
    SCHEDULER.get().expect("scheduler::init must run first")
}

pub fn current_pid() -> Option<Pid> {
    process::current_pid()
}

/// Enqueues `pid` at its current priority level and marks it runnable.
pub fn make_runnable(pid: Pid) {
    let priority = process::with_process_mut(pid, |p| {
        p.state = ProcState::Runnable;
        p.priority
    });
    if let Some(priority) = priority {
        scheduler().lock().ready[priority as usize].push_back(pid);
    }
}

/// Ages every runnable process once per tick: an aging score that reaches
/// [`MAX_AGING_SCORE`] promotes the process one priority level (toward 0,
/// the highest) and resets, matching `SCHED_AGING_BOOST`/`SCHED_AGING_MAX`
/// from `scheduler.h`.
fn age_ready_queues(sched: &mut Scheduler) {
    for level in (1..SCHED_PRIORITY_LEVELS).rev() {
        let mut promoted = VecDeque::new();
        sched.ready[level].retain(|&pid| {
            let should_promote = process::with_process_mut(pid, |p| {
                p.aging_score += 1;
                if p.aging_score >= MAX_AGING_SCORE as i32 {
                    p.aging_score = 0;
                    p.priority = p.priority.saturating_sub(1);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
            if should_promote {
                promoted.push_back(pid);
                false
            } else {
                true
            }
        });
        for pid in promoted {
            let new_level = process::with_process_mut(pid, |p| p.priority).unwrap_or(level as u8) as usize;
            sched.ready[new_level].push_back(pid);
        }
    }
}

/// Called from the timer IRQ. Decrements the running process's time slice;
/// returns `true` if a reschedule is due (slice exhausted or nothing was
/// running). The actual context switch happens outside interrupt context,
/// in [`reschedule`], matching §4.D's "dispatcher sets a flag; the switch
/// itself happens once EOI has been sent".
pub fn tick() -> bool {
    scheduler().lock().ready.iter().for_each(|_| {}); // queues exist; aging below mutates them
    let mut sched = scheduler().lock();
    age_ready_queues(&mut sched);
    drop(sched);

    match current_pid() {
        Some(pid) => process::with_process_mut(pid, |p| {
            if p.time_slice > 0 {
                p.time_slice -= 1;
            }
            p.time_slice == 0
        })
        .unwrap_or(true),
        None => true,
    }
}

/// A PCB never owns its `CpuContext` independently of the table lock, but
/// `switch_to` needs a raw pointer it can dereference across the switch
/// without holding that lock (the switch does not return until some other
/// CPU state change releases it). Safe because the outgoing process cannot
/// run concurrently with anything that would mutate `kcontext` (it is not
/// scheduled again until `switch_to` itself is done writing it).
fn kcontext_ptr(pid: Pid) -> *mut CpuContext {
    process::with_process_mut(pid, |p| &mut p.kcontext as *mut CpuContext).unwrap_or(core::ptr::null_mut())
}

/// Picks the next process (highest non-empty priority level, round-robin
/// within a level) and switches to it, first re-enqueueing the outgoing
/// process if it is still runnable. Runs with interrupts enabled or
/// disabled indifferently — `switch_to` itself does not depend on either.
pub fn reschedule() {
    let outgoing = current_pid();

    if let Some(pid) = outgoing {
        let still_runnable = process::with_process_mut(pid, |p| p.state == ProcState::Running).unwrap_or(false);
        if still_runnable {
            process::with_process_mut(pid, |p| {
                p.time_slice = crate::config::DEFAULT_TIME_SLICE;
                p.state = ProcState::Runnable;
            });
            make_runnable(pid);
        }
    }

    let next_pid = {
        let mut sched = scheduler().lock();
        sched.ready.iter_mut().find_map(|q| q.pop_front())
    };

    if outgoing.is_some() && outgoing == next_pid {
        return;
    }

    let prev_ctx: *mut CpuContext = match outgoing {
        Some(pid) => kcontext_ptr(pid),
        None => &mut scheduler().lock().idle as *mut CpuContext,
    };

    let next_ctx: *const CpuContext = match next_pid {
        Some(pid) => {
            process::with_process_mut(pid, |p| p.state = ProcState::Running);
            process::set_current(Some(pid));
            kcontext_ptr(pid)
        }
        None => {
            process::set_current(None);
            &scheduler().lock().idle as *const CpuContext
        }
    };

    unsafe { switch_to(prev_ctx, next_ctx) };
}

/// Runs on the freshly-switched-in stack, after the register swap and
/// before resuming whatever was running there. Re-arms the TSS's ring-0
/// stack so the next trap taken *in this process* lands on its own kernel
/// stack rather than the one that was just switched away from.
pub fn finish_switch() {
    if let Some(pid) = current_pid() {
        let esp0 =
            process::with_process_mut(pid, |p| p.kernel_stack.as_ptr() as u32 + p.kernel_stack.len() as u32);
        if let Some(esp0) = esp0 {
            crate::arch::gdt::set_kernel_stack(esp0);
        }
    }
}

/// Voluntary yield: re-enqueues the current process at its same priority
/// (no aging reset) and picks the next one.
pub fn yield_now() {
    reschedule();
}
