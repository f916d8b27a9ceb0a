//! Context switch and user-mode entry stubs. Spec §3.3 gives each process
//! two contexts: the kernel-level `CpuContext` saved/restored across a
//! cooperative switch between kernel stacks, and the trap frame an `iret`
//! consumes to drop (or return) into user mode. Grounded in the shape of
//! the teacher's `scheduler.rs` `Context`/`switch_to` naked-asm pair, redone
//! for 32-bit callee-saved registers and an `iret` return instead of
//! `sysretq`.

use core::arch::naked_asm;
use core::mem::offset_of;

/// Callee-saved registers plus ESP and EFLAGS — everything a cooperative
/// switch between two kernel stacks must preserve by value rather than by
/// leaving it sitting on the stack, the same fields the teacher's 64-bit
/// `Context` carries (`rflags, rbx, r12..r15, rbp, rsp`) narrowed to the
/// i386 register file. No `eip` field: the saved `esp` already points at a
/// return address on that stack (or, for a never-yet-run process, at a
/// synthetic one planted by [`CpuContext::bootstrap`]), so resuming a
/// context is just "load esp, then `ret`".
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuContext {
    pub eflags: u32,
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
}

impl CpuContext {
    /// Lays out a synthetic call frame at the top of `stack` so that the
    /// first switch into this context resumes at `entry` instead of
    /// returning into some prior caller — the same trick as the teacher's
    /// `Thread::from_func` writing `func` into `kstack.last_mut()`. `entry`
    /// must never return.
    ///
    /// # Safety
    /// `stack_top` must be the address one-past-the-end of a mapped,
    /// writable region at least 4 bytes long, owned exclusively by the
    /// process this context belongs to.
    pub unsafe fn bootstrap(stack_top: u32, entry: extern "C" fn() -> !) -> Self {
        let esp = stack_top - 4;
        unsafe { *(esp as *mut u32) = entry as u32 };
        CpuContext { eflags: 0x0000_0202, ebx: 0, esi: 0, edi: 0, ebp: 0, esp }
    }
}

/// Switches kernel stacks: copies the live register values into `*prev`,
/// loads them back out of `*next`, then jumps to [`switch_finish_hook`]
/// (scheduler bookkeeping) which falls through to a plain `ret` — popping
/// whatever return address sits at the top of the now-current stack and
/// resuming execution there. Never "returns" to its own caller in the
/// usual sense; control comes back out of a *different* call to
/// `switch_to`, made earlier by whichever thread this one now is.
///
/// # Safety
/// `prev` and `next` must both be valid `CpuContext` pointers; `next` must
/// have been produced by an earlier `switch_to` (saved mid-switch) or by
/// [`CpuContext::bootstrap`].
#[unsafe(naked)]
pub unsafe extern "C" fn switch_to(prev: *mut CpuContext, next: *const CpuContext) {
    naked_asm!(
        "mov eax, [esp + 4]",
        "mov edx, [esp + 8]",
        "mov [eax + {off_ebp}], ebp",
        "mov ebp, [edx + {off_ebp}]",
        "mov [eax + {off_ebx}], ebx",
        "mov ebx, [edx + {off_ebx}]",
        "mov [eax + {off_esi}], esi",
        "mov esi, [edx + {off_esi}]",
        "mov [eax + {off_edi}], edi",
        "mov edi, [edx + {off_edi}]",
        "mov [eax + {off_esp}], esp",
        "mov esp, [edx + {off_esp}]",
        "pushfd",
        "pop dword ptr [eax + {off_eflags}]",
        "push dword ptr [edx + {off_eflags}]",
        "popfd",
        "jmp {hook}",
        off_eflags = const offset_of!(CpuContext, eflags),
        off_ebx = const offset_of!(CpuContext, ebx),
        off_esi = const offset_of!(CpuContext, esi),
        off_edi = const offset_of!(CpuContext, edi),
        off_ebp = const offset_of!(CpuContext, ebp),
        off_esp = const offset_of!(CpuContext, esp),
        hook = sym switch_finish_hook,
    )
}

/// Runs once per switch, on the newly-current stack, before falling
/// through to `ret` and resuming whatever called `switch_to` last time (or
/// jumping into a fresh process's entry point, for a never-yet-run one).
extern "C" fn switch_finish_hook() {
    crate::proc::scheduler::finish_switch();
}

/// Registers an `iret` consumes to drop into ring 3. Built fresh by the ELF
/// loader for a new process's first entry and by signal delivery/`execve`
/// for a running one.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapReturnFrame {
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl TrapReturnFrame {
    pub fn for_user_entry(entry: u32, stack_top: u32) -> Self {
        TrapReturnFrame {
            eip: entry,
            cs: crate::arch::gdt::SEL_USER_CODE as u32,
            eflags: 0x0000_0202, // IF set, reserved bit 1 set
            esp: stack_top,
            ss: crate::arch::gdt::SEL_USER_DATA as u32,
        }
    }
}

/// Pushes `frame` and performs the privilege-level-changing `iret` that
/// drops execution into user mode. Never returns.
///
/// # Safety
/// `frame.eip`/`frame.esp` must point into memory mapped, present, and
/// user-accessible in the currently loaded page directory.
#[unsafe(naked)]
pub unsafe extern "C" fn enter_user_mode(frame: *const TrapReturnFrame) -> ! {
    naked_asm!(
        "mov eax, [esp + 4]",
        "mov cx, {user_data:x}",
        "mov ds, cx",
        "mov es, cx",
        "mov fs, cx",
        "mov gs, cx",
        "push [eax + 16]", // ss
        "push [eax + 12]", // esp
        "push [eax + 8]",  // eflags
        "push [eax + 4]",  // cs
        "push [eax + 0]",  // eip
        "iretd",
        user_data = const crate::arch::gdt::SEL_USER_DATA,
    )
}

/// Everything `fork` must restore on a child's first run besides `eax`
/// (always forced to 0, the child's view of `fork`'s return value) and the
/// trap frame itself. Captured from the parent's `int 0x80` registers at
/// fork time.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UserRegs {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
}

/// Resumes a forked child for the first time: restores `regs`, forces
/// `eax` to 0, and `iret`s into `frame` — the same user EIP/ESP/EFLAGS the
/// parent's `fork()` call trapped from, just with the child's zero return
/// value. Reached from [`crate::proc::scheduler`]'s first-run trampoline,
/// never called directly.
///
/// # Safety
/// `frame`'s `eip`/`esp` must be valid in the currently loaded directory —
/// true here because the child shares the parent's mappings at fork time.
#[unsafe(naked)]
pub unsafe extern "C" fn resume_forked_child(regs: *const UserRegs, frame: *const TrapReturnFrame) -> ! {
    naked_asm!(
        "mov cx, {user_data:x}",
        "mov ds, cx",
        "mov es, cx",
        "mov fs, cx",
        "mov gs, cx",
        "mov eax, [esp + 4]", // regs
        "mov ebx, [eax + {off_ebx}]",
        "mov ecx, [eax + {off_ecx}]",
        "mov edx, [eax + {off_edx}]",
        "mov esi, [eax + {off_esi}]",
        "mov edi, [eax + {off_edi}]",
        "mov ebp, [eax + {off_ebp}]",
        "mov eax, [esp + 8]", // frame
        "push [eax + 16]", // ss
        "push [eax + 12]", // esp
        "push [eax + 8]",  // eflags
        "push [eax + 4]",  // cs
        "push [eax + 0]",  // eip
        "xor eax, eax",
        "iretd",
        user_data = const crate::arch::gdt::SEL_USER_DATA,
        off_ebx = const offset_of!(UserRegs, ebx),
        off_ecx = const offset_of!(UserRegs, ecx),
        off_edx = const offset_of!(UserRegs, edx),
        off_esi = const offset_of!(UserRegs, esi),
        off_edi = const offset_of!(UserRegs, edi),
        off_ebp = const offset_of!(UserRegs, ebp),
    )
}
