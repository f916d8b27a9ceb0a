//! `int 0x80` entry stub, component J. `extern "x86-interrupt"` (used for
//! every other vector in `arch::idt`) hides the general-purpose registers a
//! syscall's number and arguments travel in, so this one vector gets its
//! own hand-written naked prologue/epilogue instead, the same trade the
//! teacher makes in its `handle_syscall`/`handle_syscall_inner` pair (here
//! redone around `pushad`/`popad` instead of a manual register save list,
//! since i386 has the instruction and `sysv64` doesn't).

use core::arch::naked_asm;
use core::mem::offset_of;

use crate::arch::context_switch::TrapReturnFrame;

/// Mirrors the layout `pushad` leaves on the stack: EAX pushed first ends
/// up at the highest address of the eight, EDI pushed last at the lowest
/// (`[esp]`). Declared low-to-high so field order matches ascending memory
/// address. `esp` is the original ESP `pushad` captured; `popad` ignores it,
/// so dispatch must not rely on it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// Called with a pointer to the `pushad`-saved registers, kernel segments
/// already loaded. Writes its syscall return value into `regs.eax` so the
/// stub's `popad` hands it back to userland as the `int 0x80` return value.
///
/// The hardware-pushed trap frame (`eip`/`cs`/`eflags`/`esp`/`ss`) sits
/// immediately above the `pushad` block on the same stack — `fork` is the
/// only syscall that needs it, to capture exactly where its caller should
/// resume.
extern "C" fn syscall_entry_inner(regs: *mut SyscallRegs) {
    let regs = unsafe { &mut *regs };
    let frame =
        unsafe { &*((regs as *mut SyscallRegs as usize + core::mem::size_of::<SyscallRegs>()) as *const TrapReturnFrame) };
    let ret = crate::syscall::dispatch::dispatch(regs, frame);
    regs.eax = ret as u32;
}

/// Saves every general-purpose register, switches to kernel data segments,
/// dispatches, restores registers (now carrying the return value in the
/// `eax` slot), and `iret`s back to whatever privilege level made the call.
///
/// # Safety
/// Only ever reached through the IDT's vector 0x80 gate — never called
/// directly.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        "pushad",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov cx, {kernel_data:x}",
        "mov ds, cx",
        "mov es, cx",
        "mov fs, cx",
        "mov gs, cx",
        "mov eax, esp",
        "add eax, 16", // skip the four segment pushes to reach the pushad block
        "push eax",
        "call {inner}",
        "add esp, 4",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popad",
        "iretd",
        kernel_data = const crate::arch::gdt::SEL_KERNEL_DATA,
        inner = sym syscall_entry_inner,
    )
}

const _: () = assert!(offset_of!(SyscallRegs, eax) == 28);
