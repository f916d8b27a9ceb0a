//! IDT bring-up and CPU-exception handlers. Spec §6.1 assumes the IDT is
//! already installed; this module is the external collaborator providing
//! that, generalized from the teacher's `interrupts.rs` (which leans on
//! `x86_64::structures::idt`, a 64-bit-only type) to hand-rolled i386
//! descriptors using the same `extern "x86-interrupt"` ABI the teacher uses.
//!
//! A user-mode exception here raises the matching signal and returns
//! (§4.E); a kernel-mode exception panics (§7).

use core::mem::size_of;

use crate::arch::cr::read_cr2;
use crate::klog;
use crate::proc::scheduler;
use crate::proc::signal::{self, Signal};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptStackFrame {
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl InterruptStackFrame {
    /// CS RPL bits; 3 means the interrupted frame was user-mode (§4.D).
    pub fn cpl(&self) -> u8 {
        (self.cs & 0b11) as u8
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry { offset_low: 0, selector: 0, zero: 0, type_attr: 0, offset_high: 0 }
    }

    fn new(handler: u32, selector: u16, type_attr: u8) -> Self {
        IdtEntry {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

const INTERRUPT_GATE: u8 = 0x8E;
/// Same interrupt gate but DPL 3: the only vector that needs this is 0x80,
/// callable by `int 0x80` from ring 3 (§4.J).
const USER_INTERRUPT_GATE: u8 = 0xEE;
const IDT_SIZE: usize = 256;
static mut IDT: [IdtEntry; IDT_SIZE] = [IdtEntry::missing(); IDT_SIZE];

fn set_gate(vector: u8, handler: unsafe extern "x86-interrupt" fn(InterruptStackFrame)) {
    unsafe {
        IDT[vector as usize] = IdtEntry::new(handler as u32, crate::arch::gdt::SEL_KERNEL_CODE, INTERRUPT_GATE);
    }
}

fn set_gate_ec(vector: u8, handler: unsafe extern "x86-interrupt" fn(InterruptStackFrame, u32)) {
    unsafe {
        IDT[vector as usize] = IdtEntry::new(handler as u32, crate::arch::gdt::SEL_KERNEL_CODE, INTERRUPT_GATE);
    }
}

/// Installs a gate pointing at a raw handler address rather than an
/// `extern "x86-interrupt"` function. Used for the syscall entry, which is
/// hand-written naked asm that saves registers itself instead of relying on
/// the compiler-generated interrupt prologue/epilogue.
fn set_gate_raw(vector: u8, handler_addr: u32) {
    unsafe {
        IDT[vector as usize] = IdtEntry::new(handler_addr, crate::arch::gdt::SEL_KERNEL_CODE, USER_INTERRUPT_GATE);
    }
}

/// # Safety
/// Must run once, after the GDT is installed.
pub unsafe fn init() {
    use exception_handlers::*;

    set_gate(0, divide_error);
    set_gate(1, debug);
    set_gate(2, nmi);
    set_gate(3, breakpoint);
    set_gate(4, overflow);
    set_gate(5, bound_range_exceeded);
    set_gate(6, invalid_opcode);
    set_gate(7, device_not_available);
    set_gate_ec(8, double_fault);
    set_gate_ec(10, invalid_tss);
    set_gate_ec(11, segment_not_present);
    set_gate_ec(12, stack_segment_fault);
    set_gate_ec(13, general_protection_fault);
    set_gate_ec(14, page_fault);
    set_gate(16, x87_floating_point);
    set_gate_ec(17, alignment_check);
    set_gate(18, machine_check);
    set_gate(19, simd_floating_point);

    for (i, stub) in crate::arch::irq::STUBS.into_iter().enumerate() {
        set_gate(crate::arch::pic::IRQ_BASE + i as u8, stub);
    }

    set_gate_raw(0x80, crate::arch::syscall_entry::syscall_entry as u32);

    unsafe {
        let pointer = IdtPointer {
            limit: (size_of::<[IdtEntry; IDT_SIZE]>() - 1) as u16,
            base: &raw const IDT as u32,
        };
        core::arch::asm!("lidt [{}]", in(reg) &pointer);
    }
}

/// A CPU exception taken from user mode raises the matching signal on the
/// current process and does not return into the faulting context. From
/// kernel mode it is an invariant violation: panic (§7).
fn fault_in_user(frame: &InterruptStackFrame, sig: Signal, detail: &str) {
    if frame.cpl() == 3 {
        if let Some(pid) = scheduler::current_pid() {
            klog::warn!("user fault pid={} -> {:?} ({})", pid, sig, detail);
            signal::raise(pid, sig);
        }
    } else {
        crate::kpanic_msg(detail);
    }
}

mod exception_handlers {
    use super::*;

    pub extern "x86-interrupt" fn divide_error(f: InterruptStackFrame) {
        fault_in_user(&f, Signal::SIGFPE, "divide error");
    }
    pub extern "x86-interrupt" fn debug(_f: InterruptStackFrame) {}
    pub extern "x86-interrupt" fn nmi(_f: InterruptStackFrame) {
        crate::kpanic_msg("non-maskable interrupt");
    }
    pub extern "x86-interrupt" fn breakpoint(_f: InterruptStackFrame) {}
    pub extern "x86-interrupt" fn overflow(f: InterruptStackFrame) {
        fault_in_user(&f, Signal::SIGFPE, "overflow");
    }
    pub extern "x86-interrupt" fn bound_range_exceeded(f: InterruptStackFrame) {
        fault_in_user(&f, Signal::SIGSEGV, "bound range exceeded");
    }
    pub extern "x86-interrupt" fn invalid_opcode(f: InterruptStackFrame) {
        fault_in_user(&f, Signal::SIGILL, "invalid opcode");
    }
    pub extern "x86-interrupt" fn device_not_available(_f: InterruptStackFrame) {
        crate::kpanic_msg("device not available (no FPU lazy-switch support)");
    }
    pub extern "x86-interrupt" fn double_fault(_f: InterruptStackFrame, _ec: u32) {
        crate::kpanic_msg("double fault");
    }
    pub extern "x86-interrupt" fn invalid_tss(_f: InterruptStackFrame, _ec: u32) {
        crate::kpanic_msg("invalid TSS");
    }
    pub extern "x86-interrupt" fn segment_not_present(f: InterruptStackFrame, _ec: u32) {
        fault_in_user(&f, Signal::SIGSEGV, "segment not present");
    }
    pub extern "x86-interrupt" fn stack_segment_fault(f: InterruptStackFrame, _ec: u32) {
        fault_in_user(&f, Signal::SIGSEGV, "stack segment fault");
    }
    pub extern "x86-interrupt" fn general_protection_fault(f: InterruptStackFrame, _ec: u32) {
        fault_in_user(&f, Signal::SIGSEGV, "general protection fault");
    }
    pub extern "x86-interrupt" fn page_fault(f: InterruptStackFrame, ec: u32) {
        let cr2 = unsafe { read_cr2() };
        if f.cpl() == 3 {
            fault_in_user(&f, Signal::SIGSEGV, "page fault");
        } else {
            crate::kpanic_msg_fmt(format_args!(
                "page fault at {:#010x}, error code {:#x} (present={} write={} user={})",
                cr2,
                ec,
                ec & 1 != 0,
                ec & 2 != 0,
                ec & 4 != 0
            ));
        }
    }
    pub extern "x86-interrupt" fn x87_floating_point(f: InterruptStackFrame) {
        fault_in_user(&f, Signal::SIGFPE, "x87 floating point");
    }
    pub extern "x86-interrupt" fn alignment_check(f: InterruptStackFrame, _ec: u32) {
        fault_in_user(&f, Signal::SIGBUS, "alignment check");
    }
    pub extern "x86-interrupt" fn machine_check(_f: InterruptStackFrame) {
        crate::kpanic_msg("machine check");
    }
    pub extern "x86-interrupt" fn simd_floating_point(f: InterruptStackFrame) {
        fault_in_user(&f, Signal::SIGFPE, "SIMD floating point");
    }
}
