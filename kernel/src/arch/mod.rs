//! Hand-written i386 primitives: port I/O, control registers, GDT/TSS, IDT,
//! PIC, PIT, and the context-switch/user-entry asm stubs. Everything in
//! here exists because the 64-bit `x86_64` crate the teacher depends on
//! cannot target this protected-mode IA-32 core; each module is the small,
//! narrow-FFI replacement DESIGN NOTES calls for.

pub mod boot;
pub mod context_switch;
pub mod cr;
pub mod gdt;
pub mod idt;
pub mod irq;
pub mod pic;
pub mod pit;
pub mod port;
pub mod syscall_entry;

/// Brings the CPU up to the point the rest of the kernel assumes in §6.1:
/// GDT/TSS loaded, IDT loaded, PIC remapped and IRQ0 (timer) unmasked,
/// interrupts enabled.
///
/// # Safety
/// Must run exactly once, early in `kernel_main`, before any code that
/// touches interrupts, the TSS, or paging.
pub unsafe fn init() {
    unsafe {
        gdt::init();
        idt::init();
        pic::init();
        pit::init();
        pic::unmask(pic::IRQ_TIMER);
        cr::enable_interrupts();
    }
}
