//! Multiboot entry point and the real (non-test) panic path. Everything
//! else lives in `kernel`'s `lib.rs` — this file only does what `main.rs`
//! cannot: the boot-time wiring that has to run exactly once, on the boot
//! stack `arch::boot`'s asm trampoline set up, before any process exists.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;

use kernel::arch::boot::{self, MultibootInfo};
use kernel::config;
use kernel::elf;
use kernel::fs;
use kernel::klog;
use kernel::mm;
use kernel::proc::{process, scheduler};

/// Reached from `arch::boot::multiboot_entry` with the Multiboot magic in
/// `magic` and a physical pointer to the info struct in `info_phys`.
/// Everything from here down runs on the private boot stack, with paging
/// still off.
#[unsafe(no_mangle)]
extern "C" fn kernel_entry(magic: u32, info_phys: u32) -> ! {
    if magic != boot::BOOTLOADER_MAGIC {
        kernel::kpanic_msg("not loaded by a Multiboot1-compliant loader");
    }
    let info = info_phys as *const MultibootInfo;

    let (mem_lower_kb, mem_upper_kb) =
        unsafe { MultibootInfo::mem_sizes_kb(info) }.unwrap_or_else(|| kernel::kpanic_msg("no Multiboot memory map"));
    let cmdline = unsafe { MultibootInfo::cmdline(info) };
    let module = unsafe { MultibootInfo::first_module(info) };

    config::set_boot_cmdline(cmdline);

    // The initramfs module, if GRUB supplied one, must stay out of the
    // frame allocator's hands: pmm::init only ever hands out frames above
    // `kernel_end_phys`, so folding the module's end into that boundary
    // reserves it the same way the kernel image itself is reserved.
    let kernel_end_phys = unsafe { &kernel_end as *const u8 as u32 };
    let reserved_end = match module {
        Some((_, end)) => kernel_end_phys.max(end),
        None => kernel_end_phys,
    };

    unsafe { kernel::arch::init() };
    unsafe {
        mm::init(mem_lower_kb, mem_upper_kb, reserved_end)
            .unwrap_or_else(|e| kernel::kpanic_msg_fmt(format_args!("mm::init failed: {}", e)));
    }

    klog::info!("memory: {} KiB lower, {} KiB upper, kernel ends at {:#010x}", mem_lower_kb, mem_upper_kb, kernel_end_phys);

    let idle_stack = vec![0u8; config::KERNEL_STACK_SIZE].into_boxed_slice();
    let idle_stack_top = Box::leak(idle_stack).as_ptr() as u32 + config::KERNEL_STACK_SIZE as u32;
    unsafe { kernel::proc::init(idle_stack_top) };

    let archive: &'static [u8] = match module {
        Some((start, end)) if end > start => unsafe {
            core::slice::from_raw_parts(start as *const u8, (end - start) as usize)
        },
        _ => kernel::kpanic_msg("no initramfs module supplied by the bootloader"),
    };
    fs::init(archive).unwrap_or_else(|e| kernel::kpanic_msg_fmt(format_args!("fs::init failed: {}", e)));
    let tty = fs::devfs::init_default_tty();
    let _ = tty;

    spawn_init();

    scheduler::reschedule();

    // Reached only once the system has nothing left runnable: this is the
    // idle path (see `proc::scheduler::reschedule`'s handling of an
    // outgoing context of `None` — the very first call above parks this
    // boot thread's own state as the scheduler's idle slot, so falling
    // idle later resumes right here).
    loop {
        kernel::arch::cr::enable_interrupts();
        kernel::arch::cr::halt();
    }
}

const INIT_PATH: &str = "/sbin/init";

/// Loads and spawns the first user process. Its image and argv come from
/// the initramfs mounted by `fs::init`; everything downstream (fork,
/// execve, exit/wait) is ordinary `syscall::dispatch` machinery from here
/// on — there is nothing special about pid 1 except that nothing reaped it.
fn spawn_init() {
    let node = fs::open(INIT_PATH, "/", false)
        .unwrap_or_else(|e| kernel::kpanic_msg_fmt(format_args!("cannot open {}: {}", INIT_PATH, e)));
    let size = node.metadata().size as usize;
    let mut image = vec![0u8; size];
    let read = node.read(0, &mut image).unwrap_or_else(|e| kernel::kpanic_msg_fmt(format_args!("cannot read {}: {}", INIT_PATH, e)));
    image.truncate(read);

    let loaded = elf::loader::load_image(&image, INIT_PATH, &[INIT_PATH], &[])
        .unwrap_or_else(|e| kernel::kpanic_msg_fmt(format_args!("cannot load {}: {}", INIT_PATH, e)));

    let proc_arc = process::create("init", 0, config::KERNEL_STACK_SIZE)
        .unwrap_or_else(|e| kernel::kpanic_msg_fmt(format_args!("cannot create init process: {}", e)));
    let pid = {
        let mut p = proc_arc.lock();
        p.address_space = loaded.address_space;
        p.user_entry = loaded.entry;
        p.user_stack_top = loaded.stack_top;
        p.heap_start = loaded.heap_start;
        p.heap_end = loaded.heap_start;
        p.cmdline = loaded.cmdline;
        if let Ok(tty) = fs::open("/dev/tty0", "/", false) {
            p.fds.init_stdio(tty);
        }
        p.pid
    };

    scheduler::spawn_entry(pid);
    scheduler::make_runnable(pid);
    klog::info!("spawned init as pid {}", pid);
}

unsafe extern "C" {
    /// Provided by `linker.ld`: the first byte past the kernel's own
    /// loaded sections, where frames become free for `mm::pmm` to hand out.
    static kernel_end: u8;
}

#[cfg(not(test))]
use core::panic::PanicInfo;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    kernel::kpanic_msg_fmt(format_args!("{}", info))
}
