//! Multiboot1 header and protected-mode entry trampoline (§6.1). GRUB reads
//! the header embedded in `.multiboot_header`, loads the flat image at
//! `KERNEL_LOAD_ADDRESS`, and jumps to `multiboot_entry` with EAX holding
//! the Multiboot magic and EBX a physical pointer to the info struct. The
//! teacher has no equivalent of this at all — its `bootloader_api`
//! dependency does this entirely off-core — so the header and trampoline
//! below are written straight from the Multiboot Specification rather than
//! generalized from teacher code; only the "hand-rolled naked entry calling
//! into Rust" shape carries over from how `arch::context_switch` and
//! `arch::syscall_entry` are built.

use core::arch::global_asm;
use core::ffi::CStr;

/// What Multiboot-compliant loaders place in EAX on entry.
pub const BOOTLOADER_MAGIC: u32 = 0x2BADB002;

const HEADER_MAGIC: u32 = 0x1BADB002;
/// `ALIGN` (bit 0, page-align modules) + `MEMINFO` (bit 1, ask for
/// `mem_lower`/`mem_upper`).
const HEADER_FLAGS: u32 = 0x0000_0003;
const BOOT_STACK_SIZE: u32 = 16384;

global_asm!(
    ".section .multiboot_header, \"a\"",
    ".align 4",
    ".long {magic}",
    ".long {flags}",
    ".long -({magic} + {flags})",
    magic = const HEADER_MAGIC,
    flags = const HEADER_FLAGS,
);

global_asm!(
    ".section .boot.bss, \"aw\", @nobits",
    ".align 16",
    "boot_stack_bottom:",
    ".skip {size}",
    "boot_stack_top:",
    size = const BOOT_STACK_SIZE,
);

// GRUB drops us in 32-bit protected mode with paging disabled, a GDT the
// spec says nothing about beyond "flat", and no stack of our own. This sets
// up a private boot stack and calls into Rust with the two registers the
// loader promised, cdecl-style (pushed right-to-left, caller doesn't clean
// up because `kernel_entry` never returns). `kernel_entry` is provided by
// `main.rs` — the bin crate's own entry point, linked in from the lib this
// module lives in.
global_asm!(
    ".section .boot.text, \"ax\"",
    ".global multiboot_entry",
    "multiboot_entry:",
    "mov esp, boot_stack_top",
    "push ebx", // multiboot info pointer
    "push eax", // multiboot magic
    "call kernel_entry",
    "1:",
    "cli",
    "hlt",
    "jmp 1b",
);

/// `Elf32_Dyn`-style flags into the Multiboot1 info struct (Multiboot
/// Specification 0.6.96 §3.3). Only the fields this kernel reads are named;
/// the rest are kept as padding so the layout still matches.
#[repr(C)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    _syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
    _rest: [u32; 6],
}

#[repr(C)]
pub struct ModuleEntry {
    pub mod_start: u32,
    pub mod_end: u32,
    pub string: u32,
    pub reserved: u32,
}

const FLAG_MEM: u32 = 1 << 0;
const FLAG_CMDLINE: u32 = 1 << 2;
const FLAG_MODS: u32 = 1 << 3;

impl MultibootInfo {
    /// # Safety
    /// `info` must point at a Multiboot1 info struct still valid at the
    /// physical address GRUB left it — true only before paging changes what
    /// that address means, i.e. before `mm::vmm::init` runs.
    pub unsafe fn mem_sizes_kb(info: *const MultibootInfo) -> Option<(u32, u32)> {
        let info = unsafe { &*info };
        if info.flags & FLAG_MEM == 0 {
            return None;
        }
        Some((info.mem_lower, info.mem_upper))
    }

    /// # Safety
    /// Same as [`Self::mem_sizes_kb`]; additionally the command line bytes
    /// must be valid UTF-8 (GRUB's own cmdline pass-through always is, in
    /// practice — a non-UTF-8 line is reported as empty rather than
    /// trusted).
    pub unsafe fn cmdline(info: *const MultibootInfo) -> &'static str {
        let info = unsafe { &*info };
        if info.flags & FLAG_CMDLINE == 0 || info.cmdline == 0 {
            return "";
        }
        unsafe { CStr::from_ptr(info.cmdline as *const i8) }.to_str().unwrap_or("")
    }

    /// Physical `[start, end)` of the first boot module (the initramfs
    /// archive, by convention — this kernel never asks GRUB to load more
    /// than one), if any was supplied.
    ///
    /// # Safety
    /// Same as [`Self::mem_sizes_kb`].
    pub unsafe fn first_module(info: *const MultibootInfo) -> Option<(u32, u32)> {
        let info = unsafe { &*info };
        if info.flags & FLAG_MODS == 0 || info.mods_count == 0 {
            return None;
        }
        let module = unsafe { &*(info.mods_addr as *const ModuleEntry) };
        Some((module.mod_start, module.mod_end))
    }
}
