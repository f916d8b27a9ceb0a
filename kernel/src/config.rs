//! Fixed addresses and sizes pinned by spec.md §3–§4. Kept as named
//! constants rather than inline literals, the way the teacher names
//! `HEAP_START`/`INITIAL_HEAP_SIZE` in `memory.rs` instead of repeating the
//! literal at each use site.

use alloc::string::{String, ToString};
use spin::Mutex;

pub const PAGE_SIZE: u32 = 4096;

// §3.2 virtual memory layout
pub const KERNEL_VIRTUAL_BASE: u32 = 0xC000_0000;
pub const KERNEL_HEAP_START: u32 = 0xC040_0000;
pub const KERNEL_HEAP_END: u32 = 0xCFFF_FFFF;
pub const USER_VIRTUAL_START: u32 = 0x0040_0000;
pub const USER_VIRTUAL_END: u32 = 0xBFFF_FFFF;
pub const IDENTITY_MAP_END: u32 = 0x0080_0000; // 8 MiB
pub const KERNEL_LINEAR_MAP_END: u32 = 0x0800_0000; // 128 MiB at 0xC0000000

pub const TEMP_MAP_VA: u32 = 0x007F_D000;
pub const PT_SCRATCH: u32 = 0x007F_E000;
pub const DYNLINK_SCRATCH_VA: u32 = 0x0080_0000;

// §3.3 process model
pub const KERNEL_STACK_SIZE: usize = 16384;
pub const MAX_PROCESSES: usize = 64;
pub const PROCESS_NAME_MAX: usize = 32;
pub const CMDLINE_MAX: usize = 256;
pub const CWD_MAX: usize = 256;
pub const MAX_FDS_PER_PROCESS: usize = 16;

// §4.E scheduler
pub const DEFAULT_TIME_SLICE: u32 = 10;
pub const MAX_AGING_SCORE: u32 = 32;
pub const SCHED_PRIORITY_LEVELS: usize = 8;
pub const SCHED_PRIORITY_MIN: u8 = 0;
pub const SCHED_PRIORITY_KERNEL: u8 = 0;
pub const SCHED_PRIORITY_DEFAULT: u8 = 3;

// §4.G file descriptors
pub const MAX_OPEN_FILES: usize = 256;

// §4.H ELF / dynamic linking
pub const USER_STACK_BASE: u32 = 0x0200_0000;
pub const DYNLINK_MIN_BASE: u32 = 0x0400_0000;
pub const DYNLINK_MAX_OBJECTS: usize = 8;
pub const USER_HEAP_BASE: u32 = 0x0300_0000;
pub const USER_STACK_PAGES: u32 = 2; // 8 KiB

// §4.I IPC
pub const SOCKET_RING_SIZE: usize = 8192;
pub const SOCKET_MAX_BACKLOG: usize = 32;
pub const SHM_ATTACH_BASE: u32 = 0xB000_0000;

// §4.A PMM
pub const PMM_MAX_FRAMES: usize = 128 * 1024; // 512 MiB worth of 4 KiB frames

/// The Multiboot1 command line string, stashed by `boot::init` from the
/// bootloader-provided info struct and surfaced read-only at
/// `/proc/cmdline` (§4.F).
static BOOT_CMDLINE: Mutex<String> = Mutex::new(String::new());

pub fn set_boot_cmdline(line: &str) {
    *BOOT_CMDLINE.lock() = line.to_string();
}

pub fn boot_cmdline() -> String {
    let line = BOOT_CMDLINE.lock();
    if line.is_empty() { String::new() } else { alloc::format!("{}\n", line) }
}
