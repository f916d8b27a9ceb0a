//! 8254 PIT, the tick source behind §4.D ("a platform timer interrupt fires
//! at a fixed, configurable frequency; each tick calls into the scheduler").
//! Mirrors the teacher's `lapic.rs` timer setup in shape (program a divisor,
//! count ticks in a global, expose a frequency getter) but over the legacy
//! PIT rather than the local APIC timer, since this target has no APIC.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::port::outb;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_BASE_FREQUENCY: u32 = 1_193_182;

/// §4.D's default tick rate: 100 Hz, a 10ms quantum matching
/// `DEFAULT_TIME_SLICE` ticks of 10 each giving ~100ms slices by default.
pub const FREQUENCY_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// # Safety
/// Must run once during boot, before unmasking IRQ0.
pub unsafe fn init() {
    let divisor = (PIT_BASE_FREQUENCY / FREQUENCY_HZ).clamp(1, 0xFFFF);
    unsafe {
        outb(PIT_COMMAND, 0x36); // channel 0, lobyte/hibyte, rate generator
        outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0, ((divisor >> 8) & 0xFF) as u8);
    }
}

pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn get_frequency() -> u32 {
    FREQUENCY_HZ
}

/// Milliseconds since boot, derived from the tick count rather than kept as
/// a second counter, so the two can never drift apart.
pub fn uptime_ms() -> u64 {
    get_ticks() * 1000 / FREQUENCY_HZ as u64
}
