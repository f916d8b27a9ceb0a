//! IRQ dispatch table driving §4.D ("the timer interrupt call into the
//! scheduler; other device IRQs call a registered handler function pointer,
//! or are otherwise ignored"). One named stub per vector, since
//! `extern "x86-interrupt"` handlers are not passed their own vector number.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::idt::InterruptStackFrame;
use crate::arch::pic;

pub type IrqHandler = fn();

const NONE: Option<IrqHandler> = None;
static mut HANDLERS: [Option<IrqHandler>; 16] = [NONE; 16];

/// Set by the tick handler when a reschedule is due; `dispatch` checks it
/// after EOI and before `iret`, never mid-handler, so handlers never nest
/// into a switch.
static RESCHEDULE_PENDING: AtomicBool = AtomicBool::new(false);

pub fn register(irq: u8, handler: IrqHandler) {
    unsafe {
        HANDLERS[irq as usize] = Some(handler);
    }
    pic::unmask(irq);
}

fn dispatch(irq: u8) {
    if irq == pic::IRQ_TIMER {
        crate::arch::pit::on_tick();
        if crate::proc::scheduler::tick() {
            RESCHEDULE_PENDING.store(true, Ordering::Relaxed);
        }
    } else if let Some(handler) = unsafe { HANDLERS[irq as usize] } {
        handler();
    }

    pic::send_eoi(irq);

    crate::proc::signal::check_current();

    if RESCHEDULE_PENDING.swap(false, Ordering::Relaxed) {
        crate::proc::scheduler::reschedule();
    }
}

macro_rules! irq_stub {
    ($name:ident, $irq:expr) => {
        pub extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            dispatch($irq);
        }
    };
}

irq_stub!(irq0, 0);
irq_stub!(irq1, 1);
irq_stub!(irq2, 2);
irq_stub!(irq3, 3);
irq_stub!(irq4, 4);
irq_stub!(irq5, 5);
irq_stub!(irq6, 6);
irq_stub!(irq7, 7);
irq_stub!(irq8, 8);
irq_stub!(irq9, 9);
irq_stub!(irq10, 10);
irq_stub!(irq11, 11);
irq_stub!(irq12, 12);
irq_stub!(irq13, 13);
irq_stub!(irq14, 14);
irq_stub!(irq15, 15);

pub const STUBS: [extern "x86-interrupt" fn(InterruptStackFrame); 16] = [
    irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13, irq14, irq15,
];
