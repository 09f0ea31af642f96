//! Hardware interrupt fan-out.
//!
//! One hardware IRQ demultiplexes into any number of registered
//! handlers, invoked in registration order under the line's lock.
//! Registration returns a hook that unregisters on drop. The port's
//! ISR stub calls [`dispatch`], which runs the handlers and then
//! issues end-of-interrupt.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::arch;

pub const IRQ_MAX: usize = 16;

pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

struct Registration {
    id: u64,
    handler: IrqHandler,
}

struct IrqLine {
    handlers: Mutex<Vec<Registration>>,
}

lazy_static::lazy_static! {
    static ref LINES: [IrqLine; IRQ_MAX] = {
        // Const-init would need Vec::new in a const array expression
        [(); IRQ_MAX].map(|_| IrqLine { handlers: Mutex::new(Vec::new()) })
    };
}

static NEXT_HOOK: AtomicU64 = AtomicU64::new(1);

/// Keeps a handler registered; dropping it unregisters
pub struct HandlerHook {
    irq: u8,
    id: u64,
}

impl Drop for HandlerHook {
    fn drop(&mut self) {
        let mut handlers = LINES[self.irq as usize].handlers.lock();
        handlers.retain(|r| r.id != self.id);
    }
}

/// Register a handler for `irq`, behind any already registered
pub fn register(irq: u8, handler: IrqHandler) -> HandlerHook {
    assert!((irq as usize) < IRQ_MAX);
    let id = NEXT_HOOK.fetch_add(1, Ordering::Relaxed);
    LINES[irq as usize]
        .handlers
        .lock()
        .push(Registration { id, handler });
    HandlerHook { irq, id }
}

/// ISR entry: run every handler registered for `irq` in order, then
/// signal end-of-interrupt
pub fn dispatch(irq: u8) {
    if (irq as usize) < IRQ_MAX {
        let handlers = LINES[irq as usize].handlers.lock();
        for registration in handlers.iter() {
            (registration.handler)();
        }
    }
    arch::port().end_of_interrupt(irq);
}
