//! A port implementation for hosted unit tests.
//!
//! Physical frames are lazily-allocated byte boxes, the one-shot is a
//! remaining-microseconds cell the test advances by hand, and thread
//! operations record their arguments instead of switching anything.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use hashbrown::HashMap;
use spin::{Mutex, Once};

use super::{ForkSide, Port};
use crate::memory::addr::{PageFrame, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::multitasking::ThreadId;

pub struct TestPort {
    frames: Mutex<HashMap<u32, Box<[u8; PAGE_SIZE as usize]>>>,
    oneshot: Mutex<Option<u64>>,
    interrupts_enabled: AtomicBool,
    fork_script: Mutex<VecDeque<ForkSide>>,
    switches: Mutex<Vec<ThreadId>>,
    invalidations: Mutex<Vec<VirtAddr>>,
    roots: Mutex<Vec<PhysAddr>>,
    eoi: Mutex<Vec<u8>>,
}

impl TestPort {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            oneshot: Mutex::new(None),
            interrupts_enabled: AtomicBool::new(true),
            fork_script: Mutex::new(VecDeque::new()),
            switches: Mutex::new(Vec::new()),
            invalidations: Mutex::new(Vec::new()),
            roots: Mutex::new(Vec::new()),
            eoi: Mutex::new(Vec::new()),
        }
    }

    /// Advance the virtual one-shot by `usec`. Returns true if it
    /// expired, in which case the caller is expected to deliver
    /// `time::on_expiry` like the ISR would.
    pub fn elapse(&self, usec: u64) -> bool {
        let mut slot = self.oneshot.lock();
        match slot.take() {
            Some(rem) if rem <= usec => true,
            Some(rem) => {
                *slot = Some(rem - usec);
                false
            },
            None => false,
        }
    }

    /// Remaining microseconds on the armed one-shot, if any
    pub fn oneshot_remaining(&self) -> Option<u64> {
        *self.oneshot.lock()
    }

    /// Queue the outcome of the next `thread_fork` call
    pub fn script_fork(&self, side: ForkSide) {
        self.fork_script.lock().push_back(side);
    }

    pub fn recorded_switches(&self) -> Vec<ThreadId> {
        self.switches.lock().clone()
    }

    pub fn recorded_invalidations(&self) -> usize {
        self.invalidations.lock().len()
    }

    pub fn recorded_eoi(&self) -> Vec<u8> {
        self.eoi.lock().clone()
    }
}

impl Port for TestPort {
    fn interrupt_mask(&self) -> bool {
        self.interrupts_enabled.swap(false, Ordering::SeqCst)
    }

    fn interrupt_restore(&self, enabled: bool) {
        self.interrupts_enabled.store(enabled, Ordering::SeqCst);
    }

    fn idle(&self) {
        core::hint::spin_loop();
    }

    fn set_translation_root(&self, root: PhysAddr) {
        self.roots.lock().push(root);
    }

    fn invalidate_page(&self, va: VirtAddr) {
        self.invalidations.lock().push(va);
    }

    fn frame_ptr(&self, frame: PageFrame) -> *mut u8 {
        let mut frames = self.frames.lock();
        let buf = frames
            .entry(frame.number())
            .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
        buf.as_mut_ptr()
    }

    fn timer_set(&self, usec: u64) {
        *self.oneshot.lock() = Some(usec);
    }

    fn timer_clear(&self) -> u64 {
        self.oneshot.lock().take().unwrap_or(0)
    }

    fn thread_switch(&self, to: ThreadId) {
        self.switches.lock().push(to);
    }

    fn thread_fork(&self, _child: ThreadId) -> ForkSide {
        self.fork_script
            .lock()
            .pop_front()
            .unwrap_or(ForkSide::Parent)
    }

    fn thread_finalize(&self, _thread: ThreadId) {}

    fn backtrace(&self, _buf: &mut [u32]) -> usize {
        0
    }

    fn start_user(&self, entry: VirtAddr, stack: VirtAddr) -> ! {
        panic!("start_user({}, {}) on TestPort", entry, stack);
    }

    fn end_of_interrupt(&self, irq: u8) {
        self.eoi.lock().push(irq);
    }
}

/// Install (once) and return the shared test port.
pub fn init() -> &'static TestPort {
    static INSTANCE: Once<TestPort> = Once::new();
    let port = INSTANCE.call_once(TestPort::new);
    super::install(port);
    port
}
