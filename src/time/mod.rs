//! Timer service.
//!
//! One hardware one-shot multiplexed into an ordered delta queue: each
//! entry stores microseconds relative to its predecessor, so expiry
//! pops heads in O(1) and insertion walks in O(n). The ISR moves due
//! entries onto the expired list, rearms for the next head and wakes
//! the timer thread, which runs callbacks outside interrupt context.
//! Uptime accumulates at every arm/cancel boundary, monotone with
//! resolution bounded by interrupt latency.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arch;
use crate::error::KernelResult;
use crate::multitasking::sync::InterruptMonitor;
use crate::multitasking::thread;

pub type TimerCallback = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

pub struct TimerEvent {
    id: TimerId,
    /// Microseconds after the previous queue entry
    delta: u64,
    /// Original interval, for periodic rearming
    reset: u64,
    periodic: bool,
    callback: Option<TimerCallback>,
}

impl TimerEvent {
    pub fn id(&self) -> TimerId {
        self.id
    }
}

/// Mirror of the accumulated uptime, readable without the timer lock
/// (the scheduler charges accounting while holding its own lock)
static UPTIME_CACHE: AtomicU64 = AtomicU64::new(0);

pub struct TimerQueue {
    queue: VecDeque<TimerEvent>,
    expired: Vec<TimerEvent>,
    /// Hardware one-shot armed for the queue head
    running: bool,
    uptime: u64,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            expired: Vec::new(),
            running: false,
            uptime: 0,
            next_id: 1,
        }
    }

    /// Arm the one-shot for the head entry
    fn hw_set(&mut self) {
        if !self.running {
            if let Some(head) = self.queue.front() {
                self.running = true;
                arch::port().timer_set(head.delta);
            }
        }
    }

    /// Cancel the one-shot, folding the time it already ran into
    /// uptime and the head's remaining delta
    fn hw_clear(&mut self) {
        if self.running {
            self.running = false;
            let remaining = arch::port().timer_clear();
            if let Some(head) = self.queue.front_mut() {
                self.uptime += head.delta - remaining;
                head.delta = remaining;
                UPTIME_CACHE.store(self.uptime, Ordering::Release);
            }
        }
    }

    pub fn insert(&mut self, usec: u64, periodic: bool, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let mut event = TimerEvent {
            id,
            delta: usec,
            reset: usec,
            periodic,
            callback: Some(callback),
        };

        self.hw_clear();
        let mut index = 0;
        for next in self.queue.iter_mut() {
            if event.delta < next.delta {
                next.delta -= event.delta;
                break;
            }
            event.delta -= next.delta;
            index += 1;
        }
        self.queue.insert(index, event);
        self.hw_set();
        id
    }

    /// Re-insert a periodic event for its next interval
    fn restart(&mut self, mut event: TimerEvent) {
        event.delta = event.reset;
        self.hw_clear();
        let mut index = 0;
        let mut delta = event.delta;
        for next in self.queue.iter_mut() {
            if delta < next.delta {
                next.delta -= delta;
                break;
            }
            delta -= next.delta;
            index += 1;
        }
        event.delta = delta;
        self.queue.insert(index, event);
        self.hw_set();
    }

    /// Remove a pending event. Its remaining delta is folded into the
    /// successor so later deadlines stay put.
    pub fn remove(&mut self, id: TimerId) -> bool {
        self.hw_clear();
        let found = self.queue.iter().position(|e| e.id == id);
        if let Some(index) = found {
            let event = self.queue.remove(index).unwrap();
            if let Some(next) = self.queue.get_mut(index) {
                next.delta += event.delta;
            }
        }
        self.hw_set();
        found.is_some()
    }

    /// One-shot expiry, interrupt context: move every due entry to the
    /// expired list and rearm for the next head.
    pub fn expire(&mut self) {
        self.running = false;
        if let Some(mut head) = self.queue.pop_front() {
            self.uptime += head.delta;
            UPTIME_CACHE.store(self.uptime, Ordering::Release);
            head.delta = 0;
            self.expired.push(head);
            while self.queue.front().map_or(false, |e| e.delta == 0) {
                self.expired.push(self.queue.pop_front().unwrap());
            }
            self.hw_set();
        }
    }

    pub fn take_expired(&mut self) -> Vec<TimerEvent> {
        core::mem::take(&mut self.expired)
    }

    pub fn has_expired(&self) -> bool {
        !self.expired.is_empty()
    }

    /// Force an arm/cancel boundary and read the accumulated uptime
    pub fn sync_uptime(&mut self) -> u64 {
        self.hw_clear();
        let t = self.uptime;
        self.hw_set();
        t
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Absolute deadlines (relative to now) of pending events
    pub fn deadlines(&self) -> Vec<(TimerId, u64)> {
        let mut acc = 0;
        self.queue
            .iter()
            .map(|e| {
                acc += e.delta;
                (e.id, acc)
            })
            .collect()
    }
}

lazy_static::lazy_static! {
    static ref TIMERS: InterruptMonitor<TimerQueue> = InterruptMonitor::new(TimerQueue::new());
}

/// Arm a one-shot callback after `usec` microseconds
pub fn add(usec: u64, callback: TimerCallback) -> TimerId {
    let mut guard = TIMERS.enter();
    guard.insert(usec, false, callback)
}

/// Arm a periodic callback every `usec` microseconds
pub fn add_periodic(usec: u64, callback: TimerCallback) -> TimerId {
    let mut guard = TIMERS.enter();
    guard.insert(usec, true, callback)
}

/// Cancel a pending event
pub fn delete(id: TimerId) {
    let mut guard = TIMERS.enter();
    guard.remove(id);
}

/// Monotone microsecond uptime, synchronized against the hardware
pub fn uptime_us() -> u64 {
    let mut guard = TIMERS.enter();
    guard.sync_uptime()
}

/// Last synchronized uptime, readable from any context without
/// touching the timer lock
pub fn uptime_cached() -> u64 {
    UPTIME_CACHE.load(Ordering::Acquire)
}

/// One-shot expiry entry, called by the port from the timer ISR
pub fn on_expiry() {
    let mut guard = TIMERS.enter();
    guard.expire();
    if guard.has_expired() {
        TIMERS.broadcast(&mut guard);
    }
}

/// Body of the dedicated timer thread: sleep until the ISR hands over
/// expired entries, run their callbacks, rearm the periodic ones.
fn timer_thread_loop() -> ! {
    loop {
        let expired = {
            let mut guard = TIMERS.enter();
            while !guard.has_expired() {
                guard = TIMERS.wait(guard);
            }
            guard.take_expired()
        };
        for mut event in expired {
            if let Some(cb) = event.callback.as_mut() {
                cb();
            }
            if event.periodic {
                let mut guard = TIMERS.enter();
                guard.restart(event);
            }
        }
    }
}

struct SleepVar {
    done: AtomicBool,
    monitor: InterruptMonitor<()>,
}

/// Block the calling thread for `usec` microseconds
pub fn sleep(usec: u64) {
    let var = Arc::new(SleepVar {
        done: AtomicBool::new(false),
        monitor: InterruptMonitor::new(()),
    });
    let for_cb = var.clone();
    add(
        usec,
        Box::new(move || {
            for_cb.done.store(true, Ordering::Release);
            let mut guard = for_cb.monitor.enter();
            for_cb.monitor.broadcast(&mut guard);
        }),
    );

    let mut guard = var.monitor.enter();
    while !var.done.load(Ordering::Acquire) {
        guard = var.monitor.wait(guard);
    }
}

/// POSIX nanosleep over the microsecond sleep. The remainder, when
/// requested, is always reported as zero: the sleep never wakes early.
pub fn nanosleep(req_sec: u64, req_nsec: u32, rem: Option<&mut (u64, u32)>) -> KernelResult<()> {
    sleep(req_sec * 1_000_000 + (req_nsec as u64) / 1000);
    if let Some(rem) = rem {
        *rem = (0, 0);
    }
    Ok(())
}

/// Start the timer thread and the periodic uptime refresh
pub fn init() {
    match thread::fork().expect("forking timer thread") {
        crate::multitasking::ForkResult::Parent(tid) => {
            thread::set_name(tid, "timer");
        },
        crate::multitasking::ForkResult::Child => {
            timer_thread_loop();
        },
    }

    // Keep uptime live on an otherwise idle system: the arm/cancel
    // boundary every second folds elapsed time into the counter.
    add_periodic(1_000_000, Box::new(|| {}));
}
