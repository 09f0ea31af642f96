//! The thread scheduler.
//!
//! Three FIFO run queues, one per priority, guarded by a single
//! scheduler lock. `schedule` takes the head of the highest non-empty
//! queue and context-switches through the port, charging elapsed time
//! to the outgoing thread's accounting ring. Resuming a thread of
//! higher priority than the running one raises the preempt flag, which
//! the port consults on interrupt return.

use alloc::collections::VecDeque;
use alloc::string::String;
use core::sync::atomic::{AtomicBool, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use super::thread::{Priority, Thread, ThreadState, PRIORITIES, SLICE_US};
use super::ThreadId;
use crate::arch;

pub struct Scheduler {
    threads: HashMap<ThreadId, Thread>,
    queues: [VecDeque<ThreadId>; PRIORITIES],
    running: Option<ThreadId>,
    next_id: u64,
}

/// Set when a resumed thread outranks the running one; the port checks
/// and clears it on the next interrupt return.
static PREEMPT: AtomicBool = AtomicBool::new(false);

impl Scheduler {
    pub fn new() -> Self {
        Self {
            threads: HashMap::new(),
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            running: None,
            next_id: 1,
        }
    }

    pub fn running_id(&self) -> Option<ThreadId> {
        self.running
    }

    /// The running thread, or the calling context's identity when the
    /// scheduler is not tracking one (early boot, hosted tests)
    pub fn running_id_or_boot(&self) -> ThreadId {
        self.running.unwrap_or_else(untracked_id)
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    pub fn threads(&self) -> impl Iterator<Item = (&ThreadId, &Thread)> {
        self.threads.iter()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Register a new thread descriptor
    pub fn create_thread(
        &mut self, name: String, priority: Priority, process: Option<crate::process::Pid>,
    ) -> ThreadId {
        let tid = ThreadId::from_u64(self.next_id);
        self.next_id += 1;
        self.threads
            .insert(tid, Thread::new(tid, name, priority, process));
        tid
    }

    pub fn remove_thread(&mut self, tid: ThreadId) -> Option<Thread> {
        for queue in self.queues.iter_mut() {
            queue.retain(|&t| t != tid);
        }
        if self.running == Some(tid) {
            self.running = None;
        }
        self.threads.remove(&tid)
    }

    /// Queue a thread runnable at the tail of its priority queue
    fn enqueue_tail(&mut self, tid: ThreadId) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.state = ThreadState::Runnable;
            let queue = &mut self.queues[thread.priority.index()];
            if !queue.contains(&tid) {
                queue.push_back(tid);
            }
        }
    }

    /// Queue a thread runnable at the head of its priority queue
    /// (preemption puts the current thread back in front)
    fn enqueue_head(&mut self, tid: ThreadId) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.state = ThreadState::Runnable;
            let queue = &mut self.queues[thread.priority.index()];
            if !queue.contains(&tid) {
                queue.push_front(tid);
            }
        }
    }

    /// Head of the highest non-empty queue
    fn take_next(&mut self) -> Option<ThreadId> {
        for queue in self.queues.iter_mut() {
            if let Some(tid) = queue.pop_front() {
                return Some(tid);
            }
        }
        None
    }

    /// Priority of the running thread, for preemption comparisons
    fn running_priority(&self) -> Option<Priority> {
        let tid = self.running?;
        self.threads.get(&tid).map(|t| t.priority)
    }
}

lazy_static::lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// Identity of an execution context the scheduler is not tracking.
#[cfg(not(test))]
fn untracked_id() -> ThreadId {
    ThreadId::BOOT
}

/// Under the hosted test harness each host thread gets its own stable
/// identity, so lock ownership bookkeeping works across test threads.
#[cfg(test)]
fn untracked_id() -> ThreadId {
    use core::sync::atomic::AtomicU64;
    static NEXT: AtomicU64 = AtomicU64::new(0x1000_0000);
    std::thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::SeqCst);
    }
    ThreadId::from_u64(ID.with(|id| *id))
}

/// Register the boot stack as the first thread
pub fn init() {
    let mut sched = SCHEDULER.lock();
    let tid = sched.create_thread(String::from("boot"), Priority::Normal, None);
    debug_assert_eq!(tid, ThreadId::BOOT);
    let now = crate::time::uptime_cached();
    let thread = sched.thread_mut(tid).unwrap();
    thread.state = ThreadState::Running;
    thread.start_slot(now);
    sched.running = Some(tid);
}

pub fn current_thread_id() -> ThreadId {
    SCHEDULER.lock().running_id_or_boot()
}

/// The process of the current thread, if it belongs to one
pub fn current_process_id() -> Option<crate::process::Pid> {
    let mut sched = SCHEDULER.lock();
    let tid = sched.running_id_or_boot();
    sched.thread_mut(tid).and_then(|t| t.process)
}

/// Make a thread runnable at the tail of its queue. Raises the
/// preempt flag if it outranks the running thread.
pub fn resume(tid: ThreadId) {
    let mut sched = SCHEDULER.lock();
    let priority = match sched.thread_mut(tid) {
        Some(t) => t.priority,
        None => return,
    };
    sched.enqueue_tail(tid);
    if let Some(running) = sched.running_priority() {
        if running > priority {
            PREEMPT.store(true, Ordering::Release);
        }
    }
}

/// Resume only if the thread is sleeping. Returns false for stale
/// wakeups (e.g. a wait queue entry whose thread already timed out).
pub fn resume_if_sleeping(tid: ThreadId) -> bool {
    let mut sched = SCHEDULER.lock();
    match sched.thread_mut(tid) {
        Some(t) if t.state == ThreadState::Sleeping => {},
        _ => return false,
    }
    sched.enqueue_tail(tid);
    if let Some(running) = sched.running_priority() {
        if let Some(t) = sched.thread_mut(tid) {
            if running > t.priority {
                PREEMPT.store(true, Ordering::Release);
            }
        }
    }
    true
}

/// Mark the current thread sleeping (it must then call `schedule`)
pub fn block_current() {
    let mut sched = SCHEDULER.lock();
    if let Some(tid) = sched.running {
        if let Some(thread) = sched.thread_mut(tid) {
            thread.state = ThreadState::Sleeping;
        }
    }
}

/// Record which monitor the current thread is spinning on
pub fn set_waiting_for(monitor: Option<super::sync::MonitorId>) {
    let mut sched = SCHEDULER.lock();
    let tid = sched.running_id_or_boot();
    if let Some(thread) = sched.thread_mut(tid) {
        thread.waiting_for = monitor;
    }
}

pub fn waiting_for(tid: ThreadId) -> Option<super::sync::MonitorId> {
    SCHEDULER.lock().thread_mut(tid).and_then(|t| t.waiting_for)
}

/// Has a higher-priority thread been resumed since the last check?
pub fn take_preempt_flag() -> bool {
    PREEMPT.swap(false, Ordering::AcqRel)
}

#[cfg_attr(test, allow(dead_code))]
enum Decision {
    Continue,
    Switch(ThreadId),
    Nothing,
}

/// Pick and switch to the next runnable thread. Returns true if a
/// switch happened.
///
/// Under the hosted test harness there is no context to switch, so
/// this is a no-op; queue mechanics are tested on `Scheduler`
/// directly.
pub fn schedule() -> bool {
    #[cfg(test)]
    {
        return false;
    }
    #[cfg(not(test))]
    {
        schedule_inner()
    }
}

#[cfg_attr(test, allow(dead_code))]
fn schedule_inner() -> bool {
    loop {
        let decision = {
            let mut sched = SCHEDULER.lock();
            match sched.take_next() {
                Some(next) if Some(next) == sched.running => {
                    // Back to the same thread
                    if let Some(t) = sched.thread_mut(next) {
                        t.state = ThreadState::Running;
                    }
                    Decision::Continue
                },
                Some(next) => {
                    // Cached uptime: the timer lock must not nest
                    // inside the scheduler lock
                    let now = crate::time::uptime_cached();
                    if let Some(prev) = sched.running {
                        if let Some(t) = sched.thread_mut(prev) {
                            t.charge(now);
                        }
                    }
                    let thread = sched.thread_mut(next).expect("queued thread exists");
                    thread.state = ThreadState::Running;
                    thread.start_slot(now);
                    thread.preempt_at = now + SLICE_US;
                    sched.running = Some(next);
                    Decision::Switch(next)
                },
                None => Decision::Nothing,
            }
        };

        match decision {
            Decision::Continue => return false,
            Decision::Switch(next) => {
                arch::port().thread_switch(next);
                return true;
            },
            Decision::Nothing => {
                // Nothing runnable. On hardware, wait for an interrupt
                // to produce work; under the test harness there is no
                // interrupt source, so hand control straight back.
                #[cfg(test)]
                {
                    return false;
                }
                #[cfg(not(test))]
                {
                    arch::port().idle();
                }
            },
        }
    }
}

/// Give up the CPU, requeueing at the tail of our priority
pub fn yield_now() -> bool {
    {
        let mut sched = SCHEDULER.lock();
        if let Some(tid) = sched.running {
            sched.enqueue_tail(tid);
        }
    }
    schedule()
}

/// Preempt the current thread, requeueing at the head of its priority
pub fn preempt() -> bool {
    {
        let mut sched = SCHEDULER.lock();
        if let Some(tid) = sched.running {
            sched.enqueue_head(tid);
        }
    }
    schedule()
}

/// Timer-driven entry: preempt when the slice budget has run out
pub fn tick(now: u64) {
    let due = {
        let mut sched = SCHEDULER.lock();
        match sched.running {
            Some(tid) => sched
                .thread_mut(tid)
                .map_or(false, |t| now >= t.preempt_at),
            None => false,
        }
    };
    if due || take_preempt_flag() {
        preempt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;

    fn new_thread(sched: &mut Scheduler, name: &str, priority: Priority) -> ThreadId {
        sched.create_thread(String::from(name), priority, None)
    }

    #[test]
    fn queues_serve_highest_priority_first() {
        test_support::init();
        let mut sched = Scheduler::new();
        let idle = new_thread(&mut sched, "idle", Priority::Idle);
        let normal = new_thread(&mut sched, "normal", Priority::Normal);
        let intr = new_thread(&mut sched, "intr", Priority::Interrupt);
        sched.enqueue_tail(idle);
        sched.enqueue_tail(normal);
        sched.enqueue_tail(intr);

        assert_eq!(sched.take_next(), Some(intr));
        assert_eq!(sched.take_next(), Some(normal));
        assert_eq!(sched.take_next(), Some(idle));
        assert_eq!(sched.take_next(), None);
    }

    #[test]
    fn fifo_within_a_priority() {
        test_support::init();
        let mut sched = Scheduler::new();
        let a = new_thread(&mut sched, "a", Priority::Normal);
        let b = new_thread(&mut sched, "b", Priority::Normal);
        sched.enqueue_tail(a);
        sched.enqueue_tail(b);
        assert_eq!(sched.take_next(), Some(a));
        assert_eq!(sched.take_next(), Some(b));
    }

    #[test]
    fn enqueue_head_preempts_fifo_order() {
        test_support::init();
        let mut sched = Scheduler::new();
        let a = new_thread(&mut sched, "a", Priority::Normal);
        let b = new_thread(&mut sched, "b", Priority::Normal);
        sched.enqueue_tail(a);
        sched.enqueue_head(b);
        assert_eq!(sched.take_next(), Some(b));
    }

    #[test]
    fn double_enqueue_is_idempotent() {
        test_support::init();
        let mut sched = Scheduler::new();
        let a = new_thread(&mut sched, "a", Priority::Normal);
        sched.enqueue_tail(a);
        sched.enqueue_tail(a);
        assert_eq!(sched.take_next(), Some(a));
        assert_eq!(sched.take_next(), None);
    }

    #[test]
    fn remove_thread_purges_queues() {
        test_support::init();
        let mut sched = Scheduler::new();
        let a = new_thread(&mut sched, "a", Priority::Normal);
        sched.enqueue_tail(a);
        assert!(sched.remove_thread(a).is_some());
        assert_eq!(sched.take_next(), None);
    }

    #[test]
    fn untracked_contexts_get_stable_distinct_ids() {
        let here = current_thread_id();
        assert_eq!(here, current_thread_id());
        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, other);
    }
}
