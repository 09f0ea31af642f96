//! Kernel threads.
//!
//! A thread is a schedulable context with a priority, thread-local
//! storage, a CPU-accounting ring and a monitor its joiners sleep on.
//! `fork` clones the calling thread so that the clone appears to
//! return from the same call; `exit` parks the thread as terminated
//! until a joiner has read its return value.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use super::scheduler::{self, SCHEDULER};
use super::sync::Monitor;
use super::ThreadId;
use crate::arch::{self, ForkSide};
use crate::error::{KernelError, KernelResult};
use crate::memory::arena::{self, Arena};
use crate::process::Pid;

/// Thread-local storage slots per thread
pub const TLS_MAX: usize = 32;
/// Entries in the CPU accounting ring
pub const ACCT_RING: usize = 64;
/// Default preemption budget: 100 ms
pub const SLICE_US: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    New,
    Runnable,
    Running,
    Sleeping,
    Terminated,
}

/// Scheduling class; lower value is served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Interrupt = 0,
    Normal = 1,
    Idle = 2,
}

pub const PRIORITIES: usize = 3;

impl Priority {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// One slice of CPU time charged to a thread
#[derive(Debug, Clone, Copy, Default)]
pub struct AcctSlot {
    pub start: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkResult {
    /// In the creating thread
    Parent(ThreadId),
    /// In the created thread
    Child,
}

pub struct Thread {
    pub id: ThreadId,
    pub name: String,
    pub process: Option<Pid>,
    pub priority: Priority,
    pub state: ThreadState,
    /// Set by a timed-out wait; checked and reset by the waiter
    pub interrupted: bool,
    /// Monitor this thread is currently trying to acquire, for the
    /// deadlock watchdog
    pub waiting_for: Option<super::sync::MonitorId>,
    pub retval: usize,
    /// Broadcast on exit; joiners wait here
    pub exit_monitor: Arc<Monitor>,
    tls: [usize; TLS_MAX],
    accts: [AcctSlot; ACCT_RING],
    acct: usize,
    /// Uptime after which the running thread should be preempted
    pub preempt_at: u64,
    /// Thread-local scratch arena, returned to the pool on death
    pub scratch: Option<Arena>,
}

impl Thread {
    pub fn new(id: ThreadId, name: String, priority: Priority, process: Option<Pid>) -> Self {
        Self {
            id,
            name,
            process,
            priority,
            state: ThreadState::New,
            interrupted: false,
            waiting_for: None,
            retval: 0,
            exit_monitor: Arc::new(Monitor::new()),
            tls: [0; TLS_MAX],
            accts: [AcctSlot::default(); ACCT_RING],
            acct: 0,
            preempt_at: 0,
            scratch: None,
        }
    }

    /// Close the current accounting slot at `now` and open the next
    pub fn charge(&mut self, now: u64) {
        self.accts[self.acct].len = now.saturating_sub(self.accts[self.acct].start);
        self.acct = (self.acct + 1) % ACCT_RING;
    }

    /// Open an accounting slot at `now`
    pub fn start_slot(&mut self, now: u64) {
        self.accts[self.acct].start = now;
        self.accts[self.acct].len = 0;
    }

    /// CPU time consumed during the last second before `now`
    pub fn usage_since(&self, now: u64) -> u64 {
        let from = now.saturating_sub(1_000_000);
        let mut sum = 0;
        for slot in self.accts.iter() {
            let end = slot.start + slot.len;
            if slot.start > from {
                sum += end - slot.start;
            } else if end > from {
                sum += end - from;
            }
        }
        sum
    }
}

static TLS_NEXT: AtomicU32 = AtomicU32::new(1);

/// Allocate a fresh TLS key
pub fn tls_key() -> u32 {
    TLS_NEXT.fetch_add(1, Ordering::SeqCst)
}

/// Store a value in the current thread's TLS slot
pub fn tls_set(key: u32, value: usize) -> KernelResult<()> {
    if key == 0 || key as usize >= TLS_MAX {
        return Err(KernelError::IntBounds);
    }
    let mut sched = SCHEDULER.lock();
    let tid = sched.running_id_or_boot();
    match sched.thread_mut(tid) {
        Some(thread) => {
            thread.tls[key as usize] = value;
            Ok(())
        },
        None => Err(KernelError::NoProcess),
    }
}

pub fn tls_get(key: u32) -> KernelResult<usize> {
    if key == 0 || key as usize >= TLS_MAX {
        return Err(KernelError::IntBounds);
    }
    let mut sched = SCHEDULER.lock();
    let tid = sched.running_id_or_boot();
    match sched.thread_mut(tid) {
        Some(thread) => Ok(thread.tls[key as usize]),
        None => Err(KernelError::NoProcess),
    }
}

/// Fork the current thread. The clone shares the caller's call chain;
/// it observes `ForkResult::Child` where the caller observes
/// `ForkResult::Parent`.
pub fn fork() -> KernelResult<ForkResult> {
    let process = scheduler::current_process_id();
    fork_into(process)
}

/// Fork the current thread into the given process (used by process
/// fork, where the child thread belongs to the new process)
pub fn fork_into(process: Option<Pid>) -> KernelResult<ForkResult> {
    let child = {
        let mut sched = SCHEDULER.lock();
        let me = sched.running_id_or_boot();
        let (priority, name) = match sched.thread_mut(me) {
            Some(t) => (t.priority, alloc::format!("child of {}", t.name)),
            None => (Priority::Normal, String::from("child of boot")),
        };
        sched.create_thread(name, priority, process)
    };

    match arch::port().thread_fork(child) {
        ForkSide::Parent => {
            scheduler::resume(child);
            Ok(ForkResult::Parent(child))
        },
        ForkSide::Child => Ok(ForkResult::Child),
    }
}

/// Exit the current thread, waking joiners. Never returns.
pub fn exit(retval: usize) -> ! {
    let monitor = {
        let mut sched = SCHEDULER.lock();
        let me = sched.running_id_or_boot();
        let thread = sched.thread_mut(me).expect("exiting unknown thread");
        thread.retval = retval;
        thread.state = ThreadState::Terminated;
        if let Some(scratch) = thread.scratch.take() {
            arena::give(scratch);
        }
        let monitor = thread.exit_monitor.clone();
        let process = thread.process.take();
        drop(sched);
        if let Some(pid) = process {
            crate::process::detach_thread(pid, me);
        }
        monitor
    };

    {
        let guard = monitor.enter();
        monitor.broadcast(&guard);
    }

    loop {
        scheduler::schedule();
        arch::port().idle();
    }
}

/// Wait for a thread to terminate and reap its return value
pub fn join(target: ThreadId) -> KernelResult<usize> {
    let monitor = SCHEDULER
        .lock()
        .thread_mut(target)
        .map(|t| t.exit_monitor.clone())
        .ok_or(KernelError::NoProcess)?;

    {
        let guard = monitor.enter();
        loop {
            let state = SCHEDULER.lock().thread_mut(target).map(|t| t.state);
            match state {
                Some(ThreadState::Terminated) | None => break,
                _ => monitor.wait(&guard),
            }
        }
    }

    // The thread is recovered only now, after retval is read
    let mut sched = SCHEDULER.lock();
    let retval = sched
        .thread_mut(target)
        .map(|t| t.retval)
        .ok_or(KernelError::NoProcess)?;
    sched.remove_thread(target);
    arch::port().thread_finalize(target);
    Ok(retval)
}

/// Mark a thread interrupted (timeout path)
pub fn interrupt(tid: ThreadId) {
    if let Some(thread) = SCHEDULER.lock().thread_mut(tid) {
        thread.interrupted = true;
    }
}

/// Check and reset the current thread's interrupted flag
pub fn take_interrupted() -> bool {
    let mut sched = SCHEDULER.lock();
    let tid = sched.running_id_or_boot();
    match sched.thread_mut(tid) {
        Some(thread) => core::mem::replace(&mut thread.interrupted, false),
        None => false,
    }
}

pub fn set_name(tid: ThreadId, name: &str) {
    if let Some(thread) = SCHEDULER.lock().thread_mut(tid) {
        thread.name = String::from(name);
    }
}

/// Take (or lazily build) the current thread's scratch arena
pub fn with_scratch_arena<T>(f: impl FnOnce(&mut Arena) -> T) -> T {
    let mut taken = {
        let mut sched = SCHEDULER.lock();
        let tid = sched.running_id_or_boot();
        sched.thread_mut(tid).and_then(|t| t.scratch.take())
    };
    let mut arena = taken.take().unwrap_or_else(arena::take);
    let out = f(&mut arena);
    let mut sched = SCHEDULER.lock();
    let tid = sched.running_id_or_boot();
    match sched.thread_mut(tid) {
        Some(thread) => thread.scratch = Some(arena),
        None => arena::give(arena),
    }
    out
}

/// Log per-thread CPU usage over the last second
pub fn report_usage() {
    let now = crate::time::uptime_us();
    let mut sched = SCHEDULER.lock();
    if let Some(running) = sched.running_id() {
        if let Some(thread) = sched.thread_mut(running) {
            thread.charge(now);
            thread.start_slot(now);
        }
    }
    for (_, thread) in sched.threads() {
        let percent = 100 * thread.usage_since(now) / 1_000_000;
        log::info!("{}: {}%", thread.name, percent);
    }
}

/// Backtrace of the current thread, resolved against the boot symbol
/// table when available
pub fn backtrace() {
    let mut buf = [0u32; 16];
    let depth = arch::port().backtrace(&mut buf);
    for addr in &buf[..depth] {
        match crate::debug::symbols::lookup(*addr) {
            Some((name, offset)) => log::error!("  {:#010x} {}+{:#x}", addr, name, offset),
            None => log::error!("  {:#010x}", addr),
        }
    }
}
