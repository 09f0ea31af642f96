//! Processes and containers.
//!
//! A process owns an address space, a descriptor table, a thread set
//! and its root/working directories. `fork` clones the address space
//! copy-on-write and shares file handles; `exit` leaves a zombie until
//! the parent reaps it with `waitpid`. Containers are pid namespaces;
//! the root container exists from boot.

pub mod elf;
pub mod uaccess;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use hashbrown::{HashMap, HashSet};
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::filesystem::file::FdTable;
use crate::filesystem::vnode::Vnode;
use crate::filesystem::path;
use crate::memory::paging;
use crate::memory::prelude::VirtAddr;
use crate::memory::segment::AddressSpace;
use crate::multitasking::sync::Monitor;
use crate::multitasking::thread::{self, ForkResult};
use crate::multitasking::{scheduler, ThreadId};

/// Process identifier, unique within its container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Terminated, holding its status until reaped
    Zombie(i32),
}

pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    aspace: Arc<AddressSpace>,
    pub files: FdTable,
    pub threads: HashSet<ThreadId>,
    pub root: Arc<Vnode>,
    pub cwd: Arc<Vnode>,
    pub state: ProcessState,
    /// Base and current end of the heap segment, when one exists
    pub heap_base: Option<VirtAddr>,
    pub heap_end: VirtAddr,
    /// Signalled each time one of this process's children exits
    child_monitor: Arc<Monitor>,
    /// Broadcast when this process terminates
    term_monitor: Arc<Monitor>,
}

pub type ProcessRef = Arc<Mutex<Process>>;

impl Process {
    pub fn address_space(&self) -> Arc<AddressSpace> {
        self.aspace.clone()
    }

    /// Swap in a fresh address space (exec commit point)
    pub fn install_exec(
        &mut self, aspace: Arc<AddressSpace>, heap_base: VirtAddr, heap_end: VirtAddr,
    ) {
        self.aspace = aspace;
        self.heap_base = Some(heap_base);
        self.heap_end = heap_end;
    }
}

/// A pid namespace
pub struct Container {
    next_pid: u32,
    processes: HashMap<Pid, ProcessRef>,
}

impl Container {
    fn new() -> Self {
        Self {
            next_pid: 1,
            processes: HashMap::new(),
        }
    }

    /// Next free pid, scanning past still-live values
    fn allocate_pid(&mut self) -> Pid {
        loop {
            let pid = Pid(self.next_pid);
            self.next_pid = self.next_pid.wrapping_add(1).max(1);
            if !self.processes.contains_key(&pid) {
                return pid;
            }
        }
    }
}

lazy_static::lazy_static! {
    /// The root container; additional containers are possible but the
    /// core only ever builds this one
    static ref ROOT_CONTAINER: Mutex<Container> = Mutex::new(Container::new());
}

pub fn init() {
    lazy_static::initialize(&ROOT_CONTAINER);
}

/// Register a new process in the root container
pub fn create(
    parent: Option<Pid>, aspace: Arc<AddressSpace>, files: FdTable, root: Arc<Vnode>,
    cwd: Arc<Vnode>,
) -> ProcessRef {
    let mut container = ROOT_CONTAINER.lock();
    let pid = container.allocate_pid();
    let process = Arc::new(Mutex::new(Process {
        pid,
        parent,
        aspace,
        files,
        threads: HashSet::new(),
        root,
        cwd,
        state: ProcessState::Running,
        heap_base: None,
        heap_end: VirtAddr::zero(),
        child_monitor: Arc::new(Monitor::new()),
        term_monitor: Arc::new(Monitor::new()),
    }));
    container.processes.insert(pid, process.clone());
    process
}

pub fn by_pid(pid: Pid) -> Option<ProcessRef> {
    ROOT_CONTAINER.lock().processes.get(&pid).cloned()
}

#[cfg(test)]
pub(crate) fn test_remove(pid: Pid) {
    ROOT_CONTAINER.lock().processes.remove(&pid);
}

/// The process of the calling thread
pub fn current() -> Option<ProcessRef> {
    scheduler::current_process_id().and_then(by_pid)
}

/// Fork the given process: clone its segments copy-on-write, share its
/// file handles, and fork the calling thread into the child.
pub fn fork_from(parent: &ProcessRef) -> KernelResult<ForkOutcome> {
    // Snapshot under the parent lock, register the child outside it:
    // the container lock nests inside no process lock
    let (parent_pid, child_aspace, files, root, cwd, heap_base, heap_end) = {
        let p = parent.lock();
        (
            p.pid,
            p.aspace.clone_for_fork(paging::new_asid())?,
            p.files.clone_for_fork(),
            p.root.clone(),
            p.cwd.clone(),
            p.heap_base,
            p.heap_end,
        )
    };
    let child = create(Some(parent_pid), Arc::new(child_aspace), files, root, cwd);
    let child_pid = {
        let mut c = child.lock();
        c.heap_base = heap_base;
        c.heap_end = heap_end;
        c.pid
    };

    match thread::fork_into(Some(child_pid))? {
        ForkResult::Parent(tid) => {
            child.lock().threads.insert(tid);
            Ok(ForkOutcome::Parent(child_pid))
        },
        ForkResult::Child => Ok(ForkOutcome::Child),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    Parent(Pid),
    Child,
}

/// POSIX fork for the calling thread's process
pub fn fork() -> KernelResult<ForkOutcome> {
    let process = current().ok_or(KernelError::NoProcess)?;
    fork_from(&process)
}

/// Remove a dead thread from its process (thread exit path)
pub fn detach_thread(pid: Pid, tid: ThreadId) {
    if let Some(process) = by_pid(pid) {
        process.lock().threads.remove(&tid);
    }
}

/// Turn a process into a zombie: close descriptors, release the
/// address space, keep only the status. Wakes the parent's waitpid and
/// anyone blocked on the termination monitor.
pub fn make_zombie(process: &ProcessRef, status: i32) {
    let (parent, term_monitor) = {
        let mut p = process.lock();
        p.files.close_all();
        p.aspace.release();
        p.state = ProcessState::Zombie(status);
        (p.parent, p.term_monitor.clone())
    };

    {
        let guard = term_monitor.enter();
        term_monitor.broadcast(&guard);
    }
    if let Some(parent) = parent.and_then(by_pid) {
        let monitor = parent.lock().child_monitor.clone();
        let guard = monitor.enter();
        monitor.broadcast(&guard);
    }
}

/// Terminate the calling process. Never returns.
pub fn exit_current(status: i32) -> ! {
    if let Some(process) = current() {
        let pid = process.lock().pid;
        log::debug!("{} exiting with status {}", pid, status);
        // Tear down sibling threads; the current one exits below
        let me = scheduler::current_thread_id();
        let doomed: Vec<ThreadId> = process
            .lock()
            .threads
            .iter()
            .copied()
            .filter(|&t| t != me)
            .collect();
        for tid in doomed {
            crate::multitasking::SCHEDULER.lock().remove_thread(tid);
            process.lock().threads.remove(&tid);
        }
        make_zombie(&process, status);
    }
    thread::exit(status as usize)
}

/// Find and reap a terminated child of `waiter`. `pid` selects one
/// child, or any with -1. Blocks on the child monitor until a child
/// terminates; `NoChild` when none could ever match.
pub fn waitpid_from(waiter: &ProcessRef, pid: i32) -> KernelResult<(Pid, i32)> {
    let me = waiter.lock().pid;
    let monitor = waiter.lock().child_monitor.clone();
    let guard = monitor.enter();
    loop {
        let mut container = ROOT_CONTAINER.lock();
        let mut candidates = 0;
        let mut found = None;
        for (child_pid, child) in container.processes.iter() {
            let child = child.lock();
            if child.parent != Some(me) {
                continue;
            }
            if pid >= 0 && child_pid.as_u32() != pid as u32 {
                continue;
            }
            candidates += 1;
            if let ProcessState::Zombie(status) = child.state {
                found = Some((*child_pid, status));
                break;
            }
        }
        if let Some((child_pid, status)) = found {
            container.processes.remove(&child_pid);
            return Ok((child_pid, status));
        }
        if candidates == 0 {
            return Err(KernelError::NoChild);
        }
        drop(container);
        monitor.wait(&guard);
    }
}

/// POSIX waitpid for the calling process
pub fn waitpid(pid: i32) -> KernelResult<(Pid, i32)> {
    let process = current().ok_or(KernelError::NoProcess)?;
    waitpid_from(&process, pid)
}

/// Adjust the heap end. Growth extends the anonymous heap segment;
/// contraction releases the dropped pages. Returns the new break.
pub fn brk_from(process: &ProcessRef, new_end: VirtAddr) -> KernelResult<VirtAddr> {
    let mut p = process.lock();
    let base = p.heap_base.ok_or(KernelError::InvalidPointer(0))?;
    if new_end == VirtAddr::zero() {
        return Ok(p.heap_end);
    }
    if new_end < base {
        return Err(KernelError::InvalidPointer(new_end.as_u32()));
    }
    p.aspace.resize_segment(base, new_end - base)?;
    p.heap_end = new_end;
    Ok(new_end)
}

pub fn brk(new_end: VirtAddr) -> KernelResult<VirtAddr> {
    let process = current().ok_or(KernelError::NoProcess)?;
    brk_from(&process, new_end)
}

/// Change working directory
pub fn chdir(process: &ProcessRef, path_str: &str) -> KernelResult<()> {
    let (root, cwd) = {
        let p = process.lock();
        (p.root.clone(), p.cwd.clone())
    };
    let target = path::resolve(&root, &cwd, path_str)?;
    if target.kind() != crate::filesystem::vnode::VnodeKind::Directory {
        return Err(KernelError::NotADirectory);
    }
    process.lock().cwd = target;
    Ok(())
}

pub fn getpid() -> KernelResult<Pid> {
    Ok(current().ok_or(KernelError::NoProcess)?.lock().pid)
}

/// Create the init process skeleton and exec `path` in it on a fresh
/// thread. The parent (boot) thread returns.
pub fn start_init(init_path: &str) -> KernelResult<()> {
    let root = crate::filesystem::root().ok_or(KernelError::FileNotFound)?;
    let aspace = AddressSpace::new(paging::new_asid());
    let process = create(None, Arc::new(aspace), FdTable::new(), root.clone(), root);
    let pid = process.lock().pid;

    match thread::fork_into(Some(pid))? {
        ForkResult::Parent(tid) => {
            process.lock().threads.insert(tid);
            thread::set_name(tid, "init");
            Ok(())
        },
        ForkResult::Child => {
            let argv = [init_path];
            match execve(init_path, &argv, &[]) {
                Err(err) => {
                    log::error!("exec {} failed: {}", init_path, err);
                    exit_current(127)
                },
                Ok(never) => match never {},
            }
        },
    }
}

pub enum Never {}

/// Replace the calling process image. On success control transfers to
/// the new image in user mode and this never returns; on failure the
/// old address space is still in place.
pub fn execve(path_str: &str, argv: &[&str], envp: &[&str]) -> KernelResult<Never> {
    let process = current().ok_or(KernelError::NoProcess)?;
    let (root, cwd) = {
        let p = process.lock();
        (p.root.clone(), p.cwd.clone())
    };
    let image = path::resolve(&root, &cwd, path_str)?;
    let (entry, stack) = elf::exec(&process, image, argv, envp)?;
    crate::arch::port().start_user(entry, stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ForkSide;
    use crate::filesystem::memfs;
    use crate::memory::segment::{Segment, SegmentFlags};
    use crate::memory::test_support;

    fn bare_process() -> ProcessRef {
        let root = memfs::dir();
        create(
            None,
            Arc::new(AddressSpace::new(paging::new_asid())),
            FdTable::new(),
            root.clone(),
            root,
        )
    }

    fn user_rw() -> SegmentFlags {
        SegmentFlags::R | SegmentFlags::W | SegmentFlags::U | SegmentFlags::P
    }

    #[test]
    fn pids_are_unique_and_reaped_slots_recycle_eventually() {
        let _guard = test_support::exclusive();
        let a = bare_process();
        let b = bare_process();
        assert_ne!(a.lock().pid, b.lock().pid);
        let a_pid = a.lock().pid;
        make_zombie(&a, 0);
        // Still present until reaped
        assert!(by_pid(a_pid).is_some());
        ROOT_CONTAINER.lock().processes.remove(&a_pid);
        ROOT_CONTAINER.lock().processes.remove(&b.lock().pid);
    }

    #[test]
    fn fork_clones_segments_and_shares_files() {
        let _guard = test_support::exclusive();
        let port = test_support::init();
        let parent = bare_process();
        let parent_pid = parent.lock().pid;

        // A private writable segment with one touched page
        let base = VirtAddr::new(0x80000);
        {
            let p = parent.lock();
            let aspace = p.address_space();
            aspace.add(Segment::anonymous(base, 0x1000, user_rw()));
            aspace.fault(base, true).unwrap();
        }
        let fd = parent.lock().files.open_vnode(memfs::file(b"x")).unwrap();

        port.script_fork(ForkSide::Parent);
        let outcome = fork_from(&parent).unwrap();
        let child_pid = match outcome {
            ForkOutcome::Parent(pid) => pid,
            ForkOutcome::Child => panic!("scripted as parent"),
        };
        assert_ne!(child_pid, parent_pid);

        let child = by_pid(child_pid).unwrap();
        {
            let c = child.lock();
            assert_eq!(c.parent, Some(parent_pid));
            // Shared handle: refcount grew
            assert!(c.files.handle_refs(fd).unwrap() >= 2);
            // The child sees the same segment, now COW
            let seg = c.address_space().find(base).expect("cloned segment");
            assert!(seg.perms.contains(SegmentFlags::P));
        }

        // The parent's touched page went copy-on-write: its mapping
        // was revoked pending the next write fault
        let parent_asid = parent.lock().address_space().asid;
        assert!(!paging::is_mapped(parent_asid, base));

        ROOT_CONTAINER.lock().processes.remove(&parent_pid);
        ROOT_CONTAINER.lock().processes.remove(&child_pid);
    }

    #[test]
    fn waitpid_reaps_zombie_child() {
        let _guard = test_support::exclusive();
        let port = test_support::init();
        let parent = bare_process();
        let parent_pid = parent.lock().pid;

        port.script_fork(ForkSide::Parent);
        let child_pid = match fork_from(&parent).unwrap() {
            ForkOutcome::Parent(pid) => pid,
            ForkOutcome::Child => unreachable!(),
        };
        let child = by_pid(child_pid).unwrap();
        make_zombie(&child, 7);

        let (reaped, status) = waitpid_from(&parent, -1).unwrap();
        assert_eq!(reaped, child_pid);
        assert_eq!(status, 7);
        // Gone after the reap
        assert!(by_pid(child_pid).is_none());

        // No children left
        assert_eq!(
            waitpid_from(&parent, -1).unwrap_err(),
            KernelError::NoChild
        );
        ROOT_CONTAINER.lock().processes.remove(&parent_pid);
    }

    #[test]
    fn waitpid_matches_a_specific_pid() {
        let _guard = test_support::exclusive();
        let port = test_support::init();
        let parent = bare_process();
        let parent_pid = parent.lock().pid;

        port.script_fork(ForkSide::Parent);
        let a = match fork_from(&parent).unwrap() {
            ForkOutcome::Parent(pid) => pid,
            _ => unreachable!(),
        };
        port.script_fork(ForkSide::Parent);
        let b = match fork_from(&parent).unwrap() {
            ForkOutcome::Parent(pid) => pid,
            _ => unreachable!(),
        };

        make_zombie(&by_pid(a).unwrap(), 1);
        make_zombie(&by_pid(b).unwrap(), 2);

        let (reaped, status) = waitpid_from(&parent, b.as_u32() as i32).unwrap();
        assert_eq!(reaped, b);
        assert_eq!(status, 2);

        let (reaped, _) = waitpid_from(&parent, -1).unwrap();
        assert_eq!(reaped, a);
        ROOT_CONTAINER.lock().processes.remove(&parent_pid);
    }

    #[test]
    fn brk_moves_the_heap_end_both_ways() {
        let _guard = test_support::exclusive();
        let process = bare_process();
        let base = VirtAddr::new(0x200000);
        {
            let mut p = process.lock();
            p.aspace.add(Segment::anonymous(base, 0, user_rw()));
            p.heap_base = Some(base);
            p.heap_end = base;
        }

        // Query
        assert_eq!(brk_from(&process, VirtAddr::zero()).unwrap(), base);
        // Grow
        let grown = VirtAddr::new(0x203000);
        assert_eq!(brk_from(&process, grown).unwrap(), grown);
        {
            let p = process.lock();
            let aspace = p.address_space();
            aspace.fault(VirtAddr::new(0x202000), true).unwrap();
            drop(p);
        }
        // Shrink below the touched page releases it
        let shrunk = VirtAddr::new(0x201000);
        assert_eq!(brk_from(&process, shrunk).unwrap(), shrunk);
        let p = process.lock();
        assert!(p.address_space().fault(VirtAddr::new(0x202000), true).is_err());
        // Below the base is invalid
        drop(p);
        assert!(brk_from(&process, VirtAddr::new(0x100000)).is_err());
        let pid = process.lock().pid;
        ROOT_CONTAINER.lock().processes.remove(&pid);
    }

    #[test]
    fn chdir_requires_a_directory() {
        let _guard = test_support::exclusive();
        let process = bare_process();
        let sub = {
            let p = process.lock();
            let sub = memfs::dir();
            p.root.link("sub", sub.clone()).unwrap();
            p.root.link("file", memfs::file(b"")).unwrap();
            sub
        };

        chdir(&process, "/sub").unwrap();
        assert_eq!(process.lock().cwd.id(), sub.id());
        assert_eq!(
            chdir(&process, "/file").unwrap_err(),
            KernelError::NotADirectory
        );
        let pid = process.lock().pid;
        ROOT_CONTAINER.lock().processes.remove(&pid);
    }
}
