//! Architecture port boundary.
//!
//! The core is architecture-neutral; everything the hardware actually
//! does (context switch, TLB, the one-shot timer, interrupt masking,
//! user-mode entry) goes through the [`Port`] trait. The reference
//! port implements this for i386; [`testing::TestPort`] implements it
//! for the hosted test harness with byte-array frames and a virtual
//! one-shot.
//!
//! Atomic read-modify-write is not part of the port: `core::sync::
//! atomic` covers it on every supported target.

use spin::Once;

use crate::memory::addr::{PageFrame, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::multitasking::ThreadId;

pub mod testing;

/// Which side of a thread fork the caller is on after the port
/// duplicated the context and stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkSide {
    /// Running in the creating thread
    Parent,
    /// First run of the created thread
    Child,
}

pub trait Port: Send + Sync {
    /// Mask local interrupts. Returns whether they were enabled, for a
    /// balanced restore.
    fn interrupt_mask(&self) -> bool;
    fn interrupt_restore(&self, enabled: bool);

    /// Halt until the next interrupt
    fn idle(&self);

    /// Install a new active translation root (page directory)
    fn set_translation_root(&self, root: PhysAddr);

    /// Invalidate the local TLB entry for one virtual address
    fn invalidate_page(&self, va: VirtAddr);

    /// Kernel-window pointer to the given physical frame. The window
    /// maps all of physical memory linearly in every address space.
    fn frame_ptr(&self, frame: PageFrame) -> *mut u8;

    /// Arm the hardware one-shot; expiry calls `time::on_expiry` in
    /// interrupt context.
    fn timer_set(&self, usec: u64);

    /// Cancel the one-shot, returning the remaining microseconds
    fn timer_clear(&self) -> u64;

    /// Switch execution to the given thread's saved context
    fn thread_switch(&self, to: ThreadId);

    /// Duplicate the current context and stack into `child`. Returns
    /// once in the parent and once, later, in the child.
    fn thread_fork(&self, child: ThreadId) -> ForkSide;

    /// Release the context and kernel stack of a dead thread
    fn thread_finalize(&self, thread: ThreadId);

    /// Fill `buf` with return addresses of the current call chain
    fn backtrace(&self, buf: &mut [u32]) -> usize;

    /// Drop to user mode at `entry` with the prepared stack
    fn start_user(&self, entry: VirtAddr, stack: VirtAddr) -> !;

    /// Signal end-of-interrupt to the controller
    fn end_of_interrupt(&self, irq: u8);
}

static PORT: Once<&'static dyn Port> = Once::new();

/// Install the architecture port. Called exactly once, before
/// `kernel_init`.
pub fn install(port: &'static dyn Port) {
    PORT.call_once(|| port);
}

pub fn port() -> &'static dyn Port {
    *PORT.get().expect("architecture port not installed")
}

/// Run a closure with local interrupts masked, restoring the previous
/// state afterwards. Balanced across nesting.
pub fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
    let p = port();
    let was_enabled = p.interrupt_mask();
    let out = f();
    p.interrupt_restore(was_enabled);
    out
}

/// View a physical frame as a byte slice through the kernel window.
///
/// # Safety
/// The frame must be owned by the caller, and no aliasing mutable view
/// may exist for the lifetime of the slice.
pub unsafe fn frame_slice<'a>(frame: PageFrame) -> &'a [u8] {
    core::slice::from_raw_parts(port().frame_ptr(frame), PAGE_SIZE as usize)
}

/// Mutable view of a physical frame through the kernel window.
///
/// # Safety
/// As [`frame_slice`], plus exclusivity.
pub unsafe fn frame_slice_mut<'a>(frame: PageFrame) -> &'a mut [u8] {
    core::slice::from_raw_parts_mut(port().frame_ptr(frame), PAGE_SIZE as usize)
}

/// Zero-fill a physical frame
pub fn zero_frame(frame: PageFrame) {
    unsafe {
        frame_slice_mut(frame).fill(0);
    }
}

/// Copy one physical frame onto another through the kernel window
pub fn copy_frame(dst: PageFrame, src: PageFrame) {
    assert_ne!(dst, src);
    unsafe {
        frame_slice_mut(dst).copy_from_slice(frame_slice(src));
    }
}
