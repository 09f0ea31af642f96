//! Scratch arenas.
//!
//! A page-aligned bump allocator over an anonymous VM object, with
//! stack-style checkpoint/restore. Every thread can hold one as
//! scratch space; the thread finalizer gives it back to a shared pool
//! where it is reset (releasing its pages) and reused.

use alloc::vec::Vec;
use spin::Mutex;

use super::addr::{VirtAddr, PAGE_SIZE, PAGE_SIZE_LOG2};
use super::object::{VmObject, VmObjectRef};
use super::vmpage::VmPage;
use crate::arch;
use crate::error::{KernelError, KernelResult};

/// Default arena size: 4 MiB
pub const ARENA_SIZE: u32 = 0x40_0000;

/// A bump-allocation checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaState(VirtAddr);

pub struct Arena {
    base: VirtAddr,
    top: VirtAddr,
    state: VirtAddr,
    object: VmObjectRef,
}

impl Arena {
    /// Build an arena over `size` bytes of reserved kernel window
    pub fn new(base: VirtAddr, size: u32) -> Self {
        assert!(base.is_page_aligned());
        Self {
            base,
            top: base + size,
            state: base,
            object: VmObject::anonymous(),
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Bump-allocate `size` bytes, word-aligned
    pub fn alloc(&mut self, size: u32) -> KernelResult<VirtAddr> {
        let at = self.state;
        let size = (size + 3) & !3;
        if (self.top - at) < size {
            return Err(KernelError::OutOfMemory);
        }
        self.state = at + size;
        Ok(at)
    }

    /// Bump-allocate whole pages, page-aligned
    pub fn alloc_pages(&mut self, pages: u32) -> KernelResult<VirtAddr> {
        self.state = self.state.page_align_up();
        let at = self.state;
        let size = pages * PAGE_SIZE;
        if (self.top - at) < size {
            return Err(KernelError::OutOfMemory);
        }
        self.state = at + size;
        Ok(at)
    }

    pub fn get_state(&self) -> ArenaState {
        ArenaState(self.state)
    }

    /// Rewind (or replay) to a checkpoint. The checkpoint must lie
    /// within the arena.
    pub fn set_state(&mut self, state: ArenaState) -> KernelResult<()> {
        if state.0 < self.base || state.0 > self.top {
            return Err(KernelError::IntBounds);
        }
        self.state = state.0;
        Ok(())
    }

    /// Full rewind, releasing the backing pages
    pub fn reset(&mut self) {
        self.state = self.base;
        self.object.release();
    }

    /// Copy `bytes` into arena memory at `at`, materializing backing
    /// pages as needed
    pub fn write_bytes(&self, at: VirtAddr, bytes: &[u8]) -> KernelResult<()> {
        self.walk_pages(at, bytes.len() as u32, |frame, page_off, range| {
            let dst = unsafe { arch::frame_slice_mut(frame) };
            dst[page_off..page_off + range.len()].copy_from_slice(&bytes[range]);
            Ok(())
        })
    }

    /// Copy arena memory at `at` into `bytes`
    pub fn read_bytes(&self, at: VirtAddr, bytes: &mut [u8]) -> KernelResult<()> {
        let len = bytes.len() as u32;
        self.walk_pages(at, len, |frame, page_off, range| {
            let src = unsafe { arch::frame_slice(frame) };
            bytes[range.clone()].copy_from_slice(&src[page_off..page_off + range.len()]);
            Ok(())
        })
    }

    fn walk_pages(
        &self, at: VirtAddr, len: u32,
        mut f: impl FnMut(super::addr::PageFrame, usize, core::ops::Range<usize>) -> KernelResult<()>,
    ) -> KernelResult<()> {
        if at < self.base || at.checked_add(len).map_or(true, |end| end > self.top) {
            return Err(KernelError::IntBounds);
        }
        let mut done = 0u32;
        while done < len {
            let va = at + done;
            let offset = (va.page_align_down() - self.base) as u64;
            let page_off = va.page_offset() as usize;
            let span = (PAGE_SIZE - va.page_offset()).min(len - done) as usize;

            let page = match self.object.get_page(offset)? {
                Some(page) => page,
                None => {
                    let page = VmPage::alloc_zeroed()?;
                    self.object.put_page(offset, page.clone())?;
                    page
                },
            };
            let frame = page.lock().frame();
            f(frame, page_off, done as usize..done as usize + span)?;
            done += span as u32;
        }
        Ok(())
    }

    pub fn resident_pages(&self) -> usize {
        self.object.resident_pages()
    }
}

static POOL: Mutex<Vec<Arena>> = Mutex::new(Vec::new());

/// Take an arena from the pool, or build a fresh one over newly
/// reserved kernel window
pub fn take() -> Arena {
    if let Some(arena) = POOL.lock().pop() {
        return arena;
    }
    let base = super::reserve_kernel_va(ARENA_SIZE >> PAGE_SIZE_LOG2);
    Arena::new(base, ARENA_SIZE)
}

/// Return an arena to the pool, resetting it first
pub fn give(mut arena: Arena) {
    arena.reset();
    POOL.lock().push(arena);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;

    fn arena() -> Arena {
        test_support::init();
        Arena::new(VirtAddr::new(0xe800_0000), 4 * PAGE_SIZE)
    }

    #[test]
    fn bump_allocation_is_word_aligned() {
        let _guard = test_support::exclusive();
        let mut a = arena();
        let p1 = a.alloc(3).unwrap();
        let p2 = a.alloc(8).unwrap();
        assert_eq!(p2 - p1, 4);
        let p3 = a.alloc_pages(1).unwrap();
        assert!(p3.is_page_aligned());
    }

    #[test]
    fn checkpoint_restore_replays_identically() {
        let _guard = test_support::exclusive();
        let mut a = arena();
        let state = a.get_state();

        let p1 = a.alloc(16).unwrap();
        a.write_bytes(p1, &[1, 2, 3, 4]).unwrap();
        let p2 = a.alloc(16).unwrap();
        a.write_bytes(p2, &[9, 9, 9, 9]).unwrap();

        a.set_state(state).unwrap();
        let q1 = a.alloc(16).unwrap();
        let q2 = a.alloc(16).unwrap();
        assert_eq!(p1, q1);
        assert_eq!(p2, q2);

        // Contents survive a rewind; only reset releases pages
        let mut buf = [0u8; 4];
        a.read_bytes(q1, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn set_state_rejects_foreign_pointers() {
        let _guard = test_support::exclusive();
        let mut a = arena();
        assert_eq!(
            a.set_state(ArenaState(VirtAddr::new(0x1000))),
            Err(KernelError::IntBounds)
        );
        let end = a.get_state();
        let mut b = Arena::new(VirtAddr::new(0xf000_0000), PAGE_SIZE);
        assert_eq!(b.set_state(end), Err(KernelError::IntBounds));
    }

    #[test]
    fn reset_releases_pages() {
        let _guard = test_support::exclusive();
        let mut a = arena();
        let p = a.alloc_pages(2).unwrap();
        a.write_bytes(p, &[0xff; 64]).unwrap();
        a.write_bytes(p + PAGE_SIZE, &[0xee; 64]).unwrap();
        assert_eq!(a.resident_pages(), 2);

        a.reset();
        assert_eq!(a.resident_pages(), 0);
        assert_eq!(a.get_state(), ArenaState(a.base()));
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let _guard = test_support::exclusive();
        let mut a = arena();
        assert!(a.alloc_pages(4).is_ok());
        assert_eq!(a.alloc(1), Err(KernelError::OutOfMemory));
    }
}
