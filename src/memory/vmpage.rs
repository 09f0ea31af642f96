//! Tracked physical pages.
//!
//! A [`VmPage`] wraps one frame with mapping metadata: flag bits, an
//! aging counter, the shared-copy count driving copy-on-write, and up
//! to [`VMPAGE_MAPS`] reverse mappings of (address space, virtual
//! address). Managed frames return to the frame pool when the last
//! reference drops.

use alloc::sync::Arc;
use spin::Mutex;

use super::addr::{PageFrame, VirtAddr};
use super::paging::{self, Asid};
use super::phys;
use crate::arch;
use crate::error::KernelResult;

/// Reverse-mapping slots per page. When all are live, a pseudo-random
/// victim is evicted to make room.
pub const VMPAGE_MAPS: usize = 3;

bitflags! {
    pub struct VmPageFlags: u32 {
        const PINNED   = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY    = 1 << 2;
        /// Frame is owned by this page and freed with it
        const MANAGED  = 1 << 3;
    }
}

pub type VmPageRef = Arc<Mutex<VmPage>>;

#[derive(Debug)]
pub struct VmPage {
    frame: PageFrame,
    flags: VmPageFlags,
    age: u32,
    copies: u32,
    maps: [Option<(Asid, VirtAddr)>; VMPAGE_MAPS],
}

impl VmPage {
    /// Wrap an existing frame, e.g. device memory. The frame is not
    /// released when the page dies.
    pub fn with_frame(frame: PageFrame) -> VmPageRef {
        Arc::new(Mutex::new(Self {
            frame,
            flags: VmPageFlags::empty(),
            age: 0,
            copies: 0,
            maps: [None; VMPAGE_MAPS],
        }))
    }

    /// Allocate a managed page with undefined contents
    pub fn alloc() -> KernelResult<VmPageRef> {
        let frame = phys::allocate()?;
        let page = Self::with_frame(frame);
        page.lock().flags = VmPageFlags::MANAGED;
        Ok(page)
    }

    /// Allocate a managed, zero-filled page
    pub fn alloc_zeroed() -> KernelResult<VmPageRef> {
        let frame = phys::allocate_zeroed()?;
        let page = Self::with_frame(frame);
        page.lock().flags = VmPageFlags::MANAGED;
        Ok(page)
    }

    pub fn frame(&self) -> PageFrame {
        self.frame
    }

    pub fn copies(&self) -> u32 {
        self.copies
    }

    pub fn flags(&self) -> VmPageFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: VmPageFlags) {
        self.flags |= flags;
    }

    pub fn reset_flags(&mut self, flags: VmPageFlags) {
        self.flags &= !flags;
    }

    pub fn mappings(&self) -> impl Iterator<Item = (Asid, VirtAddr)> + '_ {
        self.maps.iter().flatten().copied()
    }

    /// Install a mapping of this page, tracking it in a reverse-map
    /// slot. A slot whose entry is no longer live in its address space
    /// is reused; failing that, a pseudo-random victim is unmapped
    /// first.
    pub fn map(&mut self, asid: Asid, va: VirtAddr, rw: bool, user: bool) {
        // Already tracked?
        for slot in self.maps.iter() {
            if *slot == Some((asid, va)) {
                paging::map(asid, va, self.frame, rw, user);
                return;
            }
        }

        // Reuse a free or defunct slot
        for slot in self.maps.iter_mut() {
            let live = match slot {
                Some((a, p)) => paging::is_mapped(*a, *p),
                None => false,
            };
            if !live {
                *slot = Some((asid, va));
                paging::map(asid, va, self.frame, rw, user);
                return;
            }
        }

        // Evict a pseudo-random victim
        let victim =
            (asid.as_u32() as usize).wrapping_mul(va.as_u32() as usize).wrapping_mul(13)
                % VMPAGE_MAPS;
        if let Some((a, p)) = self.maps[victim] {
            paging::unmap(a, p);
        }
        self.maps[victim] = Some((asid, va));
        paging::map(asid, va, self.frame, rw, user);
    }

    /// Drop one mapping of this page, synchronizing the TLB
    pub fn unmap(&mut self, asid: Asid, va: VirtAddr) {
        for slot in self.maps.iter_mut() {
            if *slot == Some((asid, va)) {
                *slot = None;
                break;
            }
        }
        paging::unmap(asid, va);
    }

    /// Remove every live mapping so the next write traps
    pub fn trap_writes(&mut self) {
        for slot in self.maps.iter_mut() {
            if let Some((a, p)) = *slot {
                if paging::is_mapped(a, p) {
                    paging::unmap(a, p);
                }
                *slot = None;
            }
        }
    }

    /// Register a shared copy of this page: all mappings become
    /// write-trapping and the copy count grows.
    pub fn put_copy(&mut self) {
        self.trap_writes();
        self.copies += 1;
    }

    /// Age the page based on the accessed flag since the last sweep
    pub fn age(&mut self) {
        if self.age != 0 {
            self.age >>= 1;
            if self.flags.contains(VmPageFlags::ACCESSED) {
                self.age |= 0x100;
            }
        } else {
            self.age = if self.flags.contains(VmPageFlags::ACCESSED) {
                4
            } else {
                0
            };
        }
        self.reset_flags(VmPageFlags::ACCESSED);
    }
}

/// Resolve a page for writing. A page with outstanding shared copies
/// yields a fresh private copy (decrementing the count); otherwise the
/// page itself is returned.
pub fn get_copy(page: &VmPageRef) -> KernelResult<VmPageRef> {
    let mut inner = page.lock();
    if inner.copies == 0 {
        drop(inner);
        return Ok(page.clone());
    }

    let copy = VmPage::alloc()?;
    arch::copy_frame(copy.lock().frame(), inner.frame);
    inner.copies -= 1;
    Ok(copy)
}

impl Drop for VmPage {
    fn drop(&mut self) {
        for slot in self.maps.iter() {
            if let Some((a, p)) = *slot {
                if paging::is_mapped(a, p) {
                    paging::unmap(a, p);
                }
            }
        }
        if self.flags.contains(VmPageFlags::MANAGED) {
            phys::free(self.frame);
        }
    }
}
