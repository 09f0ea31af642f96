//! Segments and the page-fault engine.
//!
//! A segment is a virtually contiguous region backed by one or two VM
//! objects: reads come from `clean` (at `read_offset`), writes go to
//! `dirty`. A private segment (`P`) keeps a separate dirty object so
//! writes never reach the clean source; a shared one aliases them.
//!
//! The fault path:
//! 1. locate the segment by an ordered map keyed on base address
//! 2. bounds- and permission-check, else the pointer is invalid
//! 3. take the page from dirty, falling back to clean; a write through
//!    a private segment registers the page in dirty as a shared copy
//! 4. a write on a page with outstanding copies swaps in a fresh copy
//! 5. map, update accessed/dirty flags

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use hashbrown::HashMap;
use spin::Mutex;

#[cfg(test)]
use super::addr::PAGE_SIZE;
use super::addr::{PageFrame, VirtAddr};
use super::object::{VmObject, VmObjectRef};
use super::paging::{self, Asid};
use super::vmpage::{self, VmPageFlags, VmPageRef};
use crate::error::{KernelError, KernelResult};
use crate::filesystem::vnode::Vnode;

bitflags! {
    pub struct SegmentFlags: u32 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        /// User-accessible
        const U = 1 << 3;
        /// Private: writes are confined to the dirty object
        const P = 1 << 4;
    }
}

#[derive(Clone)]
pub struct Segment {
    pub base: VirtAddr,
    pub size: u32,
    pub perms: SegmentFlags,
    clean: VmObjectRef,
    read_offset: u64,
    dirty: VmObjectRef,
}

impl Segment {
    fn base_segment(
        base: VirtAddr, size: u32, perms: SegmentFlags, clean: VmObjectRef, read_offset: u64,
    ) -> Self {
        Self {
            base,
            size,
            perms,
            dirty: clean.clone(),
            clean,
            read_offset,
        }
    }

    /// Zero-filled private memory
    pub fn anonymous(base: VirtAddr, size: u32, perms: SegmentFlags) -> Self {
        let mut seg =
            Self::base_segment(base, size, perms | SegmentFlags::P, VmObject::zero(), 0);
        seg.dirty = VmObject::anonymous();
        seg
    }

    /// File-backed memory; private if `P` is set, in which case writes
    /// land in a fresh anonymous object
    pub fn vnode(
        base: VirtAddr, size: u32, perms: SegmentFlags, vnode: Arc<Vnode>, offset: u64,
    ) -> Self {
        let mut seg = Self::base_segment(base, size, perms, VmObject::vnode(vnode), offset);
        if perms.contains(SegmentFlags::P) {
            seg.dirty = VmObject::anonymous();
        }
        seg
    }

    /// Direct-mapped device memory
    pub fn direct(base: VirtAddr, size: u32, perms: SegmentFlags, frame: PageFrame) -> Self {
        Self::base_segment(base, size, perms, VmObject::direct(frame, size as u64), 0)
    }

    /// The kernel heap segment over the heap singleton object
    pub fn heap(base: VirtAddr, size: u32) -> Self {
        let mut seg = Self::base_segment(
            base,
            size,
            SegmentFlags::R | SegmentFlags::W | SegmentFlags::P,
            Arc::new(VmObject::Heap),
            0,
        );
        seg.dirty = seg.clean.clone();
        seg
    }

    /// Copy for fork: a private copy clones the dirty object (COW), a
    /// shared copy aliases it.
    pub fn copy(&self, private: bool) -> KernelResult<Segment> {
        let mut seg = Self::base_segment(
            self.base,
            self.size,
            self.perms,
            self.clean.clone(),
            self.read_offset,
        );
        if private {
            seg.perms |= SegmentFlags::P;
            if !Arc::ptr_eq(&self.clean, &self.dirty) {
                seg.dirty = VmObject::clone_object(&self.dirty)?;
            } else {
                seg.dirty = VmObject::anonymous();
            }
        } else {
            seg.dirty = self.dirty.clone();
        }
        Ok(seg)
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.base && (va - self.base) < self.size
    }

    pub fn end(&self) -> VirtAddr {
        self.base + self.size
    }

    pub fn dirty_object(&self) -> &VmObjectRef {
        &self.dirty
    }
}

/// A per-process (or the kernel) virtual address map: an ordered set
/// of segments plus the resident pages currently mapped from them.
pub struct AddressSpace {
    pub asid: Asid,
    segments: Mutex<BTreeMap<u32, Segment>>,
    /// Page currently mapped at each virtual page, keeping it alive
    /// until replaced or the space dies
    resident: Mutex<HashMap<u32, VmPageRef>>,
}

impl AddressSpace {
    pub fn new(asid: Asid) -> Self {
        Self {
            asid,
            segments: Mutex::new(BTreeMap::new()),
            resident: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, seg: Segment) {
        self.segments.lock().insert(seg.base.as_u32(), seg);
    }

    pub fn remove(&self, base: VirtAddr) -> Option<Segment> {
        let seg = self.segments.lock().remove(&base.as_u32());
        if let Some(seg) = &seg {
            self.drop_resident_range(seg.base, seg.end());
        }
        seg
    }

    /// Segment covering `va`, if any
    pub fn find(&self, va: VirtAddr) -> Option<Segment> {
        let map = self.segments.lock();
        let (_, seg) = map.range(..=va.as_u32()).next_back()?;
        seg.contains(va).then(|| seg.clone())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.lock().len()
    }

    pub fn segments(&self) -> alloc::vec::Vec<Segment> {
        self.segments.lock().values().cloned().collect()
    }

    /// Service a fault at `va` in this space. Returns `InvalidPointer`
    /// for anything outside a segment or violating its permissions.
    pub fn fault(&self, va: VirtAddr, write: bool) -> KernelResult<()> {
        let seg = self
            .find(va)
            .ok_or(KernelError::InvalidPointer(va.as_u32()))?;

        if write && !seg.perms.contains(SegmentFlags::W) {
            return Err(KernelError::InvalidPointer(va.as_u32()));
        }

        let va_page = va.page_align_down();
        let offset = (va_page - seg.base) as u64;
        let split = !Arc::ptr_eq(&seg.dirty, &seg.clean);

        let page = match seg.dirty.get_page(offset)? {
            Some(page) => page,
            None => {
                let page = seg
                    .clean
                    .get_page(offset + seg.read_offset)?
                    .ok_or(KernelError::InvalidPointer(va.as_u32()))?;
                if write && split {
                    page.lock().put_copy();
                    seg.dirty.put_page(offset, page.clone())?;
                }
                page
            },
        };

        // A write on a shared page gets its own copy
        let writable = write && seg.perms.contains(SegmentFlags::W);
        let page = if writable {
            let copy = vmpage::get_copy(&page)?;
            if !Arc::ptr_eq(&copy, &page) && split {
                seg.dirty.put_page(offset, copy.clone())?;
            }
            copy
        } else {
            page
        };

        // Swap out whatever was resident at this address before
        // installing the new mapping
        if let Some(old) = self.resident.lock().remove(&va_page.as_u32()) {
            if !Arc::ptr_eq(&old, &page) {
                old.lock().unmap(self.asid, va_page);
            }
        }

        {
            let mut inner = page.lock();
            inner.map(self.asid, va_page, writable, seg.perms.contains(SegmentFlags::U));
            if write {
                inner.set_flags(VmPageFlags::ACCESSED | VmPageFlags::DIRTY);
            } else {
                inner.set_flags(VmPageFlags::ACCESSED);
            }
        }
        self.resident.lock().insert(va_page.as_u32(), page);
        Ok(())
    }

    /// Clone every segment for fork. Segments with `P` become private
    /// COW copies; shared ones alias their dirty object.
    pub fn clone_for_fork(&self, asid: Asid) -> KernelResult<AddressSpace> {
        let child = AddressSpace::new(asid);
        {
            let parent = self.segments.lock();
            let mut map = child.segments.lock();
            for (base, seg) in parent.iter() {
                let private = seg.perms.contains(SegmentFlags::P);
                map.insert(*base, seg.copy(private)?);
            }
        }
        Ok(child)
    }

    /// Resize a segment in place (the heap, on brk). Contraction drops
    /// the tail pages of the dirty object and their mappings.
    pub fn resize_segment(&self, base: VirtAddr, new_size: u32) -> KernelResult<()> {
        let mut map = self.segments.lock();
        let seg = map
            .get_mut(&base.as_u32())
            .ok_or(KernelError::InvalidPointer(base.as_u32()))?;
        if new_size < seg.size {
            seg.dirty.truncate(new_size as u64);
            let start = (base + new_size).page_align_up();
            let end = base + seg.size;
            seg.size = new_size;
            drop(map);
            self.drop_resident_range(start, end);
        } else {
            seg.size = new_size;
        }
        Ok(())
    }

    fn drop_resident_range(&self, start: VirtAddr, end: VirtAddr) {
        let mut resident = self.resident.lock();
        let doomed: alloc::vec::Vec<u32> = resident
            .keys()
            .copied()
            .filter(|&va| va >= start.as_u32() && va < end.as_u32())
            .collect();
        for va in doomed {
            if let Some(page) = resident.remove(&va) {
                page.lock().unmap(self.asid, VirtAddr::new(va));
            }
        }
    }

    /// Tear the space down: all mappings, pages and the ASID slot
    pub fn release(&self) {
        for (va, page) in self.resident.lock().drain() {
            page.lock().unmap(self.asid, VirtAddr::new(va));
        }
        self.segments.lock().clear();
        paging::release_asid(self.asid);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.release();
    }
}

lazy_static::lazy_static! {
    /// The kernel window map, shared by every process
    pub static ref KERNEL_SPACE: AddressSpace = AddressSpace::new(Asid::KERNEL);
}

/// Page-fault entry, called by the port's fault hook. Resolves the
/// kernel map first, then the current process. A fault nothing claims
/// kills the offending user process, or panics in kernel context.
pub fn page_fault(va: VirtAddr, write: bool, user: bool, _present: bool) {
    let result = if KERNEL_SPACE.find(va).is_some() {
        KERNEL_SPACE.fault(va, write)
    } else {
        match crate::process::current() {
            Some(process) => {
                let aspace = process.lock().address_space();
                aspace.fault(va, write)
            },
            None => Err(KernelError::InvalidPointer(va.as_u32())),
        }
    };

    if let Err(err) = result {
        if user {
            log::error!("segfault at {}: {}", va, err);
            crate::process::exit_current(139);
        }
        panic!("kernel fault at {} ({:?}): {}", va, write, err);
    }
}
