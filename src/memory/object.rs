//! VM objects: the sources of physical pages behind segments.
//!
//! * `Zero` hands out a freshly zeroed page for any offset.
//! * `Anonymous` remembers pages by offset; cloning snapshots every
//!   page as a shared copy-on-write reference.
//! * `Direct` maps offsets linearly onto a fixed frame range (device
//!   memory); its frames are never released.
//! * `Vnode` delegates to the page cache over a vnode.
//! * `Heap` is the kernel-heap singleton, backed by a fixed frame
//!   table.

use alloc::sync::Arc;
use hashbrown::HashMap;
use spin::Mutex;

use super::addr::{PageFrame, PAGE_SIZE_LOG2};
use super::heap;
use super::vmpage::{VmPage, VmPageRef};
use crate::error::{KernelError, KernelResult};
use crate::filesystem::page_cache;
use crate::filesystem::vnode::Vnode;

pub type VmObjectRef = Arc<VmObject>;

pub enum VmObject {
    Zero,
    Anonymous {
        pages: Mutex<HashMap<u64, VmPageRef>>,
    },
    Direct {
        base: PageFrame,
        size: u64,
        pages: Mutex<HashMap<u64, VmPageRef>>,
    },
    Vnode {
        vnode: Arc<Vnode>,
    },
    Heap,
}

fn page_number(offset: u64) -> u64 {
    offset >> PAGE_SIZE_LOG2
}

impl VmObject {
    /// The shared zero object
    pub fn zero() -> VmObjectRef {
        lazy_static::lazy_static! {
            static ref ZERO: VmObjectRef = Arc::new(VmObject::Zero);
        }
        ZERO.clone()
    }

    pub fn anonymous() -> VmObjectRef {
        Arc::new(VmObject::Anonymous {
            pages: Mutex::new(HashMap::new()),
        })
    }

    pub fn direct(base: PageFrame, size: u64) -> VmObjectRef {
        Arc::new(VmObject::Direct {
            base,
            size,
            pages: Mutex::new(HashMap::new()),
        })
    }

    pub fn vnode(vnode: Arc<Vnode>) -> VmObjectRef {
        Arc::new(VmObject::Vnode { vnode })
    }

    /// Produce the page at `offset`, or `None` if this object has no
    /// page there (the caller falls back to the clean object).
    pub fn get_page(&self, offset: u64) -> KernelResult<Option<VmPageRef>> {
        match self {
            VmObject::Zero => Ok(Some(VmPage::alloc_zeroed()?)),
            VmObject::Anonymous { pages } => Ok(pages.lock().get(&page_number(offset)).cloned()),
            VmObject::Direct { base, size, pages } => {
                if offset >= *size {
                    return Err(KernelError::InvalidPointer(offset as u32));
                }
                let number = page_number(offset);
                let mut pages = pages.lock();
                if let Some(page) = pages.get(&number) {
                    return Ok(Some(page.clone()));
                }
                let page = VmPage::with_frame(*base + number as u32);
                pages.insert(number, page.clone());
                Ok(Some(page))
            },
            VmObject::Vnode { vnode } => Ok(Some(page_cache::get(vnode, offset)?)),
            VmObject::Heap => Ok(Some(heap::object_get_page(offset)?)),
        }
    }

    /// Install `page` at `offset`, returning the page previously there
    pub fn put_page(&self, offset: u64, page: VmPageRef) -> KernelResult<Option<VmPageRef>> {
        match self {
            VmObject::Anonymous { pages } => Ok(pages.lock().insert(page_number(offset), page)),
            VmObject::Heap => {
                heap::object_put_page(offset, &page)?;
                Ok(None)
            },
            _ => Err(KernelError::NotSupported),
        }
    }

    /// Clone for a copy-on-write split. Stateless objects clone to
    /// themselves; an anonymous object snapshots every current page as
    /// a shared copy.
    pub fn clone_object(this: &VmObjectRef) -> KernelResult<VmObjectRef> {
        match &**this {
            VmObject::Anonymous { pages } => {
                let mut copy = HashMap::new();
                for (number, page) in pages.lock().iter() {
                    page.lock().put_copy();
                    copy.insert(*number, page.clone());
                }
                Ok(Arc::new(VmObject::Anonymous {
                    pages: Mutex::new(copy),
                }))
            },
            VmObject::Zero | VmObject::Direct { .. } | VmObject::Vnode { .. } => Ok(this.clone()),
            VmObject::Heap => Err(KernelError::NotSupported),
        }
    }

    /// Drop every page at or beyond `offset`. Only meaningful for
    /// anonymous objects; used by heap contraction and arena reset.
    pub fn truncate(&self, offset: u64) {
        if let VmObject::Anonymous { pages } = self {
            let cutoff = page_number(offset + (1 << PAGE_SIZE_LOG2) - 1);
            pages.lock().retain(|number, _| *number < cutoff);
        }
    }

    /// Release all backing pages
    pub fn release(&self) {
        if let VmObject::Anonymous { pages } = self {
            pages.lock().clear();
        }
    }

    /// Number of resident pages (anonymous and direct objects)
    pub fn resident_pages(&self) -> usize {
        match self {
            VmObject::Anonymous { pages } | VmObject::Direct { pages, .. } => pages.lock().len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::memory::test_support;

    #[test]
    fn zero_object_always_yields_fresh_pages() {
        let _guard = test_support::exclusive();
        let zero = VmObject::zero();
        let a = zero.get_page(0).unwrap().unwrap();
        let b = zero.get_page(0).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        let frame = a.lock().frame();
        assert!(unsafe { arch::frame_slice(frame) }.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_clones_to_itself() {
        test_support::init();
        let zero = VmObject::zero();
        let clone = VmObject::clone_object(&zero).unwrap();
        assert!(Arc::ptr_eq(&zero, &clone));
    }

    #[test]
    fn anonymous_roundtrip_and_miss() {
        let _guard = test_support::exclusive();
        let anon = VmObject::anonymous();
        assert!(anon.get_page(0x3000).unwrap().is_none());

        let page = VmPage::alloc_zeroed().unwrap();
        anon.put_page(0x3000, page.clone()).unwrap();
        let got = anon.get_page(0x3000).unwrap().unwrap();
        assert!(Arc::ptr_eq(&page, &got));
        // Sub-page offsets resolve to the same page
        let got = anon.get_page(0x3abc).unwrap().unwrap();
        assert!(Arc::ptr_eq(&page, &got));
    }

    #[test]
    fn anonymous_clone_shares_pages_as_cow() {
        let _guard = test_support::exclusive();
        let anon = VmObject::anonymous();
        let page = VmPage::alloc_zeroed().unwrap();
        anon.put_page(0, page.clone()).unwrap();

        let clone = VmObject::clone_object(&anon).unwrap();
        let shared = clone.get_page(0).unwrap().unwrap();
        assert!(Arc::ptr_eq(&page, &shared));
        assert_eq!(page.lock().copies(), 1);
    }

    #[test]
    fn direct_object_maps_linearly_and_bounds_checks() {
        let _guard = test_support::exclusive();
        let direct = VmObject::direct(PageFrame::new(0x500), 0x3000);
        let page = direct.get_page(0x2000).unwrap().unwrap();
        assert_eq!(page.lock().frame(), PageFrame::new(0x502));
        // Cached on repeat
        let again = direct.get_page(0x2000).unwrap().unwrap();
        assert!(Arc::ptr_eq(&page, &again));

        assert!(matches!(
            direct.get_page(0x3000),
            Err(KernelError::InvalidPointer(_))
        ));
    }

    #[test]
    fn truncate_drops_tail_pages() {
        let _guard = test_support::exclusive();
        let anon = VmObject::anonymous();
        for i in 0..4u64 {
            anon.put_page(i * 0x1000, VmPage::alloc_zeroed().unwrap())
                .unwrap();
        }
        assert_eq!(anon.resident_pages(), 4);
        anon.truncate(0x2000);
        assert_eq!(anon.resident_pages(), 2);
        assert!(anon.get_page(0x1000).unwrap().is_some());
        assert!(anon.get_page(0x2000).unwrap().is_none());
    }
}
