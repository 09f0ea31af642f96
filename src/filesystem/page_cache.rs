//! The page cache.
//!
//! Maps `(vnode, page-aligned offset)` to the vmpage holding that
//! span. A miss populates through the vnode's `get_page` while the
//! cache lock is held, so concurrent misses on the same key resolve to
//! a single population (single-flight). Writes go through the vnode's
//! `put_page` (write-through); eviction is out of scope.

use alloc::collections::BTreeMap;
use spin::Mutex;

use crate::error::KernelResult;
use crate::memory::prelude::PAGE_SIZE;
use crate::memory::vmpage::VmPageRef;

use super::vnode::{Vnode, VnodeId};

lazy_static::lazy_static! {
    /// Ordered by (vnode, offset) so one vnode's pages cluster
    static ref CACHE: Mutex<BTreeMap<(VnodeId, u64), VmPageRef>> = Mutex::new(BTreeMap::new());
}

/// The page backing `vnode` at `offset` (any offset within the page)
pub fn get(vnode: &Vnode, offset: u64) -> KernelResult<VmPageRef> {
    let aligned = offset & !(PAGE_SIZE as u64 - 1);
    let key = (vnode.id(), aligned);

    let mut cache = CACHE.lock();
    if let Some(page) = cache.get(&key) {
        return Ok(page.clone());
    }
    // Populate under the lock: concurrent misses see one page and the
    // vnode sees one get_page
    let page = vnode.produce_page(aligned)?;
    cache.insert(key, page.clone());
    Ok(page)
}

/// Forget every cached page of a dying vnode
pub fn drop_vnode(id: VnodeId) {
    let mut cache = CACHE.lock();
    let doomed: alloc::vec::Vec<(VnodeId, u64)> = cache
        .range((id, 0)..=(id, u64::MAX))
        .map(|(k, _)| *k)
        .collect();
    for key in doomed {
        cache.remove(&key);
    }
}

/// Number of cached pages for a vnode
pub fn resident(id: VnodeId) -> usize {
    CACHE.lock().range((id, 0)..=(id, u64::MAX)).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::filesystem::vnode::{VnodeKind, VnodeOps};
    use crate::memory::test_support;
    use crate::memory::vmpage::VmPage;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFile {
        populated: Arc<AtomicUsize>,
    }

    impl VnodeOps for CountingFile {
        fn get_page(&self, _vnode: &Vnode, _offset: u64) -> KernelResult<VmPageRef> {
            self.populated.fetch_add(1, Ordering::SeqCst);
            VmPage::alloc_zeroed()
        }

        fn size(&self, _vnode: &Vnode) -> u64 {
            0x10000
        }
    }

    fn counting_vnode() -> (Arc<Vnode>, Arc<AtomicUsize>) {
        let populated = Arc::new(AtomicUsize::new(0));
        let vnode = Vnode::new(
            VnodeKind::Regular,
            alloc::boxed::Box::new(CountingFile {
                populated: populated.clone(),
            }),
        );
        (vnode, populated)
    }

    #[test]
    fn hit_returns_the_same_page() {
        let _guard = test_support::exclusive();
        let (vnode, populated) = counting_vnode();
        let a = get(&vnode, 0x1000).unwrap();
        let b = get(&vnode, 0x1000).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(populated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sub_page_offsets_share_the_page() {
        let _guard = test_support::exclusive();
        let (vnode, populated) = counting_vnode();
        let a = get(&vnode, 0x2000).unwrap();
        let b = get(&vnode, 0x2abc).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(populated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_misses_are_single_flight() {
        let _guard = test_support::exclusive();
        let (vnode, populated) = counting_vnode();

        let mut handles = alloc::vec::Vec::new();
        for _ in 0..8 {
            let vnode = vnode.clone();
            handles.push(std::thread::spawn(move || {
                get(&vnode, 0x3000).unwrap().lock().frame()
            }));
        }
        let frames: alloc::vec::Vec<_> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(frames.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(populated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dying_vnode_leaves_no_residue() {
        let _guard = test_support::exclusive();
        let (vnode, _populated) = counting_vnode();
        let id = vnode.id();
        get(&vnode, 0).unwrap();
        get(&vnode, 0x1000).unwrap();
        assert_eq!(resident(id), 2);
        drop(vnode);
        assert_eq!(resident(id), 0);
    }

    #[test]
    fn population_failure_propagates() {
        let _guard = test_support::exclusive();
        struct Failing;
        impl VnodeOps for Failing {
            fn get_page(&self, _v: &Vnode, _o: u64) -> KernelResult<VmPageRef> {
                Err(KernelError::IoError)
            }
        }
        let vnode = Vnode::new(VnodeKind::Regular, alloc::boxed::Box::new(Failing));
        assert_eq!(get(&vnode, 0).unwrap_err(), KernelError::IoError);
    }
}
