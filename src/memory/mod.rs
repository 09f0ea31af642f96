//! Memory management: frame allocator, address spaces, demand-paged
//! segments, slabs and arenas, and the kernel heap.

pub mod addr;
pub mod arena;
pub mod heap;
pub mod object;
pub mod paging;
pub mod phys;
pub mod segment;
pub mod slab;
pub mod vmpage;

pub mod prelude {
    pub use super::addr::{
        to_pages_round_up, PageFrame, PhysAddr, VirtAddr, PAGE_SIZE, PAGE_SIZE_LOG2,
    };
    pub use super::paging::{Asid, KERNEL_BASE};
}

use self::addr::{VirtAddr, PAGE_SIZE_LOG2};
use spin::Mutex;

use crate::bootinfo::{MemoryKind, MemoryRange};

/// Kernel-window virtual address carve-out for arenas and other
/// fault-backed regions. Never reused; sized so a busy system cannot
/// run the window dry.
static KERNEL_VA_NEXT: Mutex<u32> = Mutex::new(0xe000_0000);

/// Reserve `pages` of kernel-window virtual address space
pub fn reserve_kernel_va(pages: u32) -> VirtAddr {
    let mut next = KERNEL_VA_NEXT.lock();
    let at = *next;
    *next += pages << PAGE_SIZE_LOG2;
    VirtAddr::new(at)
}

/// Initialize the memory subsystems in dependency order: frames,
/// page-table pool, kernel heap.
pub fn init(ranges: &[MemoryRange]) {
    let mut available = 0u64;
    for range in ranges {
        if range.kind == MemoryKind::Available && range.frames > 0 {
            phys::add_range(range.base, range.frames);
            available += range.frames as u64;
        }
    }
    log::info!("{} frames of physical memory", available);

    paging::init();
    heap::init();
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::addr::PageFrame;
    use super::{paging, phys};
    use crate::arch::testing::{self, TestPort};
    use spin::Once;
    use std::sync::{Mutex, MutexGuard};

    /// Install the test port and seed the global frame pool and
    /// page-table pool, once per test process.
    pub fn init() -> &'static TestPort {
        static SEED: Once<()> = Once::new();
        let port = testing::init();
        SEED.call_once(|| {
            phys::add_range(PageFrame::new(0x100), 0x3_0000);
            paging::init();
        });
        port
    }

    /// Serialize tests that assert on shared global state (frame
    /// counts, ASID slots). Poisoning is ignored: a failed test must
    /// not wedge the rest of the suite.
    pub fn exclusive() -> MutexGuard<'static, ()> {
        static LOCK: Mutex<()> = Mutex::new(());
        init();
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }
}
