//! Kernel heap.
//!
//! The heap is one fixed virtual window backed by the heap VM object:
//! a fixed table of frames filled in on first touch through the page
//! fault path. On top of the window sits a first-fit free-list
//! allocator exposed as the Rust `GlobalAlloc` (kernel builds only;
//! hosted tests use the host allocator).

use alloc::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr;
use spin::Mutex;

use super::addr::{PageFrame, VirtAddr, PAGE_SIZE, PAGE_SIZE_LOG2};
use super::phys;
use super::segment::{Segment, KERNEL_SPACE};
use super::vmpage::{VmPage, VmPageRef};
use crate::error::{KernelError, KernelResult};

/// Base of the kernel heap window
pub const HEAP_BASE: VirtAddr = VirtAddr::new(0xd000_0000);
/// Heap size: 16 MiB
pub const HEAP_PAGES: usize = 4096;

/// The heap object's fixed frame table
static HEAP_FRAMES: Mutex<[Option<PageFrame>; HEAP_PAGES]> = Mutex::new([None; HEAP_PAGES]);

/// Heap-object page lookup: allocate the backing frame on first use.
/// The returned page does not own the frame; heap frames are never
/// released.
pub fn object_get_page(offset: u64) -> KernelResult<VmPageRef> {
    let number = (offset >> PAGE_SIZE_LOG2) as usize;
    let mut table = HEAP_FRAMES.lock();
    let frame = match table.get_mut(number) {
        Some(slot) => match slot {
            Some(frame) => *frame,
            None => {
                let frame = phys::allocate()?;
                *slot = Some(frame);
                frame
            },
        },
        None => panic!("heap page {:#x} beyond end of heap", offset),
    };
    Ok(VmPage::with_frame(frame))
}

/// Heap-object page install: adopt the page's frame into the table
pub fn object_put_page(offset: u64, page: &VmPageRef) -> KernelResult<()> {
    let number = (offset >> PAGE_SIZE_LOG2) as usize;
    let mut table = HEAP_FRAMES.lock();
    match table.get_mut(number) {
        Some(slot) => {
            *slot = Some(page.lock().frame());
            Ok(())
        },
        None => Err(KernelError::IntBounds),
    }
}

/// Install the heap segment into the kernel map
pub fn init() {
    KERNEL_SPACE.add(Segment::heap(HEAP_BASE, HEAP_PAGES as u32 * PAGE_SIZE));
}

/// Free-list header, stored at the start of each free block
struct FreeBlock {
    size: usize,
    next: *mut FreeBlock,
}

const MIN_ALLOC: usize = mem::size_of::<FreeBlock>();

struct Head(*mut FreeBlock);
// The raw pointer only ever refers to the heap window
unsafe impl Send for Head {}

pub struct GlobAlloc {
    head: Mutex<Head>,
}

impl GlobAlloc {
    pub const fn new() -> Self {
        Self {
            head: Mutex::new(Head(ptr::null_mut())),
        }
    }

    /// Seed the free list with the whole heap window. Called once,
    /// after the heap segment exists.
    ///
    /// # Safety
    /// The heap window must be faultable (memory::init done).
    pub unsafe fn seed(&self) {
        let block = HEAP_BASE.as_u32() as usize as *mut FreeBlock;
        (*block).size = HEAP_PAGES * PAGE_SIZE as usize;
        (*block).next = ptr::null_mut();
        self.head.lock().0 = block;
    }
}

unsafe impl GlobalAlloc for GlobAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(MIN_ALLOC);
        let align = layout.align().max(mem::align_of::<FreeBlock>());

        let mut head = self.head.lock();
        let mut prev: *mut *mut FreeBlock = &mut head.0;
        let mut block = head.0;
        while !block.is_null() {
            let start = block as usize;
            let aligned = (start + align - 1) & !(align - 1);
            let pad = aligned - start;
            if (*block).size >= pad + size {
                // Carve from this block: leading pad stays free if it
                // can hold a header, the tail is split off.
                let tail = (*block).size - pad - size;
                let next = (*block).next;

                let mut replacement = next;
                if tail >= MIN_ALLOC {
                    let tail_block = (aligned + size) as *mut FreeBlock;
                    (*tail_block).size = tail;
                    (*tail_block).next = replacement;
                    replacement = tail_block;
                }
                if pad >= MIN_ALLOC {
                    (*block).size = pad;
                    (*block).next = replacement;
                    replacement = block;
                }
                *prev = replacement;
                return aligned as *mut u8;
            }
            prev = &mut (*block).next;
            block = (*block).next;
        }
        // Heap exhausted
        ptr::null_mut()
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, layout: Layout) {
        let size = layout.size().max(MIN_ALLOC);
        let block = ptr_in as *mut FreeBlock;
        let mut head = self.head.lock();
        (*block).size = size;
        (*block).next = head.0;
        head.0 = block;
    }
}
