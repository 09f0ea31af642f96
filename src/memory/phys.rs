//! Physical frame allocator.
//!
//! A bitmap pool over the available RAM ranges announced at boot.
//! One bit per 4 KiB frame, set = free. Allocation scans ranges from
//! the highest downwards and takes the first set bit; no compaction
//! or reclaim exists, running dry is fatal for callers that cannot
//! back out.

use bit_field::BitField;
use spin::Mutex;

use super::addr::PageFrame;
use crate::error::KernelError;

/// Frame pool exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl From<OutOfMemory> for KernelError {
    fn from(_: OutOfMemory) -> Self {
        KernelError::OutOfMemory
    }
}

/// Maximum number of contiguous ranges the boot contract may announce
const MAX_RANGES: usize = 16;
/// Bitmap backing store, sized for the full 32-bit frame space
/// (4 GiB / 4 KiB / 32 bits per word). Lives in .bss; the pool cannot
/// use the kernel heap because it initializes before it.
const BITMAP_WORDS: usize = 1 << 15;

#[derive(Debug, Clone, Copy)]
struct FrameRange {
    base: u32,
    count: u32,
    free: u32,
    /// First word of this range's bitmap in the shared store
    word_offset: usize,
}

pub struct FramePool {
    ranges: [Option<FrameRange>; MAX_RANGES],
    range_count: usize,
    bitmap: [u32; BITMAP_WORDS],
    words_used: usize,
}

impl FramePool {
    pub const fn new() -> Self {
        Self {
            ranges: [None; MAX_RANGES],
            range_count: 0,
            bitmap: [0; BITMAP_WORDS],
            words_used: 0,
        }
    }

    /// Announce a contiguous range of available frames. Ranges must
    /// arrive in increasing base order, lowest first.
    pub fn add_range(&mut self, base: PageFrame, count: u32) {
        assert!(self.range_count < MAX_RANGES, "too many memory ranges");
        let words = ((count + 31) / 32) as usize;
        assert!(self.words_used + words <= BITMAP_WORDS);

        let range = FrameRange {
            base: base.number(),
            count,
            free: count,
            word_offset: self.words_used,
        };

        // All announced frames start out free
        for i in 0..count {
            let w = range.word_offset + (i / 32) as usize;
            self.bitmap[w].set_bit(31 - (i % 32) as usize, true);
        }

        self.ranges[self.range_count] = Some(range);
        self.range_count += 1;
        self.words_used += words;
    }

    /// Take one free frame, searching the highest range first
    pub fn allocate(&mut self) -> Result<PageFrame, OutOfMemory> {
        for slot in self.ranges[..self.range_count].iter_mut().rev() {
            let range = match slot {
                Some(r) if r.free > 0 => r,
                _ => continue,
            };
            let words = ((range.count + 31) / 32) as usize;
            for w in 0..words {
                let word = self.bitmap[range.word_offset + w];
                if word == 0 {
                    continue;
                }
                let bit = word.leading_zeros();
                let index = w as u32 * 32 + bit;
                debug_assert!(index < range.count);
                self.bitmap[range.word_offset + w].set_bit(31 - bit as usize, false);
                range.free -= 1;
                return Ok(PageFrame::new(range.base + index));
            }
            unreachable!("free count nonzero but no free bit found");
        }
        Err(OutOfMemory)
    }

    /// Return a frame to the pool
    pub fn free(&mut self, frame: PageFrame) {
        let number = frame.number();
        for slot in self.ranges[..self.range_count].iter_mut() {
            let range = match slot {
                Some(r) => r,
                None => continue,
            };
            if number < range.base || number >= range.base + range.count {
                continue;
            }
            let index = number - range.base;
            let w = range.word_offset + (index / 32) as usize;
            let bit = 31 - (index % 32) as usize;
            assert!(!self.bitmap[w].get_bit(bit), "double free of {}", frame);
            self.bitmap[w].set_bit(bit, true);
            range.free += 1;
            return;
        }
        panic!("freeing {} outside all ranges", frame);
    }

    pub fn free_frames(&self) -> u64 {
        self.ranges[..self.range_count]
            .iter()
            .flatten()
            .map(|r| r.free as u64)
            .sum()
    }

    pub fn total_frames(&self) -> u64 {
        self.ranges[..self.range_count]
            .iter()
            .flatten()
            .map(|r| r.count as u64)
            .sum()
    }
}

static FRAME_POOL: Mutex<FramePool> = Mutex::new(FramePool::new());

/// Announce a range during early boot
pub fn add_range(base: PageFrame, count: u32) {
    FRAME_POOL.lock().add_range(base, count);
}

/// Allocate one frame
pub fn allocate() -> Result<PageFrame, OutOfMemory> {
    FRAME_POOL.lock().allocate()
}

/// Allocate one frame, zero-filled through the kernel window
pub fn allocate_zeroed() -> Result<PageFrame, OutOfMemory> {
    let frame = allocate()?;
    crate::arch::zero_frame(frame);
    Ok(frame)
}

/// Release one frame
pub fn free(frame: PageFrame) {
    FRAME_POOL.lock().free(frame);
}

pub fn free_frames() -> u64 {
    FRAME_POOL.lock().free_frames()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_from_highest_range_first() {
        let mut pool = FramePool::new();
        pool.add_range(PageFrame::new(0x100), 8);
        pool.add_range(PageFrame::new(0x8000), 4);

        let f = pool.allocate().unwrap();
        assert_eq!(f.number(), 0x8000);
        let f = pool.allocate().unwrap();
        assert_eq!(f.number(), 0x8001);
    }

    #[test]
    fn exhausts_high_range_then_falls_back() {
        let mut pool = FramePool::new();
        pool.add_range(PageFrame::new(0x100), 2);
        pool.add_range(PageFrame::new(0x8000), 1);

        assert_eq!(pool.allocate().unwrap().number(), 0x8000);
        assert_eq!(pool.allocate().unwrap().number(), 0x100);
        assert_eq!(pool.allocate().unwrap().number(), 0x101);
        assert_eq!(pool.allocate(), Err(OutOfMemory));
    }

    #[test]
    fn last_frame_is_valid_then_out_of_memory() {
        let mut pool = FramePool::new();
        pool.add_range(PageFrame::new(0), 33);

        for i in 0..33 {
            assert_eq!(pool.allocate().unwrap().number(), i);
        }
        assert_eq!(pool.free_frames(), 0);
        assert_eq!(pool.allocate(), Err(OutOfMemory));
    }

    #[test]
    fn free_makes_frame_available_again() {
        let mut pool = FramePool::new();
        pool.add_range(PageFrame::new(0x10), 64);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        pool.free(a);
        assert_eq!(pool.allocate().unwrap(), a);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut pool = FramePool::new();
        pool.add_range(PageFrame::new(0), 4);
        let f = pool.allocate().unwrap();
        pool.free(f);
        pool.free(f);
    }

    #[test]
    fn randomized_alloc_free_keeps_counts() {
        use rand::prelude::*;
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xd00d);

        let mut pool = FramePool::new();
        pool.add_range(PageFrame::new(0), 200);
        pool.add_range(PageFrame::new(0x1000), 100);
        let total = pool.total_frames();

        let mut held = alloc::vec::Vec::new();
        for _ in 0..2000 {
            if rng.gen_bool(0.6) {
                match pool.allocate() {
                    Ok(f) => held.push(f),
                    Err(OutOfMemory) => assert_eq!(held.len() as u64, total),
                }
            } else if let Some(i) = (0..held.len()).choose(&mut rng) {
                pool.free(held.swap_remove(i));
            }
            assert_eq!(pool.free_frames(), total - held.len() as u64);
        }
    }
}
