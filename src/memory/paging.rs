//! Address-space manager.
//!
//! Owns a small fixed pool of hardware page-table sets (one two-level
//! i386 directory per slot). Address spaces are identified by an
//! [`Asid`]; when more address spaces exist than slots, the least
//! recently used slot is victimized and its user half rebuilt on
//! demand through page faults.
//!
//! The kernel window (above `KERNEL_BASE`) maps identically in every
//! slot: kernel page tables are shared and their directory entries
//! are mirrored into all slot directories. The user window is private
//! per slot. Every mapping update invalidates the local TLB entry.

use bit_field::BitField;
use spin::{Mutex, Once};

use super::addr::{PageFrame, VirtAddr};
use super::phys::{self, OutOfMemory};
use crate::arch;

/// Start of the kernel window (3 GiB / 1 GiB split)
pub const KERNEL_BASE: VirtAddr = VirtAddr::new(0xc000_0000);

/// Number of hardware page-table sets. Slot 0 is pinned to the kernel
/// address space.
pub const ASID_SLOTS: usize = 4;

const DIR_ENTRIES: usize = 1024;
/// First directory index of the kernel window
const KERNEL_DIR_FIRST: usize = (KERNEL_BASE.as_u32() >> 22) as usize;

/// Address-space identifier. `Asid::KERNEL` is the kernel address
/// space; process address spaces get fresh increasing values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Asid(u32);

impl Asid {
    pub const KERNEL: Asid = Asid(0);

    pub fn is_kernel(self) -> bool {
        self == Self::KERNEL
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

static NEXT_ASID: Mutex<u32> = Mutex::new(1);

/// Allocate a fresh address-space identifier
pub fn new_asid() -> Asid {
    let mut next = NEXT_ASID.lock();
    let asid = Asid(*next);
    *next += 1;
    asid
}

bitflags! {
    pub struct PteFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
    }
}

/// One page-table or page-directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct Pte(u32);

static_assertions::assert_eq_size!(Pte, u32);

impl Pte {
    const EMPTY: Pte = Pte(0);

    fn new(frame: PageFrame, flags: PteFlags) -> Self {
        Pte((frame.number() << 12) | flags.bits())
    }

    fn frame(self) -> PageFrame {
        PageFrame::new(self.0.get_bits(12..32))
    }

    fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }
}

/// View a frame as a page table through the kernel window.
///
/// Safety: the frame must hold a page table owned by the pool, and the
/// pool lock must be held.
unsafe fn table_mut<'a>(frame: PageFrame) -> &'a mut [Pte; DIR_ENTRIES] {
    &mut *(arch::port().frame_ptr(frame) as *mut [Pte; DIR_ENTRIES])
}

struct Slot {
    owner: Option<Asid>,
    /// LRU sequence, bumped on every use
    seq: u64,
    dir: PageFrame,
    /// User-window page tables, kept with the slot and zeroed when the
    /// slot changes owner
    user_tables: [Option<PageFrame>; KERNEL_DIR_FIRST],
}

pub struct AsidPool {
    slots: [Slot; ASID_SLOTS],
    /// Kernel-window page tables, shared by every slot
    kernel_tables: [Option<PageFrame>; DIR_ENTRIES - KERNEL_DIR_FIRST],
    next_seq: u64,
}

impl AsidPool {
    pub fn new() -> Result<Self, OutOfMemory> {
        let mut slots = [(); ASID_SLOTS].map(|_| Slot {
            owner: None,
            seq: 0,
            dir: PageFrame::new(0),
            user_tables: [None; KERNEL_DIR_FIRST],
        });
        for slot in slots.iter_mut() {
            let dir = phys::allocate()?;
            arch::zero_frame(dir);
            slot.dir = dir;
        }
        slots[0].owner = Some(Asid::KERNEL);
        Ok(Self {
            slots,
            kernel_tables: [None; DIR_ENTRIES - KERNEL_DIR_FIRST],
            next_seq: 1,
        })
    }

    /// Find the slot already holding `asid`, without victimizing
    fn probe(&mut self, asid: Asid) -> Option<usize> {
        if asid.is_kernel() {
            return Some(0);
        }
        for (i, slot) in self.slots.iter_mut().enumerate().skip(1) {
            if slot.owner == Some(asid) {
                slot.seq = self.next_seq;
                self.next_seq += 1;
                return Some(i);
            }
        }
        None
    }

    /// Find or build a slot for `asid`, victimizing the least recently
    /// used one if needed
    fn slot_for(&mut self, asid: Asid) -> usize {
        if let Some(i) = self.probe(asid) {
            return i;
        }

        // Victimize: lowest sequence among the non-kernel slots
        let victim = (1..ASID_SLOTS)
            .min_by_key(|&i| self.slots[i].seq)
            .expect("no victim slot");

        let slot = &mut self.slots[victim];
        slot.owner = Some(asid);
        slot.seq = self.next_seq;
        self.next_seq += 1;

        // The previous owner's user mappings die with the slot; they
        // rebuild through page faults. Table frames stay with the slot.
        for (dir_index, table) in slot.user_tables.iter().enumerate() {
            if let Some(table) = table {
                arch::zero_frame(*table);
                unsafe {
                    table_mut(slot.dir)[dir_index] =
                        Pte::new(*table, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER);
                }
            }
        }
        victim
    }

    /// Locate the page table holding `va` in `slot`, allocating it if
    /// `create` is set. Kernel-window tables are shared and mirrored
    /// into every slot directory.
    fn locate_table(
        &mut self, slot_index: usize, va: VirtAddr, create: bool,
    ) -> Result<Option<PageFrame>, OutOfMemory> {
        let dir_index = (va.as_u32() >> 22) as usize;

        if dir_index >= KERNEL_DIR_FIRST {
            let k = dir_index - KERNEL_DIR_FIRST;
            if let Some(table) = self.kernel_tables[k] {
                return Ok(Some(table));
            }
            if !create {
                return Ok(None);
            }
            let table = phys::allocate()?;
            arch::zero_frame(table);
            self.kernel_tables[k] = Some(table);
            // Kernel mapping, reflect across all slots
            let entry = Pte::new(table, PteFlags::PRESENT | PteFlags::WRITABLE);
            for slot in self.slots.iter() {
                unsafe {
                    table_mut(slot.dir)[dir_index] = entry;
                }
            }
            Ok(Some(table))
        } else {
            let slot = &mut self.slots[slot_index];
            if let Some(table) = slot.user_tables[dir_index] {
                return Ok(Some(table));
            }
            if !create {
                return Ok(None);
            }
            let table = phys::allocate()?;
            arch::zero_frame(table);
            slot.user_tables[dir_index] = Some(table);
            unsafe {
                table_mut(slot.dir)[dir_index] =
                    Pte::new(table, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER);
            }
            Ok(Some(table))
        }
    }

    pub fn map(
        &mut self, asid: Asid, va: VirtAddr, frame: PageFrame, rw: bool, user: bool,
    ) -> Result<(), OutOfMemory> {
        let slot = self.slot_for(asid);
        let table = self
            .locate_table(slot, va, true)?
            .expect("table created above");

        let mut flags = PteFlags::PRESENT;
        if rw {
            flags |= PteFlags::WRITABLE;
        }
        if user {
            flags |= PteFlags::USER;
        }
        unsafe {
            table_mut(table)[(va.page_number() & 0x3ff) as usize] = Pte::new(frame, flags);
        }
        arch::port().invalidate_page(va);
        Ok(())
    }

    pub fn unmap(&mut self, asid: Asid, va: VirtAddr) {
        // A victimized address space has no live user mappings left
        let slot = match self.probe(asid) {
            Some(i) => i,
            None => return,
        };
        if let Ok(Some(table)) = self.locate_table(slot, va, false) {
            unsafe {
                table_mut(table)[(va.page_number() & 0x3ff) as usize] = Pte::EMPTY;
            }
            arch::port().invalidate_page(va);
        }
    }

    fn pte(&mut self, asid: Asid, va: VirtAddr) -> Option<Pte> {
        let slot = self.probe(asid)?;
        let table = self.locate_table(slot, va, false).ok()??;
        let pte = unsafe { table_mut(table)[(va.page_number() & 0x3ff) as usize] };
        pte.is_present().then(|| pte)
    }

    pub fn get_page(&mut self, asid: Asid, va: VirtAddr) -> Option<PageFrame> {
        self.pte(asid, va).map(Pte::frame)
    }

    pub fn is_mapped(&mut self, asid: Asid, va: VirtAddr) -> bool {
        self.pte(asid, va).is_some()
    }

    pub fn is_writable(&mut self, asid: Asid, va: VirtAddr) -> bool {
        self.pte(asid, va)
            .map_or(false, |pte| pte.flags().contains(PteFlags::WRITABLE))
    }

    pub fn is_user(&mut self, asid: Asid, va: VirtAddr) -> bool {
        self.pte(asid, va)
            .map_or(false, |pte| pte.flags().contains(PteFlags::USER))
    }

    /// Make `asid` the active translation root
    pub fn set_asid(&mut self, asid: Asid) {
        let slot = self.slot_for(asid);
        arch::port().set_translation_root(self.slots[slot].dir.start_address());
    }

    /// Forget a dead address space. Its slot becomes the preferred
    /// victim.
    pub fn release_asid(&mut self, asid: Asid) {
        if let Some(i) = self.probe(asid) {
            if i != 0 {
                self.slots[i].owner = None;
                self.slots[i].seq = 0;
            }
        }
    }
}

static POOL: Once<Mutex<AsidPool>> = Once::new();

/// Build the page-table pool. Requires the frame allocator.
pub fn init() {
    POOL.call_once(|| Mutex::new(AsidPool::new().expect("out of memory building page tables")));
}

fn pool() -> &'static Mutex<AsidPool> {
    POOL.get().expect("paging not initialized")
}

pub fn map(asid: Asid, va: VirtAddr, frame: PageFrame, rw: bool, user: bool) {
    pool()
        .lock()
        .map(asid, va, frame, rw, user)
        .expect("out of memory extending page tables");
}

pub fn unmap(asid: Asid, va: VirtAddr) {
    pool().lock().unmap(asid, va)
}

pub fn get_page(asid: Asid, va: VirtAddr) -> Option<PageFrame> {
    pool().lock().get_page(asid, va)
}

pub fn is_mapped(asid: Asid, va: VirtAddr) -> bool {
    pool().lock().is_mapped(asid, va)
}

pub fn is_writable(asid: Asid, va: VirtAddr) -> bool {
    pool().lock().is_writable(asid, va)
}

pub fn is_user(asid: Asid, va: VirtAddr) -> bool {
    pool().lock().is_user(asid, va)
}

pub fn set_asid(asid: Asid) {
    pool().lock().set_asid(asid)
}

pub fn release_asid(asid: Asid) {
    pool().lock().release_asid(asid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;

    fn test_pool() -> AsidPool {
        test_support::init();
        AsidPool::new().unwrap()
    }

    #[test]
    fn map_and_query() {
        let _guard = test_support::exclusive();
        let mut pool = test_pool();
        let asid = new_asid();
        let va = VirtAddr::new(0x40_0000);
        let frame = phys::allocate().unwrap();

        assert!(!pool.is_mapped(asid, va));
        pool.map(asid, va, frame, true, true).unwrap();
        assert!(pool.is_mapped(asid, va));
        assert!(pool.is_writable(asid, va));
        assert!(pool.is_user(asid, va));
        assert_eq!(pool.get_page(asid, va), Some(frame));

        pool.unmap(asid, va);
        assert!(!pool.is_mapped(asid, va));
        assert_eq!(pool.get_page(asid, va), None);
    }

    #[test]
    fn read_only_mapping() {
        let _guard = test_support::exclusive();
        let mut pool = test_pool();
        let asid = new_asid();
        let va = VirtAddr::new(0x1000);
        let frame = phys::allocate().unwrap();

        pool.map(asid, va, frame, false, true).unwrap();
        assert!(pool.is_mapped(asid, va));
        assert!(!pool.is_writable(asid, va));
    }

    #[test]
    fn kernel_window_mirrors_into_every_slot() {
        let _guard = test_support::exclusive();
        let mut pool = test_pool();
        let frame = phys::allocate().unwrap();
        let kva = VirtAddr::new(KERNEL_BASE.as_u32() + 0x40_0000);

        pool.map(Asid::KERNEL, kva, frame, true, false).unwrap();

        // Visible through any other address space as well
        let other = new_asid();
        // Materialize the slot with a user mapping first
        let uframe = phys::allocate().unwrap();
        pool.map(other, VirtAddr::new(0x1000), uframe, true, true)
            .unwrap();

        assert_eq!(pool.get_page(other, kva), Some(frame));
        assert!(!pool.is_user(other, kva));
    }

    #[test]
    fn victimization_drops_user_mappings_only() {
        let _guard = test_support::exclusive();
        let mut pool = test_pool();
        let va = VirtAddr::new(0x8000);
        let kva = VirtAddr::new(KERNEL_BASE.as_u32() + 0x10_0000);
        let kframe = phys::allocate().unwrap();
        pool.map(Asid::KERNEL, kva, kframe, true, false).unwrap();

        // One more address space than there are non-kernel slots
        let mut asids = alloc::vec::Vec::new();
        for _ in 0..ASID_SLOTS {
            let asid = new_asid();
            let frame = phys::allocate().unwrap();
            pool.map(asid, va, frame, true, true).unwrap();
            asids.push(asid);
        }

        // The first one was the LRU victim: its slot was recycled and
        // its user mapping is gone, but the kernel window survived.
        assert!(!pool.is_mapped(asids[0], va));
        assert!(pool.is_mapped(*asids.last().unwrap(), va));
        assert_eq!(pool.get_page(*asids.last().unwrap(), kva), Some(kframe));
    }

    #[test]
    fn mapping_updates_invalidate_tlb() {
        let _guard = test_support::exclusive();
        let port = test_support::init();
        let mut pool = AsidPool::new().unwrap();
        let before = port.recorded_invalidations();

        let asid = new_asid();
        let frame = phys::allocate().unwrap();
        pool.map(asid, VirtAddr::new(0x2000), frame, true, true)
            .unwrap();
        pool.unmap(asid, VirtAddr::new(0x2000));

        assert!(port.recorded_invalidations() >= before + 2);
    }
}
