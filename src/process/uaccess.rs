//! Access to user memory through a process address space.
//!
//! Transfers run page by page: the page is faulted in through the
//! segment logic (so demand paging and copy-on-write behave exactly as
//! for a user-mode access), then copied through the kernel window. A
//! pointer outside the space's segments reports `InvalidPointer`, not
//! whatever the backing object would have said.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::memory::paging;
use crate::memory::prelude::{VirtAddr, PAGE_SIZE};
use crate::memory::segment::AddressSpace;

fn walk(
    aspace: &AddressSpace, at: VirtAddr, len: usize, write: bool,
    mut f: impl FnMut(&mut [u8], core::ops::Range<usize>),
) -> KernelResult<()> {
    let mut done = 0usize;
    while done < len {
        let va = at
            .checked_add(done as u32)
            .ok_or(KernelError::InvalidPointer(u32::MAX))?;
        let page_va = va.page_align_down();
        let page_off = va.page_offset() as usize;
        let span = (PAGE_SIZE as usize - page_off).min(len - done);

        aspace.fault(va, write)?;
        let frame = paging::get_page(aspace.asid, page_va)
            .ok_or(KernelError::InvalidPointer(va.as_u32()))?;
        let slice = unsafe { crate::arch::frame_slice_mut(frame) };
        f(&mut slice[page_off..page_off + span], done..done + span);
        done += span;
    }
    Ok(())
}

/// Copy `bytes` into user memory at `at`
pub fn write_bytes(aspace: &AddressSpace, at: VirtAddr, bytes: &[u8]) -> KernelResult<()> {
    walk(aspace, at, bytes.len(), true, |dst, range| {
        dst.copy_from_slice(&bytes[range])
    })
}

/// Copy user memory at `at` into `out`
pub fn read_bytes(aspace: &AddressSpace, at: VirtAddr, out: &mut [u8]) -> KernelResult<()> {
    walk(aspace, at, out.len(), false, |src, range| {
        out[range].copy_from_slice(src)
    })
}

pub fn write_u32(aspace: &AddressSpace, at: VirtAddr, value: u32) -> KernelResult<()> {
    write_bytes(aspace, at, &value.to_le_bytes())
}

pub fn read_u32(aspace: &AddressSpace, at: VirtAddr) -> KernelResult<u32> {
    let mut buf = [0u8; 4];
    read_bytes(aspace, at, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Longest C string the kernel will copy in from user space
pub const MAX_CSTR: usize = 4096;

/// Copy a NUL-terminated string out of user memory
pub fn read_cstr(aspace: &AddressSpace, at: VirtAddr) -> KernelResult<String> {
    let mut out = Vec::new();
    let mut cursor = at;
    while out.len() < MAX_CSTR {
        let span = (PAGE_SIZE - cursor.page_offset()) as usize;
        let mut buf = alloc::vec![0u8; span.min(MAX_CSTR - out.len())];
        read_bytes(aspace, cursor, &mut buf)?;
        if let Some(nul) = buf.iter().position(|&b| b == 0) {
            out.extend_from_slice(&buf[..nul]);
            return String::from_utf8(out).map_err(|_| KernelError::InvalidPointer(at.as_u32()));
        }
        out.extend_from_slice(&buf);
        cursor = cursor
            .checked_add(span as u32)
            .ok_or(KernelError::InvalidPointer(u32::MAX))?;
    }
    Err(KernelError::IntBounds)
}

/// Copy a NUL-terminated pointer array (argv/envp shape) and then
/// every string it points at
pub fn read_cstr_array(aspace: &AddressSpace, at: VirtAddr) -> KernelResult<Vec<String>> {
    let mut out = Vec::new();
    let mut cursor = at;
    loop {
        let ptr = read_u32(aspace, cursor)?;
        if ptr == 0 {
            return Ok(out);
        }
        out.push(read_cstr(aspace, VirtAddr::new(ptr))?);
        if out.len() > 1024 {
            return Err(KernelError::IntBounds);
        }
        cursor = cursor
            .checked_add(4)
            .ok_or(KernelError::InvalidPointer(u32::MAX))?;
    }
}
