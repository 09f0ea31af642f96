//! Vnodes: the filesystem boundary object.
//!
//! A concrete filesystem (or device driver, or pipe) implements
//! [`VnodeOps`] for its nodes; everything else in the kernel talks to
//! [`Vnode`]. The kernel supplies default `read`/`write` that loop
//! over page-cache pages, so an adapter only has to produce pages.
//! A vnode bypasses the page cache only by supplying its own
//! `read`/`write` (devices, pipes).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::memory::prelude::PAGE_SIZE;
use crate::memory::vmpage::VmPageRef;

use super::page_cache;

/// Stable vnode identity: page-cache key and dirent inode number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VnodeId(u64);

impl VnodeId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

fn new_vnode_id() -> VnodeId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    VnodeId(NEXT.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    Regular,
    Directory,
    Device,
    Pipe,
    Symlink,
}

/// Directory entry type byte, as reported by getdents
impl VnodeKind {
    pub fn dirent_type(self) -> u8 {
        match self {
            VnodeKind::Regular => 8,   // DT_REG
            VnodeKind::Directory => 4, // DT_DIR
            VnodeKind::Device => 6,    // DT_BLK
            VnodeKind::Pipe => 1,      // DT_FIFO
            VnodeKind::Symlink => 10,  // DT_LNK
        }
    }
}

pub trait VnodeOps: Send + Sync {
    /// Produce the page backing `offset` (page-aligned). Regular files
    /// implement this; the page cache calls it on a miss.
    fn get_page(&self, _vnode: &Vnode, _offset: u64) -> KernelResult<VmPageRef> {
        Err(KernelError::NotSupported)
    }

    /// Write-through for a page the kernel has modified
    fn put_page(&self, _vnode: &Vnode, _offset: u64, _page: &VmPageRef) -> KernelResult<()> {
        Ok(())
    }

    fn size(&self, _vnode: &Vnode) -> u64 {
        0
    }

    fn set_size(&self, _vnode: &Vnode, _size: u64) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    /// Bypass the page cache with a custom read. `None` selects the
    /// kernel default.
    fn read(&self, _vnode: &Vnode, _offset: u64, _buf: &mut [u8]) -> Option<KernelResult<usize>> {
        None
    }

    /// Bypass the page cache with a custom write. `None` selects the
    /// kernel default.
    fn write(&self, _vnode: &Vnode, _offset: u64, _buf: &[u8]) -> Option<KernelResult<usize>> {
        None
    }

    fn close(&self, _vnode: &Vnode) {}

    /// Look a name up in a directory
    fn lookup(&self, _vnode: &Vnode, _name: &str) -> KernelResult<Arc<Vnode>> {
        Err(KernelError::NotADirectory)
    }

    /// Insert a name into a directory
    fn link(&self, _vnode: &Vnode, _name: &str, _node: Arc<Vnode>) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    /// Fill `buf` with packed 64-bit directory records starting at the
    /// directory-stream offset. Returns bytes produced.
    fn getdents(&self, _vnode: &Vnode, _offset: u64, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotADirectory)
    }

    /// Reparse target (symlinks); followed one level per resolution
    /// step
    fn reparse(&self, _vnode: &Vnode) -> Option<Arc<Vnode>> {
        None
    }
}

pub struct Vnode {
    id: VnodeId,
    kind: VnodeKind,
    ops: alloc::boxed::Box<dyn VnodeOps>,
}

impl core::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vnode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Vnode {
    pub fn new(kind: VnodeKind, ops: alloc::boxed::Box<dyn VnodeOps>) -> Arc<Vnode> {
        Arc::new(Vnode {
            id: new_vnode_id(),
            kind,
            ops,
        })
    }

    pub fn id(&self) -> VnodeId {
        self.id
    }

    pub fn kind(&self) -> VnodeKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.ops.size(self)
    }

    pub fn set_size(&self, size: u64) -> KernelResult<()> {
        self.ops.set_size(self, size)
    }

    /// Adapter-level page production, for the page cache only
    pub(super) fn produce_page(&self, offset: u64) -> KernelResult<VmPageRef> {
        self.ops.get_page(self, offset)
    }

    /// Read at `offset`. Short reads happen only at end of file.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        if let Some(result) = self.ops.read(self, offset, buf) {
            return result;
        }

        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        let mut done = 0;
        while done < len {
            let at = offset + done as u64;
            let aligned = at & !(PAGE_SIZE as u64 - 1);
            let page_off = (at - aligned) as usize;
            let span = (PAGE_SIZE as usize - page_off).min(len - done);

            let page = page_cache::get(self, aligned)?;
            let frame = page.lock().frame();
            let src = unsafe { crate::arch::frame_slice(frame) };
            buf[done..done + span].copy_from_slice(&src[page_off..page_off + span]);
            done += span;
        }
        Ok(done)
    }

    /// Write at `offset`, growing the file as needed, write-through
    /// via `put_page`
    pub fn write(&self, offset: u64, buf: &[u8]) -> KernelResult<usize> {
        if let Some(result) = self.ops.write(self, offset, buf) {
            return result;
        }

        let end = offset + buf.len() as u64;
        if end > self.size() {
            self.set_size(end)?;
        }
        let mut done = 0;
        while done < buf.len() {
            let at = offset + done as u64;
            let aligned = at & !(PAGE_SIZE as u64 - 1);
            let page_off = (at - aligned) as usize;
            let span = (PAGE_SIZE as usize - page_off).min(buf.len() - done);

            let page = page_cache::get(self, aligned)?;
            {
                let frame = page.lock().frame();
                let dst = unsafe { crate::arch::frame_slice_mut(frame) };
                dst[page_off..page_off + span].copy_from_slice(&buf[done..done + span]);
            }
            self.ops.put_page(self, aligned, &page)?;
            done += span;
        }
        Ok(done)
    }

    pub fn lookup(&self, name: &str) -> KernelResult<Arc<Vnode>> {
        self.ops.lookup(self, name)
    }

    pub fn link(&self, name: &str, node: Arc<Vnode>) -> KernelResult<()> {
        self.ops.link(self, name, node)
    }

    pub fn getdents(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        self.ops.getdents(self, offset, buf)
    }

    /// Reparse target, if this vnode redirects (symlinks)
    pub fn reparse_target(&self) -> Option<Arc<Vnode>> {
        self.ops.reparse(self)
    }

    pub fn close(&self) {
        self.ops.close(self);
    }
}

impl Drop for Vnode {
    fn drop(&mut self) {
        page_cache::drop_vnode(self.id);
    }
}
