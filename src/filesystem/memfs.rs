//! In-memory vnode adapter.
//!
//! The smallest concrete filesystem: directories are ordered name
//! lists, files are byte vectors paged into the cache on demand. It
//! backs the boot ramdisk and the test suites; disk filesystems plug
//! in through the same `VnodeOps` surface.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::memory::prelude::PAGE_SIZE;
use crate::memory::vmpage::{VmPage, VmPageRef};

use super::dirent;
use super::vnode::{Vnode, VnodeKind, VnodeOps};

/* ------------------------------ files ----------------------------- */

struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl VnodeOps for MemFile {
    fn get_page(&self, _vnode: &Vnode, offset: u64) -> KernelResult<VmPageRef> {
        let page = VmPage::alloc_zeroed()?;
        let data = self.data.lock();
        let start = offset as usize;
        if start < data.len() {
            let span = (data.len() - start).min(PAGE_SIZE as usize);
            let frame = page.lock().frame();
            unsafe {
                arch::frame_slice_mut(frame)[..span].copy_from_slice(&data[start..start + span]);
            }
        }
        Ok(page)
    }

    fn put_page(&self, _vnode: &Vnode, offset: u64, page: &VmPageRef) -> KernelResult<()> {
        let mut data = self.data.lock();
        let start = offset as usize;
        if start < data.len() {
            let span = (data.len() - start).min(PAGE_SIZE as usize);
            let frame = page.lock().frame();
            let src = unsafe { arch::frame_slice(frame) };
            data[start..start + span].copy_from_slice(&src[..span]);
        }
        Ok(())
    }

    fn size(&self, _vnode: &Vnode) -> u64 {
        self.data.lock().len() as u64
    }

    fn set_size(&self, _vnode: &Vnode, size: u64) -> KernelResult<()> {
        self.data.lock().resize(size as usize, 0);
        Ok(())
    }
}

/// A regular file preloaded with `content`
pub fn file(content: &[u8]) -> Arc<Vnode> {
    Vnode::new(
        VnodeKind::Regular,
        Box::new(MemFile {
            data: Mutex::new(content.to_vec()),
        }),
    )
}

/* ---------------------------- directories ------------------------- */

struct MemDir {
    entries: Mutex<Vec<(String, Arc<Vnode>)>>,
}

impl VnodeOps for MemDir {
    fn lookup(&self, _vnode: &Vnode, name: &str) -> KernelResult<Arc<Vnode>> {
        self.entries
            .lock()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or(KernelError::FileNotFound)
    }

    fn link(&self, _vnode: &Vnode, name: &str, node: Arc<Vnode>) -> KernelResult<()> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|(n, _)| n == name) {
            return Err(KernelError::FileError);
        }
        entries.push((String::from(name), node));
        Ok(())
    }

    /// Entries as packed 64-bit dirent records. `offset` is a byte
    /// offset into the directory stream; each record's `d_off` is the
    /// stream position after it, so a reader resumes where it left.
    fn getdents(&self, _vnode: &Vnode, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        let entries = self.entries.lock();
        let mut stream = 0u64;
        let mut produced = 0usize;
        for (name, node) in entries.iter() {
            let reclen = dirent::record_len(name);
            let record_end = stream + reclen as u64;
            if stream >= offset {
                match dirent::encode64(
                    &mut buf[produced..],
                    node.id().as_u64(),
                    record_end,
                    node.kind().dirent_type(),
                    name,
                ) {
                    Some(written) => produced += written,
                    None => break,
                }
            }
            stream = record_end;
        }
        Ok(produced)
    }
}

/// An empty directory
pub fn dir() -> Arc<Vnode> {
    Vnode::new(
        VnodeKind::Directory,
        Box::new(MemDir {
            entries: Mutex::new(Vec::new()),
        }),
    )
}

/* ----------------------------- symlinks --------------------------- */

struct MemSymlink {
    target: Arc<Vnode>,
}

impl VnodeOps for MemSymlink {
    fn reparse(&self, _vnode: &Vnode) -> Option<Arc<Vnode>> {
        Some(self.target.clone())
    }
}

/// A symlink resolving to `target`
pub fn symlink(target: Arc<Vnode>) -> Arc<Vnode> {
    Vnode::new(VnodeKind::Symlink, Box::new(MemSymlink { target }))
}
