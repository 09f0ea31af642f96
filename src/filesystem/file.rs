//! File handles and per-process descriptor tables.
//!
//! A [`File`] pairs a vnode with a file pointer; descriptors are
//! small integers mapping into the per-process table, several of which
//! may share one handle (`dup`). The table holds at most
//! [`MAX_FILES`] entries and always hands out the lowest free slot.

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};

use super::dirent;
use super::pipe;
use super::vnode::Vnode;

pub const MAX_FILES: u32 = 1024;

#[derive(Debug)]
pub struct File {
    pub vnode: Arc<Vnode>,
    pub pos: u64,
}

/// Shared file handle; the reference count is the handle's refcount
pub type FileRef = Arc<Mutex<File>>;

pub struct FdTable {
    slots: HashMap<u32, FileRef>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    fn lowest_free(&self) -> KernelResult<u32> {
        for fd in 0..MAX_FILES {
            if !self.slots.contains_key(&fd) {
                return Ok(fd);
            }
        }
        Err(KernelError::TooManyFiles)
    }

    pub fn get(&self, fd: u32) -> KernelResult<FileRef> {
        if fd >= MAX_FILES {
            return Err(KernelError::IntBounds);
        }
        self.slots
            .get(&fd)
            .cloned()
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Install a fresh handle on the lowest free descriptor
    pub fn open_vnode(&mut self, vnode: Arc<Vnode>) -> KernelResult<u32> {
        let fd = self.lowest_free()?;
        self.slots
            .insert(fd, Arc::new(Mutex::new(File { vnode, pos: 0 })));
        Ok(fd)
    }

    /// Share `fd`'s handle on the lowest free descriptor
    pub fn dup(&mut self, fd: u32) -> KernelResult<u32> {
        let file = self.get(fd)?;
        let new = self.lowest_free()?;
        self.slots.insert(new, file);
        Ok(new)
    }

    /// Share `fd`'s handle as `to`, closing whatever `to` held.
    /// `dup2(fd, fd)` returns `fd` untouched.
    pub fn dup2(&mut self, fd: u32, to: u32) -> KernelResult<u32> {
        let file = self.get(fd)?;
        if to >= MAX_FILES {
            return Err(KernelError::IntBounds);
        }
        if fd == to {
            return Ok(fd);
        }
        if let Some(old) = self.slots.insert(to, file) {
            release(old);
        }
        Ok(to)
    }

    /// Install both ends of a fresh pipe: (read fd, write fd)
    pub fn pipe(&mut self) -> KernelResult<(u32, u32)> {
        let (read_end, write_end) = pipe::ends(pipe::PIPE_CAPACITY);
        let read_fd = self.open_vnode(read_end)?;
        let write_fd = match self.open_vnode(write_end) {
            Ok(fd) => fd,
            Err(err) => {
                self.close(read_fd)?;
                return Err(err);
            },
        };
        Ok((read_fd, write_fd))
    }

    pub fn close(&mut self, fd: u32) -> KernelResult<()> {
        if fd >= MAX_FILES {
            return Err(KernelError::IntBounds);
        }
        match self.slots.remove(&fd) {
            Some(file) => {
                release(file);
                Ok(())
            },
            None => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Duplicate for fork: descriptors share the parent's handles
    pub fn clone_for_fork(&self) -> FdTable {
        FdTable {
            slots: self.slots.clone(),
        }
    }

    pub fn close_all(&mut self) {
        let fds: Vec<u32> = self.slots.keys().copied().collect();
        for fd in fds {
            let _ = self.close(fd);
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.len()
    }

    pub fn handle_refs(&self, fd: u32) -> KernelResult<usize> {
        Ok(Arc::strong_count(&self.get(fd)?))
    }
}

/// Drop one reference to a handle, closing the vnode with the last
fn release(file: FileRef) {
    if Arc::strong_count(&file) == 1 {
        file.lock().vnode.close();
    }
}

/// Read through a handle, advancing the file pointer by the bytes the
/// vnode returned. The vnode may block; no table lock is held here.
pub fn read_at(file: &FileRef, buf: &mut [u8]) -> KernelResult<usize> {
    let mut file = file.lock();
    let pos = file.pos;
    let count = file.vnode.read(pos, buf)?;
    file.pos += count as u64;
    Ok(count)
}

/// Write through a handle, advancing the file pointer
pub fn write_at(file: &FileRef, buf: &[u8]) -> KernelResult<usize> {
    let mut file = file.lock();
    let pos = file.pos;
    let count = file.vnode.write(pos, buf)?;
    file.pos += count as u64;
    Ok(count)
}

/// 64-bit getdents: fill `buf` with records from the vnode and advance
/// the file pointer by the bytes produced
pub fn getdents64_at(file: &FileRef, buf: &mut [u8]) -> KernelResult<usize> {
    let mut file = file.lock();
    let pos = file.pos;
    let count = file.vnode.getdents(pos, buf)?;
    file.pos += count as u64;
    Ok(count)
}

/// 32-bit getdents: produce 64-bit records, then rewrite them in place
/// at dirent32 width. Overflowing inode numbers or offsets report
/// `FileOverflow` instead of truncating.
pub fn getdents_at(file: &FileRef, buf: &mut [u8]) -> KernelResult<usize> {
    let mut file = file.lock();
    let pos = file.pos;
    let count = file.vnode.getdents(pos, buf)?;
    if count > 0 {
        let max_off = dirent::convert64_to_32(buf, count)?;
        if max_off > file.pos {
            file.pos = max_off;
        }
    }
    Ok(count)
}

/// Descriptor-table front ends for the handle operations
pub fn read(table: &Mutex<FdTable>, fd: u32, buf: &mut [u8]) -> KernelResult<usize> {
    let file = table.lock().get(fd)?;
    read_at(&file, buf)
}

pub fn write(table: &Mutex<FdTable>, fd: u32, buf: &[u8]) -> KernelResult<usize> {
    let file = table.lock().get(fd)?;
    write_at(&file, buf)
}

pub fn getdents64(table: &Mutex<FdTable>, fd: u32, buf: &mut [u8]) -> KernelResult<usize> {
    let file = table.lock().get(fd)?;
    getdents64_at(&file, buf)
}

pub fn getdents(table: &Mutex<FdTable>, fd: u32, buf: &mut [u8]) -> KernelResult<usize> {
    let file = table.lock().get(fd)?;
    getdents_at(&file, buf)
}
