//! Typed slab pools.
//!
//! Each pool hands out objects of one type from page-sized chunks with
//! intrusive free lists. Dropping a [`SlabBox`] runs the object's drop
//! (the finalizer) and returns the slot; a chunk whose last object
//! dies is released whole, returning its memory.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem::{self, MaybeUninit};
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use spin::Mutex;

use super::addr::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};

struct Chunk<T> {
    storage: Box<[MaybeUninit<T>]>,
    free: Vec<usize>,
    used: usize,
}

impl<T> Chunk<T> {
    fn new() -> Self {
        let capacity = SlabPool::<T>::chunk_capacity();
        let mut storage = Vec::with_capacity(capacity);
        storage.resize_with(capacity, MaybeUninit::uninit);
        Self {
            storage: storage.into_boxed_slice(),
            free: (0..capacity).rev().collect(),
            used: 0,
        }
    }
}

struct PoolInner<T> {
    chunks: Vec<Option<Chunk<T>>>,
}

pub struct SlabPool<T> {
    inner: Mutex<PoolInner<T>>,
    /// Cap on live chunks; 0 = unlimited
    max_chunks: usize,
}

impl<T> SlabPool<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner { chunks: Vec::new() }),
            max_chunks: 0,
        }
    }

    pub const fn bounded(max_chunks: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner { chunks: Vec::new() }),
            max_chunks,
        }
    }

    /// Objects per page-sized chunk
    pub fn chunk_capacity() -> usize {
        let size = mem::size_of::<T>().max(1);
        ((PAGE_SIZE as usize) / size).max(1)
    }

    pub fn allocate(&'static self, value: T) -> KernelResult<SlabBox<T>> {
        let mut inner = self.inner.lock();

        // Find a chunk with room
        let mut found = None;
        for (index, chunk) in inner.chunks.iter_mut().enumerate() {
            if let Some(chunk) = chunk {
                if !chunk.free.is_empty() {
                    found = Some(index);
                    break;
                }
            }
        }

        let index = match found {
            Some(index) => index,
            None => {
                let live = inner.chunks.iter().flatten().count();
                if self.max_chunks != 0 && live >= self.max_chunks {
                    return Err(KernelError::OutOfMemory);
                }
                // Reuse an empty slot or grow
                match inner.chunks.iter().position(Option::is_none) {
                    Some(index) => {
                        inner.chunks[index] = Some(Chunk::new());
                        index
                    },
                    None => {
                        inner.chunks.push(Some(Chunk::new()));
                        inner.chunks.len() - 1
                    },
                }
            },
        };

        let chunk = inner.chunks[index].as_mut().unwrap();
        let slot = chunk.free.pop().expect("chunk has room");
        chunk.used += 1;
        let ptr = chunk.storage[slot].as_mut_ptr();
        unsafe {
            ptr::write(ptr, value);
        }
        Ok(SlabBox {
            pool: self,
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            chunk: index,
            slot,
        })
    }

    fn release(&self, chunk_index: usize, slot: usize) {
        let mut inner = self.inner.lock();
        let chunk = inner.chunks[chunk_index]
            .as_mut()
            .expect("release into dead chunk");
        chunk.free.push(slot);
        chunk.used -= 1;
        if chunk.used == 0 {
            // Last object gone, give the chunk back
            inner.chunks[chunk_index] = None;
        }
    }

    pub fn live_chunks(&self) -> usize {
        self.inner.lock().chunks.iter().flatten().count()
    }
}

/// An object owned by a slab pool. Dereferences to `T`; dropping it
/// finalizes the object and frees the slot.
pub struct SlabBox<T: 'static> {
    pool: &'static SlabPool<T>,
    ptr: NonNull<T>,
    chunk: usize,
    slot: usize,
}

unsafe impl<T: Send + 'static> Send for SlabBox<T> {}
unsafe impl<T: Sync + 'static> Sync for SlabBox<T> {}

impl<T> Deref for SlabBox<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for SlabBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for SlabBox<T> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
        }
        self.pool.release(self.chunk, self.slot);
    }
}
