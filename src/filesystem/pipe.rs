//! Pipes.
//!
//! Two vnodes share one bounded ring buffer guarded by a monitor.
//! Writers block while the ring is full, readers while it is empty;
//! closing either end wakes everyone. A read returns as soon as any
//! bytes are available, so a write of `n` followed by a read of `m`
//! transfers `min(n, m, capacity)` bytes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::multitasking::sync::InterruptMonitor;

use super::vnode::{Vnode, VnodeKind, VnodeOps};

/// Default ring capacity in bytes
pub const PIPE_CAPACITY: usize = 64;

struct Ring {
    /// One slot is kept empty to tell full from empty, so the
    /// allocation is capacity + 1
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    closed: bool,
}

impl Ring {
    fn wrap(&self, at: usize) -> usize {
        if at >= self.buf.len() {
            at - self.buf.len()
        } else {
            at
        }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        self.wrap(self.head + 1) == self.tail
    }

    fn push(&mut self, byte: u8) {
        let head = self.head;
        self.buf[head] = byte;
        self.head = self.wrap(head + 1);
    }

    fn pop(&mut self) -> u8 {
        let tail = self.tail;
        let byte = self.buf[tail];
        self.tail = self.wrap(tail + 1);
        byte
    }
}

pub struct Pipe {
    ring: InterruptMonitor<Ring>,
}

impl Pipe {
    pub fn new(capacity: usize) -> Arc<Pipe> {
        Arc::new(Pipe {
            ring: InterruptMonitor::new(Ring {
                buf: alloc::vec![0; capacity + 1],
                head: 0,
                tail: 0,
                closed: false,
            }),
        })
    }

    /// Write all of `data`, blocking on a full ring. Returns the bytes
    /// written, short only if the pipe closes underway.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut guard = self.ring.enter();
        let mut written = 0;
        while written < data.len() {
            while guard.is_full() {
                if guard.closed {
                    return written;
                }
                guard = self.ring.wait(guard);
            }
            if guard.closed {
                return written;
            }
            while written < data.len() && !guard.is_full() {
                guard.push(data[written]);
                written += 1;
            }
            self.ring.signal(&mut guard);
        }
        written
    }

    /// Read whatever is available, blocking only while the ring is
    /// empty and the pipe open. A closed empty pipe reads 0 (EOF).
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut guard = self.ring.enter();
        while guard.is_empty() {
            if guard.closed {
                return 0;
            }
            guard = self.ring.wait(guard);
        }
        let mut count = 0;
        while count < buf.len() && !guard.is_empty() {
            buf[count] = guard.pop();
            count += 1;
        }
        self.ring.signal(&mut guard);
        count
    }

    pub fn close(&self) {
        let mut guard = self.ring.enter();
        guard.closed = true;
        self.ring.broadcast(&mut guard);
    }

    pub fn is_closed(&self) -> bool {
        self.ring.enter().closed
    }
}

struct ReadEnd {
    pipe: Arc<Pipe>,
}

impl VnodeOps for ReadEnd {
    fn read(&self, _vnode: &Vnode, _offset: u64, buf: &mut [u8]) -> Option<KernelResult<usize>> {
        Some(Ok(self.pipe.read(buf)))
    }

    fn close(&self, _vnode: &Vnode) {
        self.pipe.close();
    }
}

struct WriteEnd {
    pipe: Arc<Pipe>,
}

impl VnodeOps for WriteEnd {
    fn write(&self, _vnode: &Vnode, _offset: u64, buf: &[u8]) -> Option<KernelResult<usize>> {
        let written = self.pipe.write(buf);
        if written == 0 && !buf.is_empty() {
            return Some(Err(KernelError::PipeClosed));
        }
        Some(Ok(written))
    }

    fn close(&self, _vnode: &Vnode) {
        self.pipe.close();
    }
}

/// Build the two end-vnodes of a fresh pipe: (read end, write end)
pub fn ends(capacity: usize) -> (Arc<Vnode>, Arc<Vnode>) {
    let pipe = Pipe::new(capacity);
    let read = Vnode::new(VnodeKind::Pipe, Box::new(ReadEnd { pipe: pipe.clone() }));
    let write = Vnode::new(VnodeKind::Pipe, Box::new(WriteEnd { pipe }));
    (read, write)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;

    #[test]
    fn short_write_then_read_transfers_min() {
        test_support::init();
        let pipe = Pipe::new(PIPE_CAPACITY);
        assert_eq!(pipe.write(b"hello"), 5);
        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn read_after_close_returns_zero() {
        test_support::init();
        let (read_end, write_end) = ends(PIPE_CAPACITY);
        assert_eq!(write_end.write(0, b"hello").unwrap(), 5);
        write_end.close();

        let mut buf = [0u8; 16];
        assert_eq!(read_end.read(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        // Drained and closed: end of file
        assert_eq!(read_end.read(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_to_closed_pipe_is_an_error() {
        test_support::init();
        let (read_end, write_end) = ends(8);
        read_end.close();
        assert_eq!(
            write_end.write(0, b"x").unwrap_err(),
            KernelError::PipeClosed
        );
    }

    #[test]
    fn reader_sees_write_order_across_wraparound() {
        test_support::init();
        let pipe = Pipe::new(8);
        let mut buf = [0u8; 8];
        // Cycle enough data through to wrap several times
        for round in 0u8..10 {
            let data = [round, round + 100];
            assert_eq!(pipe.write(&data), 2);
            assert_eq!(pipe.read(&mut buf), 2);
            assert_eq!(&buf[..2], &data);
        }
    }

    #[test]
    fn capacity_bounds_a_single_transfer() {
        test_support::init();
        let pipe = Pipe::new(4);
        // Room for exactly capacity bytes before blocking; close the
        // pipe so the writer gives up instead of waiting forever
        pipe.close();
        let written = pipe.write(b"abcdefgh");
        assert_eq!(written, 0);

        let pipe = Pipe::new(4);
        assert_eq!(pipe.write(b"abcd"), 4);
        let mut buf = [0u8; 8];
        assert_eq!(pipe.read(&mut buf), 4);
    }
}
