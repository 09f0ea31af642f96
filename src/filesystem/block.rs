//! Block device capability.
//!
//! The core consumes block storage through [`BlockDevice`]: submit a
//! request, then wait on its completion. Drivers complete requests
//! from their interrupt handlers; the waiter sleeps on the request's
//! monitor. Transfers must be whole-block aligned.

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::multitasking::sync::InterruptMonitor;

use super::vnode::{Vnode, VnodeKind, VnodeOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Submitted,
    Complete,
    TimedOut,
    Failed,
}

/// Completion future for one block transfer
pub struct BlockOp {
    status: InterruptMonitor<OpStatus>,
}

impl BlockOp {
    pub fn new() -> Arc<BlockOp> {
        Arc::new(BlockOp {
            status: InterruptMonitor::new(OpStatus::Submitted),
        })
    }

    /// Driver side: resolve the operation and wake the waiter
    pub fn complete(&self, status: OpStatus) {
        let mut guard = self.status.enter();
        *guard = status;
        self.status.broadcast(&mut guard);
    }

    /// Caller side: block until the driver resolves the operation
    pub fn wait(&self) -> KernelResult<()> {
        let mut guard = self.status.enter();
        loop {
            match *guard {
                OpStatus::Submitted => guard = self.status.wait(guard),
                OpStatus::Complete => return Ok(()),
                OpStatus::TimedOut => return Err(KernelError::DeviceTimeout),
                OpStatus::Failed => return Err(KernelError::DeviceError),
            }
        }
    }
}

/// One queued transfer
pub struct BlockRequest<'a> {
    pub write: bool,
    pub offset: u64,
    pub data: &'a mut [u8],
    pub op: Arc<BlockOp>,
}

pub trait BlockDevice: Send + Sync {
    /// Start the transfer; completion arrives through `req.op`
    fn submit(&self, req: &mut BlockRequest);

    /// Device size in bytes
    fn size(&self) -> u64;

    /// Transfer granularity in bytes
    fn block_size(&self) -> usize;
}

fn check(dev: &dyn BlockDevice, len: usize, offset: u64) -> KernelResult<()> {
    let bs = dev.block_size() as u64;
    if len as u64 % bs != 0 || offset % bs != 0 {
        return Err(KernelError::BlockAlignment);
    }
    if offset + len as u64 > dev.size() {
        return Err(KernelError::DeviceError);
    }
    Ok(())
}

/// Whole-block read: submit and wait
pub fn read(dev: &dyn BlockDevice, buf: &mut [u8], offset: u64) -> KernelResult<()> {
    check(dev, buf.len(), offset)?;
    let op = BlockOp::new();
    let mut req = BlockRequest {
        write: false,
        offset,
        data: buf,
        op: op.clone(),
    };
    dev.submit(&mut req);
    op.wait()
}

/// Whole-block write: submit and wait
pub fn write(dev: &dyn BlockDevice, buf: &mut [u8], offset: u64) -> KernelResult<()> {
    check(dev, buf.len(), offset)?;
    let op = BlockOp::new();
    let mut req = BlockRequest {
        write: true,
        offset,
        data: buf,
        op: op.clone(),
    };
    dev.submit(&mut req);
    op.wait()
}

/// Memory-backed block device: the boot ramdisk, and the reference
/// implementation for driver authors
pub struct MemBlockDevice {
    data: Mutex<alloc::vec::Vec<u8>>,
    block_size: usize,
}

impl MemBlockDevice {
    pub fn new(data: alloc::vec::Vec<u8>, block_size: usize) -> Self {
        assert!(data.len() % block_size == 0);
        Self {
            data: Mutex::new(data),
            block_size,
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn submit(&self, req: &mut BlockRequest) {
        let mut data = self.data.lock();
        let start = req.offset as usize;
        let end = start + req.data.len();
        if req.write {
            data[start..end].copy_from_slice(req.data);
        } else {
            req.data.copy_from_slice(&data[start..end]);
        }
        req.op.complete(OpStatus::Complete);
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

struct BlockVnode {
    dev: Arc<dyn BlockDevice>,
}

impl VnodeOps for BlockVnode {
    fn read(&self, _vnode: &Vnode, offset: u64, buf: &mut [u8]) -> Option<KernelResult<usize>> {
        Some(read(self.dev.as_ref(), buf, offset).map(|()| buf.len()))
    }

    fn write(&self, _vnode: &Vnode, offset: u64, buf: &[u8]) -> Option<KernelResult<usize>> {
        let mut copy = buf.to_vec();
        Some(write(self.dev.as_ref(), &mut copy, offset).map(|()| buf.len()))
    }

    fn size(&self, _vnode: &Vnode) -> u64 {
        self.dev.size()
    }
}

/// Expose a block device as a device vnode
pub fn block_vnode(dev: Arc<dyn BlockDevice>) -> Arc<Vnode> {
    Vnode::new(VnodeKind::Device, Box::new(BlockVnode { dev }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;

    fn ramdisk() -> MemBlockDevice {
        let mut data = alloc::vec![0u8; 4096];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        MemBlockDevice::new(data, 512)
    }

    #[test]
    fn aligned_roundtrip() {
        test_support::init();
        let dev = ramdisk();
        let mut buf = [0u8; 512];
        read(&dev, &mut buf, 512).unwrap();
        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 1);

        let mut pattern = [0xabu8; 512];
        write(&dev, &mut pattern, 1024).unwrap();
        let mut back = [0u8; 512];
        read(&dev, &mut back, 1024).unwrap();
        assert_eq!(back, [0xab; 512]);
    }

    #[test]
    fn misaligned_transfers_are_rejected() {
        test_support::init();
        let dev = ramdisk();
        let mut buf = [0u8; 100];
        assert_eq!(
            read(&dev, &mut buf, 0).unwrap_err(),
            KernelError::BlockAlignment
        );
        let mut buf = [0u8; 512];
        assert_eq!(
            read(&dev, &mut buf, 13).unwrap_err(),
            KernelError::BlockAlignment
        );
        assert_eq!(
            read(&dev, &mut buf, 4096).unwrap_err(),
            KernelError::DeviceError
        );
    }

    #[test]
    fn failed_operations_surface_as_device_errors() {
        test_support::init();
        struct Broken;
        impl BlockDevice for Broken {
            fn submit(&self, req: &mut BlockRequest) {
                req.op.complete(OpStatus::Failed);
            }
            fn size(&self) -> u64 {
                4096
            }
            fn block_size(&self) -> usize {
                512
            }
        }
        let mut buf = [0u8; 512];
        assert_eq!(
            read(&Broken, &mut buf, 0).unwrap_err(),
            KernelError::DeviceError
        );

        struct Slow;
        impl BlockDevice for Slow {
            fn submit(&self, req: &mut BlockRequest) {
                req.op.complete(OpStatus::TimedOut);
            }
            fn size(&self) -> u64 {
                4096
            }
            fn block_size(&self) -> usize {
                512
            }
        }
        assert_eq!(
            read(&Slow, &mut buf, 0).unwrap_err(),
            KernelError::DeviceTimeout
        );
    }

    #[test]
    fn device_vnode_reads_raw_blocks() {
        test_support::init();
        let vnode = block_vnode(Arc::new(ramdisk()));
        let mut buf = [0u8; 512];
        assert_eq!(vnode.read(0, &mut buf).unwrap(), 512);
        assert_eq!(buf[255], 255);
    }
}
