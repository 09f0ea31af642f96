//! Kernel error taxonomy.
//!
//! Every fallible kernel path returns [`KernelResult`]. At the system
//! call boundary the dispatcher flattens errors into a negative errno
//! (see [`KernelError::errno`]). Inside the kernel, callers either
//! propagate with `?` or decide explicitly; errors are never swallowed.

use core::fmt;

pub type KernelResult<T> = Result<T, KernelError>;

/// Linux-compatible errno values used by the syscall ABI.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const ESRCH: i32 = 3;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const ENOEXEC: i32 = 8;
    pub const EBADF: i32 = 9;
    pub const ECHILD: i32 = 10;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const ENOTDIR: i32 = 20;
    pub const EINVAL: i32 = 22;
    pub const EMFILE: i32 = 24;
    pub const ESPIPE: i32 = 29;
    pub const EPIPE: i32 = 32;
    pub const ENOSYS: i32 = 38;
    pub const EOVERFLOW: i32 = 75;
    pub const ETIMEDOUT: i32 = 110;
}

/// Error categories, the single-parent hierarchy collapsed into a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Memory,
    File,
    Device,
    Process,
    Sync,
    Api,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// Access outside any segment or across a protection boundary
    InvalidPointer(u32),
    /// Frame or slab pool exhausted
    OutOfMemory,
    /// Path resolution failed at some component
    FileNotFound,
    /// A 64-bit inode or offset does not fit the requested 32-bit dirent
    FileOverflow,
    /// Descriptor table full
    TooManyFiles,
    /// Descriptor not open, or wrong kind for the operation
    BadFileDescriptor,
    /// Path component resolved to a non-directory
    NotADirectory,
    /// Generic file-layer failure
    FileError,
    /// Vnode or device transfer failure
    IoError,
    /// Device rejected or failed the operation
    DeviceError,
    /// Device did not complete in time
    DeviceTimeout,
    /// Bounded monitor wait expired
    Timeout,
    /// Malformed or unsupported executable image
    ElfError(&'static str),
    /// Operation on a closed pipe
    PipeClosed,
    /// Block transfer not aligned to the device block size
    BlockAlignment,
    /// Integer argument outside its documented bounds
    IntBounds,
    /// No matching child for waitpid
    NoChild,
    /// No such process
    NoProcess,
    /// Request number not implemented
    NoSyscall,
    /// Operation not supported by this vnode or object
    NotSupported,
}

impl KernelError {
    /// Ancestor category of this error kind.
    pub fn category(&self) -> ErrorCategory {
        use KernelError::*;
        match self {
            InvalidPointer(_) | OutOfMemory => ErrorCategory::Memory,
            FileNotFound | FileOverflow | TooManyFiles | BadFileDescriptor | NotADirectory
            | FileError | PipeClosed => ErrorCategory::File,
            IoError | DeviceError | DeviceTimeout | BlockAlignment => ErrorCategory::Device,
            ElfError(_) | NoChild | NoProcess => ErrorCategory::Process,
            Timeout => ErrorCategory::Sync,
            IntBounds | NoSyscall | NotSupported => ErrorCategory::Api,
        }
    }

    /// Negative errno for the syscall ABI.
    pub fn errno(&self) -> i32 {
        use self::errno::*;
        use KernelError::*;
        -match self {
            InvalidPointer(_) => EFAULT,
            OutOfMemory => ENOMEM,
            FileNotFound => ENOENT,
            FileOverflow => EOVERFLOW,
            TooManyFiles => EMFILE,
            BadFileDescriptor => EBADF,
            NotADirectory => ENOTDIR,
            FileError | IoError | DeviceError => EIO,
            DeviceTimeout | Timeout => ETIMEDOUT,
            ElfError(_) => ENOEXEC,
            PipeClosed => EPIPE,
            BlockAlignment | IntBounds => EINVAL,
            NoChild => ECHILD,
            NoProcess => ESRCH,
            NoSyscall | NotSupported => ENOSYS,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::InvalidPointer(addr) => write!(f, "invalid pointer {:#010x}", addr),
            KernelError::ElfError(msg) => write!(f, "unsupported executable: {}", msg),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Runs the closure when dropped, on every exit path.
///
/// Replaces the always-flavor destructor stack entries: pair an
/// acquisition with a `Deferred` and the release happens even if an
/// error propagates through `?` between them.
pub struct Deferred<F: FnOnce()> {
    f: Option<F>,
}

pub fn defer<F: FnOnce()>(f: F) -> Deferred<F> {
    Deferred { f: Some(f) }
}

impl<F: FnOnce()> Drop for Deferred<F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Runs the closure when dropped, unless committed.
///
/// Replaces the error-only destructor stack entries: arm a `Rollback`
/// before a multi-step operation and `commit` it at the point of no
/// return. An early `?` leaves it armed and the rollback runs.
pub struct Rollback<F: FnOnce()> {
    f: Option<F>,
}

pub fn rollback<F: FnOnce()>(f: F) -> Rollback<F> {
    Rollback { f: Some(f) }
}

impl<F: FnOnce()> Rollback<F> {
    pub fn commit(mut self) {
        self.f = None;
    }
}

impl<F: FnOnce()> Drop for Rollback<F> {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(KernelError::FileNotFound.errno(), -errno::ENOENT);
        assert_eq!(KernelError::OutOfMemory.errno(), -errno::ENOMEM);
        assert_eq!(KernelError::InvalidPointer(0x1234).errno(), -errno::EFAULT);
        assert_eq!(KernelError::NoSyscall.errno(), -errno::ENOSYS);
        assert!(KernelError::Timeout.errno() < 0);
    }

    #[test]
    fn category_hierarchy() {
        assert_eq!(KernelError::FileOverflow.category(), ErrorCategory::File);
        assert_eq!(KernelError::PipeClosed.category(), ErrorCategory::File);
        assert_eq!(KernelError::DeviceTimeout.category(), ErrorCategory::Device);
    }

    #[test]
    fn deferred_runs_on_error_path() {
        let mut ran = false;
        let r: Result<(), ()> = (|| {
            let _d = defer(|| ran = true);
            Err(())?;
            Ok(())
        })();
        assert!(r.is_err());
        assert!(ran);
    }

    #[test]
    fn rollback_skipped_after_commit() {
        let mut rolled_back = false;
        {
            let guard = rollback(|| rolled_back = true);
            guard.commit();
        }
        assert!(!rolled_back);

        {
            let _guard = rollback(|| rolled_back = true);
        }
        assert!(rolled_back);
    }
}
