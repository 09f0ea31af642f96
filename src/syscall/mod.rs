//! System-call dispatch.
//!
//! The software-interrupt stub hands the saved register block to
//! [`dispatch`]: request number in `eax`, arguments in `ebx`, `ecx`,
//! `edx`, `esi`, `edi`, result back in `eax`. Numbers follow the
//! classic i386 table. Every shim runs its core call behind a single
//! catch point that folds any kernel error into a negative errno;
//! nothing propagates past here.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::filesystem::file::{self, FileRef};
use crate::filesystem::path;
use crate::memory::prelude::VirtAddr;
use crate::memory::segment::AddressSpace;
use crate::process::{self, uaccess, ForkOutcome};
use crate::time;

/// Request numbers (i386 table)
pub mod nr {
    pub const EXIT: u32 = 1;
    pub const FORK: u32 = 2;
    pub const READ: u32 = 3;
    pub const WRITE: u32 = 4;
    pub const OPEN: u32 = 5;
    pub const CLOSE: u32 = 6;
    pub const WAITPID: u32 = 7;
    pub const CREAT: u32 = 8;
    pub const LINK: u32 = 9;
    pub const UNLINK: u32 = 10;
    pub const EXECVE: u32 = 11;
    pub const CHDIR: u32 = 12;
    pub const TIME: u32 = 13;
    pub const GETPID: u32 = 20;
    pub const DUP: u32 = 41;
    pub const PIPE: u32 = 42;
    pub const BRK: u32 = 45;
    pub const DUP2: u32 = 63;
    pub const GETDENTS: u32 = 141;
    pub const NANOSLEEP: u32 = 162;
    pub const GETDENTS64: u32 = 220;
}

/// Largest single user I/O transfer the kernel will buffer
const MAX_IO: usize = 1 << 20;

/// Saved user registers, as pushed by the interrupt stub
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Registers {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
    pub si: u32,
    pub di: u32,
}

fn current_aspace() -> KernelResult<Arc<AddressSpace>> {
    Ok(process::current()
        .ok_or(KernelError::NoProcess)?
        .lock()
        .address_space())
}

fn current_file(fd: u32) -> KernelResult<FileRef> {
    process::current()
        .ok_or(KernelError::NoProcess)?
        .lock()
        .files
        .get(fd)
}

fn sys_read(fd: u32, buf: u32, count: u32) -> KernelResult<u32> {
    let file = current_file(fd)?;
    let aspace = current_aspace()?;
    let mut tmp = alloc::vec![0u8; (count as usize).min(MAX_IO)];
    let n = file::read_at(&file, &mut tmp)?;
    uaccess::write_bytes(&aspace, VirtAddr::new(buf), &tmp[..n])?;
    Ok(n as u32)
}

fn sys_write(fd: u32, buf: u32, count: u32) -> KernelResult<u32> {
    let file = current_file(fd)?;
    let aspace = current_aspace()?;
    let mut tmp = alloc::vec![0u8; (count as usize).min(MAX_IO)];
    uaccess::read_bytes(&aspace, VirtAddr::new(buf), &mut tmp)?;
    let n = file::write_at(&file, &tmp)?;
    Ok(n as u32)
}

fn sys_open(path_ptr: u32) -> KernelResult<u32> {
    let proc = process::current().ok_or(KernelError::NoProcess)?;
    let aspace = proc.lock().address_space();
    let path_str = uaccess::read_cstr(&aspace, VirtAddr::new(path_ptr))?;
    let (root, cwd) = {
        let p = proc.lock();
        (p.root.clone(), p.cwd.clone())
    };
    let vnode = path::resolve(&root, &cwd, &path_str)?;
    let fd = proc.lock().files.open_vnode(vnode);
    fd
}

fn sys_close(fd: u32) -> KernelResult<u32> {
    process::current()
        .ok_or(KernelError::NoProcess)?
        .lock()
        .files
        .close(fd)?;
    Ok(0)
}

fn sys_waitpid(pid: u32, status_ptr: u32) -> KernelResult<u32> {
    let (child, status) = process::waitpid(pid as i32)?;
    if status_ptr != 0 {
        let aspace = current_aspace()?;
        uaccess::write_u32(&aspace, VirtAddr::new(status_ptr), status as u32)?;
    }
    Ok(child.as_u32())
}

fn sys_execve(path_ptr: u32, argv_ptr: u32, envp_ptr: u32) -> KernelResult<u32> {
    let aspace = current_aspace()?;
    let path_str = uaccess::read_cstr(&aspace, VirtAddr::new(path_ptr))?;
    let argv: Vec<String> = if argv_ptr != 0 {
        uaccess::read_cstr_array(&aspace, VirtAddr::new(argv_ptr))?
    } else {
        Vec::new()
    };
    let envp: Vec<String> = if envp_ptr != 0 {
        uaccess::read_cstr_array(&aspace, VirtAddr::new(envp_ptr))?
    } else {
        Vec::new()
    };
    let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
    let envp_refs: Vec<&str> = envp.iter().map(String::as_str).collect();
    // Transfers to the new image on success
    match process::execve(&path_str, &argv_refs, &envp_refs) {
        Err(err) => Err(err),
        Ok(never) => match never {},
    }
}

fn sys_chdir(path_ptr: u32) -> KernelResult<u32> {
    let proc = process::current().ok_or(KernelError::NoProcess)?;
    let aspace = proc.lock().address_space();
    let path_str = uaccess::read_cstr(&aspace, VirtAddr::new(path_ptr))?;
    process::chdir(&proc, &path_str)?;
    Ok(0)
}

fn sys_time(out_ptr: u32) -> KernelResult<u32> {
    // No wall clock in the core: seconds of uptime
    let seconds = (time::uptime_us() / 1_000_000) as u32;
    if out_ptr != 0 {
        let aspace = current_aspace()?;
        uaccess::write_u32(&aspace, VirtAddr::new(out_ptr), seconds)?;
    }
    Ok(seconds)
}

fn sys_pipe(fds_ptr: u32) -> KernelResult<u32> {
    let proc = process::current().ok_or(KernelError::NoProcess)?;
    let (read_fd, write_fd) = proc.lock().files.pipe()?;
    let aspace = proc.lock().address_space();
    uaccess::write_u32(&aspace, VirtAddr::new(fds_ptr), read_fd)?;
    uaccess::write_u32(&aspace, VirtAddr::new(fds_ptr + 4), write_fd)?;
    Ok(0)
}

fn sys_getdents(fd: u32, buf: u32, count: u32, wide: bool) -> KernelResult<u32> {
    let file = current_file(fd)?;
    let aspace = current_aspace()?;
    let mut tmp = alloc::vec![0u8; (count as usize).min(MAX_IO)];
    let n = if wide {
        file::getdents64_at(&file, &mut tmp)?
    } else {
        file::getdents_at(&file, &mut tmp)?
    };
    uaccess::write_bytes(&aspace, VirtAddr::new(buf), &tmp[..n])?;
    Ok(n as u32)
}

fn sys_nanosleep(req_ptr: u32, rem_ptr: u32) -> KernelResult<u32> {
    let aspace = current_aspace()?;
    let sec = uaccess::read_u32(&aspace, VirtAddr::new(req_ptr))?;
    let nsec = uaccess::read_u32(&aspace, VirtAddr::new(req_ptr + 4))?;
    if nsec >= 1_000_000_000 {
        return Err(KernelError::IntBounds);
    }
    time::nanosleep(sec as u64, nsec, None)?;
    if rem_ptr != 0 {
        uaccess::write_u32(&aspace, VirtAddr::new(rem_ptr), 0)?;
        uaccess::write_u32(&aspace, VirtAddr::new(rem_ptr + 4), 0)?;
    }
    Ok(0)
}

/// Route one request. `regs.a` carries the result out: values in the
/// non-negative range, errors as negative errno.
pub fn dispatch(regs: &mut Registers) {
    let result: KernelResult<u32> = match regs.a {
        nr::EXIT => process::exit_current(regs.b as i32),
        nr::FORK => process::fork().map(|outcome| match outcome {
            ForkOutcome::Parent(pid) => pid.as_u32(),
            ForkOutcome::Child => 0,
        }),
        nr::READ => sys_read(regs.b, regs.c, regs.d),
        nr::WRITE => sys_write(regs.b, regs.c, regs.d),
        nr::OPEN => sys_open(regs.b),
        nr::CLOSE => sys_close(regs.b),
        nr::WAITPID => sys_waitpid(regs.b, regs.c),
        // Wired but not provided by the core
        nr::CREAT | nr::LINK | nr::UNLINK => Err(KernelError::NoSyscall),
        nr::EXECVE => sys_execve(regs.b, regs.c, regs.d),
        nr::CHDIR => sys_chdir(regs.b),
        nr::TIME => sys_time(regs.b),
        nr::GETPID => process::getpid().map(|pid| pid.as_u32()),
        nr::DUP => process::current()
            .ok_or(KernelError::NoProcess)
            .and_then(|p| p.lock().files.dup(regs.b)),
        nr::PIPE => sys_pipe(regs.b),
        nr::BRK => process::brk(VirtAddr::new(regs.b)).map(|end| end.as_u32()),
        nr::DUP2 => process::current()
            .ok_or(KernelError::NoProcess)
            .and_then(|p| p.lock().files.dup2(regs.b, regs.c)),
        nr::GETDENTS => sys_getdents(regs.b, regs.c, regs.d, false),
        nr::NANOSLEEP => sys_nanosleep(regs.b, regs.c),
        nr::GETDENTS64 => sys_getdents(regs.b, regs.c, regs.d, true),
        _ => Err(KernelError::NoSyscall),
    };

    regs.a = match result {
        Ok(value) => value,
        Err(err) => {
            log::trace!("syscall {} failed: {}", regs.a, err);
            err.errno() as u32
        },
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errno;
    use crate::memory::test_support;

    fn call(a: u32, b: u32, c: u32, d: u32) -> i32 {
        let mut regs = Registers {
            a,
            b,
            c,
            d,
            ..Registers::default()
        };
        dispatch(&mut regs);
        regs.a as i32
    }

    #[test]
    fn unknown_request_is_enosys() {
        test_support::init();
        assert_eq!(call(0xdead, 0, 0, 0), -errno::ENOSYS);
    }

    #[test]
    fn wired_but_unimplemented_requests_are_enosys() {
        test_support::init();
        assert_eq!(call(nr::CREAT, 0, 0, 0), -errno::ENOSYS);
        assert_eq!(call(nr::LINK, 0, 0, 0), -errno::ENOSYS);
        assert_eq!(call(nr::UNLINK, 0, 0, 0), -errno::ENOSYS);
    }

    #[test]
    fn process_calls_without_a_process_report_esrch() {
        test_support::init();
        // The test harness context belongs to no process
        assert_eq!(call(nr::GETPID, 0, 0, 0), -errno::ESRCH);
        assert_eq!(call(nr::READ, 0, 0, 0), -errno::ESRCH);
        assert_eq!(call(nr::BRK, 0x1000, 0, 0), -errno::ESRCH);
    }

    #[test]
    fn time_reports_uptime_seconds() {
        let _guard = test_support::exclusive();
        let value = call(nr::TIME, 0, 0, 0);
        assert!(value >= 0);
    }
}
