//! Directory entry records.
//!
//! Filesystems produce 64-bit records (`getdents64` layout: 64-bit
//! inode and offset, type byte in the header). The compatibility
//! `getdents` path rewrites them in place to the 32-bit layout, whose
//! type byte hides at `reclen - 1`; an inode or offset that does not
//! fit 32 bits aborts the conversion rather than truncate.

use alloc::string::String;
use alloc::vec::Vec;
use core::convert::TryInto;

use crate::error::{KernelError, KernelResult};

/// 64-bit header: ino, off, reclen, type, then the NUL-terminated name
const HEADER64: usize = 8 + 8 + 2 + 1;
/// 32-bit header: ino, off, reclen, then the name; type at reclen-1
const HEADER32: usize = 4 + 4 + 2;

/// Record length of a 64-bit entry for `name`, 8-aligned
pub fn record_len(name: &str) -> usize {
    (HEADER64 + name.len() + 1 + 7) & !7
}

/// Pack one 64-bit record into `buf`. Returns the bytes written, or
/// `None` if it does not fit.
pub fn encode64(buf: &mut [u8], ino: u64, off: u64, dtype: u8, name: &str) -> Option<usize> {
    let reclen = record_len(name);
    if buf.len() < reclen {
        return None;
    }
    buf[0..8].copy_from_slice(&ino.to_le_bytes());
    buf[8..16].copy_from_slice(&off.to_le_bytes());
    buf[16..18].copy_from_slice(&(reclen as u16).to_le_bytes());
    buf[18] = dtype;
    let name_at = HEADER64;
    buf[name_at..name_at + name.len()].copy_from_slice(name.as_bytes());
    // NUL terminator and alignment padding
    for b in buf[name_at + name.len()..reclen].iter_mut() {
        *b = 0;
    }
    Some(reclen)
}

/// A decoded directory entry (either width)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    pub off: u64,
    pub dtype: u8,
    pub name: String,
}

fn c_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decode a stream of 64-bit records
pub fn parse64(buf: &[u8]) -> Vec<Dirent> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + HEADER64 < buf.len() {
        let ino = u64::from_le_bytes(buf[i..i + 8].try_into().unwrap());
        let off = u64::from_le_bytes(buf[i + 8..i + 16].try_into().unwrap());
        let reclen = u16::from_le_bytes(buf[i + 16..i + 18].try_into().unwrap()) as usize;
        if reclen == 0 || i + reclen > buf.len() {
            break;
        }
        out.push(Dirent {
            ino,
            off,
            dtype: buf[i + 18],
            name: c_name(&buf[i + HEADER64..i + reclen]),
        });
        i += reclen;
    }
    out
}

/// Decode a stream of 32-bit records
pub fn parse32(buf: &[u8]) -> Vec<Dirent> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + HEADER32 < buf.len() {
        let ino = u32::from_le_bytes(buf[i..i + 4].try_into().unwrap()) as u64;
        let off = u32::from_le_bytes(buf[i + 4..i + 8].try_into().unwrap()) as u64;
        let reclen = u16::from_le_bytes(buf[i + 8..i + 10].try_into().unwrap()) as usize;
        if reclen == 0 || i + reclen > buf.len() {
            break;
        }
        out.push(Dirent {
            ino,
            off,
            dtype: buf[i + reclen - 1],
            name: c_name(&buf[i + HEADER32..i + reclen - 1]),
        });
        i += reclen;
    }
    out
}

/// Rewrite a 64-bit record stream to the 32-bit layout in place,
/// keeping record boundaries. Returns the highest `d_off` seen, for
/// the caller's file position. Fails with `FileOverflow` before
/// touching a record whose inode or offset exceeds 32 bits.
pub fn convert64_to_32(buf: &mut [u8], len: usize) -> KernelResult<u64> {
    let mut max_off = 0u64;
    let mut i = 0;
    while i < len {
        let ino = u64::from_le_bytes(buf[i..i + 8].try_into().unwrap());
        let off = u64::from_le_bytes(buf[i + 8..i + 16].try_into().unwrap());
        let reclen = u16::from_le_bytes(buf[i + 16..i + 18].try_into().unwrap()) as usize;
        let dtype = buf[i + 18];

        if ino > u32::MAX as u64 || off > u32::MAX as u64 {
            return Err(KernelError::FileOverflow);
        }
        if off > max_off {
            max_off = off;
        }

        // Name moves down; the regions overlap but the copy is forward
        let name_len = reclen - HEADER64;
        buf.copy_within(i + HEADER64..i + reclen, i + HEADER32);
        buf[i..i + 4].copy_from_slice(&(ino as u32).to_le_bytes());
        buf[i + 4..i + 8].copy_from_slice(&(off as u32).to_le_bytes());
        buf[i + 8..i + 10].copy_from_slice(&(reclen as u16).to_le_bytes());
        // Scrub the tail the move left behind, then park the type byte
        for b in buf[i + HEADER32 + name_len..i + reclen].iter_mut() {
            *b = 0;
        }
        buf[i + reclen - 1] = dtype;

        i += reclen;
    }
    Ok(max_off)
}
