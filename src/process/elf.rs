//! ELF images and exec.
//!
//! Little-endian 32-bit i386 executables only; just the PT_LOAD
//! program headers are interpreted. `exec` builds the whole new image
//! in a detached address space and commits it to the process only once
//! everything (segments, BSS, the argument stack) is in place, so a
//! malformed image leaves the caller untouched.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::convert::TryInto;

use crate::error::{KernelError, KernelResult};
use crate::filesystem::vnode::Vnode;
use crate::memory::paging;
use crate::memory::prelude::{VirtAddr, PAGE_SIZE};
use crate::memory::segment::{AddressSpace, Segment, SegmentFlags};
use crate::multitasking::thread;
use crate::util::{align_down, align_up};

use super::uaccess;
use super::ProcessRef;

pub const EHDR_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const CLASS_32: u8 = 1;
const DATA_LSB: u8 = 1;
const VERSION_CURRENT: u8 = 1;
const TYPE_REL: u16 = 1;
const TYPE_EXEC: u16 = 2;
const MACHINE_386: u16 = 3;
const PT_LOAD: u32 = 1;

/// Default top of the user stack when the image loads above it: 16 MiB
const DEFAULT_STACK_TOP: u32 = 0x0100_0000;
/// The lowest page never maps, so null dereferences trap
const STACK_BOTTOM: u32 = PAGE_SIZE;

bitflags! {
    pub struct PhdrFlags: u32 {
        const X = 1 << 0;
        const W = 1 << 1;
        const R = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Ehdr {
    pub e_type: u16,
    pub machine: u16,
    pub entry: u32,
    pub phoff: u32,
    pub phentsize: u16,
    pub phnum: u16,
    ident_class: u8,
    ident_data: u8,
    ident_version: u8,
    version: u32,
    magic: [u8; 4],
}

impl Ehdr {
    pub fn parse(bytes: &[u8]) -> KernelResult<Ehdr> {
        if bytes.len() < EHDR_SIZE {
            return Err(KernelError::ElfError("truncated header"));
        }
        let u16_at = |i: usize| u16::from_le_bytes(bytes[i..i + 2].try_into().unwrap());
        let u32_at = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
        Ok(Ehdr {
            magic: bytes[0..4].try_into().unwrap(),
            ident_class: bytes[4],
            ident_data: bytes[5],
            ident_version: bytes[6],
            e_type: u16_at(16),
            machine: u16_at(18),
            version: u32_at(20),
            entry: u32_at(24),
            phoff: u32_at(28),
            phentsize: u16_at(42),
            phnum: u16_at(44),
        })
    }

    /// The checks exec relies on: magic, 32-bit, little-endian,
    /// version, REL or EXEC, i386, sane program header size
    pub fn validate(&self) -> KernelResult<()> {
        if self.magic != ELF_MAGIC {
            return Err(KernelError::ElfError("bad magic"));
        }
        if self.ident_class != CLASS_32 {
            return Err(KernelError::ElfError("not a 32-bit image"));
        }
        if self.ident_data != DATA_LSB {
            return Err(KernelError::ElfError("not little-endian"));
        }
        if self.ident_version != VERSION_CURRENT || self.version != VERSION_CURRENT as u32 {
            return Err(KernelError::ElfError("bad version"));
        }
        if self.e_type != TYPE_REL && self.e_type != TYPE_EXEC {
            return Err(KernelError::ElfError("not an executable"));
        }
        if self.machine != MACHINE_386 {
            return Err(KernelError::ElfError("wrong machine"));
        }
        if self.phentsize as usize != PHDR_SIZE {
            return Err(KernelError::ElfError("bad program header size"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Phdr {
    pub p_type: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: PhdrFlags,
    pub align: u32,
}

impl Phdr {
    pub fn parse(bytes: &[u8]) -> KernelResult<Phdr> {
        if bytes.len() < PHDR_SIZE {
            return Err(KernelError::ElfError("truncated program header"));
        }
        let u32_at = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
        Ok(Phdr {
            p_type: u32_at(0),
            offset: u32_at(4),
            vaddr: u32_at(8),
            // paddr at 12 is unused
            filesz: u32_at(16),
            memsz: u32_at(20),
            flags: PhdrFlags::from_bits_truncate(u32_at(24)),
            align: u32_at(28),
        })
    }

    pub fn loadable(&self) -> bool {
        self.p_type == PT_LOAD
    }

    fn segment_flags(&self) -> SegmentFlags {
        let mut perms = SegmentFlags::U | SegmentFlags::P;
        if self.flags.contains(PhdrFlags::R) {
            perms |= SegmentFlags::R;
        }
        if self.flags.contains(PhdrFlags::W) {
            perms |= SegmentFlags::W;
        }
        if self.flags.contains(PhdrFlags::X) {
            perms |= SegmentFlags::X;
        }
        perms
    }
}

fn read_exact(file: &Arc<Vnode>, offset: u64, buf: &mut [u8]) -> KernelResult<()> {
    if file.read(offset, buf)? != buf.len() {
        return Err(KernelError::ElfError("truncated image"));
    }
    Ok(())
}

/// Push `bytes` onto a downward stack
fn push(aspace: &AddressSpace, sp: &mut VirtAddr, bytes: &[u8]) -> KernelResult<VirtAddr> {
    *sp = *sp - bytes.len() as u32;
    uaccess::write_bytes(aspace, *sp, bytes)?;
    Ok(*sp)
}

/// Replace `process`'s image with the executable in `file`.
///
/// The new address space is assembled off to the side: PT_LOAD
/// segments become private vnode-backed segments (writable ones get an
/// anonymous dirty side and a zeroed BSS tail), a stack grows down
/// from the lowest image page, and the heap starts empty after the
/// highest writable byte. argv and envp are staged through the
/// caller's scratch arena and pushed as NUL-terminated strings, the
/// two NULL-terminated pointer arrays, then argc.
///
/// Returns `(entry, stack pointer)`; the caller transfers control. On
/// any error the half-built space is dropped and the process keeps its
/// old image.
pub fn exec(
    process: &ProcessRef, file: Arc<Vnode>, argv: &[&str], envp: &[&str],
) -> KernelResult<(VirtAddr, VirtAddr)> {
    let aspace = AddressSpace::new(paging::new_asid());

    let mut header = [0u8; EHDR_SIZE];
    read_exact(&file, 0, &mut header)?;
    let ehdr = Ehdr::parse(&header)?;
    ehdr.validate()?;

    let mut phdrs = Vec::with_capacity(ehdr.phnum as usize);
    for i in 0..ehdr.phnum as usize {
        let mut buf = [0u8; PHDR_SIZE];
        read_exact(&file, ehdr.phoff as u64 + (i * PHDR_SIZE) as u64, &mut buf)?;
        phdrs.push(Phdr::parse(&buf)?);
    }

    let mut stack_top = VirtAddr::new(DEFAULT_STACK_TOP);
    let mut brk = VirtAddr::zero();
    for phdr in phdrs.iter().filter(|p| p.loadable()) {
        let align = phdr.align.max(PAGE_SIZE);
        let vaddr = VirtAddr::new(align_down(phdr.vaddr, align));
        let msize = align_up(phdr.memsz + (phdr.vaddr - vaddr.as_u32()), align);
        let offset = align_down(phdr.offset, align);

        aspace.add(Segment::vnode(
            vaddr,
            msize,
            phdr.segment_flags(),
            file.clone(),
            offset as u64,
        ));

        if vaddr < stack_top {
            stack_top = vaddr;
        }

        if phdr.flags.contains(PhdrFlags::W) {
            // Zero the BSS tail: bytes past filesz up to the aligned
            // end of the segment would otherwise leak file content
            let zero_start = phdr.vaddr + phdr.filesz;
            let zero_end = align_up(phdr.vaddr + phdr.memsz, align);
            let zeroes = [0u8; 256];
            let mut at = zero_start;
            while at < zero_end {
                let span = (zero_end - at).min(zeroes.len() as u32);
                uaccess::write_bytes(&aspace, VirtAddr::new(at), &zeroes[..span as usize])?;
                at += span;
            }
            if VirtAddr::new(zero_end) > brk {
                brk = VirtAddr::new(zero_end);
            }
        }
    }

    // Stack below the image, heap above the writable image end
    let stack_top = stack_top.page_align_down();
    if stack_top.as_u32() <= STACK_BOTTOM {
        return Err(KernelError::ElfError("image leaves no room for a stack"));
    }
    aspace.add(Segment::anonymous(
        VirtAddr::new(STACK_BOTTOM),
        stack_top.as_u32() - STACK_BOTTOM,
        SegmentFlags::U | SegmentFlags::R | SegmentFlags::W,
    ));
    aspace.add(Segment::anonymous(
        brk,
        0,
        SegmentFlags::U | SegmentFlags::R | SegmentFlags::W,
    ));

    // Build the initial stack: strings first, then envp and argv
    // pointer arrays (NULL-terminated), then argc at the very top.
    // The strings stage through the thread's scratch arena.
    let mut sp = stack_top;
    let (argv_ptrs, envp_ptrs) = thread::with_scratch_arena(
        |arena| -> KernelResult<(Vec<u32>, Vec<u32>)> {
            let mark = arena.get_state();
            let mut staged = Vec::new();
            for s in argv.iter().chain(envp.iter()) {
                let at = arena.alloc(s.len() as u32 + 1)?;
                arena.write_bytes(at, s.as_bytes())?;
                arena.write_bytes(at + s.len() as u32, &[0])?;
                staged.push((at, s.len() + 1));
            }

            let mut ptrs = Vec::new();
            for (at, len) in staged {
                let mut buf = alloc::vec![0u8; len];
                arena.read_bytes(at, &mut buf)?;
                ptrs.push(push(&aspace, &mut sp, &buf)?.as_u32());
            }
            arena.set_state(mark)?;
            let envp_ptrs = ptrs.split_off(argv.len());
            Ok((ptrs, envp_ptrs))
        },
    )?;

    // Word-align before the pointer arrays
    sp = VirtAddr::new(align_down(sp.as_u32(), 4));
    let mut array = |ptrs: &[u32]| -> KernelResult<()> {
        push(&aspace, &mut sp, &0u32.to_le_bytes())?;
        for ptr in ptrs.iter().rev() {
            push(&aspace, &mut sp, &ptr.to_le_bytes())?;
        }
        Ok(())
    };
    array(&envp_ptrs)?;
    array(&argv_ptrs)?;
    push(&aspace, &mut sp, &(argv.len() as u32).to_le_bytes())?;

    // Commit: the old space dies with its last reference
    let entry = VirtAddr::new(ehdr.entry);
    {
        let mut p = process.lock();
        p.install_exec(Arc::new(aspace), brk, brk);
    }
    {
        let p = process.lock();
        paging::set_asid(p.address_space().asid);
    }
    Ok((entry, sp))
}

/// Build a minimal i386 executable image: one PT_LOAD segment with the
/// given payload. Shared by the exec tests and by filesystem adapters'
/// self-checks.
#[cfg(test)]
pub fn build_test_image(
    entry: u32, vaddr: u32, payload: &[u8], filesz: u32, memsz: u32, flags: u32,
) -> Vec<u8> {
    let mut image = alloc::vec![0u8; 0x1000 + payload.len()];
    // ELF header
    image[0..4].copy_from_slice(&ELF_MAGIC);
    image[4] = CLASS_32;
    image[5] = DATA_LSB;
    image[6] = VERSION_CURRENT;
    image[16..18].copy_from_slice(&TYPE_EXEC.to_le_bytes());
    image[18..20].copy_from_slice(&MACHINE_386.to_le_bytes());
    image[20..24].copy_from_slice(&(VERSION_CURRENT as u32).to_le_bytes());
    image[24..28].copy_from_slice(&entry.to_le_bytes());
    image[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes()); // phoff
    image[40..42].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // ehsize
    image[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    image[44..46].copy_from_slice(&1u16.to_le_bytes()); // phnum
    // Program header
    let ph = EHDR_SIZE;
    image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
    image[ph + 4..ph + 8].copy_from_slice(&0x1000u32.to_le_bytes()); // offset
    image[ph + 8..ph + 12].copy_from_slice(&vaddr.to_le_bytes());
    image[ph + 16..ph + 20].copy_from_slice(&filesz.to_le_bytes());
    image[ph + 20..ph + 24].copy_from_slice(&memsz.to_le_bytes());
    image[ph + 24..ph + 28].copy_from_slice(&flags.to_le_bytes());
    image[ph + 28..ph + 32].copy_from_slice(&0x1000u32.to_le_bytes()); // align
    // Payload at file offset 0x1000
    image[0x1000..0x1000 + payload.len()].copy_from_slice(payload);
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::file::FdTable;
    use crate::filesystem::memfs;
    use crate::memory::test_support;
    use crate::process;

    fn test_process() -> ProcessRef {
        let root = memfs::dir();
        process::create(
            None,
            Arc::new(AddressSpace::new(paging::new_asid())),
            FdTable::new(),
            root.clone(),
            root,
        )
    }

    fn cleanup(p: &ProcessRef) {
        let pid = p.lock().pid;
        process::test_remove(pid);
    }

    #[test]
    fn header_validation_catches_foreign_images() {
        let image = build_test_image(0x100080, 0x100000, b"code", 4, 4, 5);

        let mut bad_magic = image.clone();
        bad_magic[0] = 0x7e;
        let e = Ehdr::parse(&bad_magic).unwrap();
        assert!(matches!(e.validate(), Err(KernelError::ElfError(_))));

        let mut wrong_machine = image.clone();
        wrong_machine[18..20].copy_from_slice(&0x3eu16.to_le_bytes()); // x86-64
        let e = Ehdr::parse(&wrong_machine).unwrap();
        assert!(matches!(e.validate(), Err(KernelError::ElfError(_))));

        let mut wide = image.clone();
        wide[4] = 2; // 64-bit class
        let e = Ehdr::parse(&wide).unwrap();
        assert!(matches!(e.validate(), Err(KernelError::ElfError(_))));

        let mut bad_phent = image;
        bad_phent[42..44].copy_from_slice(&56u16.to_le_bytes());
        let e = Ehdr::parse(&bad_phent).unwrap();
        assert!(matches!(e.validate(), Err(KernelError::ElfError(_))));
    }

    #[test]
    fn exec_failure_keeps_the_old_address_space() {
        let _guard = test_support::exclusive();
        let process = test_process();
        let old = process.lock().address_space();

        let garbage = memfs::file(b"\x7fNOPE this is not an executable");
        let err = exec(&process, garbage, &["x"], &[]).unwrap_err();
        assert!(matches!(err, KernelError::ElfError(_)));
        assert!(Arc::ptr_eq(&old, &process.lock().address_space()));
        cleanup(&process);
    }

    #[test]
    fn exec_builds_the_posix_argument_stack() {
        let _guard = test_support::exclusive();
        let process = test_process();

        let payload = [0x90u8; 0x200]; // nops
        let image = build_test_image(0x100080, 0x100000, &payload, 0x200, 0x200, 5);
        let file = memfs::file(&image);

        let (entry, sp) = exec(&process, file, &["echo", "hi"], &[]).unwrap();
        assert_eq!(entry.as_u32(), 0x100080);

        let aspace = process.lock().address_space();
        // argc
        assert_eq!(uaccess::read_u32(&aspace, sp).unwrap(), 2);
        // argv array, NULL-terminated
        let argv0 = uaccess::read_u32(&aspace, sp + 4).unwrap();
        let argv1 = uaccess::read_u32(&aspace, sp + 8).unwrap();
        assert_eq!(uaccess::read_u32(&aspace, sp + 12).unwrap(), 0);
        // envp array: just the NULL
        assert_eq!(uaccess::read_u32(&aspace, sp + 16).unwrap(), 0);

        let a0 = uaccess::read_cstr(&aspace, VirtAddr::new(argv0)).unwrap();
        let a1 = uaccess::read_cstr(&aspace, VirtAddr::new(argv1)).unwrap();
        assert_eq!(a0, "echo");
        assert_eq!(a1, "hi");
        cleanup(&process);
    }

    #[test]
    fn exec_maps_the_image_and_zeroes_bss() {
        let _guard = test_support::exclusive();
        let process = test_process();

        // File bytes continue past filesz; memsz extends further
        let mut payload = [0xabu8; 0x400];
        payload[0] = 0x11;
        let image = build_test_image(0x100000, 0x100000, &payload, 0x200, 0x400, 7);
        let file = memfs::file(&image);

        exec(&process, file, &["bss"], &[]).unwrap();
        let aspace = process.lock().address_space();

        // Image bytes inside filesz come from the file
        let mut byte = [0u8; 1];
        uaccess::read_bytes(&aspace, VirtAddr::new(0x100000), &mut byte).unwrap();
        assert_eq!(byte[0], 0x11);
        uaccess::read_bytes(&aspace, VirtAddr::new(0x1001ff), &mut byte).unwrap();
        assert_eq!(byte[0], 0xab);
        // Past filesz: zeroed BSS, not the 0xab the file holds there
        uaccess::read_bytes(&aspace, VirtAddr::new(0x100250), &mut byte).unwrap();
        assert_eq!(byte[0], 0);

        // The heap begins at the aligned writable end
        assert_eq!(process.lock().heap_base, Some(VirtAddr::new(0x101000)));
        cleanup(&process);
    }

    #[test]
    fn exec_stack_sits_below_the_image() {
        let _guard = test_support::exclusive();
        let process = test_process();
        let image = build_test_image(0x100000, 0x100000, &[0x90; 16], 16, 16, 5);
        let (_, sp) = exec(&process, memfs::file(&image), &["a"], &[]).unwrap();
        assert!(sp.as_u32() < 0x100000);
        assert!(sp.as_u32() > PAGE_SIZE);

        // The stack faults in as user-writable memory
        let aspace = process.lock().address_space();
        uaccess::write_bytes(&aspace, sp - 64, &[1, 2, 3]).unwrap();
        cleanup(&process);
    }
}
