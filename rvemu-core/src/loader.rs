//! Process image loader. Maps the `PT_LOAD` segments of a statically
//! linked RV64 executable into guest memory, lays out the stack and heap
//! and synthesizes the initial System V stack frame (argc/argv/envp).
//!
//! ELF parsing itself is delegated to the `elf` crate; only a list of
//! segment descriptors and the entry point cross into the mapping code.

use std::fs;
use std::io;
use std::iter;
use std::mem;
use std::path::Path;

use elf::abi::{EM_RISCV, ET_EXEC, PT_LOAD};
use elf::endian::AnyEndian;
use elf::file::Class;
use elf::ElfBytes;
use log::debug;
use thiserror::Error;

use crate::emulator::{Emulator, RegAlias, VmExit};
use crate::mmu::{
    self, LeBytes, Perm, VirtAddr, PERM_READ, PERM_WRITE,
};

/// Memory reserved for the stack at the high end of guest memory.
pub const STACK_SIZE: usize = 1024 * 1024;

/// Initial heap allocation backing the `mmap` stub.
pub const HEAP_SIZE: usize = 64 * 1024;

/// Loader error.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("ELF parse error: {0}")]
    Elf(#[from] elf::parse::ParseError),

    #[error("not a 64-bit little-endian RISC-V executable")]
    NotRiscv64,

    #[error("no loadable segments")]
    NoSegments,

    #[error("segment exceeds file size: offset={offset:#x} size={size:#x}")]
    TruncatedSegment { offset: usize, size: usize },

    #[error("guest memory too small for the process image")]
    OutOfMemory,

    #[error("memory fault while mapping: {0}")]
    Mmu(#[from] mmu::Error),

    #[error("emulator error while mapping: {0}")]
    Emu(#[from] VmExit),
}

/// Loadable segment descriptor, extracted from a `PT_LOAD` program
/// header. The permission flags use the ELF encoding, which matches the
/// MMU's permission bits (EXEC=1, WRITE=2, READ=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub file_offset: usize,
    pub file_size: usize,
    pub mem_size: usize,
    pub virt_addr: VirtAddr,
    pub perms: Perm,
    pub align: usize,
}

/// Parses an ELF image and returns its loadable segments and entry point.
/// Only 64-bit little-endian RISC-V executables are accepted.
pub fn parse_segments(
    contents: &[u8],
) -> Result<(Vec<Segment>, VirtAddr), LoadError> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(contents)?;

    if file.ehdr.class != Class::ELF64
        || file.ehdr.endianness != AnyEndian::Little
        || file.ehdr.e_machine != EM_RISCV
        || file.ehdr.e_type != ET_EXEC
    {
        return Err(LoadError::NotRiscv64);
    }

    let phdrs = file.segments().ok_or(LoadError::NoSegments)?;

    let mut segments = Vec::new();
    for phdr in phdrs.iter() {
        if phdr.p_type != PT_LOAD {
            continue;
        }

        let segment = Segment {
            file_offset: phdr.p_offset as usize,
            file_size: phdr.p_filesz as usize,
            mem_size: phdr.p_memsz as usize,
            virt_addr: VirtAddr(phdr.p_vaddr as usize),
            perms: Perm((phdr.p_flags & 0b111) as u8),
            align: phdr.p_align as usize,
        };

        debug!(
            "PT_LOAD vaddr={} file_size={:#x} mem_size={:#x} perms={} \
             align={:#x}",
            segment.virt_addr,
            segment.file_size,
            segment.mem_size,
            segment.perms,
            segment.align
        );

        segments.push(segment);
    }

    if segments.is_empty() {
        return Err(LoadError::NoSegments);
    }

    Ok((segments, VirtAddr(file.ehdr.e_entry as usize)))
}

fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    debug_assert!(align.is_power_of_two());

    (value + align - 1) & !(align - 1)
}

impl Emulator {
    /// Loads an ELF executable into the emulator, building a complete
    /// process image: mapped segments, stack, heap and the initial stack
    /// frame. `argv[0]` is derived from the file name.
    pub fn load_program<P: AsRef<Path>>(
        &mut self,
        path: P,
        guest_args: &[String],
    ) -> Result<(), LoadError> {
        let contents = fs::read(&path)?;

        let argv0 = path
            .as_ref()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("a.out"));

        self.load_image(&contents, &argv0, guest_args)
    }

    /// Loads an in-memory ELF image. See `load_program`.
    pub fn load_image(
        &mut self,
        contents: &[u8],
        argv0: &str,
        guest_args: &[String],
    ) -> Result<(), LoadError> {
        let (segments, entry) = parse_segments(contents)?;

        self.map_segments(contents, &segments)?;

        self.mmu.set_program_start(entry);
        self.set_reg(RegAlias::Pc, *entry as u64)?;

        self.setup_stack(argv0, guest_args)?;

        Ok(())
    }

    fn map_segments(
        &mut self,
        contents: &[u8],
        segments: &[Segment],
    ) -> Result<(), LoadError> {
        for seg in segments {
            let aligned_size = align_up(seg.mem_size, seg.align);

            // Map the whole region writable while populating it, then
            // demote to the segment's own permissions.
            self.mmu
                .set_perms(seg.virt_addr, aligned_size, Perm(PERM_WRITE))?;

            let file_end = seg
                .file_offset
                .checked_add(seg.file_size)
                .ok_or(LoadError::TruncatedSegment {
                    offset: seg.file_offset,
                    size: seg.file_size,
                })?;
            let bytes = contents.get(seg.file_offset..file_end).ok_or(
                LoadError::TruncatedSegment {
                    offset: seg.file_offset,
                    size: seg.file_size,
                },
            )?;

            self.mmu.write(seg.virt_addr, bytes)?;

            // Zero-fill the BSS portion.
            if seg.mem_size > seg.file_size {
                let pad = vec![0u8; seg.mem_size - seg.file_size];
                self.mmu
                    .write(VirtAddr(*seg.virt_addr + seg.file_size), &pad)?;
            }

            self.mmu.set_perms(seg.virt_addr, aligned_size, seg.perms)?;

            // Keep the bump allocator clear of every mapped segment.
            let seg_end =
                align_up(*seg.virt_addr + seg.mem_size, seg.align);
            self.mmu.advance_alloc(VirtAddr(seg_end));
        }

        Ok(())
    }

    /// Reserves the stack at the high end of memory and the heap right
    /// after the loaded segments, then builds the initial stack frame:
    ///
    /// ```text
    /// argv_base -> "argv0\0arg1\0..." (16-byte aligned blob)
    /// sp+12     -> envp terminator (0)
    /// sp+4      -> argv_base
    /// sp        -> argc (u32)
    /// ```
    fn setup_stack(
        &mut self,
        argv0: &str,
        guest_args: &[String],
    ) -> Result<(), LoadError> {
        let mem_size = self.mmu.size();

        let stack_base = (mem_size - 0xff) & !0xf;
        let stack_low = stack_base
            .checked_sub(STACK_SIZE)
            .ok_or(LoadError::OutOfMemory)?;

        if stack_low < *self.mmu.cur_alloc() {
            return Err(LoadError::OutOfMemory);
        }

        self.mmu.set_perms(
            VirtAddr(stack_low),
            mem_size - stack_low,
            Perm(PERM_READ | PERM_WRITE),
        )?;
        self.mmu.set_stack_base(VirtAddr(stack_base));
        self.set_reg(RegAlias::Sp, stack_base as u64)?;

        let heap = self.mmu.allocate(HEAP_SIZE).ok_or(LoadError::OutOfMemory)?;
        self.mmu.set_heap_base(heap);

        debug!(
            "stack_base={:#x} heap_base={} entry={}",
            stack_base,
            heap,
            self.mmu.program_start()
        );

        // NUL-joined argument blob, placed at the very top of the stack.
        let mut blob = Vec::new();
        for arg in iter::once(argv0).chain(guest_args.iter().map(String::as_str))
        {
            blob.extend_from_slice(arg.as_bytes());
            blob.push(0);
        }
        let argc = guest_args.len() as u32 + 1;

        let blob_size = (blob.len() + 0xf) & !0xf;
        let argv_base = stack_base
            .checked_sub(blob_size)
            .ok_or(LoadError::OutOfMemory)?;

        self.mmu.write(VirtAddr(argv_base), &blob)?;

        // Drop SP below the blob before pushing so the frame does not
        // overlap it.
        self.set_reg(RegAlias::Sp, argv_base as u64)?;

        self.push(0u64)?; // envp terminator
        self.push(argv_base as u64)?; // argv
        self.push(argc)?; // argc

        Ok(())
    }

    /// Pushes a little-endian value onto the guest stack, moving SP down
    /// by its size.
    pub fn push<T: LeBytes<Target = T>>(
        &mut self,
        val: T,
    ) -> Result<(), LoadError> {
        let size = mem::size_of::<T>() as u64;

        let sp = self
            .reg(RegAlias::Sp)?
            .checked_sub(size)
            .ok_or(LoadError::OutOfMemory)?;

        self.mmu.write_int::<T>(VirtAddr(sp as usize), val)?;
        self.set_reg(RegAlias::Sp, sp)?;

        Ok(())
    }
}
