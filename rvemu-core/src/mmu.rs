//! Emulated MMU with byte-level memory permissions able to detect
//! uninitialized memory accesses, plus coarse dirty tracking so a forked
//! guest can be restored to its parent's state in microseconds.

use std::cmp;
use std::convert::TryInto;
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};

use thiserror::Error;

/// Executable memory. Aimed to be used with `Perm`.
pub const PERM_EXEC: u8 = 1;

/// Writable memory. Aimed to be used with `Perm`.
pub const PERM_WRITE: u8 = 1 << 1;

/// Readable memory. Aimed to be used with `Perm`.
pub const PERM_READ: u8 = 1 << 2;

/// Read-after-write memory. Aimed to be used with `Perm`.
///
/// This permission should be set when allocating writable memory. If a
/// memory position has this flag and is written, the READ permission will
/// be assigned afterwards. This allows us to detect accesses to
/// uninitialized memory.
pub const PERM_RAW: u8 = 1 << 3;

/// Block size used for resetting and tracking memory which has been
/// modified. Must be a power of two.
pub const DIRTY_BLOCK_SIZE: usize = 128;

/// Initial value of the allocation cursor. Leaves the low addresses
/// unmapped, so null-ish pointer dereferences fault.
pub const ALLOC_BASE: usize = 0x100;

/// Memory error. Every data-plane operation reports failures through this
/// type; the MMU never panics on guest input.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Some byte in the range does not satisfy the required permissions.
    #[error("permission denied: addr={addr} size={size} required={perm}")]
    PermDenied {
        addr: VirtAddr,
        size: usize,
        perm: Perm,
    },

    /// The range is outside the guest address space, or its end cannot be
    /// computed without overflow.
    #[error("out of bounds: addr={addr} size={size}")]
    OutOfBounds { addr: VirtAddr, size: usize },

    /// A host-side transfer produced fewer bytes than requested.
    #[error("short copy: addr={addr} size={size}")]
    CopyShort { addr: VirtAddr, size: usize },
}

/// Memory permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perm(pub u8);

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut disp = String::new();

        disp.push(if self.0 & PERM_READ != 0 { 'r' } else { '-' });
        disp.push(if self.0 & PERM_WRITE != 0 { 'w' } else { '-' });
        disp.push(if self.0 & PERM_EXEC != 0 { 'x' } else { '-' });
        disp.push(if self.0 & PERM_RAW != 0 { '*' } else { '-' });

        write!(f, "{}", disp)
    }
}

impl Deref for Perm {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Virtual address. Guest addresses are not translated; they index
/// directly into the MMU's memory array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub usize);

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Deref for VirtAddr {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for VirtAddr {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Emulated memory management unit.
#[derive(Debug, PartialEq, Eq)]
pub struct Mmu {
    /// Memory size.
    size: usize,

    /// Memory contents.
    memory: Vec<u8>,

    /// Byte-level memory permissions.
    perms: Vec<Perm>,

    /// Block indices in `memory` which are dirty.
    dirty: Vec<usize>,

    /// Tracks which parts of memory have been dirtied.
    dirty_bitmap: Vec<u64>,

    /// Bump allocator cursor.
    cur_alloc: VirtAddr,

    /// Base of the stack region, set up by the loader.
    stack_base: VirtAddr,

    /// Base of the heap region, set up by the loader.
    heap_base: VirtAddr,

    /// Entry point of the loaded program.
    program_start: VirtAddr,
}

impl Mmu {
    /// Returns a new Mmu with a given memory `size`.
    ///
    /// # Panics
    ///
    /// This function panics if `size` is lower than `DIRTY_BLOCK_SIZE`.
    pub fn new(size: usize) -> Mmu {
        assert!(size >= DIRTY_BLOCK_SIZE, "invalid size");

        Mmu {
            size,
            memory: vec![0; size],
            perms: vec![Perm(0); size],
            dirty: Vec::with_capacity(size / DIRTY_BLOCK_SIZE + 1),
            dirty_bitmap: vec![0; size / DIRTY_BLOCK_SIZE / 64 + 1],
            cur_alloc: VirtAddr(ALLOC_BASE),
            stack_base: VirtAddr(0),
            heap_base: VirtAddr(0),
            program_start: VirtAddr(0),
        }
    }

    /// Returns the size of the memory.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the current allocation cursor.
    pub fn cur_alloc(&self) -> VirtAddr {
        self.cur_alloc
    }

    /// Returns the base address of the stack region.
    pub fn stack_base(&self) -> VirtAddr {
        self.stack_base
    }

    /// Sets the base address of the stack region.
    pub fn set_stack_base(&mut self, addr: VirtAddr) {
        self.stack_base = addr;
    }

    /// Returns the base address of the heap region.
    pub fn heap_base(&self) -> VirtAddr {
        self.heap_base
    }

    /// Sets the base address of the heap region.
    pub fn set_heap_base(&mut self, addr: VirtAddr) {
        self.heap_base = addr;
    }

    /// Returns the entry point of the loaded program.
    pub fn program_start(&self) -> VirtAddr {
        self.program_start
    }

    /// Sets the entry point of the loaded program.
    pub fn set_program_start(&mut self, addr: VirtAddr) {
        self.program_start = addr;
    }

    /// Returns a copy of the MMU. All memory is marked as clean in the
    /// new copy.
    pub fn fork(&self) -> Mmu {
        Mmu {
            size: self.size,
            memory: self.memory.clone(),
            perms: self.perms.clone(),
            dirty: Vec::with_capacity(self.size / DIRTY_BLOCK_SIZE + 1),
            dirty_bitmap: vec![0; self.size / DIRTY_BLOCK_SIZE / 64 + 1],
            cur_alloc: self.cur_alloc,
            stack_base: self.stack_base,
            heap_base: self.heap_base,
            program_start: self.program_start,
        }
    }

    /// Restores memory to the original state `other`. Only the blocks
    /// recorded as dirty are copied back, which is what makes reusing a
    /// forked guest cheap.
    pub fn reset(&mut self, other: &Mmu) {
        for &block in &self.dirty {
            let start = block * DIRTY_BLOCK_SIZE;
            let end = cmp::min((block + 1) * DIRTY_BLOCK_SIZE, self.size);

            self.dirty_bitmap[block / 64] = 0;
            self.memory[start..end].copy_from_slice(&other.memory[start..end]);
            self.perms[start..end].copy_from_slice(&other.perms[start..end]);
        }
        self.dirty.clear();

        self.cur_alloc = other.cur_alloc;
        self.stack_base = other.stack_base;
        self.heap_base = other.heap_base;
        self.program_start = other.program_start;
    }

    /// Bump-allocates `size` bytes, rounded up to a 16-byte boundary, and
    /// marks them writable but uninitialized (RAW). Returns `None` if the
    /// allocation does not fit, leaving the cursor untouched.
    pub fn allocate(&mut self, size: usize) -> Option<VirtAddr> {
        self.allocate_perms(size, Perm(PERM_RAW | PERM_WRITE))
    }

    /// Bump-allocates `size` bytes with the given permissions.
    pub fn allocate_perms(
        &mut self,
        size: usize,
        perm: Perm,
    ) -> Option<VirtAddr> {
        let align_size = size.checked_add(0xf)? & !0xf;

        let base = self.cur_alloc;
        if *base >= self.size {
            return None;
        }

        let new_cur = base.checked_add(align_size)?;
        if new_cur > self.size {
            return None;
        }

        // Cannot fail: the range has just been checked.
        self.set_perms(base, size, perm).ok()?;
        self.cur_alloc = VirtAddr(new_cur);

        Some(base)
    }

    /// Moves the allocation cursor up to `addr` if it currently sits
    /// below it. The loader uses this to keep future allocations clear of
    /// mapped segments.
    pub fn advance_alloc(&mut self, addr: VirtAddr) {
        if addr > self.cur_alloc {
            self.cur_alloc = addr;
        }
    }

    /// Set memory permissions in the given range. The new permissions
    /// replace the old ones; they are not OR'ed in. The range is marked
    /// dirty so `reset` restores permission changes as well.
    pub fn set_perms(
        &mut self,
        addr: VirtAddr,
        size: usize,
        perm: Perm,
    ) -> Result<(), Error> {
        let end = addr
            .checked_add(size)
            .ok_or(Error::OutOfBounds { addr, size })?;

        self.perms
            .get_mut(*addr..end)
            .ok_or(Error::OutOfBounds { addr, size })?
            .iter_mut()
            .for_each(|p| *p = perm);

        self.update_dirty(addr, size);

        Ok(())
    }

    /// Checks that every byte in the given range satisfies the expected
    /// permissions.
    pub fn check_perms(
        &self,
        addr: VirtAddr,
        size: usize,
        perm: Perm,
    ) -> Result<(), Error> {
        let end = addr
            .checked_add(size)
            .ok_or(Error::OutOfBounds { addr, size })?;

        let range = self
            .perms
            .get(*addr..end)
            .ok_or(Error::OutOfBounds { addr, size })?;

        if range.iter().any(|p| **p & *perm != *perm) {
            return Err(Error::PermDenied { addr, size, perm });
        }

        Ok(())
    }

    /// Copy the bytes in `src` to the given memory address. This function
    /// fails if any destination byte is not writable; no partial write is
    /// visible in that case.
    pub fn write(&mut self, addr: VirtAddr, src: &[u8]) -> Result<(), Error> {
        let size = src.len();

        self.check_perms(addr, size, Perm(PERM_WRITE))?;

        // The range has been validated by check_perms.
        let end = *addr + size;

        self.memory[*addr..end].copy_from_slice(src);

        // Writing initializes RAW memory: add PERM_READ and keep PERM_RAW
        // as a historical marker.
        self.perms[*addr..end]
            .iter_mut()
            .filter(|p| ***p & PERM_RAW != 0)
            .for_each(|p| *p = Perm(**p | PERM_READ));

        self.update_dirty(addr, size);

        Ok(())
    }

    /// Copy the data starting at the specified memory address into `dst`.
    /// This function fails if the source memory is not readable.
    pub fn read(&self, addr: VirtAddr, dst: &mut [u8]) -> Result<(), Error> {
        self.read_perms(addr, dst, Perm(PERM_READ))
    }

    /// Copy the data starting at the specified memory address into `dst`,
    /// requiring `perm` on every source byte. Instruction fetches go
    /// through here with `PERM_EXEC`.
    pub fn read_perms(
        &self,
        addr: VirtAddr,
        dst: &mut [u8],
        perm: Perm,
    ) -> Result<(), Error> {
        let size = dst.len();

        self.check_perms(addr, size, perm)?;

        dst.copy_from_slice(&self.memory[*addr..*addr + size]);

        Ok(())
    }

    /// Copy the data starting at the specified memory address into `dst`
    /// without checking permissions. Host-side introspection only.
    pub fn peek(&self, addr: VirtAddr, dst: &mut [u8]) -> Result<(), Error> {
        let size = dst.len();

        let end = addr
            .checked_add(size)
            .ok_or(Error::OutOfBounds { addr, size })?;

        let src = self
            .memory
            .get(*addr..end)
            .ok_or(Error::OutOfBounds { addr, size })?;

        dst.copy_from_slice(src);

        Ok(())
    }

    /// Returns the permissions of the given range without any access
    /// check. Host-side introspection only.
    pub fn peek_perms(
        &self,
        addr: VirtAddr,
        size: usize,
    ) -> Result<&[Perm], Error> {
        let end = addr
            .checked_add(size)
            .ok_or(Error::OutOfBounds { addr, size })?;

        self.perms
            .get(*addr..end)
            .ok_or(Error::OutOfBounds { addr, size })
    }

    /// Record the blocks covering `[addr, addr+size)` as dirty. The range
    /// is coarsened to `DIRTY_BLOCK_SIZE`, so the dirty set may
    /// over-approximate the touched bytes.
    fn update_dirty(&mut self, addr: VirtAddr, size: usize) {
        let block_start = *addr / DIRTY_BLOCK_SIZE;
        // Round up so a range ending exactly on a block boundary does not
        // spill into the next block.
        let block_end =
            (*addr + size + (DIRTY_BLOCK_SIZE - 1)) / DIRTY_BLOCK_SIZE;

        for block in block_start..block_end {
            let idx = block / 64;
            let bit = block % 64;

            if self.dirty_bitmap[idx] & (1 << bit) == 0 {
                self.dirty_bitmap[idx] |= 1 << bit;
                self.dirty.push(block);
            }
        }
    }

    /// Write an integer value into a given memory address, serialized as
    /// little-endian bytes regardless of the host endianness.
    pub fn write_int<T: LeBytes>(
        &mut self,
        addr: VirtAddr,
        value: T::Target,
    ) -> Result<(), Error> {
        let bytes = T::to_le_bytes(value);
        let src = &bytes[..mem::size_of::<T::Target>()];
        self.write(addr, src)
    }

    /// Read a little-endian integer from the specified memory address.
    /// This function fails if the source memory is not readable.
    pub fn read_int<T: LeBytes>(
        &self,
        addr: VirtAddr,
    ) -> Result<T::Target, Error> {
        self.read_int_perms::<T>(addr, Perm(PERM_READ))
    }

    /// Read a little-endian integer from the specified memory address,
    /// requiring `perm` on every source byte.
    pub fn read_int_perms<T: LeBytes>(
        &self,
        addr: VirtAddr,
        perm: Perm,
    ) -> Result<T::Target, Error> {
        let mut bytes = [0u8; 8];
        let dst = &mut bytes[..mem::size_of::<T::Target>()];
        self.read_perms(addr, dst, perm)?;
        Ok(T::from_le_bytes(bytes))
    }
}

/// Types implementing this trait can be converted to and from
/// little-endian bytes.
pub trait LeBytes {
    type Target;

    /// Convert an array of bytes into a value of the associated type.
    fn from_le_bytes(bytes: [u8; 8]) -> Self::Target;

    /// Convert a value of the associated type into an array of bytes.
    fn to_le_bytes(value: Self::Target) -> [u8; 8];
}

macro_rules! impl_le_bytes {
    ($Ty: ty) => {
        impl LeBytes for $Ty {
            type Target = $Ty;

            fn from_le_bytes(bytes: [u8; 8]) -> $Ty {
                let src = &bytes[..mem::size_of::<$Ty>()];

                <$Ty>::from_le_bytes(src.try_into().unwrap())
            }

            fn to_le_bytes(value: $Ty) -> [u8; 8] {
                let bytes = value.to_le_bytes();

                let mut result = [0u8; 8];
                let dst = &mut result[..mem::size_of::<$Ty>()];
                dst.copy_from_slice(&bytes);

                result
            }
        }
    };
}

// Implement LeBytes for unsigned integers.
impl_le_bytes!(u8);
impl_le_bytes!(u16);
impl_le_bytes!(u32);
impl_le_bytes!(u64);

// Implement LeBytes for signed integers.
impl_le_bytes!(i8);
impl_le_bytes!(i16);
impl_le_bytes!(i32);
impl_le_bytes!(i64);
