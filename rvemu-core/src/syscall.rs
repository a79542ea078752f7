//! Host system interface. ECALL traps land here: the syscall number is
//! read from `a7`, the arguments from `a0..a5`, and the handler interacts
//! with guest memory exclusively through the MMU's checked accessors.

use std::io::{self, Write};

use log::debug;

use crate::emulator::{Emulator, RegAlias, VmExit};
use crate::mmu::{self, Perm, VirtAddr, PERM_RAW, PERM_READ, PERM_WRITE};

pub const SYS_WRITE: u64 = 64;
pub const SYS_WRITEV: u64 = 66;
pub const SYS_EXIT: u64 = 93;
pub const SYS_EXIT_GROUP: u64 = 94;
pub const SYS_BRK: u64 = 214;
pub const SYS_MMAP: u64 = 222;

/// Linux EBADF, returned for writes to file descriptors the host does not
/// map.
const EBADF: u64 = -9i64 as u64;

/// Syscall number and arguments as captured from the register file.
#[derive(Debug, Clone, Copy)]
pub struct Syscall {
    pub num: u64,
    pub args: [u64; 6],
}

impl Syscall {
    /// Reads the syscall number and arguments from `a7` and `a0..a5`.
    pub fn gather(emu: &Emulator) -> Result<Syscall, VmExit> {
        Ok(Syscall {
            num: emu.reg(RegAlias::A7)?,
            args: [
                emu.reg(RegAlias::A0)?,
                emu.reg(RegAlias::A1)?,
                emu.reg(RegAlias::A2)?,
                emu.reg(RegAlias::A3)?,
                emu.reg(RegAlias::A4)?,
                emu.reg(RegAlias::A5)?,
            ],
        })
    }
}

/// Host-side process state: the output sinks backing the guest's file
/// descriptors and the program break cursor.
///
/// Each emulator instance gets its own `System`, so forked instances
/// driven concurrently do not share host state. The break cursor should
/// be seeded with `set_brk` once the program image is loaded.
pub struct System {
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    brk: VirtAddr,
}

impl System {
    /// Returns a `System` backed by the host's stdout and stderr.
    pub fn new() -> System {
        System {
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
            brk: VirtAddr(0),
        }
    }

    /// Returns a `System` with custom output sinks. Used by tests and
    /// harnesses that multiplex many instances over one terminal.
    pub fn with_output(
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) -> System {
        System {
            stdout,
            stderr,
            brk: VirtAddr(0),
        }
    }

    /// Seeds the program break. Callers typically pass
    /// `emu.mmu.cur_alloc()` right after loading.
    pub fn set_brk(&mut self, addr: VirtAddr) {
        self.brk = addr;
    }

    /// Dispatches the syscall described by the current register state and
    /// stores its result in `a0`. Returns `VmExit::Exit` for
    /// `exit`/`exit_group` and `VmExit::SyscallUnimplemented` for numbers
    /// without a handler.
    pub fn syscall(&mut self, emu: &mut Emulator) -> Result<(), VmExit> {
        let sc = Syscall::gather(emu)?;

        debug!("syscall {} args={:x?}", sc.num, sc.args);

        match sc.num {
            SYS_WRITE => self.sys_write(emu, &sc),
            SYS_WRITEV => self.sys_writev(emu, &sc),
            SYS_EXIT | SYS_EXIT_GROUP => Err(VmExit::Exit(sc.args[0])),
            SYS_BRK => self.sys_brk(emu, &sc),
            SYS_MMAP => {
                // Minimal stub: hand out the heap base. Enough for common
                // startup code, not a real mapping allocator.
                let heap = emu.mmu.heap_base();
                emu.set_reg(RegAlias::A0, *heap as u64)
            }
            _ => Err(VmExit::SyscallUnimplemented {
                num: sc.num,
                args: sc.args,
            }),
        }
    }

    fn sink(&mut self, fd: u64) -> Option<&mut (dyn Write + Send)> {
        match fd {
            1 => Some(&mut *self.stdout),
            2 => Some(&mut *self.stderr),
            _ => None,
        }
    }

    /// ssize_t write(int fd, const void *buf, size_t count)
    fn sys_write(
        &mut self,
        emu: &mut Emulator,
        sc: &Syscall,
    ) -> Result<(), VmExit> {
        let (fd, buf, count) = (sc.args[0], sc.args[1], sc.args[2]);

        let sink = match self.sink(fd) {
            Some(sink) => sink,
            None => return emu.set_reg(RegAlias::A0, EBADF),
        };

        let mut bytes = vec![0; count as usize];
        emu.mmu
            .read_perms(VirtAddr(buf as usize), &mut bytes, Perm(PERM_READ))?;

        host_write(sink, VirtAddr(buf as usize), &bytes)?;

        emu.set_reg(RegAlias::A0, count)
    }

    /// ssize_t writev(int fd, const struct iovec *iov, int iovcnt)
    ///
    /// Each iovec is a pair of little-endian u64s: `{base, len}`.
    fn sys_writev(
        &mut self,
        emu: &mut Emulator,
        sc: &Syscall,
    ) -> Result<(), VmExit> {
        let (fd, iov, iovcnt) = (sc.args[0], sc.args[1], sc.args[2]);

        let sink = match self.sink(fd) {
            Some(sink) => sink,
            None => return emu.set_reg(RegAlias::A0, EBADF),
        };

        let mut total = 0u64;

        for i in 0..iovcnt {
            let entry = iov.wrapping_add(i.wrapping_mul(16));

            let base = emu.mmu.read_int::<u64>(VirtAddr(entry as usize))?;
            let len = emu
                .mmu
                .read_int::<u64>(VirtAddr(entry.wrapping_add(8) as usize))?;

            let mut bytes = vec![0; len as usize];
            emu.mmu.read_perms(
                VirtAddr(base as usize),
                &mut bytes,
                Perm(PERM_READ),
            )?;

            host_write(sink, VirtAddr(base as usize), &bytes)?;

            total = total.wrapping_add(len);
        }

        emu.set_reg(RegAlias::A0, total)
    }

    /// int brk(void *addr)
    ///
    /// `brk(0)` queries the current break. Growing the break maps the gap
    /// as RAW|WRITE, so reads of never-written break memory still fault.
    /// Failure (including shrink attempts) returns all-ones.
    fn sys_brk(
        &mut self,
        emu: &mut Emulator,
        sc: &Syscall,
    ) -> Result<(), VmExit> {
        let addr = sc.args[0];

        if addr == 0 {
            return emu.set_reg(RegAlias::A0, *self.brk as u64);
        }

        let new_brk = addr as usize;
        let result = match new_brk.checked_sub(*self.brk) {
            Some(increment) => emu
                .mmu
                .set_perms(self.brk, increment, Perm(PERM_RAW | PERM_WRITE))
                .map(|_| {
                    self.brk = VirtAddr(new_brk);
                    addr
                })
                .unwrap_or(!0),
            None => !0,
        };

        emu.set_reg(RegAlias::A0, result)
    }
}

impl Default for System {
    fn default() -> System {
        System::new()
    }
}

/// Writes the whole buffer to a host sink. A sink accepting fewer bytes
/// than requested surfaces as a short-copy fault carrying the guest
/// address the data came from.
fn host_write(
    sink: &mut (dyn Write + Send),
    addr: VirtAddr,
    bytes: &[u8],
) -> Result<(), VmExit> {
    let n = sink.write(bytes)?;

    if n != bytes.len() {
        return Err(mmu::Error::CopyShort {
            addr,
            size: bytes.len(),
        }
        .into());
    }

    Ok(())
}
