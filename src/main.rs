//! Command-line driver: loads a statically linked RV64I ELF executable
//! and runs it to completion, mirroring the guest's exit status. On a
//! trap the register file and the faulting memory region are dumped.

use std::cmp;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use log::{info, LevelFilter};

use rvemu_core::emulator::{Emulator, VmExit};
use rvemu_core::mmu;
use rvemu_core::mmu::VirtAddr;
use rvemu_core::syscall::System;

/// Extra bytes shown after the faulting range in memory dumps.
const DUMP_TAIL: usize = 16;

/// Smallest guest memory that fits the stack plus a reasonable image.
const MIN_MEM_SIZE: usize = 2 * 1024 * 1024;

#[derive(Parser)]
#[command(about = "User-space RV64I emulator")]
struct Args {
    /// Guest memory size in bytes.
    #[arg(long, default_value_t = 32 * 1024 * 1024)]
    mem_size: usize,

    /// Increase verbosity (-v: info, -vv: syscall/segment trace,
    /// -vvv: instruction trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Treat FENCE as a terminal trap instead of a no-op.
    #[arg(long)]
    fence_halt: bool,

    /// Path to a statically linked RV64I ELF executable.
    program: PathBuf,

    /// Arguments passed to the guest program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    guest_args: Vec<String>,
}

fn main() {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    match run(&args) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            process::exit(1);
        }
    }
}

fn run(args: &Args) -> anyhow::Result<i32> {
    anyhow::ensure!(
        args.mem_size >= MIN_MEM_SIZE,
        "guest memory must be at least {} bytes",
        MIN_MEM_SIZE
    );

    let mut emu = Emulator::new(args.mem_size);
    emu.set_fence_halt(args.fence_halt);

    emu.load_program(&args.program, &args.guest_args)
        .with_context(|| {
            format!("could not load {}", args.program.display())
        })?;

    let mut sys = System::new();
    sys.set_brk(emu.mmu.cur_alloc());

    let exit = emu.run(&mut sys);

    info!("executed {} instructions", emu.inst_execed());

    if let VmExit::Exit(status) = exit.cause {
        return Ok(status as i32);
    }

    eprintln!("{}", exit);

    if let VmExit::MmuFault(fault) = &exit.cause {
        let (addr, size) = match *fault {
            mmu::Error::PermDenied { addr, size, .. }
            | mmu::Error::OutOfBounds { addr, size }
            | mmu::Error::CopyShort { addr, size } => (addr, size),
        };
        dump_region(&emu, addr, size);
    }

    Ok(1)
}

/// Prints memory contents and permissions covering the faulting range
/// plus a small tail, eight bytes per row.
fn dump_region(emu: &Emulator, addr: VirtAddr, size: usize) {
    let start = *addr;
    let end = cmp::min(
        start.saturating_add(size.saturating_add(DUMP_TAIL)),
        emu.mmu.size(),
    );

    if start >= end {
        eprintln!("memory at {}: outside guest memory", addr);
        return;
    }

    let len = end - start;
    let mut bytes = vec![0u8; len];
    if emu.mmu.peek(VirtAddr(start), &mut bytes).is_err() {
        return;
    }
    let perms = match emu.mmu.peek_perms(VirtAddr(start), len) {
        Ok(perms) => perms,
        Err(_) => return,
    };

    eprintln!("memory at {}:", addr);
    for (i, row) in bytes.chunks(8).enumerate() {
        let offset = start + i * 8;

        let hex: Vec<String> =
            row.iter().map(|b| format!("{:02x}", b)).collect();
        let flags: Vec<String> = perms[i * 8..i * 8 + row.len()]
            .iter()
            .map(|p| p.to_string())
            .collect();

        eprintln!(
            "  {:#010x}: {:<23}  |{}|",
            offset,
            hex.join(" "),
            flags.join(" ")
        );
    }
}
