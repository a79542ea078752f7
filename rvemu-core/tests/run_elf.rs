//! End-to-end tests: synthesize a minimal RV64 ELF image, load it into
//! the emulator and run it through the syscall layer, the way the CLI
//! driver and a fuzzing harness do.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use rvemu_core::emulator::{Emulator, VmExit};
use rvemu_core::syscall::System;

const ECALL: u32 = 0x00000073;

fn itype(opcode: u32, funct3: u32, rd: u32, rs1: u32, imm: i32) -> u32 {
    ((imm as u32 & 0xfff) << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (rd << 7)
        | opcode
}

fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    itype(0b0010011, 0b000, rd, rs1, imm)
}

fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    itype(0b0000011, 0b010, rd, rs1, imm)
}

fn auipc(rd: u32, imm: i32) -> u32 {
    (imm as u32 & 0xffff_f000) | (rd << 7) | 0b0010111
}

/// Builds an ELF64 image with a single R+X PT_LOAD segment at `vaddr`
/// holding `payload`, entry at `vaddr`.
fn build_elf(vaddr: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"\x7fELF");
    out.push(2); // ELFCLASS64
    out.push(1); // ELFDATA2LSB
    out.push(1); // EV_CURRENT
    out.push(0); // ELFOSABI_NONE
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&243u16.to_le_bytes()); // EM_RISCV
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&vaddr.to_le_bytes()); // e_entry
    out.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    out.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
    out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    out.extend_from_slice(&5u32.to_le_bytes()); // R+X
    out.extend_from_slice(&120u64.to_le_bytes()); // p_offset
    out.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
    out.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align

    out.extend_from_slice(payload);

    out
}

/// hello-world guest: write(1, msg, 13) followed by exit(0). The message
/// lives in the same R+X segment, right after the code.
fn hello_image() -> Vec<u8> {
    let msg = b"hello, world\n";

    let code = [
        auipc(11, 0),       // a1 = segment base
        addi(11, 11, 36),   // a1 = &msg
        addi(10, 0, 1),     // a0 = stdout
        addi(12, 0, 13),    // a2 = count
        addi(17, 0, 64),    // a7 = write
        ECALL,
        addi(10, 0, 0),     // a0 = 0
        addi(17, 0, 93),    // a7 = exit
        ECALL,
    ];

    let mut payload: Vec<u8> =
        code.iter().flat_map(|inst| inst.to_le_bytes()).collect();
    assert_eq!(payload.len(), 36);
    payload.extend_from_slice(msg);

    build_elf(0x10000, &payload)
}

/// Write sink with a shared handle so the emitted bytes can be checked.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_system(emu: &Emulator) -> (System, SharedBuf) {
    let stdout = SharedBuf::default();
    let mut sys = System::with_output(
        Box::new(stdout.clone()),
        Box::new(SharedBuf::default()),
    );
    sys.set_brk(emu.mmu.cur_alloc());
    (sys, stdout)
}

#[test]
fn hello_world_via_write() {
    let image = hello_image();

    let mut emu = Emulator::new(32 * 1024 * 1024);
    emu.load_image(&image, "hello", &[]).unwrap();

    let (mut sys, stdout) = capture_system(&emu);
    let exit = emu.run(&mut sys);

    match exit.cause {
        VmExit::Exit(0) => {}
        cause => panic!("unexpected exit: {}", cause),
    }
    assert_eq!(stdout.contents(), b"hello, world\n");
}

#[test]
fn exit_status_is_argc() {
    // lw a0, 0(sp); addi a7, zero, 93; ecall
    //
    // The guest reports the argc pushed by the loader through its exit
    // status.
    let code = [lw(10, 2, 0), addi(17, 0, 93), ECALL];
    let payload: Vec<u8> =
        code.iter().flat_map(|inst| inst.to_le_bytes()).collect();
    let image = build_elf(0x10000, &payload);

    let mut emu = Emulator::new(32 * 1024 * 1024);
    let guest_args = vec![String::from("-a"), String::from("input")];
    emu.load_image(&image, "argc", &guest_args).unwrap();

    let (mut sys, _) = capture_system(&emu);
    let exit = emu.run(&mut sys);

    match exit.cause {
        VmExit::Exit(3) => {}
        cause => panic!("unexpected exit: {}", cause),
    }
}

#[test]
fn fork_reset_replays_identically() {
    let image = hello_image();

    let mut parent = Emulator::new(32 * 1024 * 1024);
    parent.load_image(&image, "hello", &[]).unwrap();

    // Golden parent, never run. Children replay the same case after each
    // reset, like a fuzzing harness does between inputs.
    let mut child = parent.fork();

    for _ in 0..3 {
        let (mut sys, stdout) = capture_system(&child);
        let exit = child.run(&mut sys);

        match exit.cause {
            VmExit::Exit(0) => {}
            cause => panic!("unexpected exit: {}", cause),
        }
        assert_eq!(stdout.contents(), b"hello, world\n");

        child.reset(&parent);
        assert_eq!(
            child.reg(rvemu_core::emulator::RegAlias::Pc).unwrap(),
            0x10000
        );
    }
}
