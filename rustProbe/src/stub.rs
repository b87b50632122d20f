//! The flash stub runner. Drivers that cannot poke their controller
//! from the debug link download a tiny position-independent routine
//! into target RAM and run it on the target core.
//!
//! Stub convention: the first instruction is the entry point, arguments
//! arrive in the integer argument registers as
//! `(dest, src, length[, controller_base])`, the stack pointer is set
//! from the top of the scratch RAM, and the routine finishes at a
//! breakpoint with its status in the first argument register
//! (0 = ok, nonzero = error).

use log::debug;

use crate::accessor::{REG_ARG, REG_LR, REG_PC, REG_SP};
use crate::memmap::RamRegion;
use crate::target::Target;
use crate::time::{Deadline, Progress};
use crate::{Result, RustprobeError};

/// Thumb `BKPT #0`, planted after the stub as the return sentinel.
const BKPT: u16 = 0xBE00;

/// Copies `code` into scratch RAM, stages `args`, resumes the core and
/// waits for it to halt at the sentinel. Status is taken from the first
/// argument register after the halt.
pub fn run_stub(
    target: &mut Target,
    ram: RamRegion,
    code: &[u8],
    args: [u32; 4],
    timeout_ms: u32,
) -> Result<()> {
    let load_addr = ram.start;
    // sentinel breakpoint sits just past the stub, halfword aligned
    let sentinel = (load_addr + code.len() as u32 + 1) & !1;
    if sentinel + 2 > ram.end() {
        return Err(RustprobeError::Unsupported);
    }

    target.mem.halt()?;
    target.mem.write(load_addr, code)?;
    target.mem.write16(sentinel, BKPT)?;

    for (reg, value) in REG_ARG.iter().zip(args.iter()) {
        target.mem.write_core_reg(*reg, *value)?;
    }
    // stub owns the scratch RAM; stack grows down from its top
    target.mem.write_core_reg(REG_SP, ram.end() & !7)?;
    target.mem.write_core_reg(REG_LR, sentinel | 1)?;
    target.mem.write_core_reg(REG_PC, load_addr)?;
    target.mem.resume()?;

    let deadline = Deadline::after(target.clock, timeout_ms);
    let mut progress = Progress::silent();
    loop {
        if target.mem.is_halted()? {
            break;
        }
        progress.tick(target.clock);
        if deadline.expired(target.clock) {
            // best effort: stop the runaway stub before reporting
            let _ = target.mem.halt();
            return Err(RustprobeError::Timeout);
        }
    }

    let pc = target.mem.read_core_reg(REG_PC)? & !1;
    if pc != sentinel {
        debug!("stub stopped at {:#010x}, sentinel {:#010x}", pc, sentinel);
        return Err(RustprobeError::StubFailed);
    }
    let status = target.mem.read_core_reg(REG_ARG[0])?;
    if status != 0 {
        debug!("stub exit status {}", status);
        return Err(RustprobeError::StubFailed);
    }
    Ok(())
}

/// Stages `data` in scratch RAM after the stub image and runs the stub
/// over it: the common "program this buffer" shape. The data buffer is
/// word-aligned past the stub; returns the staged source address used.
pub fn run_flash_stub(
    target: &mut Target,
    code: &[u8],
    dest: u32,
    data: &[u8],
    controller_base: u32,
    timeout_ms: u32,
) -> Result<()> {
    let ram = target.scratch_ram().ok_or(RustprobeError::Unsupported)?;
    let src = (ram.start + code.len() as u32 + 2 + 3) & !3;
    // stub, sentinel, staged data and stack must all fit
    if src + data.len() as u32 + 32 > ram.end() {
        return Err(RustprobeError::Unsupported);
    }
    target.mem.halt()?;
    target.mem.write(src, data)?;
    run_stub(
        target,
        ram,
        code,
        [dest, src, data.len() as u32, controller_base],
        timeout_ms,
    )
}
