//! SAM4L driver: the FLASHCALW controller. Command-register protocol
//! with a key byte, a memory-mapped page buffer, and per-region lock
//! bits. After reset the core is held until the hold latch is released
//! through the system access port, so the driver installs an extended
//! reset hook.

use core::fmt::Write;

use crate::commands::{parse_u32, Command};
use crate::family::FlashParams;
use crate::memmap::{AccessWidth, FlashOps, FlashRegion, RamRegion};
use crate::target::{Target, TargetDriver};
use crate::time::FLASH_OP_TIMEOUT_MS;
use crate::{Result, RustprobeError};

#[rustfmt::skip]
mod calw {
    pub const CALW_BASE    : u32 = 0x400A_0000;
    pub const FCMD         : u32 = 0x04;
    pub const FSR          : u32 = 0x08;
    pub const FPR          : u32 = 0x0C;
    pub const CMD_KEY      : u32 = 0xA5 << 24;
    pub const CMD_WP       : u32 = 0x01;
    pub const CMD_EP       : u32 = 0x02;
    pub const CMD_CPB      : u32 = 0x03;
    pub const CMD_LP       : u32 = 0x04;
    pub const CMD_UP       : u32 = 0x05;
    pub const CMD_EA       : u32 = 0x06;
    pub const FSR_FRDY     : u32 = 1 << 0;
    pub const FSR_LOCKE    : u32 = 1 << 2;
    pub const FSR_PROGE    : u32 = 1 << 3;
    pub const FPR_FSZ_MASK : u32 = 0xF;
    pub const PAGE_SIZE    : u32 = 512;
    pub const FLASH_BASE   : u32 = 0x0000_0000;
    pub const SRAM_BASE    : u32 = 0x2000_0000;
    /// System access port register releasing the CPU-hold-reset latch.
    pub const SMAP_SCR     : u32 = 0x400A_3008;
    pub const SCR_RELEASE  : u32 = 1 << 0;
    pub const CHIPID_MATCH : u32 = 0x4B0;
}

use calw::*;

fn pagen(cmd: u32, page: u32) -> u32 {
    CMD_KEY | (page << 8) | cmd
}

fn command(target: &mut Target, cmd: u32, page: u32) -> Result<()> {
    target.mem.write32(CALW_BASE + FCMD, pagen(cmd, page))?;
    let fsr = target.wait_set(CALW_BASE + FSR, FSR_FRDY, FLASH_OP_TIMEOUT_MS)?;
    if fsr & FSR_LOCKE != 0 {
        return Err(RustprobeError::WriteProtected);
    }
    if fsr & FSR_PROGE != 0 {
        return Err(RustprobeError::ProgramError);
    }
    Ok(())
}

pub struct Sam4lFlashOps;

impl FlashOps for Sam4lFlashOps {
    fn prepare(&self, target: &mut Target, _region: &FlashRegion) -> Result<()> {
        if target.mem.read32(CALW_BASE + FSR)? & FSR_FRDY == 0 {
            return Err(RustprobeError::FlashBusy);
        }
        Ok(())
    }

    fn erase(&self, target: &mut Target, region: &FlashRegion, addr: u32, len: u32) -> Result<()> {
        let mut cur = addr;
        while cur < addr + len {
            let page = (cur - region.start) / PAGE_SIZE;
            command(target, CMD_EP, page)?;
            cur += PAGE_SIZE;
        }
        Ok(())
    }

    fn write(&self, target: &mut Target, region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        // one full page buffer per page: clear it, fill it through the
        // page's own address window, then issue the write command
        for (i, page_data) in data.chunks_exact(PAGE_SIZE as usize).enumerate() {
            let page_addr = addr + i as u32 * PAGE_SIZE;
            let page = (page_addr - region.start) / PAGE_SIZE;
            command(target, CMD_CPB, 0)?;
            for (w, word) in page_data.chunks_exact(4).enumerate() {
                let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                target.mem.write32(page_addr + w as u32 * 4, value)?;
            }
            command(target, CMD_WP, page)?;
        }
        Ok(())
    }
}

static FLASH_OPS: Sam4lFlashOps = Sam4lFlashOps;

pub struct Sam4lDriver;

impl TargetDriver for Sam4lDriver {
    /// Releases the CPU-hold-reset latch through the system access
    /// port; until that happens the core ignores all halt requests.
    fn extended_reset(&self, target: &mut Target) -> Result<()> {
        target.mem.write32(SMAP_SCR, SCR_RELEASE)
    }

    fn mass_erase(&self, target: &mut Target, progress: &mut crate::time::Progress) -> Option<Result<()>> {
        let result = (|| {
            target.mem.write32(CALW_BASE + FCMD, pagen(CMD_EA, 0))?;
            let timeout = target.long_op_timeout_ms;
            let deadline = crate::time::Deadline::after(target.clock, timeout);
            loop {
                let fsr = target.mem.read32(CALW_BASE + FSR)?;
                if fsr & FSR_FRDY != 0 {
                    if fsr & FSR_PROGE != 0 {
                        return Err(RustprobeError::ProgramError);
                    }
                    return Ok(());
                }
                progress.tick(target.clock);
                if deadline.expired(target.clock) {
                    return Err(RustprobeError::Timeout);
                }
            }
        })();
        Some(result)
    }
}

static DRIVER: Sam4lDriver = Sam4lDriver;

static COMMANDS: &[Command] = &[
    Command {
        name: "lock_flash",
        handler: cmd_lock_flash,
        help: "Lock the flash region containing <addr>",
    },
    Command {
        name: "unlock_flash",
        handler: cmd_unlock_flash,
        help: "Unlock the flash region containing <addr>",
    },
];

fn lock_region(target: &mut Target, out: &mut dyn Write, args: &str, cmd: u32) -> bool {
    let addr = match parse_u32(args) {
        Some(a) => a,
        None => {
            let _ = writeln!(out, "usage: {} <addr>", if cmd == CMD_LP { "lock_flash" } else { "unlock_flash" });
            return false;
        }
    };
    let page = (addr - FLASH_BASE) / PAGE_SIZE;
    match command(target, cmd, page) {
        Ok(()) => true,
        Err(e) => {
            let _ = writeln!(out, "lock command failed: {}", e);
            false
        }
    }
}

fn cmd_lock_flash(target: &mut Target, out: &mut dyn Write, args: &str) -> bool {
    lock_region(target, out, args, CMD_LP)
}

fn cmd_unlock_flash(target: &mut Target, out: &mut dyn Write, args: &str) -> bool {
    lock_region(target, out, args, CMD_UP)
}

pub fn probe(target: &mut Target) -> Result<bool> {
    if target.ident.part_id >> 20 != CHIPID_MATCH {
        return Ok(false);
    }

    let fsz = target.mem.read32(CALW_BASE + FPR)? & FPR_FSZ_MASK;
    let flash_size = match fsz {
        0x07 => 128 * 1024,
        0x09 => 256 * 1024,
        0x0A => 512 * 1024,
        _ => 128 * 1024,
    };

    target.add_ram(RamRegion {
        start: SRAM_BASE,
        length: 0x1_0000,
        width: AccessWidth::Word,
    })?;
    target.add_flash(FlashRegion {
        start: FLASH_BASE,
        length: flash_size,
        block_size: PAGE_SIZE,
        write_size: PAGE_SIZE,
        erased_byte: 0xFF,
        ops: &FLASH_OPS,
        params: FlashParams::Calw {
            regbase: CALW_BASE,
            page: PAGE_SIZE,
        },
    })?;

    target.set_driver("SAM4L", &DRIVER);
    target.add_commands("SAM4L", COMMANDS)?;
    target.extended_reset_required = true;
    Ok(true)
}
