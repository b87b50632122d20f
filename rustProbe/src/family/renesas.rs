//! Renesas RA (RV40 flash) driver. P/E mode is entered through the
//! FENTRYR handshake after the write-enable protection register opens;
//! operations are byte sequences written to the FACI command-issue
//! area. A malformed sequence latches the unit in command-locked state,
//! which only a FORCED_STOP clears.

use byteorder::{ByteOrder, LittleEndian};

use crate::family::FlashParams;
use crate::memmap::{AccessWidth, FlashOps, FlashRegion, RamRegion};
use crate::target::{Target, TargetDriver};
use crate::time::FLASH_OP_TIMEOUT_MS;
use crate::{Result, RustprobeError};

#[rustfmt::skip]
mod rv40 {
    pub const FACI_CMD       : u32 = 0x407E_0000;
    pub const FACI_BASE      : u32 = 0x407F_E000;
    pub const FASTAT         : u32 = 0x10;
    pub const FSADDR         : u32 = 0x30;
    pub const FSTATR         : u32 = 0x80;
    pub const FENTRYR        : u32 = 0x84;
    pub const FWEPROR        : u32 = 0x4001_E416;
    pub const FENTRYR_KEY    : u16 = 0xAA00;
    pub const FENTRYR_PE_CF  : u16 = 0x0001;
    pub const FWEPROR_PERMIT : u8  = 0x01;
    pub const FASTAT_CMDLK   : u32 = 1 << 4;
    pub const FSTATR_FRDY    : u32 = 1 << 15;
    pub const FSTATR_PRGERR  : u32 = 1 << 12;
    pub const FSTATR_ERSERR  : u32 = 1 << 13;
    pub const CMD_ERASE_1    : u8  = 0x20;
    pub const CMD_PROGRAM    : u8  = 0xE8;
    pub const CMD_FINAL      : u8  = 0xD0;
    pub const CMD_FORCED_STOP: u8  = 0xB3;
    pub const WRITE_SIZE     : u32 = 128;
    pub const FLASH_BASE     : u32 = 0x0000_0000;
    pub const SRAM_BASE      : u32 = 0x2000_0000;
    pub const SMALL_BLOCK    : u32 = 8 * 1024;
    pub const LARGE_BLOCK    : u32 = 32 * 1024;
    pub const SMALL_AREA     : u32 = 64 * 1024;
    pub const PNR_RA         : u32 = 0x52;
}

use rv40::*;

/// Waits for FRDY; on errors or a command lock, issues FORCED_STOP so
/// the unit accepts commands again, then reports the failure.
fn faci_wait(target: &mut Target, timeout_ms: u32) -> Result<()> {
    let fstatr = match target.wait_set(FACI_BASE + FSTATR, FSTATR_FRDY, timeout_ms) {
        Ok(v) => v,
        Err(e) => {
            let _ = target.mem.write8(FACI_CMD, CMD_FORCED_STOP);
            return Err(e);
        }
    };
    let fastat = target.mem.read32(FACI_BASE + FASTAT)?;
    if fastat & FASTAT_CMDLK != 0 {
        target.mem.write8(FACI_CMD, CMD_FORCED_STOP)?;
        target.wait_set(FACI_BASE + FSTATR, FSTATR_FRDY, timeout_ms)?;
        return Err(RustprobeError::ProgramError);
    }
    if fstatr & (FSTATR_PRGERR | FSTATR_ERSERR) != 0 {
        target.mem.write8(FACI_CMD, CMD_FORCED_STOP)?;
        return Err(RustprobeError::ProgramError);
    }
    Ok(())
}

fn pe_enter(target: &mut Target) -> Result<()> {
    if target.mem.read16(FACI_BASE + FENTRYR)? & FENTRYR_PE_CF != 0 {
        return Err(RustprobeError::FlashBusy);
    }
    target.mem.write8(FWEPROR, FWEPROR_PERMIT)?;
    target
        .mem
        .write16(FACI_BASE + FENTRYR, FENTRYR_KEY | FENTRYR_PE_CF)?;
    if target.mem.read16(FACI_BASE + FENTRYR)? & FENTRYR_PE_CF == 0 {
        return Err(RustprobeError::FlashLocked);
    }
    Ok(())
}

fn pe_exit(target: &mut Target) -> Result<()> {
    target.mem.write16(FACI_BASE + FENTRYR, FENTRYR_KEY)?;
    if target.mem.read16(FACI_BASE + FENTRYR)? & FENTRYR_PE_CF != 0 {
        return Err(RustprobeError::FlashBusy);
    }
    Ok(())
}

pub struct Rv40FlashOps;

impl FlashOps for Rv40FlashOps {
    fn prepare(&self, target: &mut Target, region: &FlashRegion) -> Result<()> {
        // both code-flash regions share the unit; only the first enters
        if region.start == FLASH_BASE {
            pe_enter(target)?;
        }
        Ok(())
    }

    fn erase(&self, target: &mut Target, region: &FlashRegion, addr: u32, len: u32) -> Result<()> {
        let mut cur = addr;
        while cur < addr + len {
            target.mem.write32(FACI_BASE + FSADDR, cur)?;
            target.mem.write8(FACI_CMD, CMD_ERASE_1)?;
            target.mem.write8(FACI_CMD, CMD_FINAL)?;
            faci_wait(target, FLASH_OP_TIMEOUT_MS)?;
            cur += region.block_size;
        }
        Ok(())
    }

    fn write(&self, target: &mut Target, _region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        for (i, unit) in data.chunks_exact(WRITE_SIZE as usize).enumerate() {
            target
                .mem
                .write32(FACI_BASE + FSADDR, addr + i as u32 * WRITE_SIZE)?;
            target.mem.write8(FACI_CMD, CMD_PROGRAM)?;
            target.mem.write8(FACI_CMD, (WRITE_SIZE / 2) as u8)?;
            for pair in unit.chunks_exact(2) {
                target.mem.write16(FACI_CMD, LittleEndian::read_u16(pair))?;
            }
            target.mem.write8(FACI_CMD, CMD_FINAL)?;
            faci_wait(target, FLASH_OP_TIMEOUT_MS)?;
        }
        Ok(())
    }

    fn done(&self, target: &mut Target, region: &FlashRegion) -> Result<()> {
        if region.start == FLASH_BASE {
            pe_exit(target)?;
        }
        Ok(())
    }
}

static FLASH_OPS: Rv40FlashOps = Rv40FlashOps;

pub struct RenesasDriver;

impl TargetDriver for RenesasDriver {}

static DRIVER: RenesasDriver = RenesasDriver;

pub fn probe(target: &mut Target) -> Result<bool> {
    if target.ident.part_id >> 24 != PNR_RA {
        return Ok(false);
    }

    target.add_ram(RamRegion {
        start: SRAM_BASE,
        length: 0x4_0000,
        width: AccessWidth::Word,
    })?;
    // small 8K blocks up front, 32K blocks for the rest
    let params = FlashParams::Rv40 {
        regbase: FACI_BASE,
        faci: FACI_CMD,
    };
    target.add_flash(FlashRegion {
        start: FLASH_BASE,
        length: SMALL_AREA,
        block_size: SMALL_BLOCK,
        write_size: WRITE_SIZE,
        erased_byte: 0xFF,
        ops: &FLASH_OPS,
        params,
    })?;
    target.add_flash(FlashRegion {
        start: FLASH_BASE + SMALL_AREA,
        length: 1024 * 1024 - SMALL_AREA,
        block_size: LARGE_BLOCK,
        write_size: WRITE_SIZE,
        erased_byte: 0xFF,
        ops: &FLASH_OPS,
        params,
    })?;

    target.set_driver("Renesas RA", &DRIVER);
    Ok(true)
}
