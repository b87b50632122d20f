//! TI MSPM0 driver: the FLASHCTL command interface. Every erase or
//! program must first drop the sector's dynamic write protection, which
//! re-arms after each command execution.

use crate::family::FlashParams;
use crate::memmap::{AccessWidth, FlashOps, FlashRegion, RamRegion};
use crate::target::{Target, TargetDriver};
use crate::time::{Progress, FLASH_OP_TIMEOUT_MS};
use crate::{Result, RustprobeError};

#[rustfmt::skip]
mod flashctl {
    pub const CTL_BASE        : u32 = 0x400C_D000;
    pub const CMDEXEC         : u32 = 0x1100;
    pub const CMDTYPE         : u32 = 0x1104;
    pub const CMDADDR         : u32 = 0x1120;
    pub const CMDDATA0        : u32 = 0x1130;
    pub const CMDWEPROTA      : u32 = 0x11D0;
    pub const STATCMD         : u32 = 0x13D0;
    pub const CMD_PROGRAM     : u32 = 0x0001;
    pub const CMD_ERASE       : u32 = 0x0002;
    pub const SIZE_ONEWORD    : u32 = 0x0000;
    pub const SIZE_SECTOR     : u32 = 0x0040;
    pub const SIZE_BANK       : u32 = 0x0050;
    pub const STAT_DONE       : u32 = 1 << 0;
    pub const STAT_CMDPASS    : u32 = 1 << 1;
    pub const STAT_FAILWEPROT : u32 = 1 << 4;
    pub const FLASH_BASE      : u32 = 0x0000_0000;
    pub const SRAM_BASE       : u32 = 0x2000_0000;
    pub const SECTOR_SIZE     : u32 = 1024;
    pub const WORD_SIZE       : u32 = 8;
    pub const DID_MSPM0       : u32 = 0x0BB8;
}

use flashctl::*;

/// Drops write protection for the sector holding `addr`, then runs one
/// command and waits it out. Protection re-arms on completion.
fn exec(target: &mut Target, cmdtype: u32, addr: u32) -> Result<()> {
    let sector = (addr - FLASH_BASE) / SECTOR_SIZE;
    target
        .mem
        .write32(CTL_BASE + CMDWEPROTA, !(1u32 << (sector % 32)))?;
    target.mem.write32(CTL_BASE + CMDTYPE, cmdtype)?;
    target.mem.write32(CTL_BASE + CMDADDR, addr)?;
    target.mem.write32(CTL_BASE + CMDEXEC, 1)?;
    let stat = target.wait_set(CTL_BASE + STATCMD, STAT_DONE, FLASH_OP_TIMEOUT_MS)?;
    if stat & STAT_FAILWEPROT != 0 {
        return Err(RustprobeError::WriteProtected);
    }
    if stat & STAT_CMDPASS == 0 {
        return Err(RustprobeError::ProgramError);
    }
    Ok(())
}

pub struct Mspm0FlashOps;

impl FlashOps for Mspm0FlashOps {
    fn erase(&self, target: &mut Target, _region: &FlashRegion, addr: u32, len: u32) -> Result<()> {
        let mut cur = addr;
        while cur < addr + len {
            exec(target, CMD_ERASE | SIZE_SECTOR, cur)?;
            cur += SECTOR_SIZE;
        }
        Ok(())
    }

    fn write(&self, target: &mut Target, _region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        for (i, word) in data.chunks_exact(WORD_SIZE as usize).enumerate() {
            let cur = addr + i as u32 * WORD_SIZE;
            let lo = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            let hi = u32::from_le_bytes([word[4], word[5], word[6], word[7]]);
            target.mem.write32(CTL_BASE + CMDDATA0, lo)?;
            target.mem.write32(CTL_BASE + CMDDATA0 + 4, hi)?;
            exec(target, CMD_PROGRAM | SIZE_ONEWORD, cur)?;
        }
        Ok(())
    }
}

static FLASH_OPS: Mspm0FlashOps = Mspm0FlashOps;

pub struct Mspm0Driver;

impl TargetDriver for Mspm0Driver {
    fn mass_erase(&self, target: &mut Target, progress: &mut Progress) -> Option<Result<()>> {
        let result = (|| {
            target.mem.write32(CTL_BASE + CMDWEPROTA, 0)?;
            target.mem.write32(CTL_BASE + CMDTYPE, CMD_ERASE | SIZE_BANK)?;
            target.mem.write32(CTL_BASE + CMDADDR, FLASH_BASE)?;
            target.mem.write32(CTL_BASE + CMDEXEC, 1)?;
            let timeout = target.long_op_timeout_ms;
            let deadline = crate::time::Deadline::after(target.clock, timeout);
            loop {
                let stat = target.mem.read32(CTL_BASE + STATCMD)?;
                if stat & STAT_DONE != 0 {
                    if stat & STAT_CMDPASS == 0 {
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

static DRIVER: Mspm0Driver = Mspm0Driver;

pub fn probe(target: &mut Target) -> Result<bool> {
    if target.ident.part_id & 0xFFFF != DID_MSPM0 {
        return Ok(false);
    }

    target.add_ram(RamRegion {
        start: SRAM_BASE,
        length: 0x8000,
        width: AccessWidth::Word,
    })?;
    target.add_flash(FlashRegion {
        start: FLASH_BASE,
        length: 128 * 1024,
        block_size: SECTOR_SIZE,
        write_size: WORD_SIZE,
        erased_byte: 0xFF,
        ops: &FLASH_OPS,
        params: FlashParams::Flashctl { regbase: CTL_BASE },
    })?;

    target.set_driver("MSPM0", &DRIVER);
    Ok(true)
}
