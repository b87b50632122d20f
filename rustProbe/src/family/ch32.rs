//! CH32F1 driver. The part answers with an STM32F1 medium-density id
//! but carries a nonstandard revision field and a "fast mode" extension
//! to the FPEC: 128-byte page erase and a 128-byte page program loaded
//! as eight 16-byte sub-pages, each latched with BUF_LOAD.

use crate::family::stm32::{self, regs::*, Stm32OptionOps};
use crate::family::{DriverData, FlashParams};
use crate::memmap::{AccessWidth, FlashOps, FlashRegion, RamRegion};
use crate::target::{Target, TargetDriver};
use crate::time::{Progress, FLASH_OP_TIMEOUT_MS};
use crate::{Result, RustprobeError};

#[rustfmt::skip]
mod ch32_regs {
    pub const MODEKEYR     : u32 = 0x24;
    pub const MAGIC        : u32 = 0x34;
    pub const CR_FTPG      : u32 = 1 << 16;
    pub const CR_FTER      : u32 = 1 << 17;
    pub const CR_BUF_LOAD  : u32 = 1 << 18;
    pub const CR_BUF_RST   : u32 = 1 << 19;
    pub const CR_FLOCK     : u32 = 1 << 15;
    pub const FAST_PAGE    : u32 = 128;
    pub const SUB_PAGE     : u32 = 16;
    pub const REV_CH32     : u32 = 0x2000;
}

use ch32_regs::*;

#[derive(Clone, Copy, Default)]
pub struct Ch32Data {
    /// Reproduce the vendor's undocumented magic-word sequence around
    /// fast-mode operations. What the written value means is not
    /// documented anywhere; the sequence is carried verbatim from
    /// vendor code and only runs when this capability flag is set.
    pub magic_quirk: bool,
}

fn magic_quirk_enabled(target: &Target) -> bool {
    matches!(target.drv, DriverData::Ch32(Ch32Data { magic_quirk: true }))
}

/// The vendor magic: read the flash word at `addr ^ 0x100` and write it
/// back to the magic register. Vendor-undocumented behaviour.
fn magic(target: &mut Target, params: &FlashParams, addr: u32) -> Result<()> {
    if !magic_quirk_enabled(target) {
        return Ok(());
    }
    let regbase = match params {
        FlashParams::Fpec { regbase, .. } => *regbase,
        _ => FPEC_BASE,
    };
    let word = target.mem.read32(addr ^ 0x100)?;
    target.mem.write32(regbase + MAGIC, word)
}

fn cr(params: &FlashParams) -> u32 {
    match params {
        FlashParams::Fpec { regbase, bank } => regbase + bank + CR,
        _ => FPEC_BASE + CR,
    }
}

/// Feeds the key sequence into MODEKEYR to release the fast-mode lock.
fn fast_unlock(target: &mut Target, params: &FlashParams) -> Result<()> {
    let regbase = match params {
        FlashParams::Fpec { regbase, .. } => *regbase,
        _ => FPEC_BASE,
    };
    if target.mem.read32(cr(params))? & CR_FLOCK == 0 {
        return Ok(());
    }
    target.mem.write32(regbase + MODEKEYR, KEY1)?;
    target.mem.write32(regbase + MODEKEYR, KEY2)?;
    if target.mem.read32(cr(params))? & CR_FLOCK != 0 {
        return Err(RustprobeError::FlashLocked);
    }
    Ok(())
}

pub struct Ch32FlashOps;

impl FlashOps for Ch32FlashOps {
    fn prepare(&self, target: &mut Target, region: &FlashRegion) -> Result<()> {
        stm32::prepare(target, &region.params)?;
        fast_unlock(target, &region.params)
    }

    fn erase(&self, target: &mut Target, region: &FlashRegion, addr: u32, len: u32) -> Result<()> {
        let params = region.params;
        let mut cur = addr;
        while cur < addr + len {
            magic(target, &params, cur)?;
            target.mem.write32(cr(&params), CR_FTER)?;
            target.mem.write32(
                match params {
                    FlashParams::Fpec { regbase, bank } => regbase + bank + AR,
                    _ => FPEC_BASE + AR,
                },
                cur,
            )?;
            target.mem.write32(cr(&params), CR_FTER | CR_STRT)?;
            stm32::busy_wait(target, &params, FLASH_OP_TIMEOUT_MS)?;
            cur += region.block_size;
        }
        Ok(())
    }

    fn write(&self, target: &mut Target, region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        let params = region.params;
        let ar = match params {
            FlashParams::Fpec { regbase, bank } => regbase + bank + AR,
            _ => FPEC_BASE + AR,
        };
        for (page_idx, page) in data.chunks_exact(FAST_PAGE as usize).enumerate() {
            let page_addr = addr + page_idx as u32 * FAST_PAGE;
            magic(target, &params, page_addr)?;
            target.mem.write32(cr(&params), CR_FTPG | CR_BUF_RST)?;
            stm32::busy_wait(target, &params, FLASH_OP_TIMEOUT_MS)?;
            for (sub_idx, sub) in page.chunks_exact(SUB_PAGE as usize).enumerate() {
                let sub_addr = page_addr + sub_idx as u32 * SUB_PAGE;
                target.mem.write32(cr(&params), CR_FTPG)?;
                for (w, word) in sub.chunks_exact(4).enumerate() {
                    let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    target.mem.write32(sub_addr + w as u32 * 4, value)?;
                }
                target.mem.write32(cr(&params), CR_FTPG | CR_BUF_LOAD)?;
                stm32::busy_wait(target, &params, FLASH_OP_TIMEOUT_MS)?;
            }
            target.mem.write32(ar, page_addr)?;
            target.mem.write32(cr(&params), CR_FTPG | CR_STRT)?;
            stm32::busy_wait(target, &params, FLASH_OP_TIMEOUT_MS)?;
        }
        Ok(())
    }

    fn done(&self, target: &mut Target, region: &FlashRegion) -> Result<()> {
        // LOCK and FLOCK must land in one store; the controller drops
        // the second of two separate lock writes.
        target.mem.write32(cr(&region.params), CR_LOCK | CR_FLOCK)
    }
}

static FLASH_OPS: Ch32FlashOps = Ch32FlashOps;
static OPTION_OPS: Stm32OptionOps = Stm32OptionOps;

pub struct Ch32Driver;

impl TargetDriver for Ch32Driver {
    fn mass_erase(&self, target: &mut Target, progress: &mut Progress) -> Option<Result<()>> {
        let params = FlashParams::Fpec {
            regbase: FPEC_BASE,
            bank: 0,
        };
        Some(stm32::mass_erase_bank(target, &params, progress))
    }
}

static DRIVER: Ch32Driver = Ch32Driver;

pub fn probe(target: &mut Target) -> Result<bool> {
    let part_id = target.ident.part_id;
    if part_id & 0xFFF != 0x410 || part_id >> 16 != REV_CH32 {
        return Ok(false);
    }

    let size_kb = match target.mem.read16(FLASHSIZE_R)? {
        0xFFFF | 0 => 64,
        kb => kb as u32,
    };
    let params = FlashParams::Fpec {
        regbase: FPEC_BASE,
        bank: 0,
    };

    target.add_ram(RamRegion {
        start: SRAM_BASE,
        length: 0x5000,
        width: AccessWidth::Word,
    })?;
    target.add_flash(FlashRegion {
        start: FLASH_BASE,
        length: size_kb * 1024,
        block_size: FAST_PAGE,
        write_size: FAST_PAGE,
        erased_byte: 0xFF,
        ops: &FLASH_OPS,
        params,
    })?;
    target.add_flash(FlashRegion {
        start: OPTION_BASE,
        length: OPTION_SIZE,
        block_size: OPTION_SIZE,
        write_size: 2,
        erased_byte: 0xFF,
        ops: &OPTION_OPS,
        params,
    })?;

    target.set_driver("CH32F1 medium density", &DRIVER);
    target.add_commands("CH32", stm32::COMMANDS)?;
    target.drv = DriverData::Ch32(Ch32Data { magic_quirk: true });
    Ok(true)
}
