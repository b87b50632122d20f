//! STM32F1-style FPEC driver: the archetype of the simple
//! key-register/status-register flash controllers. Per-page erase,
//! halfword programming, option bytes behind a second unlock register.
//! The CH32 and AT32 drivers build on the helpers in here.

use core::fmt::Write;

use crate::commands::{parse_u32, split_command, Command};
use crate::family::{DriverData, FlashParams};
use crate::memmap::{AccessWidth, FlashOps, FlashRegion, RamRegion};
use crate::target::{Target, TargetDriver};
use crate::time::{Progress, FLASH_OP_TIMEOUT_MS};
use crate::{Result, RustprobeError};

#[rustfmt::skip]
pub(crate) mod regs {
    pub const FPEC_BASE     : u32 = 0x4002_2000;
    pub const KEYR          : u32 = 0x04;
    pub const OPTKEYR       : u32 = 0x08;
    pub const SR            : u32 = 0x0C;
    pub const CR            : u32 = 0x10;
    pub const AR            : u32 = 0x14;
    pub const KEY1          : u32 = 0x4567_0123;
    pub const KEY2          : u32 = 0xCDEF_89AB;
    pub const SR_BSY        : u32 = 1 << 0;
    pub const SR_PGERR      : u32 = 1 << 2;
    pub const SR_WRPRTERR   : u32 = 1 << 4;
    pub const SR_EOP        : u32 = 1 << 5;
    pub const CR_PG         : u32 = 1 << 0;
    pub const CR_PER        : u32 = 1 << 1;
    pub const CR_MER        : u32 = 1 << 2;
    pub const CR_OPTPG      : u32 = 1 << 4;
    pub const CR_OPTER      : u32 = 1 << 5;
    pub const CR_STRT       : u32 = 1 << 6;
    pub const CR_LOCK       : u32 = 1 << 7;
    pub const FLASH_BASE    : u32 = 0x0800_0000;
    pub const OPTION_BASE   : u32 = 0x1FFF_F800;
    pub const OPTION_SIZE   : u32 = 16;
    pub const FLASHSIZE_R   : u32 = 0x1FFF_F7E0;
    pub const UID_BASE      : u32 = 0x1FFF_F7E8;
    pub const SRAM_BASE     : u32 = 0x2000_0000;
    pub const DBGMCU_CR     : u32 = 0xE004_2004;
    pub const DBG_LOWPOWER  : u32 = 0x7;
    pub const DBG_WATCHDOGS : u32 = (1 << 8) | (1 << 9);
}

use regs::*;

fn reg(params: &FlashParams, offset: u32) -> u32 {
    match params {
        FlashParams::Fpec { regbase, bank } => regbase + bank + offset,
        _ => FPEC_BASE + offset,
    }
}

/// Decodes a final status value, then clears the sticky flags.
pub(crate) fn check_sr(target: &mut Target, params: &FlashParams, sr: u32) -> Result<()> {
    if sr & (SR_PGERR | SR_WRPRTERR | SR_EOP) != 0 {
        target
            .mem
            .write32(reg(params, SR), SR_PGERR | SR_WRPRTERR | SR_EOP)?;
    }
    if sr & SR_WRPRTERR != 0 {
        return Err(RustprobeError::WriteProtected);
    }
    if sr & SR_PGERR != 0 {
        return Err(RustprobeError::ProgramError);
    }
    Ok(())
}

/// Polls BSY down, then decodes the error flags.
pub(crate) fn busy_wait(target: &mut Target, params: &FlashParams, timeout_ms: u32) -> Result<()> {
    let sr = target.wait_clear(reg(params, SR), SR_BSY, timeout_ms)?;
    check_sr(target, params, sr)
}

pub(crate) fn busy_wait_prog(
    target: &mut Target,
    params: &FlashParams,
    timeout_ms: u32,
    progress: &mut Progress,
) -> Result<()> {
    let sr = target.wait_clear_prog(reg(params, SR), SR_BSY, timeout_ms, progress)?;
    check_sr(target, params, sr)
}

/// Feeds the key sequence if the controller is locked. A rejected key
/// latches the controller until reset, which reads back as LOCK still
/// set.
pub(crate) fn unlock(target: &mut Target, params: &FlashParams) -> Result<()> {
    if target.mem.read32(reg(params, CR))? & CR_LOCK == 0 {
        return Ok(());
    }
    target.mem.write32(reg(params, KEYR), KEY1)?;
    target.mem.write32(reg(params, KEYR), KEY2)?;
    if target.mem.read32(reg(params, CR))? & CR_LOCK != 0 {
        return Err(RustprobeError::FlashLocked);
    }
    Ok(())
}

/// Second key sequence for the option-byte area.
pub(crate) fn option_unlock(target: &mut Target, params: &FlashParams) -> Result<()> {
    target.mem.write32(reg(params, OPTKEYR), KEY1)?;
    target.mem.write32(reg(params, OPTKEYR), KEY2)?;
    Ok(())
}

pub(crate) fn lock(target: &mut Target, params: &FlashParams) -> Result<()> {
    target.mem.write32(reg(params, CR), CR_LOCK)
}

/// Session entry shared by the FPEC family: refuse a busy controller,
/// then unlock.
pub(crate) fn prepare(target: &mut Target, params: &FlashParams) -> Result<()> {
    if target.mem.read32(reg(params, SR))? & SR_BSY != 0 {
        return Err(RustprobeError::FlashBusy);
    }
    unlock(target, params)
}

pub(crate) fn erase_pages(
    target: &mut Target,
    params: &FlashParams,
    addr: u32,
    len: u32,
    page: u32,
) -> Result<()> {
    let mut cur = addr;
    while cur < addr + len {
        target.mem.write32(reg(params, CR), CR_PER)?;
        target.mem.write32(reg(params, AR), cur)?;
        target.mem.write32(reg(params, CR), CR_PER | CR_STRT)?;
        busy_wait(target, params, FLASH_OP_TIMEOUT_MS)?;
        cur += page;
    }
    Ok(())
}

pub(crate) fn program_halfwords(
    target: &mut Target,
    params: &FlashParams,
    addr: u32,
    data: &[u8],
) -> Result<()> {
    target.mem.write32(reg(params, CR), CR_PG)?;
    for (i, pair) in data.chunks_exact(2).enumerate() {
        let hw = u16::from_le_bytes([pair[0], pair[1]]);
        target.mem.write16(addr + i as u32 * 2, hw)?;
        busy_wait(target, params, FLASH_OP_TIMEOUT_MS)?;
    }
    Ok(())
}

/// Bank mass erase via MER, ticking progress during the long poll.
pub(crate) fn mass_erase_bank(
    target: &mut Target,
    params: &FlashParams,
    progress: &mut Progress,
) -> Result<()> {
    prepare(target, params)?;
    let result = (|| {
        target.mem.write32(reg(params, CR), CR_MER)?;
        target.mem.write32(reg(params, CR), CR_MER | CR_STRT)?;
        let timeout = target.long_op_timeout_ms;
        busy_wait_prog(target, params, timeout, progress)
    })();
    let locked = lock(target, params);
    result.and(locked)
}

pub struct Stm32FlashOps;

impl FlashOps for Stm32FlashOps {
    fn prepare(&self, target: &mut Target, region: &FlashRegion) -> Result<()> {
        prepare(target, &region.params)
    }

    fn erase(&self, target: &mut Target, region: &FlashRegion, addr: u32, len: u32) -> Result<()> {
        erase_pages(target, &region.params, addr, len, region.block_size)
    }

    fn write(&self, target: &mut Target, region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        program_halfwords(target, &region.params, addr, data)
    }

    fn done(&self, target: &mut Target, region: &FlashRegion) -> Result<()> {
        lock(target, &region.params)
    }
}

static FLASH_OPS: Stm32FlashOps = Stm32FlashOps;

/// Option bytes are a Flash region of their own with a 16-byte block
/// and halfword writes, but they live behind the second unlock.
pub struct Stm32OptionOps;

impl FlashOps for Stm32OptionOps {
    fn prepare(&self, target: &mut Target, region: &FlashRegion) -> Result<()> {
        prepare(target, &region.params)?;
        option_unlock(target, &region.params)
    }

    fn erase(&self, target: &mut Target, region: &FlashRegion, _addr: u32, _len: u32) -> Result<()> {
        option_erase(target, &region.params)
    }

    fn write(&self, target: &mut Target, region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        program_option(target, &region.params, addr, data)
    }

    fn done(&self, target: &mut Target, region: &FlashRegion) -> Result<()> {
        lock(target, &region.params)
    }
}

static OPTION_OPS: Stm32OptionOps = Stm32OptionOps;

pub(crate) fn option_erase(target: &mut Target, params: &FlashParams) -> Result<()> {
    target.mem.write32(reg(params, CR), CR_OPTER)?;
    target.mem.write32(reg(params, CR), CR_OPTER | CR_STRT)?;
    let timeout = target.long_op_timeout_ms;
    busy_wait(target, params, timeout)
}

pub(crate) fn program_option(
    target: &mut Target,
    params: &FlashParams,
    addr: u32,
    data: &[u8],
) -> Result<()> {
    for (i, pair) in data.chunks_exact(2).enumerate() {
        let hw = u16::from_le_bytes([pair[0], pair[1]]);
        if hw == 0xFFFF {
            continue;
        }
        target.mem.write32(reg(params, CR), CR_OPTPG)?;
        target.mem.write16(addr + i as u32 * 2, hw)?;
        busy_wait(target, params, FLASH_OP_TIMEOUT_MS)?;
    }
    Ok(())
}

/// Rewrites one option halfword. A virgin cell is programmed in place;
/// anything else forces the save/erase/rewrite cycle, preserving the
/// rest of the area.
pub(crate) fn option_write(
    target: &mut Target,
    params: &FlashParams,
    base: u32,
    size: u32,
    addr: u32,
    value: u16,
) -> Result<()> {
    if addr < base || addr + 2 > base + size || addr % 2 != 0 {
        return Err(RustprobeError::UnalignedAccess);
    }
    let current = target.mem.read16(addr)?;
    if current == value {
        return Ok(());
    }
    prepare(target, params)?;
    option_unlock(target, params)?;
    let result = (|| {
        if current == 0xFFFF {
            let bytes = value.to_le_bytes();
            return program_option(target, params, addr, &bytes);
        }
        let mut saved = [0u8; 512];
        let len = size as usize;
        if len > saved.len() {
            return Err(RustprobeError::Unsupported);
        }
        target.mem.read(base, &mut saved[..len])?;
        let off = (addr - base) as usize;
        saved[off..off + 2].copy_from_slice(&value.to_le_bytes());
        option_erase(target, params)?;
        program_option(target, params, base, &saved[..len])
    })();
    let locked = lock(target, params);
    result.and(locked)
}

#[derive(Clone, Copy, Default)]
pub struct Stm32Data {
    /// DBGMCU_CR as found before attach, restored verbatim on detach.
    pub dbgmcu_cr: u32,
}

pub struct Stm32Driver;

impl TargetDriver for Stm32Driver {
    fn attach(&self, target: &mut Target) -> Result<()> {
        let saved = target.mem.read32(DBGMCU_CR)?;
        target
            .mem
            .write32(DBGMCU_CR, saved | DBG_LOWPOWER | DBG_WATCHDOGS)?;
        target.drv = DriverData::Stm32(Stm32Data { dbgmcu_cr: saved });
        target.mem.halt()
    }

    fn detach(&self, target: &mut Target) -> Result<()> {
        if let DriverData::Stm32(data) = target.drv {
            target.mem.write32(DBGMCU_CR, data.dbgmcu_cr)?;
        }
        target.mem.resume()
    }

    fn mass_erase(&self, target: &mut Target, progress: &mut Progress) -> Option<Result<()>> {
        let params = FlashParams::Fpec {
            regbase: FPEC_BASE,
            bank: 0,
        };
        Some(mass_erase_bank(target, &params, progress))
    }
}

static DRIVER: Stm32Driver = Stm32Driver;

pub static COMMANDS: &[Command] = &[
    Command {
        name: "option",
        handler: cmd_option,
        help: "Manipulate option bytes: option erase | option <addr> <value>",
    },
    Command {
        name: "uid",
        handler: cmd_uid,
        help: "Print the device unique id",
    },
];

fn cmd_option(target: &mut Target, out: &mut dyn Write, args: &str) -> bool {
    let params = FlashParams::Fpec {
        regbase: FPEC_BASE,
        bank: 0,
    };
    match split_command(args) {
        Some(("erase", "")) => {
            let result = prepare(target, &params)
                .and_then(|_| option_unlock(target, &params))
                .and_then(|_| option_erase(target, &params));
            let locked = lock(target, &params);
            match result.and(locked) {
                Ok(()) => true,
                Err(e) => {
                    let _ = writeln!(out, "option erase failed: {}", e);
                    false
                }
            }
        }
        Some((addr, rest)) => {
            let addr = match parse_u32(addr) {
                Some(a) => a,
                None => {
                    let _ = writeln!(out, "usage: option erase | option <addr> <value>");
                    return false;
                }
            };
            let value = match parse_u32(rest) {
                Some(v) => v as u16,
                None => {
                    let _ = writeln!(out, "usage: option erase | option <addr> <value>");
                    return false;
                }
            };
            match option_write(target, &params, OPTION_BASE, OPTION_SIZE, addr, value) {
                Ok(()) => true,
                Err(e) => {
                    let _ = writeln!(out, "option write failed: {}", e);
                    false
                }
            }
        }
        None => {
            // no arguments: dump the area
            let mut bytes = [0u8; OPTION_SIZE as usize];
            if target.mem.read(OPTION_BASE, &mut bytes).is_err() {
                let _ = writeln!(out, "option read failed");
                return false;
            }
            for (i, pair) in bytes.chunks_exact(2).enumerate() {
                let _ = writeln!(
                    out,
                    "{:#010x}: {:#06x}",
                    OPTION_BASE + i as u32 * 2,
                    u16::from_le_bytes([pair[0], pair[1]])
                );
            }
            true
        }
    }
}

fn cmd_uid(target: &mut Target, out: &mut dyn Write, _args: &str) -> bool {
    let mut uid = [0u8; 12];
    if target.mem.read(UID_BASE, &mut uid).is_err() {
        let _ = writeln!(out, "uid read failed");
        return false;
    }
    let _ = out.write_str("0x");
    for byte in uid.iter() {
        let _ = write!(out, "{:02X}", byte);
    }
    let _ = out.write_str("\n");
    true
}

pub fn probe(target: &mut Target) -> Result<bool> {
    let dev_id = target.ident.part_id & 0xFFF;
    // CH32F1 parts carry dev_id 0x410 with a nonstandard revision; they
    // are claimed by the CH32 probe registered ahead of this one.
    if dev_id == 0x410 && (target.ident.part_id >> 16) == 0x2000 {
        return Ok(false);
    }
    let (name, page_size, sram_size) = match dev_id {
        0x410 => ("STM32F1 medium density", 1024, 0x5000),
        0x412 => ("STM32F1 low density", 1024, 0x2800),
        0x414 => ("STM32F1 high density", 2048, 0x1_0000),
        0x418 => ("STM32F1 connectivity", 2048, 0x1_0000),
        0x420 => ("STM32F1 value line", 1024, 0x2000),
        0x428 => ("STM32F1 value line HD", 2048, 0x8000),
        0x430 => ("STM32F1 XL density", 2048, 0x1_8000),
        _ => return Ok(false),
    };

    let size_kb = match target.mem.read16(FLASHSIZE_R)? {
        0xFFFF | 0 => 128,
        kb => kb as u32,
    };
    let params = FlashParams::Fpec {
        regbase: FPEC_BASE,
        bank: 0,
    };

    target.add_ram(RamRegion {
        start: SRAM_BASE,
        length: sram_size,
        width: AccessWidth::Word,
    })?;
    target.add_flash(FlashRegion {
        start: FLASH_BASE,
        length: size_kb * 1024,
        block_size: page_size,
        write_size: 4,
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

    target.set_driver(name, &DRIVER);
    target.add_commands("STM32", COMMANDS)?;
    target.drv = DriverData::Stm32(Stm32Data::default());
    Ok(true)
}
