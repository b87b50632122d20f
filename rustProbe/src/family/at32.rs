//! AT32F43x driver. An FPEC derivative with dual banks: bank 2 carries
//! a second copy of the controller registers at a fixed offset, so the
//! STM32 routines run unchanged against either bank through the region
//! params. Option ("user system data") erase on fully populated parts
//! takes seconds, so the driver raises the long-operation budget.

use core::fmt::Write;

use crate::commands::{parse_u32, split_command, Command};
use crate::family::stm32::regs::{FLASHSIZE_R, FLASH_BASE};
use crate::family::stm32::{self, Stm32FlashOps, Stm32OptionOps};
use crate::family::{DriverData, FlashParams};
use crate::memmap::{AccessWidth, FlashRegion, RamRegion};
use crate::target::{Target, TargetDriver};
use crate::time::Progress;
use crate::Result;

#[rustfmt::skip]
mod at32_regs {
    pub const FMC_BASE        : u32 = 0x4002_3C00;
    pub const BANK2_OFFSET    : u32 = 0x40;
    pub const USD_BASE        : u32 = 0x1FFF_C000;
    pub const USD_SIZE        : u32 = 512;
    pub const UID_BASE        : u32 = 0x1FFF_F7E8;
    pub const SRAM_BASE       : u32 = 0x2000_0000;
    pub const SECTOR_SIZE     : u32 = 4096;
    pub const BANK1_MAX       : u32 = 2048 * 1024;
    pub const SERIES_F435     : u32 = 0x7008;
    pub const SERIES_F437     : u32 = 0x7009;
    /// Fully populated user system data can take ~15s to erase.
    pub const USD_TIMEOUT_MS  : u32 = 15_000;
}

use at32_regs::*;

#[derive(Clone, Copy, Default)]
pub struct At32Data {
    pub dual_bank: bool,
}

static FLASH_OPS: Stm32FlashOps = Stm32FlashOps;
static OPTION_OPS: Stm32OptionOps = Stm32OptionOps;

fn bank_params(bank: u32) -> FlashParams {
    FlashParams::Fpec {
        regbase: FMC_BASE,
        bank,
    }
}

pub struct At32Driver;

impl TargetDriver for At32Driver {
    fn mass_erase(&self, target: &mut Target, progress: &mut Progress) -> Option<Result<()>> {
        let dual = matches!(target.drv, DriverData::At32(At32Data { dual_bank: true }));
        let mut result = stm32::mass_erase_bank(target, &bank_params(0), progress);
        if result.is_ok() && dual {
            result = stm32::mass_erase_bank(target, &bank_params(BANK2_OFFSET), progress);
        }
        Some(result)
    }
}

static DRIVER: At32Driver = At32Driver;

static COMMANDS: &[Command] = &[
    Command {
        name: "option",
        handler: cmd_option,
        help: "Manipulate user system data: option erase | option <addr> <value>",
    },
    Command {
        name: "uid",
        handler: cmd_uid,
        help: "Print the device unique id",
    },
];

fn cmd_option(target: &mut Target, out: &mut dyn Write, args: &str) -> bool {
    let params = bank_params(0);
    match split_command(args) {
        Some(("erase", "")) => {
            let result = stm32::prepare(target, &params)
                .and_then(|_| stm32::option_unlock(target, &params))
                .and_then(|_| stm32::option_erase(target, &params));
            let locked = stm32::lock(target, &params);
            match result.and(locked) {
                Ok(()) => true,
                Err(e) => {
                    let _ = writeln!(out, "user system data erase failed: {}", e);
                    false
                }
            }
        }
        Some((addr, rest)) => {
            match (parse_u32(addr), parse_u32(rest)) {
                (Some(addr), Some(value)) => {
                    match stm32::option_write(target, &params, USD_BASE, USD_SIZE, addr, value as u16)
                    {
                        Ok(()) => true,
                        Err(e) => {
                            let _ = writeln!(out, "user system data write failed: {}", e);
                            false
                        }
                    }
                }
                _ => {
                    let _ = writeln!(out, "usage: option erase | option <addr> <value>");
                    false
                }
            }
        }
        None => {
            let _ = writeln!(out, "usage: option erase | option <addr> <value>");
            false
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
    let series = target.ident.part_id >> 16;
    let name = match series {
        SERIES_F435 => "AT32F435",
        SERIES_F437 => "AT32F437",
        _ => return Ok(false),
    };

    let size_kb = match target.mem.read16(FLASHSIZE_R)? {
        0xFFFF | 0 => 4032,
        kb => kb as u32,
    };
    let total = size_kb * 1024;

    target.add_ram(RamRegion {
        start: SRAM_BASE,
        length: 0x6_0000,
        width: AccessWidth::Word,
    })?;

    let dual_bank = total > BANK1_MAX;
    if dual_bank {
        target.add_flash(FlashRegion {
            start: FLASH_BASE,
            length: BANK1_MAX,
            block_size: SECTOR_SIZE,
            write_size: 4,
            erased_byte: 0xFF,
            ops: &FLASH_OPS,
            params: bank_params(0),
        })?;
        target.add_flash(FlashRegion {
            start: FLASH_BASE + BANK1_MAX,
            length: total - BANK1_MAX,
            block_size: SECTOR_SIZE,
            write_size: 4,
            erased_byte: 0xFF,
            ops: &FLASH_OPS,
            params: bank_params(BANK2_OFFSET),
        })?;
    } else {
        target.add_flash(FlashRegion {
            start: FLASH_BASE,
            length: total,
            block_size: SECTOR_SIZE,
            write_size: 4,
            erased_byte: 0xFF,
            ops: &FLASH_OPS,
            params: bank_params(0),
        })?;
    }
    target.add_flash(FlashRegion {
        start: USD_BASE,
        length: USD_SIZE,
        block_size: USD_SIZE,
        write_size: 2,
        erased_byte: 0xFF,
        ops: &OPTION_OPS,
        params: bank_params(0),
    })?;

    target.set_driver(name, &DRIVER);
    target.add_commands("AT32", COMMANDS)?;
    target.long_op_timeout_ms = USD_TIMEOUT_MS;
    target.drv = DriverData::At32(At32Data { dual_bank });
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flasher::Flasher;
    use crate::sim::fpec::Fpec;
    use crate::sim::{SimClock, SimTarget};
    use crate::target::Identity;
    use crate::RustprobeError;

    fn at32_ident() -> Identity {
        Identity {
            core_tag: "M4",
            cpuid: 0x410F_C241,
            part_id: 0x7008_4540,
        }
    }

    /// A 4032 KiB dual-bank part: 2048K + 1984K behind one controller.
    fn sim_at32() -> SimTarget<Fpec> {
        let mut sim = SimTarget::new(Fpec::dual(
            FMC_BASE,
            BANK2_OFFSET,
            (FLASH_BASE, BANK1_MAX),
            (FLASH_BASE + BANK1_MAX, 4032 * 1024 - BANK1_MAX),
            SECTOR_SIZE,
        ));
        sim.ctrl.option_base = USD_BASE;
        sim.ctrl.option_len = USD_SIZE;
        sim.add_seg(FLASH_BASE, 4032 * 1024, 0xFF);
        sim.add_seg(SRAM_BASE, 0x1_0000, 0);
        sim.add_seg(0x1FFF_F7E0, 0x40, 0xFF);
        sim.add_seg(USD_BASE, USD_SIZE as usize, 0xFF);
        sim.poke16(FLASHSIZE_R, 4032);
        sim
    }

    #[test]
    fn probe_registers_two_banks() {
        let mut sim = sim_at32();
        let clock = SimClock::share(&sim);
        let mut target = Target::new(&mut sim, &clock, at32_ident());
        assert!(probe(&mut target).unwrap());
        assert_eq!(target.driver_name, "AT32F435");
        assert_eq!(target.map().flash_count(), 3);
        assert_eq!(target.long_op_timeout_ms, USD_TIMEOUT_MS);
        let (_, bank2) = target.map().flash_at(FLASH_BASE + BANK1_MAX).unwrap();
        assert!(matches!(
            bank2.params,
            FlashParams::Fpec { bank, .. } if bank == BANK2_OFFSET
        ));
    }

    #[test]
    fn erase_straddles_bank_split() {
        // one sector either side of the split: each bank's registers
        // see exactly one erase
        let mut sim = sim_at32();
        sim.st.fill(FLASH_BASE, 4032 * 1024, 0x00);
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, at32_ident());
            assert!(probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            flasher
                .flash_erase(&mut target, FLASH_BASE + BANK1_MAX - SECTOR_SIZE, 2 * SECTOR_SIZE)
                .unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(sim.ctrl.banks[0].erased_blocks, 1);
        assert_eq!(sim.ctrl.banks[1].erased_blocks, 1);
        let straddle = sim
            .st
            .read_vec(FLASH_BASE + BANK1_MAX - SECTOR_SIZE, 2 * SECTOR_SIZE as usize);
        assert!(straddle.iter().all(|b| *b == 0xFF));
        // outside the erased window nothing changed
        assert_eq!(
            sim.st.get8(FLASH_BASE + BANK1_MAX - SECTOR_SIZE - 1).unwrap(),
            0x00
        );
        assert_eq!(sim.st.get8(FLASH_BASE + BANK1_MAX + SECTOR_SIZE).unwrap(), 0x00);
    }

    #[test]
    fn mass_erase_reports_progress() {
        let mut sim = sim_at32();
        sim.st.fill(FLASH_BASE, 4032 * 1024, 0x00);
        // each bank erase holds BSY for ~1.2s of simulated time
        sim.ctrl.slow_busy_reads = 1200;
        let mut ticks = 0u32;
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, at32_ident());
            assert!(probe(&mut target).unwrap());
            let mut sink = |_n: u32| ticks += 1;
            let mut progress = Progress::new(&mut sink);
            Flasher::mass_erase(&mut target, &mut progress).unwrap();
        }
        assert!(ticks >= 2, "expected periodic progress, got {} ticks", ticks);
        assert!(sim
            .st
            .read_vec(FLASH_BASE, 4032 * 1024)
            .iter()
            .all(|b| *b == 0xFF));
    }

    #[test]
    fn option_erase_uses_long_timeout() {
        let mut sim = sim_at32();
        // the USD erase stays busy for ~600ms: longer than the default
        // per-operation budget, well within the driver's
        sim.ctrl.slow_busy_reads = 600;
        let clock = SimClock::share(&sim);
        let mut target = Target::new(&mut sim, &clock, at32_ident());
        assert!(probe(&mut target).unwrap());

        target.long_op_timeout_ms = 250;
        let params = bank_params(0);
        stm32::prepare(&mut target, &params).unwrap();
        stm32::option_unlock(&mut target, &params).unwrap();
        assert_eq!(
            stm32::option_erase(&mut target, &params).unwrap_err(),
            RustprobeError::Timeout
        );
        stm32::lock(&mut target, &params).unwrap();
        // let the abandoned erase run out before retrying
        target
            .wait_clear(FMC_BASE + stm32::regs::SR, stm32::regs::SR_BSY, 2_000)
            .unwrap();

        target.long_op_timeout_ms = USD_TIMEOUT_MS;
        stm32::prepare(&mut target, &params).unwrap();
        stm32::option_unlock(&mut target, &params).unwrap();
        stm32::option_erase(&mut target, &params).unwrap();
        stm32::lock(&mut target, &params).unwrap();
    }
}
