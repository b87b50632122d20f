//! LMI/Stellaris driver. Erase goes through the FMA/FMC command
//! registers directly; word programming runs a small routine in target
//! RAM because FMD only takes one word per command strobe and the
//! debug-link round trips would make large images crawl.

use crate::family::FlashParams;
use crate::memmap::{AccessWidth, FlashOps, FlashRegion, RamRegion};
use crate::stub;
use crate::target::{Target, TargetDriver};
use crate::time::{Progress, FLASH_OP_TIMEOUT_MS};
use crate::{Result, RustprobeError};

#[rustfmt::skip]
mod fma {
    pub const FLASH_BASE   : u32 = 0x0000_0000;
    pub const SRAM_BASE    : u32 = 0x2000_0000;
    pub const FMA_BASE     : u32 = 0x400F_D000;
    pub const FMA          : u32 = 0x00;
    pub const FMC          : u32 = 0x08;
    pub const FMC_WRKEY    : u32 = 0xA442 << 16;
    pub const FMC_WRITE    : u32 = 1 << 0;
    pub const FMC_ERASE    : u32 = 1 << 1;
    pub const FMC_MERASE   : u32 = 1 << 2;
    pub const PAGE_SIZE    : u32 = 1024;
    pub const DID_CLASS    : u32 = 0x10;
    pub const STUB_TIMEOUT : u32 = 5_000;
}

use fma::*;

/// Word-programming routine staged into target RAM. Takes
/// `(dest, src, byte count, FMA base)` in r0-r3 and iterates the word
/// index up from zero, strobing one FMC write per word; exits through
/// the runner's breakpoint with the status in r0.
#[rustfmt::skip]
static WRITE_STUB: [u8; 42] = [
    0x10, 0xB5,             // push {r4, lr}
    0x00, 0x24,             // movs r4, #0
    0x92, 0x08,             // lsrs r2, r2, #2
    0x0B, 0xE0,             // b    check
    0x31, 0xF8, 0x04, 0x5B, // ldr.w r5, [r1], #4
    0x18, 0x60,             // str  r0, [r3, #0]
    0x5D, 0x60,             // str  r5, [r3, #4]
    0x4F, 0xF4, 0x22, 0x45, // mov.w r5, #0xA4420000
    0x05, 0xF1, 0x01, 0x05, // add.w r5, r5, #1
    0x9D, 0x60,             // str  r5, [r3, #8]
    0x9D, 0x68,             // wait: ldr r5, [r3, #8]
    0x00, 0x2D,             // cmp  r5, #0
    0xFC, 0xD1,             // bne  wait
    0x04, 0x30,             // adds r0, #4
    0x01, 0x34,             // adds r4, #1
    0xA2, 0x42,             // check: cmp r2, r4
    0xF1, 0xD8,             // bhi  loop
    0x00, 0x20,             // movs r0, #0
];

fn fmc_strobe(target: &mut Target, addr: u32, bits: u32) -> Result<()> {
    target.mem.write32(FMA_BASE + FMA, addr)?;
    target.mem.write32(FMA_BASE + FMC, FMC_WRKEY | bits)?;
    target.wait_clear(FMA_BASE + FMC, bits, FLASH_OP_TIMEOUT_MS)?;
    Ok(())
}

pub struct LmiFlashOps;

impl FlashOps for LmiFlashOps {
    fn erase(&self, target: &mut Target, _region: &FlashRegion, addr: u32, len: u32) -> Result<()> {
        let mut cur = addr;
        while cur < addr + len {
            fmc_strobe(target, cur, FMC_ERASE)?;
            cur += PAGE_SIZE;
        }
        Ok(())
    }

    fn write(&self, target: &mut Target, _region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        stub::run_flash_stub(target, &WRITE_STUB, addr, data, FMA_BASE, STUB_TIMEOUT)
    }
}

static FLASH_OPS: LmiFlashOps = LmiFlashOps;

pub struct LmiDriver;

impl TargetDriver for LmiDriver {
    fn mass_erase(&self, target: &mut Target, progress: &mut Progress) -> Option<Result<()>> {
        let result = (|| {
            target.mem.write32(FMA_BASE + FMA, 0)?;
            target.mem.write32(FMA_BASE + FMC, FMC_WRKEY | FMC_MERASE)?;
            let timeout = target.long_op_timeout_ms;
            target.wait_clear_prog(FMA_BASE + FMC, FMC_MERASE, timeout, progress)?;
            Ok(())
        })();
        Some(result)
    }
}

static DRIVER: LmiDriver = LmiDriver;

pub fn probe(target: &mut Target) -> Result<bool> {
    if target.ident.part_id >> 24 != DID_CLASS {
        return Ok(false);
    }

    target.add_ram(RamRegion {
        start: SRAM_BASE,
        length: 0x1_0000,
        width: AccessWidth::Word,
    })?;
    target.add_flash(FlashRegion {
        start: FLASH_BASE,
        length: 256 * 1024,
        block_size: PAGE_SIZE,
        write_size: 4,
        erased_byte: 0xFF,
        ops: &FLASH_OPS,
        params: FlashParams::Lmi { regbase: FMA_BASE },
    })?;

    target.set_driver("Stellaris LM3S", &DRIVER);
    Ok(true)
}
