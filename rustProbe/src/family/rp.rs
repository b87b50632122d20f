//! RP2040/RP2350 driver. The XIP QSPI flash has no memory-mapped
//! controller; programming goes through the bootrom's flash routines,
//! run on the target core by the stub runner. A helper blob staged in
//! SRAM looks the routines up in the ROM function table (whose pointer
//! it receives as its fourth argument) and chains
//! connect / exit-XIP / operation / flush around each call.

use core::fmt::Write;

use crate::commands::{parse_u32, Command};
use crate::family::FlashParams;
use crate::flasher::Flasher;
use crate::memmap::{AccessWidth, FlashOps, FlashRegion, RamRegion};
use crate::stub;
use crate::target::{Target, TargetDriver};
use crate::{Result, RustprobeError};

#[rustfmt::skip]
mod rom {
    pub const RP2040_ID      : u32 = 0x0100_2927;
    pub const RP2350_ID      : u32 = 0x0004_0927;
    pub const XIP_BASE       : u32 = 0x1000_0000;
    pub const XIP_SIZE       : u32 = 16 * 1024 * 1024;
    pub const SRAM_BASE      : u32 = 0x2000_0000;
    pub const FUNC_TABLE_PTR : u32 = 0x0000_0014;
    pub const SECTOR_SIZE    : u32 = 4096;
    pub const PAGE_SIZE      : u32 = 256;
    pub const STUB_TIMEOUT   : u32 = 10_000;
}

use rom::*;

const fn rom_tag(a: u8, b: u8) -> u16 {
    a as u16 | (b as u16) << 8
}

pub const TAG_USB_BOOT: u16 = rom_tag(b'U', b'B');

/// Erase helper: `(flash offset, unused, byte count, ROM table)`.
/// Resolves connect/exit-XIP/range-erase/flush from the table and runs
/// them in order, forwarding the bootrom status.
#[rustfmt::skip]
static ERASE_STUB: [u8; 52] = [
    0xF0, 0xB5,             // push {r4-r7, lr}
    0x04, 0x46,             // mov  r4, r0
    0x15, 0x46,             // mov  r5, r2
    0x1E, 0x46,             // mov  r6, r3
    0x30, 0x46, 0x49, 0x46, // tag 'IF': resolve + blx
    0xB0, 0x47,
    0x30, 0x46, 0x58, 0x45, // tag 'EX': resolve + blx
    0xB0, 0x47,
    0x20, 0x46,             // mov  r0, r4 (offset)
    0x29, 0x46,             // mov  r1, r5 (count)
    0x4F, 0xF4, 0x80, 0x52, // mov.w r2, #4096
    0x20, 0x23,             // movs r3, #0x20
    0xB0, 0x47,             // blx  range_erase
    0x07, 0x46,             // mov  r7, r0
    0x30, 0x46, 0x43, 0x46, // tag 'FC': resolve + blx
    0xB0, 0x47,
    0x30, 0x46, 0x58, 0x43, // tag 'CX': resolve + blx
    0xB0, 0x47,
    0x38, 0x46,             // mov  r0, r7 (status)
    0xF0, 0xBD,             // pop  {r4-r7, pc}
    0x00, 0x00,
];

/// Program helper: `(flash offset, source, byte count, ROM table)`.
#[rustfmt::skip]
static PROGRAM_STUB: [u8; 48] = [
    0xF0, 0xB5,             // push {r4-r7, lr}
    0x04, 0x46,             // mov  r4, r0
    0x0D, 0x46,             // mov  r5, r1
    0x16, 0x46,             // mov  r6, r2
    0x1F, 0x46,             // mov  r7, r3
    0x38, 0x46, 0x49, 0x46, // tag 'IF': resolve + blx
    0xB8, 0x47,
    0x38, 0x46, 0x58, 0x45, // tag 'EX': resolve + blx
    0xB8, 0x47,
    0x20, 0x46,             // mov  r0, r4 (offset)
    0x29, 0x46,             // mov  r1, r5 (source)
    0x32, 0x46,             // mov  r2, r6 (count)
    0xB8, 0x47,             // blx  range_program
    0x04, 0x46,             // mov  r4, r0
    0x38, 0x46, 0x43, 0x46, // tag 'FC': resolve + blx
    0xB8, 0x47,
    0x38, 0x46, 0x58, 0x43, // tag 'CX': resolve + blx
    0xB8, 0x47,
    0x20, 0x46,             // mov  r0, r4 (status)
    0xF0, 0xBD,             // pop  {r4-r7, pc}
];

/// Resolves a bootrom function by its two-letter tag.
pub(crate) fn rom_lookup(target: &mut Target, tag: u16) -> Result<u32> {
    let table = target.mem.read16(FUNC_TABLE_PTR)? as u32;
    let mut entry = table;
    loop {
        let found = target.mem.read16(entry)?;
        if found == 0 {
            return Err(RustprobeError::Unsupported);
        }
        if found == tag {
            return Ok(target.mem.read16(entry + 2)? as u32);
        }
        entry += 4;
    }
}

fn rom_table(params: &FlashParams) -> u32 {
    match params {
        FlashParams::Rom { table } => *table,
        _ => 0,
    }
}

pub struct RpFlashOps;

impl FlashOps for RpFlashOps {
    fn erase(&self, target: &mut Target, region: &FlashRegion, addr: u32, len: u32) -> Result<()> {
        let ram = target.scratch_ram().ok_or(RustprobeError::Unsupported)?;
        stub::run_stub(
            target,
            ram,
            &ERASE_STUB,
            [addr - XIP_BASE, 0, len, rom_table(&region.params)],
            STUB_TIMEOUT,
        )
    }

    fn write(&self, target: &mut Target, region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        stub::run_flash_stub(
            target,
            &PROGRAM_STUB,
            addr - XIP_BASE,
            data,
            rom_table(&region.params),
            STUB_TIMEOUT,
        )
    }
}

static FLASH_OPS: RpFlashOps = RpFlashOps;

pub struct RpDriver;

impl TargetDriver for RpDriver {}

static DRIVER: RpDriver = RpDriver;

static COMMANDS: &[Command] = &[
    Command {
        name: "erase_sector",
        handler: cmd_erase_sector,
        help: "Erase flash sectors: erase_sector <start> <len>",
    },
    Command {
        name: "reset_usb_boot",
        handler: cmd_reset_usb_boot,
        help: "Reboot into the USB bootloader",
    },
];

fn cmd_erase_sector(target: &mut Target, out: &mut dyn Write, args: &str) -> bool {
    let mut it = args.split_whitespace();
    let parsed = (
        it.next().and_then(parse_u32),
        it.next().and_then(parse_u32),
    );
    let (start, len) = match parsed {
        (Some(start), Some(len)) => (start, len),
        _ => {
            let _ = writeln!(out, "usage: erase_sector <start> <len>");
            return false;
        }
    };
    let mut flasher = Flasher::new();
    let result = flasher
        .begin_flash(target)
        .and_then(|_| flasher.flash_erase(target, start, len));
    let closed = flasher.end_flash(target);
    match result.and(closed) {
        Ok(()) => true,
        Err(e) => {
            let _ = writeln!(out, "erase failed: {}", e);
            false
        }
    }
}

/// Jumps the core into the bootrom's USB bootloader entry. The target
/// drops off the debug bus; no completion is waited for.
fn cmd_reset_usb_boot(target: &mut Target, out: &mut dyn Write, _args: &str) -> bool {
    let result = (|| {
        let entry = rom_lookup(target, TAG_USB_BOOT)?;
        target.mem.halt()?;
        target.mem.write_core_reg(crate::accessor::REG_ARG[0], 0)?;
        target.mem.write_core_reg(crate::accessor::REG_ARG[1], 0)?;
        let ram = target.scratch_ram().ok_or(RustprobeError::Unsupported)?;
        target.mem.write_core_reg(crate::accessor::REG_SP, ram.end() & !7)?;
        target.mem.write_core_reg(crate::accessor::REG_PC, entry)?;
        target.mem.resume()
    })();
    match result {
        Ok(()) => {
            let _ = writeln!(out, "target rebooting into USB bootloader");
            true
        }
        Err(e) => {
            let _ = writeln!(out, "reset_usb_boot failed: {}", e);
            false
        }
    }
}

pub fn probe(target: &mut Target) -> Result<bool> {
    let (name, sram_len) = match target.ident.part_id {
        RP2040_ID => ("RP2040", 0x4_2000),
        RP2350_ID => ("RP2350", 0x8_2000),
        _ => return Ok(false),
    };

    let table = target.mem.read16(FUNC_TABLE_PTR)? as u32;
    if table == 0 || table == 0xFFFF {
        return Ok(false);
    }

    target.add_ram(RamRegion {
        start: SRAM_BASE,
        length: sram_len,
        width: AccessWidth::Word,
    })?;
    target.add_flash(FlashRegion {
        start: XIP_BASE,
        length: XIP_SIZE,
        block_size: SECTOR_SIZE,
        write_size: PAGE_SIZE,
        erased_byte: 0xFF,
        ops: &FLASH_OPS,
        params: FlashParams::Rom { table },
    })?;

    target.set_driver(name, &DRIVER);
    target.add_commands(name, COMMANDS)?;
    Ok(true)
}
