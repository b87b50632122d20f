//! SAMD5x/E5x driver: the NVMCTRL command interface. Commands go into
//! CTRLB together with the 0xA5 execution key; programming fills the
//! automatic page buffer through the flash address window. The user
//! page (boot protection, watchdog fuses) is a separate region with
//! quad-word writes and its own erase command.

use core::fmt::Write;

use crate::commands::{parse_u32, Command};
use crate::family::FlashParams;
use crate::memmap::{AccessWidth, FlashOps, FlashRegion, RamRegion};
use crate::target::{Target, TargetDriver};
use crate::time::{Progress, FLASH_OP_TIMEOUT_MS};
use crate::{Result, RustprobeError};

#[rustfmt::skip]
mod nvm {
    pub const NVMCTRL_BASE : u32 = 0x4100_4000;
    pub const CTRLB        : u32 = 0x04;
    pub const PARAM        : u32 = 0x08;
    pub const INTFLAG      : u32 = 0x10;
    pub const STATUS       : u32 = 0x12;
    pub const ADDR         : u32 = 0x14;
    pub const CMDEX        : u16 = 0xA5 << 8;
    pub const CMD_EP       : u16 = 0x00;
    pub const CMD_EB       : u16 = 0x01;
    pub const CMD_WP       : u16 = 0x03;
    pub const CMD_WQW      : u16 = 0x04;
    pub const CMD_PBC      : u16 = 0x15;
    pub const CMD_SSB      : u16 = 0x16;
    pub const INT_DONE     : u16 = 1 << 0;
    pub const INT_PROGE    : u16 = 1 << 2;
    pub const INT_LOCKE    : u16 = 1 << 3;
    pub const STATUS_READY : u16 = 1 << 0;
    pub const PARAM_NVMP   : u32 = 0xFFFF;
    pub const FLASH_BASE   : u32 = 0x0000_0000;
    pub const PAGE_SIZE    : u32 = 512;
    pub const BLOCK_SIZE   : u32 = 8192;
    pub const USER_PAGE    : u32 = 0x0080_4000;
    pub const QUAD_WORD    : u32 = 16;
    pub const SRAM_BASE    : u32 = 0x2000_0000;
    pub const SERIAL_WORDS : [u32; 4] = [0x0080_61FC, 0x0080_6010, 0x0080_6014, 0x0080_6018];
    pub const BOOTPROT_POS : u32 = 26;
    pub const BOOTPROT_MASK: u32 = 0xF << BOOTPROT_POS;
    pub const DSU_CTRL     : u32 = 0x4100_2000;
    pub const DSU_STATUSA  : u32 = 0x4100_2001;
    pub const DSU_CE       : u8  = 1 << 4;
    pub const DSU_DONE     : u8  = 1 << 0;
    pub const DID_SAMD5X   : u32 = 0x6006;
}

use nvm::*;

fn command(target: &mut Target, cmd: u16) -> Result<()> {
    target.mem.write16(NVMCTRL_BASE + CTRLB, cmd | CMDEX)?;
    let deadline = crate::time::Deadline::after(target.clock, FLASH_OP_TIMEOUT_MS);
    loop {
        let flags = target.mem.read16(NVMCTRL_BASE + INTFLAG)?;
        if flags & INT_DONE != 0 {
            target.mem.write16(NVMCTRL_BASE + INTFLAG, flags)?;
            if flags & INT_LOCKE != 0 {
                return Err(RustprobeError::WriteProtected);
            }
            if flags & INT_PROGE != 0 {
                return Err(RustprobeError::ProgramError);
            }
            return Ok(());
        }
        if deadline.expired(target.clock) {
            return Err(RustprobeError::Timeout);
        }
    }
}

fn ready(target: &mut Target) -> Result<bool> {
    Ok(target.mem.read16(NVMCTRL_BASE + STATUS)? & STATUS_READY != 0)
}

/// Fills the automatic page buffer through the address window, then
/// commits it with `cmd` at `addr`.
fn buffered_write(target: &mut Target, addr: u32, data: &[u8], cmd: u16) -> Result<()> {
    command(target, CMD_PBC)?;
    for (w, word) in data.chunks_exact(4).enumerate() {
        let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        target.mem.write32(addr + w as u32 * 4, value)?;
    }
    target.mem.write32(NVMCTRL_BASE + ADDR, addr)?;
    command(target, cmd)
}

pub struct Samd5xFlashOps;

impl FlashOps for Samd5xFlashOps {
    fn prepare(&self, target: &mut Target, _region: &FlashRegion) -> Result<()> {
        if !ready(target)? {
            return Err(RustprobeError::FlashBusy);
        }
        Ok(())
    }

    fn erase(&self, target: &mut Target, _region: &FlashRegion, addr: u32, len: u32) -> Result<()> {
        let mut cur = addr;
        while cur < addr + len {
            target.mem.write32(NVMCTRL_BASE + ADDR, cur)?;
            command(target, CMD_EB)?;
            cur += BLOCK_SIZE;
        }
        Ok(())
    }

    fn write(&self, target: &mut Target, _region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        for (i, page) in data.chunks_exact(PAGE_SIZE as usize).enumerate() {
            buffered_write(target, addr + i as u32 * PAGE_SIZE, page, CMD_WP)?;
        }
        Ok(())
    }
}

static FLASH_OPS: Samd5xFlashOps = Samd5xFlashOps;

/// The user page: quad-word writes, page erase command.
pub struct Samd5xUserOps;

impl FlashOps for Samd5xUserOps {
    fn erase(&self, target: &mut Target, _region: &FlashRegion, addr: u32, _len: u32) -> Result<()> {
        target.mem.write32(NVMCTRL_BASE + ADDR, addr)?;
        command(target, CMD_EP)
    }

    fn write(&self, target: &mut Target, _region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        for (i, quad) in data.chunks_exact(QUAD_WORD as usize).enumerate() {
            buffered_write(target, addr + i as u32 * QUAD_WORD, quad, CMD_WQW)?;
        }
        Ok(())
    }
}

static USER_OPS: Samd5xUserOps = Samd5xUserOps;

/// Reads the 512-byte user page, patches `word_idx`, then erases and
/// rewrites the whole page. Failure after the erase leaves the page
/// honestly erased.
fn update_user_word(target: &mut Target, word_idx: u32, value: u32) -> Result<()> {
    if word_idx >= PAGE_SIZE / 4 {
        return Err(RustprobeError::UnalignedAccess);
    }
    let mut page = [0u8; PAGE_SIZE as usize];
    target.mem.read(USER_PAGE, &mut page)?;
    let off = (word_idx * 4) as usize;
    let current = u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]]);
    if current == value {
        return Ok(());
    }
    page[off..off + 4].copy_from_slice(&value.to_le_bytes());

    target.mem.write32(NVMCTRL_BASE + ADDR, USER_PAGE)?;
    command(target, CMD_EP)?;
    for (i, quad) in page.chunks_exact(QUAD_WORD as usize).enumerate() {
        buffered_write(target, USER_PAGE + i as u32 * QUAD_WORD, quad, CMD_WQW)?;
    }
    Ok(())
}

fn set_bootprot(target: &mut Target, out: &mut dyn Write, value: u32) -> bool {
    let mut word0 = [0u8; 4];
    if target.mem.read(USER_PAGE, &mut word0).is_err() {
        let _ = writeln!(out, "user page read failed");
        return false;
    }
    let current = u32::from_le_bytes(word0);
    let wanted = (current & !BOOTPROT_MASK) | ((value << BOOTPROT_POS) & BOOTPROT_MASK);
    match update_user_word(target, 0, wanted) {
        Ok(()) => {
            let _ = writeln!(out, "bootprot updated, effective after reset");
            true
        }
        Err(e) => {
            let _ = writeln!(out, "bootprot update failed: {}", e);
            false
        }
    }
}

pub struct Samd5xDriver;

impl TargetDriver for Samd5xDriver {
    fn mass_erase(&self, target: &mut Target, progress: &mut Progress) -> Option<Result<()>> {
        let result = (|| {
            target.mem.write8(DSU_CTRL, DSU_CE)?;
            let timeout = target.long_op_timeout_ms;
            let deadline = crate::time::Deadline::after(target.clock, timeout);
            loop {
                let status = target.mem.read8(DSU_STATUSA)?;
                if status & DSU_DONE != 0 {
                    target.mem.write8(DSU_STATUSA, DSU_DONE)?;
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

static DRIVER: Samd5xDriver = Samd5xDriver;

static COMMANDS: &[Command] = &[
    Command {
        name: "lock_bootprot",
        handler: cmd_lock_bootprot,
        help: "Protect the bootloader area (takes effect after reset)",
    },
    Command {
        name: "unlock_bootprot",
        handler: cmd_unlock_bootprot,
        help: "Remove bootloader protection (takes effect after reset)",
    },
    Command {
        name: "set_security_bit",
        handler: cmd_set_security_bit,
        help: "Set the device security bit (irreversible without chip erase)",
    },
    Command {
        name: "update_user_word",
        handler: cmd_update_user_word,
        help: "Rewrite one 32-bit word of the user page: update_user_word <idx> <value>",
    },
    Command {
        name: "uid",
        handler: cmd_uid,
        help: "Print the device serial number",
    },
];

fn cmd_lock_bootprot(target: &mut Target, out: &mut dyn Write, _args: &str) -> bool {
    set_bootprot(target, out, 0x0)
}

fn cmd_unlock_bootprot(target: &mut Target, out: &mut dyn Write, _args: &str) -> bool {
    set_bootprot(target, out, 0xF)
}

fn cmd_set_security_bit(target: &mut Target, out: &mut dyn Write, _args: &str) -> bool {
    match command(target, CMD_SSB) {
        Ok(()) => {
            let _ = writeln!(out, "security bit set, effective after reset");
            true
        }
        Err(e) => {
            let _ = writeln!(out, "set security bit failed: {}", e);
            false
        }
    }
}

fn cmd_update_user_word(target: &mut Target, out: &mut dyn Write, args: &str) -> bool {
    let mut it = args.split_whitespace();
    let parsed = (
        it.next().and_then(parse_u32),
        it.next().and_then(parse_u32),
    );
    match parsed {
        (Some(idx), Some(value)) => match update_user_word(target, idx, value) {
            Ok(()) => true,
            Err(e) => {
                let _ = writeln!(out, "user word update failed: {}", e);
                false
            }
        },
        _ => {
            let _ = writeln!(out, "usage: update_user_word <idx> <value>");
            false
        }
    }
}

fn cmd_uid(target: &mut Target, out: &mut dyn Write, _args: &str) -> bool {
    let _ = out.write_str("0x");
    for addr in SERIAL_WORDS.iter() {
        match target.mem.read32(*addr) {
            Ok(word) => {
                let _ = write!(out, "{:08X}", word);
            }
            Err(_) => {
                let _ = writeln!(out, "serial read failed");
                return false;
            }
        }
    }
    let _ = out.write_str("\n");
    true
}

pub fn probe(target: &mut Target) -> Result<bool> {
    if target.ident.part_id >> 16 != DID_SAMD5X {
        return Ok(false);
    }

    let pages = target.mem.read32(NVMCTRL_BASE + PARAM)? & PARAM_NVMP;
    let flash_size = pages * PAGE_SIZE;

    target.add_ram(RamRegion {
        start: SRAM_BASE,
        length: 0x4_0000,
        width: AccessWidth::Word,
    })?;
    target.add_flash(FlashRegion {
        start: FLASH_BASE,
        length: flash_size,
        block_size: BLOCK_SIZE,
        write_size: PAGE_SIZE,
        erased_byte: 0xFF,
        ops: &FLASH_OPS,
        params: FlashParams::Nvmctrl {
            regbase: NVMCTRL_BASE,
        },
    })?;
    target.add_flash(FlashRegion {
        start: USER_PAGE,
        length: PAGE_SIZE,
        block_size: PAGE_SIZE,
        write_size: QUAD_WORD,
        erased_byte: 0xFF,
        ops: &USER_OPS,
        params: FlashParams::Nvmctrl {
            regbase: NVMCTRL_BASE,
        },
    })?;

    target.set_driver("SAMD5x", &DRIVER);
    target.add_commands("SAMD5x", COMMANDS)?;
    // external reset would re-engage the DSU cold-plug state
    target.inhibit_nrst = true;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flasher::Flasher;
    use crate::sim::{Controller, SimClock, SimState, SimTarget};
    use crate::target::Identity;

    /// NVMCTRL model: CMDEX-keyed commands, automatic page buffer fed
    /// through the address window, DSU chip erase.
    struct Nvmctrl {
        buf: [u8; PAGE_SIZE as usize],
        addr: u32,
        intflag: u16,
        fail_user_writes: bool,
        security_bit: bool,
        dsu_busy: u32,
    }

    impl Nvmctrl {
        fn new() -> Self {
            Nvmctrl {
                buf: [0xFF; PAGE_SIZE as usize],
                addr: 0,
                intflag: 0,
                fail_user_writes: false,
                security_bit: false,
                dsu_busy: 0,
            }
        }

        fn in_flash(addr: u32) -> bool {
            addr < 256 * 1024 || (addr >= USER_PAGE && addr < USER_PAGE + PAGE_SIZE)
        }
    }

    impl Controller for Nvmctrl {
        fn read8(&mut self, _st: &mut SimState, addr: u32) -> Option<u8> {
            if addr == DSU_STATUSA {
                if self.dsu_busy > 0 {
                    self.dsu_busy -= 1;
                    return Some(0);
                }
                return Some(DSU_DONE);
            }
            None
        }

        fn write8(&mut self, st: &mut SimState, addr: u32, value: u8) -> bool {
            if addr == DSU_CTRL {
                if value & DSU_CE != 0 {
                    st.fill(FLASH_BASE, 256 * 1024, 0xFF);
                    self.dsu_busy = 700;
                }
                return true;
            }
            if addr == DSU_STATUSA {
                return true;
            }
            false
        }

        fn read16(&mut self, _st: &mut SimState, addr: u32) -> Option<u16> {
            match addr {
                a if a == NVMCTRL_BASE + INTFLAG => Some(self.intflag | INT_DONE),
                a if a == NVMCTRL_BASE + STATUS => Some(STATUS_READY),
                _ => None,
            }
        }

        fn write16(&mut self, st: &mut SimState, addr: u32, value: u16) -> bool {
            if addr == NVMCTRL_BASE + INTFLAG {
                self.intflag &= !value;
                return true;
            }
            if addr != NVMCTRL_BASE + CTRLB {
                return false;
            }
            if value & 0xFF00 != CMDEX {
                self.intflag |= INT_PROGE;
                return true;
            }
            match value & 0xFF {
                x if x == CMD_PBC => {
                    self.buf = [0xFF; PAGE_SIZE as usize];
                }
                x if x == CMD_EB => {
                    st.fill(self.addr & !(BLOCK_SIZE - 1), BLOCK_SIZE, 0xFF);
                }
                x if x == CMD_EP => {
                    st.fill(USER_PAGE, PAGE_SIZE, 0xFF);
                }
                x if x == CMD_WP || x == CMD_WQW => {
                    let span = if x == CMD_WP { PAGE_SIZE } else { QUAD_WORD };
                    let base = self.addr & !(span - 1);
                    if self.fail_user_writes && base >= USER_PAGE {
                        self.intflag |= INT_PROGE;
                    } else {
                        for i in 0..span {
                            let a = base + i;
                            let old = st.get8(a).unwrap_or(0xFF);
                            st.put8(a, old & self.buf[(a % PAGE_SIZE) as usize]);
                        }
                    }
                    self.buf = [0xFF; PAGE_SIZE as usize];
                }
                x if x == CMD_SSB => {
                    self.security_bit = true;
                }
                _ => self.intflag |= INT_PROGE,
            }
            true
        }

        fn write32(&mut self, st: &mut SimState, addr: u32, value: u32) -> bool {
            if addr == NVMCTRL_BASE + ADDR {
                self.addr = value;
                return true;
            }
            if Nvmctrl::in_flash(addr) {
                let off = (addr % PAGE_SIZE) as usize;
                self.buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
                return true;
            }
            false
        }

        fn read32(&mut self, _st: &mut SimState, addr: u32) -> Option<u32> {
            if addr == NVMCTRL_BASE + PARAM {
                return Some(512); // 512 pages = 256 KiB
            }
            None
        }
    }

    fn samd_ident() -> Identity {
        Identity {
            core_tag: "M4",
            cpuid: 0x410F_C241,
            part_id: 0x6006_0004,
        }
    }

    fn sim_samd() -> SimTarget<Nvmctrl> {
        let mut sim = SimTarget::new(Nvmctrl::new());
        sim.add_seg(FLASH_BASE, 256 * 1024, 0xFF);
        sim.add_seg(USER_PAGE, PAGE_SIZE as usize, 0xFF);
        sim.add_seg(SRAM_BASE, 0x1_0000, 0);
        sim.add_seg(0x0080_6000, 0x200, 0xAB);
        sim
    }

    #[test]
    fn block_erase_page_write_round_trip() {
        let mut sim = sim_samd();
        let data: Vec<u8> = (0..512u32).map(|i| (i ^ 0x5A) as u8).collect();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, samd_ident());
            assert!(probe(&mut target).unwrap());
            assert_eq!(target.map().flash_at(FLASH_BASE).unwrap().1.length, 256 * 1024);
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            flasher.flash_erase(&mut target, 0x2000, 512).unwrap();
            flasher.flash_write(&mut target, 0x2000, &data).unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(sim.st.read_vec(0x2000, 512), data);
    }

    #[test]
    fn user_word_update_preserves_page() {
        let mut sim = sim_samd();
        sim.st.fill(USER_PAGE, PAGE_SIZE, 0x5A);
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, samd_ident());
            assert!(probe(&mut target).unwrap());
            update_user_word(&mut target, 3, 0xDEAD_BEEF).unwrap();
        }
        assert_eq!(sim.st.get32(USER_PAGE + 12).unwrap(), 0xDEAD_BEEF);
        assert_eq!(sim.st.get32(USER_PAGE).unwrap(), 0x5A5A_5A5A);
        assert_eq!(sim.st.get32(USER_PAGE + 16).unwrap(), 0x5A5A_5A5A);
    }

    #[test]
    fn user_word_failure_leaves_page_erased() {
        let mut sim = sim_samd();
        sim.st.fill(USER_PAGE, PAGE_SIZE, 0x5A);
        sim.ctrl.fail_user_writes = true;
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, samd_ident());
            assert!(probe(&mut target).unwrap());
            assert_eq!(
                update_user_word(&mut target, 3, 0xDEAD_BEEF).unwrap_err(),
                RustprobeError::ProgramError
            );
        }
        assert!(sim
            .st
            .read_vec(USER_PAGE, PAGE_SIZE as usize)
            .iter()
            .all(|b| *b == 0xFF));
    }

    #[test]
    fn dsu_mass_erase_with_progress() {
        let mut sim = sim_samd();
        sim.st.fill(FLASH_BASE, 256 * 1024, 0x00);
        let mut ticks = 0u32;
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, samd_ident());
            assert!(probe(&mut target).unwrap());
            let mut sink = |_n: u32| ticks += 1;
            let mut progress = Progress::new(&mut sink);
            Flasher::mass_erase(&mut target, &mut progress).unwrap();
        }
        assert!(ticks >= 1);
        assert!(sim.st.read_vec(FLASH_BASE, 4096).iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn security_bit_command() {
        let mut sim = sim_samd();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, samd_ident());
            assert!(probe(&mut target).unwrap());
            let mut out = String::new();
            assert!(crate::commands::dispatch(&mut target, &mut out, "set_security_bit").unwrap());
        }
        assert!(sim.ctrl.security_bit);
    }
}
