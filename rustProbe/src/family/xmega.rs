//! AVR XMEGA driver. The NVM controller sits in PDI-visible i/o space;
//! the transport maps it, the signature row and the application flash
//! into one linear address space. Commands are written to CMD, pages
//! load through the flash window and execute with CMDEX.

use crate::family::FlashParams;
use crate::memmap::{AccessWidth, FlashOps, FlashRegion, RamRegion};
use crate::target::{Target, TargetDriver};
use crate::time::{Progress, FLASH_OP_TIMEOUT_MS};
use crate::{Result, RustprobeError};

#[rustfmt::skip]
mod nvm {
    pub const NVM_BASE       : u32 = 0x0100_01C0;
    pub const NVM_ADDR0      : u32 = 0x00;
    pub const NVM_CMD        : u32 = 0x0A;
    pub const NVM_CTRLA      : u32 = 0x0B;
    pub const NVM_STATUS     : u32 = 0x0F;
    pub const CTRLA_CMDEX    : u8  = 1 << 0;
    pub const STATUS_BUSY    : u8  = 1 << 7;
    pub const CMD_CHIP_ERASE : u8  = 0x40;
    pub const CMD_LOAD_BUF   : u8  = 0x23;
    pub const CMD_ERASE_PAGE : u8  = 0x22;
    pub const CMD_WRITE_PAGE : u8  = 0x25;
    pub const APP_BASE       : u32 = 0x0080_0000;
    pub const SRAM_BASE      : u32 = 0x0100_2000;
    pub const PAGE_SIZE      : u32 = 512;
    pub const SIG_ATXMEGA    : u32 = 0x1E97;
}

use nvm::*;

fn nvm_addr(target: &mut Target, addr: u32) -> Result<()> {
    let offset = addr - APP_BASE;
    target.mem.write8(NVM_BASE + NVM_ADDR0, offset as u8)?;
    target.mem.write8(NVM_BASE + NVM_ADDR0 + 1, (offset >> 8) as u8)?;
    target.mem.write8(NVM_BASE + NVM_ADDR0 + 2, (offset >> 16) as u8)?;
    Ok(())
}

fn nvm_exec(target: &mut Target, cmd: u8, timeout_ms: u32) -> Result<()> {
    target.mem.write8(NVM_BASE + NVM_CMD, cmd)?;
    target.mem.write8(NVM_BASE + NVM_CTRLA, CTRLA_CMDEX)?;
    let deadline = crate::time::Deadline::after(target.clock, timeout_ms);
    loop {
        if target.mem.read8(NVM_BASE + NVM_STATUS)? & STATUS_BUSY == 0 {
            return Ok(());
        }
        if deadline.expired(target.clock) {
            return Err(RustprobeError::Timeout);
        }
    }
}

pub struct XmegaFlashOps;

impl FlashOps for XmegaFlashOps {
    fn erase(&self, target: &mut Target, _region: &FlashRegion, addr: u32, len: u32) -> Result<()> {
        let mut cur = addr;
        while cur < addr + len {
            nvm_addr(target, cur)?;
            nvm_exec(target, CMD_ERASE_PAGE, FLASH_OP_TIMEOUT_MS)?;
            cur += PAGE_SIZE;
        }
        Ok(())
    }

    fn write(&self, target: &mut Target, _region: &FlashRegion, addr: u32, data: &[u8]) -> Result<()> {
        for (i, page) in data.chunks_exact(PAGE_SIZE as usize).enumerate() {
            let page_addr = addr + i as u32 * PAGE_SIZE;
            // fill the page buffer through the flash window
            target.mem.write8(NVM_BASE + NVM_CMD, CMD_LOAD_BUF)?;
            target.mem.write(page_addr, page)?;
            nvm_addr(target, page_addr)?;
            nvm_exec(target, CMD_WRITE_PAGE, FLASH_OP_TIMEOUT_MS)?;
        }
        Ok(())
    }
}

static FLASH_OPS: XmegaFlashOps = XmegaFlashOps;

pub struct XmegaDriver;

impl TargetDriver for XmegaDriver {
    fn mass_erase(&self, target: &mut Target, progress: &mut Progress) -> Option<Result<()>> {
        let result = (|| {
            target.mem.write8(NVM_BASE + NVM_CMD, CMD_CHIP_ERASE)?;
            target.mem.write8(NVM_BASE + NVM_CTRLA, CTRLA_CMDEX)?;
            let timeout = target.long_op_timeout_ms;
            let deadline = crate::time::Deadline::after(target.clock, timeout);
            loop {
                if target.mem.read8(NVM_BASE + NVM_STATUS)? & STATUS_BUSY == 0 {
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

static DRIVER: XmegaDriver = XmegaDriver;

pub fn probe(target: &mut Target) -> Result<bool> {
    if target.ident.part_id >> 8 & 0xFFFF != SIG_ATXMEGA {
        return Ok(false);
    }

    target.add_ram(RamRegion {
        start: SRAM_BASE,
        length: 0x2000,
        width: AccessWidth::Byte,
    })?;
    target.add_flash(FlashRegion {
        start: APP_BASE,
        length: 128 * 1024,
        block_size: PAGE_SIZE,
        write_size: PAGE_SIZE,
        erased_byte: 0xFF,
        ops: &FLASH_OPS,
        params: FlashParams::Nvm { regbase: NVM_BASE },
    })?;

    target.set_driver("ATxmega", &DRIVER);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flasher::Flasher;
    use crate::sim::{Controller, SimClock, SimState, SimTarget};
    use crate::target::Identity;

    struct Nvm {
        addr: [u8; 3],
        cmd: u8,
        buf: [u8; PAGE_SIZE as usize],
        busy: u32,
    }

    impl Nvm {
        fn new() -> Self {
            Nvm {
                addr: [0; 3],
                cmd: 0,
                buf: [0xFF; PAGE_SIZE as usize],
                busy: 0,
            }
        }

        fn target_addr(&self) -> u32 {
            APP_BASE
                + (self.addr[0] as u32
                    | (self.addr[1] as u32) << 8
                    | (self.addr[2] as u32) << 16)
        }
    }

    impl Controller for Nvm {
        fn read8(&mut self, _st: &mut SimState, addr: u32) -> Option<u8> {
            if addr == NVM_BASE + NVM_STATUS {
                if self.busy > 0 {
                    self.busy -= 1;
                    return Some(STATUS_BUSY);
                }
                return Some(0);
            }
            None
        }

        fn write8(&mut self, st: &mut SimState, addr: u32, value: u8) -> bool {
            if addr >= APP_BASE && addr < APP_BASE + 128 * 1024 {
                if self.cmd == CMD_LOAD_BUF {
                    self.buf[(addr % PAGE_SIZE) as usize] = value;
                    return true;
                }
                // stray writes outside buffer-load mode are dropped
                return true;
            }
            match addr {
                a if a >= NVM_BASE + NVM_ADDR0 && a < NVM_BASE + NVM_ADDR0 + 3 => {
                    self.addr[(a - NVM_BASE - NVM_ADDR0) as usize] = value;
                    true
                }
                a if a == NVM_BASE + NVM_CMD => {
                    self.cmd = value;
                    true
                }
                a if a == NVM_BASE + NVM_CTRLA => {
                    if value & CTRLA_CMDEX != 0 {
                        let page = self.target_addr() & !(PAGE_SIZE - 1);
                        match self.cmd {
                            CMD_ERASE_PAGE => st.fill(page, PAGE_SIZE, 0xFF),
                            CMD_WRITE_PAGE => {
                                for (i, b) in self.buf.iter().enumerate() {
                                    let a = page + i as u32;
                                    let old = st.get8(a).unwrap_or(0xFF);
                                    st.put8(a, old & *b);
                                }
                                self.buf = [0xFF; PAGE_SIZE as usize];
                            }
                            CMD_CHIP_ERASE => {
                                st.fill(APP_BASE, 128 * 1024, 0xFF);
                                self.busy = 600;
                            }
                            _ => {}
                        }
                        self.busy = self.busy.max(2);
                    }
                    true
                }
                _ => false,
            }
        }
    }

    fn xmega_ident() -> Identity {
        Identity {
            core_tag: "AVR",
            cpuid: 0,
            part_id: 0x001E_974C,
        }
    }

    fn sim_xmega() -> SimTarget<Nvm> {
        let mut sim = SimTarget::new(Nvm::new());
        sim.add_seg(APP_BASE, 128 * 1024, 0xFF);
        sim.add_seg(SRAM_BASE, 0x2000, 0);
        sim
    }

    #[test]
    fn page_program_round_trip() {
        let mut sim = sim_xmega();
        let data: Vec<u8> = (0..512u32).map(|i| (i * 13) as u8).collect();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, xmega_ident());
            assert!(probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            flasher.flash_erase(&mut target, APP_BASE + 0x400, 512).unwrap();
            flasher
                .flash_write(&mut target, APP_BASE + 0x400, &data)
                .unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(sim.st.read_vec(APP_BASE + 0x400, 512), data);
    }

    #[test]
    fn chip_erase_with_progress() {
        let mut sim = sim_xmega();
        sim.st.fill(APP_BASE, 128 * 1024, 0x00);
        let mut ticks = 0u32;
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, xmega_ident());
            assert!(probe(&mut target).unwrap());
            let mut sink = |_n: u32| ticks += 1;
            let mut progress = Progress::new(&mut sink);
            Flasher::mass_erase(&mut target, &mut progress).unwrap();
        }
        assert!(ticks >= 1);
        assert!(sim.st.read_vec(APP_BASE, 1024).iter().all(|b| *b == 0xFF));
    }
}
