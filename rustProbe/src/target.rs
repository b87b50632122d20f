//! The target object: the single rendezvous point between the debug
//! accessor, the memory map, the owning driver and the monitor command
//! tables. Created by a successful probe, destroyed by the caller after
//! `detach`.

use log::warn;

use crate::accessor::Accessor;
use crate::commands::Command;
use crate::family::DriverData;
use crate::memmap::{FlashRegion, MemRegion, MemoryMap, RamRegion};
use crate::time::{Clock, Deadline, LONG_OP_TIMEOUT_MS};
use crate::time::Progress;
use crate::{Result, RustprobeError};

pub const MAX_COMMAND_GROUPS: usize = 4;

/// Core identity read out by the transport before probing starts.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    /// CPU core tag, e.g. "M0", "M3", "M4", "M7", "A9".
    pub core_tag: &'static str,
    /// Raw CPUID word.
    pub cpuid: u32,
    /// Opaque vendor part-id word (e.g. the full DBGMCU IDCODE).
    pub part_id: u32,
}

/// Target-level driver hooks. A driver replaces the entries it cares
/// about and leaves the rest on their defaults: attach halts the core,
/// detach resumes it, reset requests a plain soft reset.
pub trait TargetDriver {
    fn attach(&self, target: &mut Target) -> Result<()> {
        target.mem.halt()
    }

    fn detach(&self, target: &mut Target) -> Result<()> {
        target.mem.resume()
    }

    fn reset(&self, target: &mut Target) -> Result<()> {
        target.mem.request_reset()
    }

    /// Post-reset hook, run only when the driver sets
    /// `extended_reset_required` (e.g. to release a CPU-hold-reset
    /// latch).
    fn extended_reset(&self, target: &mut Target) -> Result<()> {
        let _ = target;
        Ok(())
    }

    /// Whole-device erase, when the controller has one that beats the
    /// per-sector loop. `None` selects the dispatcher's region loop.
    fn mass_erase(&self, target: &mut Target, progress: &mut Progress) -> Option<Result<()>> {
        let _ = (target, progress);
        None
    }
}

struct NullDriver;

impl TargetDriver for NullDriver {}

static NULL_DRIVER: NullDriver = NullDriver;

#[derive(Clone, Copy)]
pub struct CommandGroup {
    pub label: &'static str,
    pub table: &'static [Command],
}

pub struct Target<'a> {
    pub mem: &'a mut dyn Accessor,
    pub clock: &'a dyn Clock,
    pub ident: Identity,
    /// Display name set by the successful probe.
    pub driver_name: &'static str,
    /// Driver forbids asserting the external reset line.
    pub inhibit_nrst: bool,
    /// Driver-supplied post-reset hook must run after every reset.
    pub extended_reset_required: bool,
    /// Budget for slow whole-device operations; drivers with slow
    /// controllers raise it at probe time.
    pub long_op_timeout_ms: u32,
    /// Typed driver-private payload.
    pub drv: DriverData,
    map: MemoryMap,
    driver: &'static dyn TargetDriver,
    commands: [Option<CommandGroup>; MAX_COMMAND_GROUPS],
    attached: bool,
}

impl<'a> Target<'a> {
    pub fn new(mem: &'a mut dyn Accessor, clock: &'a dyn Clock, ident: Identity) -> Self {
        Target {
            mem,
            clock,
            ident,
            driver_name: "unknown",
            inhibit_nrst: false,
            extended_reset_required: false,
            long_op_timeout_ms: LONG_OP_TIMEOUT_MS,
            drv: DriverData::None,
            map: MemoryMap::new(),
            driver: &NULL_DRIVER,
            commands: [None; MAX_COMMAND_GROUPS],
            attached: false,
        }
    }

    pub fn set_driver(&mut self, name: &'static str, driver: &'static dyn TargetDriver) {
        self.driver_name = name;
        self.driver = driver;
    }

    pub fn driver(&self) -> &'static dyn TargetDriver {
        self.driver
    }

    pub fn add_ram(&mut self, region: RamRegion) -> Result<()> {
        self.map.add(MemRegion::Ram(region))
    }

    pub fn add_flash(&mut self, region: FlashRegion) -> Result<()> {
        self.map.add(MemRegion::Flash(region))
    }

    /// Registers a driver command table under a group label.
    pub fn add_commands(&mut self, label: &'static str, table: &'static [Command]) -> Result<()> {
        for slot in self.commands.iter_mut() {
            if slot.is_none() {
                *slot = Some(CommandGroup { label, table });
                return Ok(());
            }
        }
        Err(RustprobeError::Unsupported)
    }

    pub fn command_groups(&self) -> impl Iterator<Item = &CommandGroup> {
        self.commands.iter().filter_map(|g| g.as_ref())
    }

    pub fn map(&self) -> &MemoryMap {
        &self.map
    }

    /// First RAM region of the map, the conventional stub scratch area.
    pub fn scratch_ram(&self) -> Option<RamRegion> {
        self.map.iter().find_map(|r| match r {
            MemRegion::Ram(ram) => Some(*ram),
            _ => None,
        })
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    /// Runs the driver attach hook. On failure the target is left
    /// unattached.
    pub fn attach(&mut self) -> Result<()> {
        let driver = self.driver;
        driver.attach(self)?;
        self.attached = true;
        Ok(())
    }

    pub fn detach(&mut self) -> Result<()> {
        let driver = self.driver;
        driver.detach(self)?;
        self.attached = false;
        Ok(())
    }

    /// Soft reset, followed by the driver's post-reset hook where one is
    /// required.
    pub fn reset(&mut self) -> Result<()> {
        let driver = self.driver;
        driver.reset(self)?;
        if self.extended_reset_required {
            driver.extended_reset(self)?;
        }
        Ok(())
    }

    /// Map-checked block read. Unmapped ranges are forwarded to the
    /// accessor with a warning so hidden peripheral regions stay
    /// reachable.
    pub fn mem_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.check_mapped(addr, buf.len() as u32)?;
        self.mem.read(addr, buf)
    }

    /// Map-checked block write.
    pub fn mem_write(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.check_mapped(addr, data.len() as u32)?;
        self.mem.write(addr, data)
    }

    fn check_mapped(&self, addr: u32, len: u32) -> Result<()> {
        match self.map.lookup(addr) {
            Some(MemRegion::Ram(ram)) => {
                let unit = ram.width.bytes();
                if addr % unit != 0 || len % unit != 0 {
                    return Err(RustprobeError::UnalignedAccess);
                }
            }
            Some(MemRegion::Flash(_)) => {}
            None => {
                warn!("access to unmapped address {:#010x}", addr);
            }
        }
        Ok(())
    }

    /// Polls `addr` until `value & mask == 0`, returning the final
    /// value. Expires with `Timeout` after `timeout_ms`.
    pub fn wait_clear(&mut self, addr: u32, mask: u32, timeout_ms: u32) -> Result<u32> {
        self.wait_clear_prog(addr, mask, timeout_ms, &mut Progress::silent())
    }

    /// Like [`wait_clear`](Self::wait_clear), ticking `progress` on
    /// every poll round.
    pub fn wait_clear_prog(
        &mut self,
        addr: u32,
        mask: u32,
        timeout_ms: u32,
        progress: &mut Progress,
    ) -> Result<u32> {
        let deadline = Deadline::after(self.clock, timeout_ms);
        loop {
            let value = self.mem.read32(addr)?;
            if value & mask == 0 {
                return Ok(value);
            }
            progress.tick(self.clock);
            if deadline.expired(self.clock) {
                return Err(RustprobeError::Timeout);
            }
        }
    }

    /// Polls `addr` until `value & mask == mask`.
    pub fn wait_set(&mut self, addr: u32, mask: u32, timeout_ms: u32) -> Result<u32> {
        let deadline = Deadline::after(self.clock, timeout_ms);
        loop {
            let value = self.mem.read32(addr)?;
            if value & mask == mask {
                return Ok(value);
            }
            if deadline.expired(self.clock) {
                return Err(RustprobeError::Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memmap::AccessWidth;
    use crate::sim::{SimClock, SimTarget};

    #[test]
    fn unmapped_access_is_forwarded() {
        let mut sim = SimTarget::with_ram(0x2000_0000, 0x1000);
        let clock = SimClock::share(&sim);
        let mut target = Target::new(&mut sim, &clock, crate::sim::test_ident());
        let mut buf = [0u8; 4];
        // nothing mapped yet: forwarded to the accessor
        target.mem_read(0x2000_0000, &mut buf).unwrap();
    }

    #[test]
    fn ram_width_enforced() {
        let mut sim = SimTarget::with_ram(0x2000_0000, 0x1000);
        let clock = SimClock::share(&sim);
        let mut target = Target::new(&mut sim, &clock, crate::sim::test_ident());
        target
            .add_ram(RamRegion {
                start: 0x2000_0000,
                length: 0x1000,
                width: AccessWidth::Word,
            })
            .unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(
            target.mem_read(0x2000_0000, &mut buf).unwrap_err(),
            RustprobeError::UnalignedAccess
        );
        let mut buf = [0u8; 4];
        target.mem_read(0x2000_0000, &mut buf).unwrap();
    }

    #[test]
    fn wait_clear_times_out() {
        let mut sim = SimTarget::with_ram(0x2000_0000, 0x10);
        sim.poke32(0x2000_0000, 1);
        let clock = SimClock::share(&sim);
        let mut target = Target::new(&mut sim, &clock, crate::sim::test_ident());
        assert_eq!(
            target.wait_clear(0x2000_0000, 1, 50).unwrap_err(),
            RustprobeError::Timeout
        );
    }
}
