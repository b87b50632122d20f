//! The Flash region dispatcher. Aligns, splits and routes host
//! erase/write requests onto the owning region's driver primitives, and
//! owns the per-session write buffer.

use core::mem;

use crate::target::Target;
use crate::time::Progress;
use crate::{memmap::MAX_REGIONS, Result, RustprobeError};

/// Largest `write_size` any driver registers (one controller page).
pub const MAX_WRITE_SIZE: usize = 512;

/// Write-buffer state machine: either idle, or accumulating one partial
/// write-unit for a region. `filled` counts bytes from `base`, head
/// padding included; a buffer never holds a complete unit (complete
/// units are emitted immediately).
enum WriteBuf {
    Empty,
    Partial {
        region_start: u32,
        base: u32,
        filled: usize,
        bytes: [u8; MAX_WRITE_SIZE],
    },
}

/// One host flash session. `begin_flash` prepares every Flash region,
/// `end_flash` runs every matching `done` even after failures; the
/// session result is the first non-OK outcome.
pub struct Flasher {
    active: bool,
    prepared: [bool; MAX_REGIONS],
    buf: WriteBuf,
    first_err: Option<RustprobeError>,
}

impl Flasher {
    pub const fn new() -> Self {
        Flasher {
            active: false,
            prepared: [false; MAX_REGIONS],
            buf: WriteBuf::Empty,
            first_err: None,
        }
    }

    pub fn active(&self) -> bool {
        self.active
    }

    fn latch(&mut self, res: Result<()>) -> Result<()> {
        if let Err(e) = res {
            if self.first_err.is_none() {
                self.first_err = Some(e);
            }
        }
        res
    }

    /// Walks all Flash regions and calls each one's `prepare`. On
    /// failure the already-prepared regions are rolled back with `done`
    /// and the error is returned.
    pub fn begin_flash(&mut self, target: &mut Target) -> Result<()> {
        if self.active {
            return Err(RustprobeError::FlashBusy);
        }
        self.first_err = None;
        self.buf = WriteBuf::Empty;
        self.prepared = [false; MAX_REGIONS];

        let count = target.map().flash_count();
        for i in 0..count {
            let region = match target.map().flash_region(i) {
                Some(r) => r,
                None => break,
            };
            match region.ops.prepare(target, &region) {
                Ok(()) => self.prepared[i] = true,
                Err(e) => {
                    for j in (0..i).rev() {
                        if !self.prepared[j] {
                            continue;
                        }
                        if let Some(r) = target.map().flash_region(j) {
                            let _ = r.ops.done(target, &r);
                        }
                        self.prepared[j] = false;
                    }
                    return Err(e);
                }
            }
        }
        self.active = true;
        Ok(())
    }

    /// Erases at least `[addr, addr + len)`, rounding the head down and
    /// the tail up to `block_size` boundaries. The range must lie within
    /// a single region, except where regions are registered back to back
    /// across a bank split.
    pub fn flash_erase(&mut self, target: &mut Target, addr: u32, len: u32) -> Result<()> {
        if !self.active {
            return Err(RustprobeError::FlashBusy);
        }
        if len == 0 {
            // tolerate host over-alignment
            return Ok(());
        }
        let res = self.erase_inner(target, addr, len);
        self.latch(res)
    }

    fn erase_inner(&mut self, target: &mut Target, addr: u32, len: u32) -> Result<()> {
        // pending bytes must land before their blocks are erased again
        self.flush(target)?;

        let (_, mut region) = target
            .map()
            .flash_at(addr)
            .ok_or(RustprobeError::CrossRegion)?;
        let end = addr + len;

        // validate the whole range up front: it must be covered by one
        // region, or by regions registered back to back
        let mut check = region;
        while check.end() < end {
            check = target
                .map()
                .flash_starting_at(check.end())
                .ok_or(RustprobeError::CrossRegion)?
                .1;
        }

        let mut cur = addr - addr % region.block_size;
        loop {
            let aligned_end = match end.checked_add(region.block_size - 1) {
                Some(v) => v - v % region.block_size,
                None => region.end(),
            };
            let span_end = region.end().min(aligned_end);
            region.ops.erase(target, &region, cur, span_end - cur)?;
            if span_end >= end {
                return Ok(());
            }
            // continue into the adjacent bank
            region = target
                .map()
                .flash_starting_at(span_end)
                .ok_or(RustprobeError::CrossRegion)?
                .1;
            cur = span_end;
        }
    }

    /// Buffered write. Contiguous calls accumulate into one write-unit;
    /// complete units are emitted immediately, aligned multiples stream
    /// straight through to the driver.
    pub fn flash_write(&mut self, target: &mut Target, addr: u32, data: &[u8]) -> Result<()> {
        if !self.active {
            return Err(RustprobeError::FlashBusy);
        }
        let res = self.write_inner(target, addr, data);
        self.latch(res)
    }

    fn write_inner(&mut self, target: &mut Target, addr: u32, data: &[u8]) -> Result<()> {
        let mut addr = addr;
        let mut data = data;
        while !data.is_empty() {
            let (_, region) = target
                .map()
                .flash_at(addr)
                .ok_or(RustprobeError::CrossRegion)?;
            let ws = region.write_size as usize;

            let contiguous = match &self.buf {
                WriteBuf::Partial {
                    region_start,
                    base,
                    filled,
                    ..
                } => *region_start == region.start && addr == *base + *filled as u32,
                WriteBuf::Empty => true,
            };
            if !contiguous {
                self.flush(target)?;
            }

            if let WriteBuf::Empty = self.buf {
                if addr % ws as u32 == 0 && data.len() >= ws {
                    // stream whole units without copying
                    let mut span = data.len().min((region.end() - addr) as usize);
                    span -= span % ws;
                    if span > 0 {
                        region.ops.write(target, &region, addr, &data[..span])?;
                        addr += span as u32;
                        data = &data[span..];
                        continue;
                    }
                }
                // open a partial unit, head-padded with the erased value
                let base = addr - addr % ws as u32;
                let mut bytes = [0u8; MAX_WRITE_SIZE];
                for b in bytes[..ws].iter_mut() {
                    *b = region.erased_byte;
                }
                let head = (addr - base) as usize;
                let take = (ws - head).min(data.len());
                bytes[head..head + take].copy_from_slice(&data[..take]);
                addr += take as u32;
                data = &data[take..];
                self.buf = WriteBuf::Partial {
                    region_start: region.start,
                    base,
                    filled: head + take,
                    bytes,
                };
            } else if let WriteBuf::Partial { filled, bytes, .. } = &mut self.buf {
                let take = (ws - *filled).min(data.len());
                bytes[*filled..*filled + take].copy_from_slice(&data[..take]);
                *filled += take;
                addr += take as u32;
                data = &data[take..];
            }

            let full = match &self.buf {
                WriteBuf::Partial { filled, .. } => *filled == ws,
                WriteBuf::Empty => false,
            };
            if full {
                if let WriteBuf::Partial { base, bytes, .. } =
                    mem::replace(&mut self.buf, WriteBuf::Empty)
                {
                    region.ops.write(target, &region, base, &bytes[..ws])?;
                }
            }
        }
        Ok(())
    }

    /// Emits the pending partial unit, tail-padded with the region's
    /// erased value. Padding never extends past the final write-unit.
    fn flush(&mut self, target: &mut Target) -> Result<()> {
        if let WriteBuf::Partial {
            base,
            filled,
            mut bytes,
            ..
        } = mem::replace(&mut self.buf, WriteBuf::Empty)
        {
            let (_, region) = target
                .map()
                .flash_at(base)
                .ok_or(RustprobeError::CrossRegion)?;
            let ws = region.write_size as usize;
            for b in bytes[filled..ws].iter_mut() {
                *b = region.erased_byte;
            }
            region.ops.write(target, &region, base, &bytes[..ws])?;
        }
        Ok(())
    }

    /// Flushes the pending buffer, then runs `done` on every prepared
    /// region, even after failures, so the controller ends up locked.
    pub fn end_flash(&mut self, target: &mut Target) -> Result<()> {
        if !self.active {
            return Err(RustprobeError::FlashBusy);
        }
        let res = self.flush(target);
        let _ = self.latch(res);
        for i in 0..MAX_REGIONS {
            if !self.prepared[i] {
                continue;
            }
            if let Some(region) = target.map().flash_region(i) {
                let res = region.ops.done(target, &region);
                let _ = self.latch(res);
            }
            self.prepared[i] = false;
        }
        self.active = false;
        match self.first_err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whole-device erase: the driver hook when it has one, otherwise a
    /// session erasing every Flash region block by block.
    pub fn mass_erase(target: &mut Target, progress: &mut Progress) -> Result<()> {
        let driver = target.driver();
        if let Some(res) = driver.mass_erase(target, progress) {
            return res;
        }

        let mut flasher = Flasher::new();
        flasher.begin_flash(target)?;
        let count = target.map().flash_count();
        'regions: for i in 0..count {
            let region = match target.map().flash_region(i) {
                Some(r) => r,
                None => break,
            };
            let mut addr = region.start;
            while addr < region.end() {
                if flasher.flash_erase(target, addr, region.block_size).is_err() {
                    break 'regions;
                }
                progress.tick(target.clock);
                addr += region.block_size;
            }
        }
        flasher.end_flash(target)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::family::stm32::regs::{FLASHSIZE_R, FLASH_BASE, OPTION_BASE};
    use crate::family::stm32::tests::{f103_ident, sim_f103};
    use crate::family::FlashParams;
    use crate::memmap::{FlashOps, FlashRegion};
    use crate::sim::SimClock;
    use crate::target::Target;

    #[test]
    fn single_block_session_matches_expected_bytes() {
        // one 2 KiB block, write size 4: partial words pad with 0xFF
        let mut sim = sim_f103();
        sim.poke16(FLASHSIZE_R, 2);
        sim.st.fill(FLASH_BASE, 2048, 0x00);
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            flasher.flash_erase(&mut target, FLASH_BASE, 2048).unwrap();
            flasher
                .flash_write(&mut target, FLASH_BASE, &[0x12, 0x34, 0x56, 0x78])
                .unwrap();
            flasher
                .flash_write(&mut target, FLASH_BASE + 4, &[0xFF; 4])
                .unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(sim.st.read_vec(FLASH_BASE, 4), vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(sim.st.read_vec(FLASH_BASE + 4, 4), vec![0xFF; 4]);
        assert!(sim
            .st
            .read_vec(FLASH_BASE + 8, 2040)
            .iter()
            .all(|b| *b == 0xFF));
    }

    #[test]
    fn one_prepare_one_done_per_session() {
        let mut sim = sim_f103();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            assert_eq!(
                flasher.begin_flash(&mut target).unwrap_err(),
                RustprobeError::FlashBusy
            );
            flasher.flash_erase(&mut target, FLASH_BASE, 2048).unwrap();
            flasher
                .flash_write(&mut target, FLASH_BASE, &[0xA5; 8])
                .unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(sim.ctrl.banks[0].unlocks, 1);
        assert_eq!(sim.ctrl.banks[0].locks, 1);
        assert!(sim.ctrl.banks[0].locked);
    }

    #[test]
    fn erase_write_read_round_trip() {
        crate::sim::init_test_logging();
        let mut sim = sim_f103();
        sim.st.fill(FLASH_BASE, 0x4_0000, 0x00);
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            flasher
                .flash_erase(&mut target, FLASH_BASE + 0x2000, 4096)
                .unwrap();
            flasher
                .flash_write(&mut target, FLASH_BASE + 0x2000, &data)
                .unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(sim.st.read_vec(FLASH_BASE + 0x2000, 4096), data);
    }

    #[test]
    fn buffered_writes_concatenate_regardless_of_call_sizes() {
        let mut sim = sim_f103();
        let data: Vec<u8> = (0..32u32).map(|i| i as u8 ^ 0xC3).collect();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            flasher.flash_erase(&mut target, FLASH_BASE, 2048).unwrap();
            // chop the image into ragged pieces, all contiguous
            let mut offset = 0usize;
            for chunk in [1usize, 2, 1, 5, 3, 8, 2, 7, 3].iter() {
                flasher
                    .flash_write(
                        &mut target,
                        FLASH_BASE + offset as u32,
                        &data[offset..offset + chunk],
                    )
                    .unwrap();
                offset += chunk;
            }
            flasher
                .flash_write(&mut target, FLASH_BASE + offset as u32, &data[offset..])
                .unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(sim.st.read_vec(FLASH_BASE, 32), data);
    }

    #[test]
    fn partial_final_unit_reads_erased() {
        let mut sim = sim_f103();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            flasher.flash_erase(&mut target, FLASH_BASE, 2048).unwrap();
            flasher
                .flash_write(&mut target, FLASH_BASE, &[0x11, 0x22])
                .unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(
            sim.st.read_vec(FLASH_BASE, 4),
            vec![0x11, 0x22, 0xFF, 0xFF]
        );
    }

    #[test]
    fn timeout_still_relocks_on_end() {
        let mut sim = sim_f103();
        sim.ctrl.busy_reads = 10_000;
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            assert_eq!(
                flasher.flash_erase(&mut target, FLASH_BASE, 2048).unwrap_err(),
                RustprobeError::Timeout
            );
            assert_eq!(
                flasher.end_flash(&mut target).unwrap_err(),
                RustprobeError::Timeout
            );
        }
        assert!(sim.ctrl.banks[0].locked);
    }

    #[test]
    fn zero_length_erase_is_ignored() {
        let mut sim = sim_f103();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            flasher.flash_erase(&mut target, FLASH_BASE, 0).unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(sim.ctrl.banks[0].erased_blocks, 0);
    }

    #[test]
    fn disjoint_regions_reject_spanning_erase() {
        let mut sim = sim_f103();
        sim.poke16(FLASHSIZE_R, 2);
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            assert_eq!(
                flasher.flash_erase(&mut target, FLASH_BASE, 4096).unwrap_err(),
                RustprobeError::CrossRegion
            );
            let _ = flasher.end_flash(&mut target);
        }
        // nothing was erased before the range was rejected
        assert_eq!(sim.ctrl.banks[0].erased_blocks, 0);
    }

    #[test]
    fn writes_outside_flash_are_rejected() {
        let mut sim = sim_f103();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            assert_eq!(
                flasher
                    .flash_write(&mut target, 0x2000_0000, &[0u8; 4])
                    .unwrap_err(),
                RustprobeError::CrossRegion
            );
            let _ = flasher.end_flash(&mut target);
        }
    }

    #[test]
    fn flush_happens_before_overlapping_erase() {
        let mut sim = sim_f103();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            flasher.flash_erase(&mut target, FLASH_BASE, 2048).unwrap();
            // leaves two bytes pending in the write buffer
            flasher
                .flash_write(&mut target, FLASH_BASE, &[0xAA, 0xBB])
                .unwrap();
            // the pending bytes land before the block is erased again
            flasher.flash_erase(&mut target, FLASH_BASE, 2048).unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(sim.st.read_vec(FLASH_BASE, 2), vec![0xFF, 0xFF]);
        assert_eq!(sim.ctrl.banks[0].erased_blocks, 2);
    }

    static PREPARES: AtomicUsize = AtomicUsize::new(0);
    static DONES: AtomicUsize = AtomicUsize::new(0);

    struct CountingOps {
        fail_on: usize,
    }

    impl FlashOps for CountingOps {
        fn prepare(&self, _target: &mut Target, _region: &FlashRegion) -> crate::Result<()> {
            let n = PREPARES.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_on {
                return Err(RustprobeError::FlashBusy);
            }
            Ok(())
        }

        fn erase(
            &self,
            _target: &mut Target,
            _region: &FlashRegion,
            _addr: u32,
            _len: u32,
        ) -> crate::Result<()> {
            Ok(())
        }

        fn write(
            &self,
            _target: &mut Target,
            _region: &FlashRegion,
            _addr: u32,
            _data: &[u8],
        ) -> crate::Result<()> {
            Ok(())
        }

        fn done(&self, _target: &mut Target, _region: &FlashRegion) -> crate::Result<()> {
            DONES.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    static FAIL_SECOND: CountingOps = CountingOps { fail_on: 2 };

    #[test]
    fn begin_failure_rolls_back_prepared_regions() {
        let mut sim = crate::sim::SimTarget::with_ram(0x2000_0000, 0x1000);
        let clock = SimClock::share(&sim);
        let mut target = Target::new(&mut sim, &clock, crate::sim::test_ident());
        for i in 0..2u32 {
            target
                .add_flash(FlashRegion {
                    start: 0x0800_0000 + i * 0x1000,
                    length: 0x1000,
                    block_size: 0x400,
                    write_size: 4,
                    erased_byte: 0xFF,
                    ops: &FAIL_SECOND,
                    params: FlashParams::None,
                })
                .unwrap();
        }
        PREPARES.store(0, Ordering::SeqCst);
        DONES.store(0, Ordering::SeqCst);
        let mut flasher = Flasher::new();
        assert_eq!(
            flasher.begin_flash(&mut target).unwrap_err(),
            RustprobeError::FlashBusy
        );
        assert!(!flasher.active());
        // the first region was prepared, so it was rolled back
        assert_eq!(PREPARES.load(Ordering::SeqCst), 2);
        assert_eq!(DONES.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn option_region_reachable_through_dispatcher() {
        let mut sim = sim_f103();
        {
            let clock = SimClock::share(&sim);
            let mut target = Target::new(&mut sim, &clock, f103_ident());
            assert!(crate::family::stm32::probe(&mut target).unwrap());
            let mut flasher = Flasher::new();
            flasher.begin_flash(&mut target).unwrap();
            flasher.flash_erase(&mut target, OPTION_BASE, 16).unwrap();
            flasher
                .flash_write(&mut target, OPTION_BASE, &[0x34, 0x12])
                .unwrap();
            flasher.end_flash(&mut target).unwrap();
        }
        assert_eq!(sim.st.get16(OPTION_BASE).unwrap(), 0x1234);
    }
}
