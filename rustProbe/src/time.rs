//! Timeout and progress plumbing for long-running flash operations.

/// Monotonic millisecond clock provided by the probe platform.
pub trait Clock {
    fn millis(&self) -> u64;
}

/// Default budget for a single erase/program busy-poll.
pub const FLASH_OP_TIMEOUT_MS: u32 = 250;

/// Default budget for whole-device operations (mass erase, option erase).
/// Drivers with slow controllers raise this per target.
pub const LONG_OP_TIMEOUT_MS: u32 = 5_000;

/// Interval between progress callbacks during long operations.
pub const PROGRESS_INTERVAL_MS: u64 = 500;

/// An absolute point on the monotonic clock.
#[derive(Clone, Copy)]
pub struct Deadline {
    end: u64,
}

impl Deadline {
    pub fn after(clock: &dyn Clock, ms: u32) -> Self {
        Deadline {
            end: clock.millis() + ms as u64,
        }
    }

    pub fn expired(&self, clock: &dyn Clock) -> bool {
        clock.millis() >= self.end
    }
}

/// Periodic progress source driven from inside busy-wait polls. Emits at
/// most one callback per [`PROGRESS_INTERVAL_MS`]; the callback argument
/// is the running tick count.
pub struct Progress<'p> {
    sink: Option<&'p mut dyn FnMut(u32)>,
    last: u64,
    count: u32,
}

impl<'p> Progress<'p> {
    pub fn new(sink: &'p mut dyn FnMut(u32)) -> Self {
        Progress {
            sink: Some(sink),
            last: 0,
            count: 0,
        }
    }

    /// A progress source that swallows all ticks.
    pub fn silent() -> Self {
        Progress {
            sink: None,
            last: 0,
            count: 0,
        }
    }

    pub fn tick(&mut self, clock: &dyn Clock) {
        let now = clock.millis();
        if now.saturating_sub(self.last) < PROGRESS_INTERVAL_MS {
            return;
        }
        self.last = now;
        self.count += 1;
        let count = self.count;
        if let Some(sink) = self.sink.as_mut() {
            sink(count);
        }
    }

    /// Ticks emitted so far.
    pub fn ticks(&self) -> u32 {
        self.count
    }
}
