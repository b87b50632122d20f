#![cfg_attr(not(test), no_std)]
#![allow(non_snake_case)]

pub mod accessor;
pub mod commands;
pub mod family;
pub mod flasher;
pub mod memmap;
pub mod probe;
pub mod stub;
pub mod target;
pub mod time;

#[cfg(test)]
pub(crate) mod sim;

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The RustprobeError type.
pub enum RustprobeError {
    /// The debug accessor reported a transport fault.
    CommLost,
    /// A caller-supplied address or length violates region alignment.
    UnalignedAccess,
    /// A range crosses a region boundary.
    CrossRegion,
    /// The unlock sequence failed; the controller refuses its key register.
    FlashLocked,
    /// A previous operation has not completed, or the controller is in an
    /// unexpected state.
    FlashBusy,
    /// The controller reported that a program or erase operation failed.
    ProgramError,
    /// Region lock bits forbid the requested operation.
    WriteProtected,
    /// A busy-poll exceeded its deadline.
    Timeout,
    /// The RAM stub returned a nonzero status or stopped at an unexpected
    /// address.
    StubFailed,
    /// The operation is not implemented by the owning driver.
    Unsupported,
    /// A driver registered a region that overlaps an existing one, or the
    /// region table is full.
    RegionOverlap,
}

/// The result type for rustprobe.
pub type Result<T> = core::result::Result<T, RustprobeError>;

#[rustfmt::skip]
impl fmt::Display for RustprobeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &RustprobeError::CommLost        => write!(f, "Debug transport fault"),
            &RustprobeError::UnalignedAccess => write!(f, "Unaligned address or length"),
            &RustprobeError::CrossRegion     => write!(f, "Range crosses a region boundary"),
            &RustprobeError::FlashLocked     => write!(f, "Flash controller refused the unlock sequence"),
            &RustprobeError::FlashBusy       => write!(f, "Flash controller busy or in an unexpected state"),
            &RustprobeError::ProgramError    => write!(f, "Flash program or erase failed"),
            &RustprobeError::WriteProtected  => write!(f, "Region is write protected"),
            &RustprobeError::Timeout         => write!(f, "Operation timed out"),
            &RustprobeError::StubFailed      => write!(f, "Flash stub reported failure"),
            &RustprobeError::Unsupported     => write!(f, "Operation not supported by this driver"),
            &RustprobeError::RegionOverlap   => write!(f, "Memory region overlaps an existing region"),
        }
    }
}
