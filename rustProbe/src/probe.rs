//! The probe registry. After the transport has discovered the debug
//! port and read out the core identity, each registered probe gets a
//! look at the tentative target until one claims it.
//!
//! Probes must be side-effect-free on a miss: no writes to target
//! memory, no state left behind in the driver payload. Ordering
//! matters; families that masquerade as another vendor's part id are
//! registered before the part they imitate.

use log::{debug, info};

use crate::family;
use crate::target::Target;
use crate::{Result, RustprobeError};

pub type ProbeFn = fn(&mut Target) -> Result<bool>;

pub static PROBE_TABLE: &[ProbeFn] = &[
    family::rp::probe,
    family::ch32::probe,
    family::at32::probe,
    family::stm32::probe,
    family::sam4l::probe,
    family::samd5x::probe,
    family::lmi::probe,
    family::mspm0::probe,
    family::renesas::probe,
    family::xmega::probe,
];

/// Runs the registry in order. A transport fault during a speculative
/// read is treated as a miss for that probe; any other error aborts.
pub fn probe_all(target: &mut Target) -> Result<bool> {
    for probe in PROBE_TABLE {
        match probe(target) {
            Ok(true) => {
                info!("attached driver {}", target.driver_name);
                #[cfg(feature = "defmt")]
                defmt::info!("attached driver {=str}", target.driver_name);
                return Ok(true);
            }
            Ok(false) => {}
            Err(RustprobeError::CommLost) => {
                debug!("probe faulted the transport, treating as miss");
            }
            Err(e) => return Err(e),
        }
        if target.mem.check_error() {
            debug!("clearing transport fault left by probe miss");
        }
    }
    Ok(false)
}
