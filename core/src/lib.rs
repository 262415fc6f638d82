#[macro_use]
extern crate log;

pub mod error;
pub mod hypervisor;
pub mod shmem;
pub mod telemetry;

/// Synthetic published state meaning "no mission state active".
///
/// It has no row in the MCT; while it is current no rules are armed and
/// schedule 0 (no schedule) is applied to the partitions.
pub const STATE_HALTED: u32 = 0;
