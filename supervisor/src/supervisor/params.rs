//! The live parameter store
//!
//! A fixed-size id → value mapping living in the publication region.
//! Validity is backed by the MCT parameter table; every read and write is
//! serialized on the region semaphore. There is no lock-free fast path:
//! traffic is 1 Hz rule ticks and operator commands, so correctness wins.
use std::sync::Arc;

use anyhow::anyhow;

use mcp_core::error::{ErrorKind, TypedError, TypedResult};
use mcp_core::shmem::SharedRegion;
use mcp_core::telemetry::Telemetry;

use super::mct::MctCell;

pub struct Params {
    region: Arc<SharedRegion>,
    mct: Arc<MctCell>,
    telemetry: Arc<dyn Telemetry>,
}

impl Params {
    pub fn new(
        region: Arc<SharedRegion>,
        mct: Arc<MctCell>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            region,
            mct,
            telemetry,
        }
    }

    /// Whether `id` names a declared parameter
    pub fn valid(&self, id: u32) -> bool {
        self.mct.get().param_valid(id)
    }

    pub fn set(&self, id: u32, value: f64) -> TypedResult<()> {
        if !self.valid(id) {
            return Err(TypedError::new(
                ErrorKind::InvalidArgument,
                anyhow!("parameter {id} is not valid"),
            ));
        }
        {
            let mut guard = self.region.lock()?;
            // Parameter ids are 1-based; slot indices are not.
            if !guard.set_param((id - 1) as usize, value) {
                return Err(TypedError::new(
                    ErrorKind::InvalidArgument,
                    anyhow!("parameter {id} lies outside the mapped region"),
                ));
            }
        }
        // Mirror the write to the telemetry store, best-effort.
        if let Err(e) = self.telemetry.param_update(id, value) {
            debug!("telemetry update for parameter {id} failed: {e}");
        }
        Ok(())
    }

    pub fn get(&self, id: u32) -> TypedResult<f64> {
        if !self.valid(id) {
            return Err(TypedError::new(
                ErrorKind::InvalidArgument,
                anyhow!("parameter {id} is not valid"),
            ));
        }
        let guard = self.region.lock()?;
        guard.param((id - 1) as usize).ok_or_else(|| {
            TypedError::new(
                ErrorKind::InvalidArgument,
                anyhow!("parameter {id} lies outside the mapped region"),
            )
        })
    }

    /// Reader for the rule calculator; a parameter that cannot be read
    /// evaluates as 0
    pub fn reader(&self) -> impl Fn(u32) -> f64 + '_ {
        move |id| {
            self.get(id).unwrap_or_else(|e| {
                debug!("parameter {id} unreadable during evaluation: {e}");
                0.0
            })
        }
    }
}
