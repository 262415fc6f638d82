//! Telemetry capability interface
//!
//! The remote relational store receiving parameter updates, status text and
//! partition state notifications. Every use in the supervisor is
//! best-effort; a failing call must never abort the operation that made it.
use crate::error::TypedResult;

/// Partition state as published to the telemetry store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Unknown,
    Started,
    Paused,
    Error,
}

/// Operations the supervisor performs against the telemetry store
pub trait Telemetry: Send + Sync {
    fn increment_session(&self) -> TypedResult<()>;
    fn status(&self, message: &str) -> TypedResult<()>;
    fn param_update(&self, id: u32, value: f64) -> TypedResult<()>;
    fn set_vm_state(&self, name: &str, state: VmState) -> TypedResult<()>;
}

/// Telemetry sink used when the store is disabled or unreachable
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn increment_session(&self) -> TypedResult<()> {
        Ok(())
    }

    fn status(&self, _message: &str) -> TypedResult<()> {
        Ok(())
    }

    fn param_update(&self, _id: u32, _value: f64) -> TypedResult<()> {
        Ok(())
    }

    fn set_vm_state(&self, _name: &str, _state: VmState) -> TypedResult<()> {
        Ok(())
    }
}
