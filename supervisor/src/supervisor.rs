//! The mission-control supervisor
//!
//! The supervisor loads the Mission Configuration Table, publishes its
//! operating state through the shared region, evaluates the periodic rules
//! of the current state and drives guest partitions through the hypervisor
//! capability according to the per-state schedules.
pub mod action;
pub mod cond;
pub mod config;
pub mod domain;
pub mod mcp;
pub mod mct;
pub mod params;
pub mod rules;
pub mod xl;

use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;

use mcp_core::error::{ErrorKind, TypedError, TypedResult};

use self::config::Config;
use self::mcp::Mcp;
use self::xl::XlHypervisor;

/// Loads the configuration and runs the supervisor until shutdown
pub fn run_supervisor(config_path: &Path, shm_name: &str) -> TypedResult<()> {
    // Block the supervised signal set before any worker thread exists so
    // children inherit the mask and only this thread observes signals.
    mcp::block_signals()?;

    let config = Config::load_or_default(config_path);

    // The concrete relational driver is an external collaborator; a
    // deployment links one in by replacing this connector.
    let telemetry = mcp::connect_telemetry(&config, || {
        Err(TypedError::new(
            ErrorKind::NotFound,
            anyhow!("no telemetry driver linked"),
        ))
    });

    let hv = Arc::new(XlHypervisor::new(config.xl_bin.clone()));
    let mcp = Mcp::start(config, shm_name, hv, telemetry)?;
    mcp.run()
}
