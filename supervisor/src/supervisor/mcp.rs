//! Supervisor context and lifecycle
//!
//! [McpCore] owns every resource: the publication region, the MCT
//! snapshot, the parameter store, the rule engine and the partition
//! controller. Timer threads hold a weak reference into it; their lifetime
//! ends at shutdown, which joins them all.
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::sleep;
use std::time::Duration;

use anyhow::anyhow;
use nix::sys::signal::{pthread_sigmask, SigSet, Signal, SigmaskHow};

use mcp_core::error::{ErrorKind, ResultExt, TypedError, TypedResult};
use mcp_core::hypervisor::Hypervisor;
use mcp_core::shmem::SharedRegion;
use mcp_core::telemetry::{NullTelemetry, Telemetry};
use mcp_core::STATE_HALTED;

use super::config::Config;
use super::domain::DomainController;
use super::mct::{Mct, MctCell};
use super::params::Params;
use super::rules::RuleEngine;

/// Everything the supervisor owns
pub struct McpCore {
    config: Config,
    region: Arc<SharedRegion>,
    mct: Arc<MctCell>,
    params: Params,
    rules: Mutex<RuleEngine>,
    domains: DomainController,
    telemetry: Arc<dyn Telemetry>,
}

impl McpCore {
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn domains(&self) -> &DomainController {
        &self.domains
    }

    pub fn telemetry(&self) -> &Arc<dyn Telemetry> {
        &self.telemetry
    }

    /// The current MCT snapshot
    pub fn mct(&self) -> Arc<Mct> {
        self.mct.get()
    }

    fn rules_guard(&self) -> MutexGuard<RuleEngine> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the supervisor to `state`
    ///
    /// Protocol: validate, lock the publication region, disarm the rules
    /// leaving scope, commit the published triple, arm the rules entering
    /// scope, apply the state's schedule. The published write is the commit
    /// point; later failures are logged and surfaced without rollback so
    /// the system stays able to take the next command.
    pub fn set_state(&self, state: u32) -> TypedResult<()> {
        debug!("changing MCP to state {state}");

        let mct = self.mct.get();
        let (sched, leg, mode) = if state == STATE_HALTED {
            (0, 0, 0)
        } else {
            let row = mct.state_row(state).ok_or_else(|| {
                TypedError::new(ErrorKind::InvalidState, anyhow!("invalid state {state}"))
            })?;
            (row.schedule, row.flight_leg, row.op_mode)
        };

        let mut guard = self.region.lock()?;
        let current = guard.mcp_state();
        let mut result = Ok(());

        if current != STATE_HALTED {
            if let Err(e) = self.rules_guard().stop(&mct, current, state) {
                error!("error stopping rules of state {current}: {e}");
                result = Err(e);
            }
        }

        guard.set_mcp_state(state);
        guard.set_flight_leg(leg);
        guard.set_op_mode(mode);

        if state != STATE_HALTED {
            if let Err(e) = self.rules_guard().start(&mct, state, current) {
                error!("error starting rules of state {state}: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        if let Err(e) = self.domains.set_schedule(&mct, sched) {
            error!("error applying schedule {sched} of state {state}: {e}");
            if result.is_ok() {
                result = Err(e);
            }
        }

        drop(guard);
        result
    }

    pub fn get_state(&self) -> TypedResult<u32> {
        Ok(self.region.lock()?.mcp_state())
    }

    pub fn get_flight_leg(&self) -> TypedResult<u32> {
        Ok(self.region.lock()?.flight_leg())
    }

    pub fn get_op_mode(&self) -> TypedResult<u32> {
        Ok(self.region.lock()?.op_mode())
    }

    /// Changes the flight leg; valid only when (leg, current mode) names a
    /// state
    pub fn set_flight_leg(&self, leg: u32) -> TypedResult<()> {
        let mode = self.get_op_mode()?;
        let state = self.mct.get().state_for(leg, mode).ok_or_else(|| {
            TypedError::new(
                ErrorKind::NotFound,
                anyhow!("no state for flight leg {leg} and op mode {mode}"),
            )
        })?;
        self.set_state(state)
    }

    /// Changes the operating mode; valid only when (current leg, mode)
    /// names a state
    pub fn set_op_mode(&self, mode: u32) -> TypedResult<()> {
        let leg = self.get_flight_leg()?;
        let state = self.mct.get().state_for(leg, mode).ok_or_else(|| {
            TypedError::new(
                ErrorKind::NotFound,
                anyhow!("no state for flight leg {leg} and op mode {mode}"),
            )
        })?;
        self.set_state(state)
    }
}

/// Handle to a running supervisor
pub struct Mcp {
    core: Arc<McpCore>,
}

impl Mcp {
    /// Brings the supervisor up: MCT, publication region, partitions, rule
    /// engine. The initial mission state is entered by [Mcp::run].
    pub fn start(
        config: Config,
        shm_name: &str,
        hv: Arc<dyn Hypervisor>,
        telemetry: Arc<dyn Telemetry>,
    ) -> TypedResult<Self> {
        let mct = Mct::load(&config.mct)?;
        let region = Arc::new(SharedRegion::create(shm_name, mct.num_params())?);
        let mct = Arc::new(MctCell::new(mct));
        let params = Params::new(region.clone(), mct.clone(), telemetry.clone());
        let domains = DomainController::initialize(
            &mct.get(),
            hv,
            telemetry.clone(),
            config.xen_dir.clone(),
        )?;

        let core = Arc::new(McpCore {
            config,
            region,
            mct,
            params,
            rules: Mutex::new(RuleEngine::default()),
            domains,
            telemetry,
        });

        let engine = RuleEngine::build(&core.mct.get(), Arc::downgrade(&core))?;
        *core.rules_guard() = engine;

        Ok(Self { core })
    }

    pub fn core(&self) -> &Arc<McpCore> {
        &self.core
    }

    /// Enters the initial state and runs the signal loop until termination
    pub fn run(&self) -> TypedResult<()> {
        // The initial mission state is the first state in the MCT, ID 1.
        self.core.set_state(1)?;

        let set = SigSet::all();
        let mut result = Ok(());
        loop {
            let signal = set.wait().typ(ErrorKind::Io)?;
            match signal {
                Signal::SIGTERM | Signal::SIGINT => {
                    debug!("received signal {signal:?}, shutting down");
                    break;
                }
                Signal::SIGHUP => {
                    debug!("received signal {signal:?}, reloading MCT");
                    if let Err(e) = self.reload() {
                        error!("reload failed: {e}");
                    }
                }
                Signal::SIGUSR1 => match self.core.get_state() {
                    Ok(state) => info!("MCP state {state}"),
                    Err(e) => error!("error reading published state: {e}"),
                },
                Signal::SIGCHLD | Signal::SIGALRM | Signal::SIGPIPE => {
                    debug!("ignoring signal {signal:?}");
                }
                other => {
                    error!("received unexpected signal {other:?}, stopping");
                    result = Err(TypedError::new(
                        ErrorKind::InvalidArgument,
                        anyhow!("unexpected signal {other:?}"),
                    ));
                    break;
                }
            }
        }

        self.stop();
        result
    }

    /// Reload protocol: save the current state, tear the rule engine down,
    /// load a fresh MCT, rebuild, re-enter the saved state
    pub fn reload(&self) -> TypedResult<()> {
        let core = &self.core;
        let saved = core.get_state()?;

        // Joining the timer threads must happen outside the publication
        // lock: an in-flight tick may be blocked on it.
        let engine = std::mem::take(&mut *core.rules_guard());
        engine.shutdown();

        {
            let mut guard = core.region.lock()?;
            guard.set_mcp_state(STATE_HALTED);

            let mct = Mct::load(&core.config.mct)?;
            // The region cannot grow; a reload must fit the mapped array.
            if mct.num_params() > core.region.num_params() {
                return Err(TypedError::new(
                    ErrorKind::InvalidArgument,
                    anyhow!(
                        "reloaded MCT declares {} parameters but the region holds {}",
                        mct.num_params(),
                        core.region.num_params()
                    ),
                ));
            }
            core.mct.replace(mct);
            let mct = core.mct.get();

            let engine = RuleEngine::build(&mct, Arc::downgrade(core))?;
            *core.rules_guard() = engine;

            core.domains.reload_config(&mct)?;
        }

        // Resume in the state saved before the reload, after the lock is
        // released.
        core.set_state(saved)
    }

    /// Orderly shutdown: halt, stop the rules, destroy the partitions
    pub fn stop(&self) {
        if let Err(e) = self.core.set_state(STATE_HALTED) {
            error!("error entering the halted state: {e}");
        }
        let engine = std::mem::take(&mut *self.core.rules_guard());
        engine.shutdown();
        self.core.domains.shutdown();
    }
}

/// Blocks the supervised signal set for the calling thread
///
/// Must run before any worker thread spawns so children inherit the mask
/// and only the supervisor thread observes asynchronous signals.
pub fn block_signals() -> TypedResult<()> {
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), None).typ(ErrorKind::Io)
}

/// Connects to the telemetry store with bounded retry
///
/// Waits the configured delay before every attempt; a connection failure
/// is not fatal, the supervisor falls back to the null sink.
pub fn connect_telemetry<F>(config: &Config, connector: F) -> Arc<dyn Telemetry>
where
    F: Fn() -> TypedResult<Arc<dyn Telemetry>>,
{
    if !config.vms_enabled {
        return Arc::new(NullTelemetry);
    }

    for attempt in 0..=config.vms_connect_retries {
        if config.vms_connect_delay > 0.0 {
            info!(
                "waiting {} seconds before attempting to connect to the telemetry store",
                config.vms_connect_delay
            );
            sleep(Duration::from_secs_f64(config.vms_connect_delay));
        }

        info!(
            "telemetry connection attempt {} of {}",
            attempt + 1,
            config.vms_connect_retries + 1
        );
        match connector() {
            Ok(telemetry) => {
                info!("telemetry connection established");
                if let Err(e) = telemetry.increment_session() {
                    debug!("telemetry session increment failed: {e}");
                }
                return telemetry;
            }
            Err(e) => warn!("telemetry connection failed: {e}"),
        }
    }

    info!("telemetry disconnected");
    Arc::new(NullTelemetry)
}
