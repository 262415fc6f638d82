//! The periodic rule engine
//!
//! Every rule gets its own timer thread, created disarmed when the engine
//! is built and driven over a control channel. While armed, the thread
//! treats each receive timeout as a tick: evaluate the compiled equation
//! against the live parameters and dispatch the action when the result is
//! not exactly zero. Ticks of one rule never overlap; ticks of distinct
//! rules run concurrently.
use std::collections::HashMap;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::anyhow;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use mcp_core::error::{ErrorKind, ResultExt, TypedError, TypedResult};

use super::action::{self, Action};
use super::cond::{self, Expr};
use super::mcp::McpCore;
use super::mct::Mct;

enum TimerCmd {
    Arm,
    Disarm,
    Shutdown,
}

struct RuleTimer {
    id: u32,
    period: Duration,
    tx: Sender<TimerCmd>,
    thread: JoinHandle<()>,
}

/// All compiled rules and their timers
#[derive(Default)]
pub struct RuleEngine {
    timers: HashMap<u32, RuleTimer>,
}

impl RuleEngine {
    /// Compiles every rule in the MCT and creates its (disarmed) timer
    ///
    /// Fails if any equation does not compile, any action code is
    /// unrecognized or any option text does not parse for its action.
    pub fn build(mct: &Mct, core: Weak<McpCore>) -> TypedResult<Self> {
        let mut timers = HashMap::new();

        for row in mct.rules() {
            let action = Action::from_code(row.action, &row.option)?;
            let expr = cond::compile(&row.equation, |id| mct.param_valid(id)).map_err(|e| {
                TypedError::new(
                    e.kind(),
                    anyhow!(
                        "equation \"{}\" of rule {} is invalid: {}",
                        row.equation,
                        row.id,
                        e.source()
                    ),
                )
            })?;

            let (tx, rx) = unbounded();
            let thread = thread::Builder::new()
                .name(format!("rule-{}", row.id))
                .spawn({
                    let core = core.clone();
                    let id = row.id;
                    let period = row.period;
                    move || timer_loop(id, period, expr, action, rx, core)
                })
                .typ(ErrorKind::ResourceExhausted)?;

            timers.insert(
                row.id,
                RuleTimer {
                    id: row.id,
                    period: row.period,
                    tx,
                    thread,
                },
            );
        }

        Ok(Self { timers })
    }

    /// Arms the rules linked to `new_state` but not to `old_state`
    pub fn start(&self, mct: &Mct, new_state: u32, old_state: u32) -> TypedResult<()> {
        for id in mct.rules_changed(new_state, old_state) {
            let timer = self.timer(id)?;
            info!(
                "state {new_state}: starting rule {id} every {:?}",
                timer.period
            );
            timer.send(TimerCmd::Arm)?;
        }
        Ok(())
    }

    /// Disarms the rules linked to `old_state` but not to `new_state`
    pub fn stop(&self, mct: &Mct, old_state: u32, new_state: u32) -> TypedResult<()> {
        for id in mct.rules_changed(old_state, new_state) {
            info!("state {old_state}: stopping rule {id}");
            self.timer(id)?.send(TimerCmd::Disarm)?;
        }
        Ok(())
    }

    fn timer(&self, id: u32) -> TypedResult<&RuleTimer> {
        self.timers.get(&id).ok_or_else(|| {
            TypedError::new(ErrorKind::NotFound, anyhow!("no timer for rule {id}"))
        })
    }

    /// Stops every timer thread and joins it
    ///
    /// Callers must not hold the publication semaphore: an in-flight tick
    /// may need it to finish evaluating.
    pub fn shutdown(mut self) {
        for timer in self.timers.values() {
            let _ = timer.tx.send(TimerCmd::Shutdown);
        }
        for (_, timer) in self.timers.drain() {
            if timer.thread.join().is_err() {
                error!("timer thread for rule {} panicked", timer.id);
            }
        }
    }
}

impl RuleTimer {
    fn send(&self, cmd: TimerCmd) -> TypedResult<()> {
        self.tx.send(cmd).map_err(|_| {
            TypedError::new(
                ErrorKind::ResourceExhausted,
                anyhow!("timer thread for rule {} is gone", self.id),
            )
        })
    }
}

fn timer_loop(
    id: u32,
    period: Duration,
    expr: Expr,
    action: Action,
    rx: Receiver<TimerCmd>,
    core: Weak<McpCore>,
) {
    let mut armed = false;
    loop {
        let cmd = if armed {
            match rx.recv_timeout(period) {
                Ok(cmd) => cmd,
                Err(RecvTimeoutError::Timeout) => {
                    tick(id, &expr, &action, &core);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            }
        };

        match cmd {
            TimerCmd::Arm => armed = true,
            TimerCmd::Disarm => armed = false,
            TimerCmd::Shutdown => break,
        }
    }
}

fn tick(id: u32, expr: &Expr, action: &Action, core: &Weak<McpCore>) {
    // The context disappears while shutdown joins us; nothing to do then.
    let Some(core) = core.upgrade() else {
        return;
    };

    let reader = core.params().reader();
    let result = expr.eval(&reader);
    trace!("rule {id} = {result}");

    if result != 0.0 {
        if let Err(e) = action::execute(&core, action, result) {
            error!("error executing action {action:?} ({result}) for rule {id}: {e}");
        }
    }
}
