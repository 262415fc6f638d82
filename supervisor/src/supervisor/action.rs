//! Rule actions
//!
//! The side effect a rule performs when its equation evaluates nonzero.
//! Arguments are parsed out of the MCT option text when the rule table is
//! built, so a malformed option is a load-time failure instead of a
//! surprise at tick time.
use anyhow::anyhow;

use mcp_core::error::{ErrorKind, TypedError, TypedResult};

use super::domain::DomState;
use super::mcp::McpCore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SetFlightLeg(u32),
    SetOpMode(u32),
    SetState(u32),
    ResetPartition(u32),
    PausePartition(u32),
    UnpausePartition(u32),
    LogMessage(String),
    SetParam(u32),
    CheckPartitions,
}

impl Action {
    /// Builds an action from its MCT code and option text
    pub fn from_code(code: u32, option: &str) -> TypedResult<Self> {
        let uint = || {
            option.trim().parse::<u32>().map_err(|e| {
                TypedError::new(
                    ErrorKind::InvalidArgument,
                    anyhow!("action {code} needs an unsigned integer option, got \"{option}\": {e}"),
                )
            })
        };

        Ok(match code {
            1 => Action::SetFlightLeg(uint()?),
            2 => Action::SetOpMode(uint()?),
            3 => Action::SetState(uint()?),
            4 => Action::ResetPartition(uint()?),
            5 => Action::PausePartition(uint()?),
            6 => Action::UnpausePartition(uint()?),
            7 => Action::LogMessage(option.to_string()),
            8 => Action::SetParam(uint()?),
            9 => Action::CheckPartitions,
            other => {
                return Err(TypedError::new(
                    ErrorKind::InvalidArgument,
                    anyhow!("invalid action code {other}"),
                ))
            }
        })
    }
}

/// Executes a fired rule's action; `value` is the equation result
pub fn execute(core: &McpCore, action: &Action, value: f64) -> TypedResult<()> {
    match action {
        Action::SetFlightLeg(leg) => core.set_flight_leg(*leg),
        Action::SetOpMode(mode) => core.set_op_mode(*mode),
        Action::SetState(state) => core.set_state(*state),
        Action::ResetPartition(id) => core.domains().set_dom_state(*id, DomState::Reset),
        Action::PausePartition(id) => core.domains().set_dom_state(*id, DomState::Paused),
        Action::UnpausePartition(id) => core.domains().set_dom_state(*id, DomState::On),
        Action::LogMessage(message) => {
            info!("LOG_MESSAGE \"{message}\"");
            if let Err(e) = core.telemetry().status(message) {
                debug!("telemetry status update failed: {e}");
            }
            Ok(())
        }
        Action::SetParam(id) => core.params().set(*id, value),
        Action::CheckPartitions => core.domains().reconcile(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_mapping() {
        assert_eq!(
            Action::from_code(1, "2").unwrap(),
            Action::SetFlightLeg(2)
        );
        assert_eq!(Action::from_code(2, "1").unwrap(), Action::SetOpMode(1));
        assert_eq!(Action::from_code(3, "4").unwrap(), Action::SetState(4));
        assert_eq!(
            Action::from_code(4, "1").unwrap(),
            Action::ResetPartition(1)
        );
        assert_eq!(
            Action::from_code(5, "1").unwrap(),
            Action::PausePartition(1)
        );
        assert_eq!(
            Action::from_code(6, "1").unwrap(),
            Action::UnpausePartition(1)
        );
        assert_eq!(
            Action::from_code(7, "engine hot").unwrap(),
            Action::LogMessage("engine hot".to_string())
        );
        assert_eq!(Action::from_code(8, " 3 ").unwrap(), Action::SetParam(3));
        assert_eq!(
            Action::from_code(9, "ignored").unwrap(),
            Action::CheckPartitions
        );
    }

    #[test]
    fn unknown_codes_are_rejected() {
        for code in [0, 10, 99] {
            let err = Action::from_code(code, "1").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
    }

    #[test]
    fn malformed_integer_options_are_rejected() {
        for option in ["", "abc", "-1", "1.5"] {
            let err = Action::from_code(1, option).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        // The log action takes its option verbatim.
        assert!(Action::from_code(7, "").is_ok());
    }
}
