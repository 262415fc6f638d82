//! The Mission Configuration Table
//!
//! A declarative snapshot of everything the supervisor runs: parameters,
//! rules, states with their flight-leg/op-mode coordinates, schedules,
//! partitions and the schedule allocations. The snapshot is immutable once
//! loaded; reload replaces it wholesale through [MctCell] so no query can
//! observe a half-updated table set.
//!
//! ```rust
//! # let yaml = "
//! parameters:
//!   - { id: 1, name: fuel_level, type: double, port: sample }
//! rules:
//!   - { id: 1, name: low_fuel, period: 1s, equation: '$1 < 10', action: 7, option: low fuel }
//! states:
//!   - { id: 1, name: ascent, schedule: 1, flight_leg: 0, op_mode: 0 }
//! state_rules:
//!   - { state: 1, rule: 1 }
//! schedules:
//!   - { id: 1, name: nominal, timeslice: 10 }
//! partitions:
//!   - { id: 1, name: payload }
//! allocations:
//!   - { schedule: 1, partition: 1, weight: 256, cpucap: 50 }
//! # ";
//! # mcp_supervisor::supervisor::mct::Mct::from_str(yaml).unwrap();
//! ```
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use mcp_core::error::{ErrorKind, ResultExt, TypedResult};

use crate::problem;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Parameter {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub port: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RuleRow {
    pub id: u32,
    pub name: String,
    /// Evaluation period of the rule's timer
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    pub equation: String,
    /// Action code, resolved at rule-engine build time
    pub action: u32,
    #[serde(default)]
    pub option: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NamedId {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StateRow {
    pub id: u32,
    pub name: String,
    /// Schedule applied while the state is current; 0 means no schedule
    pub schedule: u32,
    pub flight_leg: u32,
    pub op_mode: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StateRuleLink {
    pub state: u32,
    pub rule: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScheduleRow {
    pub id: u32,
    pub name: String,
    /// Scheduler timeslice in milliseconds; 0 leaves the default
    #[serde(default)]
    pub timeslice: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PartitionRow {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AllocationRow {
    pub schedule: u32,
    pub partition: u32,
    pub weight: u32,
    pub cpucap: u32,
}

/// One loaded MCT snapshot
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Mct {
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub rules: Vec<RuleRow>,
    #[serde(default)]
    pub flight_legs: Vec<NamedId>,
    #[serde(default)]
    pub op_modes: Vec<NamedId>,
    #[serde(default)]
    pub states: Vec<StateRow>,
    #[serde(default)]
    pub state_rules: Vec<StateRuleLink>,
    #[serde(default)]
    pub schedules: Vec<ScheduleRow>,
    #[serde(default)]
    pub partitions: Vec<PartitionRow>,
    #[serde(default)]
    pub allocations: Vec<AllocationRow>,
}

impl Mct {
    pub fn load(path: &Path) -> TypedResult<Self> {
        let text = fs::read_to_string(path).typ(ErrorKind::Io)?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> TypedResult<Self> {
        let mct: Self = serde_yaml::from_str(text).typ(ErrorKind::InvalidArgument)?;
        mct.validate()?;
        Ok(mct)
    }

    fn validate(&self) -> TypedResult<()> {
        // Parameter ids must be dense in [1, numParams]; the live value of
        // parameter id lives at region slot id-1.
        let ids: Vec<u32> = self.parameters.iter().map(|p| p.id).sorted().collect();
        if ids.iter().copied().ne(1..=ids.len() as u32) {
            problem!(
                InvalidArgument,
                "parameter ids must be dense in [1, {}]",
                ids.len()
            );
        }

        for rule in &self.rules {
            if rule.id == 0 {
                problem!(InvalidArgument, "rule id 0 is reserved");
            }
            if rule.period.is_zero() {
                problem!(InvalidArgument, "rule {} has a zero period", rule.id);
            }
        }

        let mut coords = HashSet::new();
        for state in &self.states {
            if state.id == 0 {
                problem!(InvalidArgument, "state id 0 is reserved for HALTED");
            }
            if !coords.insert((state.flight_leg, state.op_mode)) {
                problem!(
                    InvalidArgument,
                    "states share the coordinates ({}, {})",
                    state.flight_leg,
                    state.op_mode
                );
            }
        }

        if !self.schedules.iter().map(|s| &s.name).all_unique() {
            problem!(InvalidArgument, "schedule names must be unique");
        }
        if !self.partitions.iter().map(|p| &p.name).all_unique() {
            problem!(InvalidArgument, "partition names must be unique");
        }
        for partition in &self.partitions {
            if partition.id == 0 {
                problem!(InvalidArgument, "partition id 0 is invalid");
            }
        }

        for link in &self.state_rules {
            if !self.states.iter().any(|s| s.id == link.state) {
                problem!(InvalidArgument, "link references unknown state {}", link.state);
            }
            if !self.rules.iter().any(|r| r.id == link.rule) {
                problem!(InvalidArgument, "link references unknown rule {}", link.rule);
            }
        }

        if !self
            .allocations
            .iter()
            .map(|a| (a.schedule, a.partition))
            .all_unique()
        {
            problem!(
                InvalidArgument,
                "schedule allocations must be unique per (schedule, partition)"
            );
        }
        for alloc in &self.allocations {
            if !self.partitions.iter().any(|p| p.id == alloc.partition) {
                problem!(
                    InvalidArgument,
                    "allocation references unknown partition {}",
                    alloc.partition
                );
            }
        }

        Ok(())
    }

    pub fn num_params(&self) -> u32 {
        self.parameters.len() as u32
    }

    pub fn param_valid(&self, id: u32) -> bool {
        self.parameters.iter().any(|p| p.id == id)
    }

    pub fn rules(&self) -> &[RuleRow] {
        &self.rules
    }

    /// Name and equation of a rule, for introspection
    pub fn rule_info(&self, id: u32) -> Option<(&str, &str)> {
        self.rules
            .iter()
            .find(|r| r.id == id)
            .map(|r| (r.name.as_str(), r.equation.as_str()))
    }

    pub fn partitions(&self) -> &[PartitionRow] {
        &self.partitions
    }

    pub fn max_partition_id(&self) -> u32 {
        self.partitions.iter().map(|p| p.id).max().unwrap_or(0)
    }

    /// The state selected by a (flight leg, op mode) coordinate pair
    pub fn state_for(&self, flight_leg: u32, op_mode: u32) -> Option<u32> {
        self.states
            .iter()
            .find(|s| s.flight_leg == flight_leg && s.op_mode == op_mode)
            .map(|s| s.id)
    }

    pub fn state_row(&self, id: u32) -> Option<&StateRow> {
        self.states.iter().find(|s| s.id == id)
    }

    /// Timeslice of a schedule; None when the schedule has no row, which is
    /// still valid for a safe state
    pub fn timeslice(&self, schedule: u32) -> Option<u32> {
        self.schedules
            .iter()
            .find(|s| s.id == schedule)
            .map(|s| s.timeslice)
    }

    pub fn allocations(&self, schedule: u32) -> impl Iterator<Item = &AllocationRow> {
        self.allocations
            .iter()
            .filter(move |a| a.schedule == schedule)
    }

    /// Rules linked to `in_state` but not to `not_in_state`
    ///
    /// This is the set difference the state machine applies on both sides
    /// of a transition.
    pub fn rules_changed(&self, in_state: u32, not_in_state: u32) -> Vec<u32> {
        let excluded: HashSet<u32> = self
            .state_rules
            .iter()
            .filter(|l| l.state == not_in_state)
            .map(|l| l.rule)
            .collect();
        self.state_rules
            .iter()
            .filter(|l| l.state == in_state && !excluded.contains(&l.rule))
            .map(|l| l.rule)
            .sorted()
            .dedup()
            .collect()
    }
}

/// Swappable handle to the current snapshot
///
/// Reload replaces the `Arc` under the lock; readers hold at most a clone
/// of the previous snapshot, never a half-updated one.
pub struct MctCell(Mutex<Arc<Mct>>);

impl MctCell {
    pub fn new(mct: Mct) -> Self {
        Self(Mutex::new(Arc::new(mct)))
    }

    pub fn get(&self) -> Arc<Mct> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, mct: Mct) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(mct);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Mct {
        Mct::from_str(
            "
parameters:
  - { id: 1, name: p_one }
  - { id: 2, name: p_two }
rules:
  - { id: 1, name: a, period: 1s, equation: '$1 > 5', action: 7, option: fired }
  - { id: 2, name: b, period: 500ms, equation: '0', action: 9, option: '' }
states:
  - { id: 1, name: ascent, schedule: 1, flight_leg: 0, op_mode: 0 }
  - { id: 2, name: orbit, schedule: 2, flight_leg: 1, op_mode: 0 }
state_rules:
  - { state: 1, rule: 1 }
  - { state: 1, rule: 2 }
  - { state: 2, rule: 2 }
schedules:
  - { id: 1, name: boost, timeslice: 10 }
  - { id: 2, name: cruise }
partitions:
  - { id: 1, name: payload }
  - { id: 2, name: comms }
allocations:
  - { schedule: 1, partition: 1, weight: 256, cpucap: 50 }
  - { schedule: 2, partition: 2, weight: 128, cpucap: 0 }
",
        )
        .unwrap()
    }

    #[test]
    fn queries() {
        let mct = sample();
        assert_eq!(mct.num_params(), 2);
        assert!(mct.param_valid(1));
        assert!(mct.param_valid(2));
        assert!(!mct.param_valid(3));
        assert_eq!(mct.max_partition_id(), 2);
        assert_eq!(mct.state_for(0, 0), Some(1));
        assert_eq!(mct.state_for(1, 0), Some(2));
        assert_eq!(mct.state_for(2, 0), None);
        assert_eq!(mct.timeslice(1), Some(10));
        assert_eq!(mct.timeslice(2), Some(0));
        assert_eq!(mct.timeslice(0), None);
        assert_eq!(mct.rule_info(1), Some(("a", "$1 > 5")));
        assert_eq!(mct.rule_info(9), None);

        let allocs: Vec<_> = mct.allocations(1).collect();
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].partition, 1);
        assert_eq!(allocs[0].weight, 256);
    }

    #[test]
    fn rule_set_difference() {
        let mct = sample();
        // Entering state 1 from state 2 only starts rule 1; rule 2 runs in both.
        assert_eq!(mct.rules_changed(1, 2), vec![1]);
        assert_eq!(mct.rules_changed(2, 1), Vec::<u32>::new());
        // Entering from HALTED starts everything linked.
        assert_eq!(mct.rules_changed(1, 0), vec![1, 2]);
        assert_eq!(mct.rules_changed(0, 1), Vec::<u32>::new());
    }

    #[test]
    fn rejects_sparse_parameter_ids() {
        let err = Mct::from_str("parameters:\n  - { id: 2, name: lonely }\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_duplicate_state_coordinates() {
        let err = Mct::from_str(
            "
states:
  - { id: 1, name: a, schedule: 0, flight_leg: 0, op_mode: 0 }
  - { id: 2, name: b, schedule: 0, flight_leg: 0, op_mode: 0 }
",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_zero_rule_period() {
        let err = Mct::from_str(
            "rules:\n  - { id: 1, name: a, period: 0s, equation: '0', action: 9 }\n",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_dangling_links() {
        let err = Mct::from_str("state_rules:\n  - { state: 1, rule: 1 }\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn cell_swaps_snapshots() {
        let cell = MctCell::new(sample());
        assert_eq!(cell.get().num_params(), 2);
        cell.replace(Mct::default());
        assert_eq!(cell.get().num_params(), 0);
    }
}
