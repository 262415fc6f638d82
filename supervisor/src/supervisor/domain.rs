//! The partition controller
//!
//! Tracks one state-machine record per configured partition, applies the
//! per-state schedules and reconciles the records with what the hypervisor
//! actually reports. One mutex serializes all table access; it is held
//! across the hypervisor subprocess wait, which bounds external calls to
//! one at a time and keeps reconciliation from interleaving with explicit
//! transitions.
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;

use mcp_core::error::{ErrorKind, TypedError, TypedResult};
use mcp_core::hypervisor::{state_from_flags, DomainInfo, HvState, Hypervisor};
use mcp_core::telemetry::{Telemetry, VmState};

use super::mct::Mct;

/// Recorded lifecycle state of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomState {
    Off,
    On,
    /// Like Off, but requested by an operator or rule rather than by a
    /// schedule change; the two must not be collapsed
    Paused,
    Unpaused,
    Reset,
    /// The partition has been (or is being) destroyed
    Delete,
    /// The partition still needs to be created
    Init,
}

#[derive(Debug, Clone)]
struct DomInfo {
    name: Option<String>,
    state: DomState,
    hv_id: Option<u32>,
    hv_state: HvState,
}

impl DomInfo {
    fn tombstone() -> Self {
        Self {
            name: None,
            state: DomState::Delete,
            hv_id: None,
            hv_state: HvState::Unknown,
        }
    }
}

struct DomTable {
    /// Index id-1 over [1, max_id]; gaps hold Delete tombstones
    doms: Vec<DomInfo>,
    sched: u32,
}

pub struct DomainController {
    table: Mutex<DomTable>,
    hv: Arc<dyn Hypervisor>,
    telemetry: Arc<dyn Telemetry>,
    xen_dir: PathBuf,
}

/// Maps an observed hypervisor state to the published partition state
///
/// A blocked domain is waiting on I/O or has nothing to do; it still counts
/// as started and likely operating normally.
pub fn vm_state_for(state: HvState) -> VmState {
    match state {
        HvState::Unknown | HvState::Dying | HvState::Shutdown => VmState::Error,
        HvState::Paused => VmState::Paused,
        HvState::Blocked | HvState::Running => VmState::Started,
    }
}

impl DomainController {
    /// Opens the hypervisor and creates every configured partition paused
    pub fn initialize(
        mct: &Mct,
        hv: Arc<dyn Hypervisor>,
        telemetry: Arc<dyn Telemetry>,
        xen_dir: PathBuf,
    ) -> TypedResult<Self> {
        hv.open()?;

        let max = mct.max_partition_id();
        let mut doms = vec![DomInfo::tombstone(); max as usize];
        for row in mct.partitions() {
            let slot = &mut doms[(row.id - 1) as usize];
            slot.state = DomState::Init;
            slot.name = Some(row.name.clone());
        }

        let ctrl = Self {
            table: Mutex::new(DomTable { doms, sched: 0 }),
            hv,
            telemetry,
            xen_dir,
        };

        {
            let mut table = ctrl.lock_table();
            for id in 1..=max {
                if table.doms[(id - 1) as usize].state != DomState::Delete {
                    ctrl.transition(&mut table, id, DomState::Off)?;
                }
            }
        }

        Ok(ctrl)
    }

    fn lock_table(&self) -> MutexGuard<DomTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Requests a partition state change
    pub fn set_dom_state(&self, id: u32, state: DomState) -> TypedResult<()> {
        let mut table = self.lock_table();
        self.transition(&mut table, id, state)
    }

    pub fn dom_state(&self, id: u32) -> TypedResult<DomState> {
        let table = self.lock_table();
        let index = Self::index(&table, id)?;
        Ok(table.doms[index].state)
    }

    /// The schedule currently applied to the partitions
    pub fn schedule(&self) -> u32 {
        self.lock_table().sched
    }

    fn index(table: &DomTable, id: u32) -> TypedResult<usize> {
        if id >= 1 && (id as usize) <= table.doms.len() {
            Ok((id - 1) as usize)
        } else {
            Err(TypedError::new(
                ErrorKind::InvalidArgument,
                anyhow!("invalid partition id {id}"),
            ))
        }
    }

    /// Performs one state transition with the table lock held
    ///
    /// The recorded state is updated before the hypervisor call; drift from
    /// a failed call is corrected by reconciliation.
    fn transition(&self, table: &mut DomTable, id: u32, new: DomState) -> TypedResult<()> {
        let index = Self::index(table, id)?;
        let current = table.doms[index].state;
        if new == current {
            return Ok(());
        }

        info!("changing partition {id} state {current:?} -> {new:?}");

        let name = table.doms[index].name.clone().ok_or_else(|| {
            TypedError::new(
                ErrorKind::InvalidArgument,
                anyhow!("partition {id} has no name"),
            )
        })?;

        match (current, new) {
            (DomState::Init, DomState::Off) => {
                // New partitions are created paused.
                table.doms[index].state = new;
                let config = self.xen_dir.join(format!("mcp{name}.cfg"));
                self.hv.create(&config)?;
                // Mark the partition started right away; the record is
                // corrected on the next reconciliation if the start failed.
                if let Err(e) = self.telemetry.set_vm_state(&name, VmState::Started) {
                    debug!("telemetry state update for {name} failed: {e}");
                }
                table.doms[index].hv_state = HvState::Running;
            }
            (_, DomState::Delete) => {
                table.doms[index].state = new;
                self.hv.destroy(&name)?;
            }
            (DomState::Off, DomState::On) => {
                // Partitions in the OFF state sit paused; release it.
                table.doms[index].state = new;
                self.hv.unpause(&name)?;
            }
            (DomState::On, DomState::Off) => {
                table.doms[index].state = new;
                self.hv.pause(&name)?;
            }
            (DomState::On, DomState::Paused) => {
                table.doms[index].state = new;
                self.hv.pause(&name)?;
            }
            (DomState::On, DomState::Reset) => {
                // A reset collapses straight back to ON.
                self.hv.reboot(&name)?;
            }
            (DomState::Paused, DomState::Unpaused) => {
                table.doms[index].state = new;
                self.hv.unpause(&name)?;
            }
            (current, new) => {
                return Err(TypedError::new(
                    ErrorKind::InvalidState,
                    anyhow!("invalid state transition requested for partition {id}: {current:?} -> {new:?}"),
                ))
            }
        }

        Ok(())
    }

    /// Applies a schedule: programs the scheduler and moves every partition
    /// to its target state
    pub fn set_schedule(&self, mct: &Mct, sched: u32) -> TypedResult<()> {
        let mut table = self.lock_table();
        if table.sched == sched {
            return Ok(());
        }
        debug!("changing to schedule {sched}");
        table.sched = sched;

        // A schedule with no row is still valid: it is the safe "no
        // schedule" case and leaves the scheduler defaults alone.
        let timeslice = mct.timeslice(sched).unwrap_or(0);
        if timeslice != 0 {
            self.hv.set_sched_timeslice(timeslice)?;
        }

        // Every partition defaults to OFF unless the schedule allocates it.
        let mut targets: Vec<DomState> = table
            .doms
            .iter()
            .map(|dom| {
                if dom.state == DomState::Delete {
                    DomState::Delete
                } else {
                    DomState::Off
                }
            })
            .collect();
        let mut weight = vec![0u32; table.doms.len()];
        let mut cap = vec![0u32; table.doms.len()];
        for alloc in mct.allocations(sched) {
            let index = (alloc.partition - 1) as usize;
            if index >= targets.len() {
                warn!(
                    "allocation for partition {} is outside the partition table",
                    alloc.partition
                );
                continue;
            }
            targets[index] = DomState::On;
            weight[index] = alloc.weight;
            cap[index] = alloc.cpucap;
        }

        for (index, target) in targets.iter().enumerate() {
            let id = (index + 1) as u32;
            // Program the per-partition scheduler parameters first, when any
            // were specified.
            if weight[index] != 0 && cap[index] != 0 {
                if let Some(name) = table.doms[index].name.clone() {
                    debug!(
                        "setting schedule parameters for partition {id}: name = \"{name}\", \
                         weight = {}, cpu cap = {}",
                        weight[index], cap[index]
                    );
                    self.hv.set_sched_weight_cap(&name, weight[index], cap[index])?;
                }
            }
            self.transition(&mut table, id, *target)?;
        }

        Ok(())
    }

    /// Aligns the recorded partition states with the hypervisor's view and
    /// publishes changes to the telemetry store
    pub fn reconcile(&self) -> TypedResult<()> {
        let mut table = self.lock_table();

        // Other domains than ours may exist, so ask for everything.
        let infos = self.hv.get_info_list(0, 1024)?;

        for index in 0..table.doms.len() {
            if table.doms[index].state == DomState::Delete {
                continue;
            }
            let Some(name) = table.doms[index].name.clone() else {
                warn!(
                    "unable to retrieve state, no name set for partition {}",
                    index + 1
                );
                continue;
            };

            let previous = vm_state_for(table.doms[index].hv_state);
            let observed = self.observe(&mut table.doms[index], &name, &infos);
            let published = vm_state_for(observed);

            if published != previous {
                // Telemetry problems must not abort reconciliation.
                if let Err(e) = self.telemetry.set_vm_state(&name, published) {
                    debug!("telemetry state update for {name} failed: {e}");
                }
            }
            table.doms[index].hv_state = observed;
        }

        Ok(())
    }

    /// Matches a partition to a hypervisor domain, by cached id first and
    /// by name otherwise; a name match caches the discovered id
    fn observe(&self, dom: &mut DomInfo, name: &str, infos: &[DomainInfo]) -> HvState {
        if let Some(id) = dom.hv_id {
            if let Some(info) = infos.iter().find(|i| i.id == id) {
                return state_from_flags(info.flags);
            }
        }
        for info in infos {
            if self.hv.name_for_id(info.id).as_deref() == Some(name) {
                dom.hv_id = Some(info.id);
                return state_from_flags(info.flags);
            }
        }
        warn!("unable to find a matching domain for partition \"{name}\"");
        HvState::Unknown
    }

    /// Applies a reloaded MCT to the partition table
    ///
    /// Partitions present before and after keep their state; partitions
    /// only in the old table are destroyed; partitions only in the new one
    /// are created. The schedule is cleared so the next set_schedule call
    /// reprograms everything.
    pub fn reload_config(&self, mct: &Mct) -> TypedResult<()> {
        let mut table = self.lock_table();

        let new_max = mct.max_partition_id() as usize;
        if new_max > table.doms.len() {
            table.doms.resize(new_max, DomInfo::tombstone());
        }

        let mut targets = vec![DomState::Delete; table.doms.len()];
        for row in mct.partitions() {
            let index = (row.id - 1) as usize;
            targets[index] = DomState::Init;
            // A slot that never had a name takes it from the new table.
            if table.doms[index].name.is_none() {
                table.doms[index].name = Some(row.name.clone());
            }
        }

        for index in 0..table.doms.len() {
            if targets[index] == DomState::Init && table.doms[index].state != DomState::Delete {
                // Survivor: keep its current state.
                targets[index] = table.doms[index].state;
            }
        }

        for index in 0..table.doms.len() {
            let id = (index + 1) as u32;
            debug!("MCT reload: partition {id} target {:?}", targets[index]);
            match targets[index] {
                DomState::Delete => self.transition(&mut table, id, DomState::Delete)?,
                DomState::Init => {
                    table.doms[index].state = DomState::Init;
                    self.transition(&mut table, id, DomState::Off)?;
                }
                _ => {}
            }
        }

        table.sched = 0;
        Ok(())
    }

    /// Raw domain listing from the hypervisor, for operator introspection
    pub fn status(&self) -> TypedResult<String> {
        self.hv.list()
    }

    /// Destroys every partition and closes the hypervisor
    pub fn shutdown(&self) {
        let mut table = self.lock_table();
        debug!("stopping {} partitions", table.doms.len());
        for index in 0..table.doms.len() {
            let id = (index + 1) as u32;
            if let Err(e) = self.transition(&mut table, id, DomState::Delete) {
                error!("error deleting partition {id}: {e}");
            }
        }
        drop(table);
        self.hv.close();
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    use mcp_core::hypervisor::flags;
    use mcp_core::telemetry::NullTelemetry;

    use super::*;
    use crate::supervisor::mct::Mct;

    /// Records every verb; the info list is scripted per test
    #[derive(Default)]
    struct RecordingHv {
        calls: StdMutex<Vec<String>>,
        infos: StdMutex<Vec<(String, DomainInfo)>>,
    }

    impl RecordingHv {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn set_infos(&self, infos: Vec<(String, DomainInfo)>) {
            *self.infos.lock().unwrap() = infos;
        }
    }

    impl Hypervisor for RecordingHv {
        fn open(&self) -> TypedResult<()> {
            self.push("open".into());
            Ok(())
        }

        fn close(&self) {
            self.push("close".into());
        }

        fn create(&self, config: &Path) -> TypedResult<()> {
            self.push(format!("create -qp {}", config.display()));
            Ok(())
        }

        fn destroy(&self, name: &str) -> TypedResult<()> {
            self.push(format!("destroy {name}"));
            Ok(())
        }

        fn pause(&self, name: &str) -> TypedResult<()> {
            self.push(format!("pause {name}"));
            Ok(())
        }

        fn unpause(&self, name: &str) -> TypedResult<()> {
            self.push(format!("unpause {name}"));
            Ok(())
        }

        fn reboot(&self, name: &str) -> TypedResult<()> {
            self.push(format!("reboot {name}"));
            Ok(())
        }

        fn set_sched_timeslice(&self, timeslice_ms: u32) -> TypedResult<()> {
            self.push(format!("sched-timeslice {timeslice_ms}"));
            Ok(())
        }

        fn set_sched_weight_cap(&self, name: &str, weight: u32, cap: u32) -> TypedResult<()> {
            self.push(format!("sched-params {name} {weight} {cap}"));
            Ok(())
        }

        fn list(&self) -> TypedResult<String> {
            Ok("listing".to_string())
        }

        fn get_info_list(&self, _first: u32, _count: u32) -> TypedResult<Vec<DomainInfo>> {
            Ok(self.infos.lock().unwrap().iter().map(|(_, i)| *i).collect())
        }

        fn name_for_id(&self, id: u32) -> Option<String> {
            self.infos
                .lock()
                .unwrap()
                .iter()
                .find(|(_, i)| i.id == id)
                .map(|(name, _)| name.clone())
        }
    }

    /// Records set_vm_state calls
    #[derive(Default)]
    struct RecordingVms {
        states: StdMutex<Vec<(String, VmState)>>,
    }

    impl Telemetry for RecordingVms {
        fn increment_session(&self) -> TypedResult<()> {
            Ok(())
        }

        fn status(&self, _message: &str) -> TypedResult<()> {
            Ok(())
        }

        fn param_update(&self, _id: u32, _value: f64) -> TypedResult<()> {
            Ok(())
        }

        fn set_vm_state(&self, name: &str, state: VmState) -> TypedResult<()> {
            self.states.lock().unwrap().push((name.to_string(), state));
            Ok(())
        }
    }

    fn sample_mct() -> Mct {
        Mct::from_str(
            "
schedules:
  - { id: 1, name: boost, timeslice: 10 }
  - { id: 2, name: cruise }
partitions:
  - { id: 1, name: p1 }
  - { id: 2, name: p2 }
allocations:
  - { schedule: 1, partition: 1, weight: 256, cpucap: 50 }
  - { schedule: 2, partition: 2, weight: 128, cpucap: 25 }
",
        )
        .unwrap()
    }

    fn controller(mct: &Mct) -> (DomainController, Arc<RecordingHv>, Arc<RecordingVms>) {
        let hv = Arc::new(RecordingHv::default());
        let vms = Arc::new(RecordingVms::default());
        let ctrl = DomainController::initialize(
            mct,
            hv.clone(),
            vms.clone(),
            PathBuf::from("/etc/xen"),
        )
        .unwrap();
        (ctrl, hv, vms)
    }

    #[test]
    fn initialize_creates_partitions_paused() {
        let mct = sample_mct();
        let (ctrl, hv, vms) = controller(&mct);
        assert_eq!(
            hv.calls(),
            vec![
                "open",
                "create -qp /etc/xen/mcpp1.cfg",
                "create -qp /etc/xen/mcpp2.cfg",
            ]
        );
        assert_eq!(ctrl.dom_state(1).unwrap(), DomState::Off);
        assert_eq!(ctrl.dom_state(2).unwrap(), DomState::Off);
        // Creation optimistically reports both partitions started.
        assert_eq!(vms.states.lock().unwrap().len(), 2);
    }

    #[test]
    fn schedule_application_follows_scenario() {
        let mct = sample_mct();
        let (ctrl, hv, _) = controller(&mct);

        ctrl.set_schedule(&mct, 1).unwrap();
        assert_eq!(ctrl.schedule(), 1);
        assert_eq!(ctrl.dom_state(1).unwrap(), DomState::On);
        assert_eq!(ctrl.dom_state(2).unwrap(), DomState::Off);

        let calls = hv.calls();
        // After the two creates: timeslice, weight/cap for p1, unpause p1.
        assert_eq!(
            &calls[3..],
            &[
                "sched-timeslice 10",
                "sched-params p1 256 50",
                "unpause p1",
            ]
        );

        // Re-applying the same schedule is a no-op.
        ctrl.set_schedule(&mct, 1).unwrap();
        assert_eq!(hv.calls().len(), calls.len());

        // Switching to schedule 2 pauses p1 and releases p2; no timeslice
        // call because schedule 2 leaves the default.
        ctrl.set_schedule(&mct, 2).unwrap();
        assert_eq!(ctrl.dom_state(1).unwrap(), DomState::Off);
        assert_eq!(ctrl.dom_state(2).unwrap(), DomState::On);
        let calls = hv.calls();
        assert!(calls.contains(&"pause p1".to_string()));
        assert!(calls.contains(&"unpause p2".to_string()));
        assert!(!calls.contains(&"sched-timeslice 0".to_string()));
    }

    #[test]
    fn schedule_zero_is_safe() {
        let mct = sample_mct();
        let (ctrl, hv, _) = controller(&mct);
        ctrl.set_schedule(&mct, 1).unwrap();
        ctrl.set_schedule(&mct, 0).unwrap();
        assert_eq!(ctrl.dom_state(1).unwrap(), DomState::Off);
        assert_eq!(ctrl.dom_state(2).unwrap(), DomState::Off);
        assert!(hv.calls().contains(&"pause p1".to_string()));
    }

    #[test]
    fn transition_graph_is_enforced() {
        let mct = sample_mct();
        let (ctrl, hv, _) = controller(&mct);

        // OFF -> RESET is not a legal edge.
        let err = ctrl.set_dom_state(1, DomState::Reset).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        // ON -> RESET reboots and stays ON.
        ctrl.set_dom_state(1, DomState::On).unwrap();
        ctrl.set_dom_state(1, DomState::Reset).unwrap();
        assert_eq!(ctrl.dom_state(1).unwrap(), DomState::On);
        assert!(hv.calls().contains(&"reboot p1".to_string()));

        // ON -> PAUSED -> UNPAUSED is the operator path.
        ctrl.set_dom_state(1, DomState::Paused).unwrap();
        ctrl.set_dom_state(1, DomState::Unpaused).unwrap();

        // Same-state requests are no-ops.
        let before = hv.calls().len();
        ctrl.set_dom_state(2, DomState::Off).unwrap();
        assert_eq!(hv.calls().len(), before);

        // Unknown ids are rejected.
        let err = ctrl.set_dom_state(9, DomState::On).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn delete_is_reachable_from_everywhere_and_final() {
        let mct = sample_mct();
        let (ctrl, hv, _) = controller(&mct);
        ctrl.set_dom_state(1, DomState::On).unwrap();
        ctrl.set_dom_state(1, DomState::Delete).unwrap();
        assert!(hv.calls().contains(&"destroy p1".to_string()));

        // A deleted partition cannot come back without a reload.
        let err = ctrl.set_dom_state(1, DomState::On).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn reconcile_reports_changes_once() {
        let mct = sample_mct();
        let (ctrl, hv, vms) = controller(&mct);
        vms.states.lock().unwrap().clear();

        // p1 paused, p2 missing from the hypervisor listing.
        hv.set_infos(vec![(
            "p1".to_string(),
            DomainInfo {
                id: 7,
                flags: flags::PAUSED,
            },
        )]);

        ctrl.reconcile().unwrap();
        {
            let states = vms.states.lock().unwrap();
            // Both partitions changed from the optimistic Started record.
            assert!(states.contains(&("p1".to_string(), VmState::Paused)));
            assert!(states.contains(&("p2".to_string(), VmState::Error)));
        }

        // Nothing changed: a second sweep publishes nothing new.
        vms.states.lock().unwrap().clear();
        ctrl.reconcile().unwrap();
        assert!(vms.states.lock().unwrap().is_empty());

        // p1 starts running again; only p1 is re-published.
        hv.set_infos(vec![(
            "p1".to_string(),
            DomainInfo {
                id: 7,
                flags: flags::RUNNING,
            },
        )]);
        ctrl.reconcile().unwrap();
        assert_eq!(
            vms.states.lock().unwrap().clone(),
            vec![("p1".to_string(), VmState::Started)]
        );
    }

    #[test]
    fn reload_keeps_survivors_deletes_missing_creates_new() {
        let mct = sample_mct();
        let (ctrl, hv, _) = controller(&mct);
        ctrl.set_schedule(&mct, 1).unwrap();
        assert_eq!(ctrl.dom_state(1).unwrap(), DomState::On);

        // p2 disappears, p3 appears.
        let reloaded = Mct::from_str(
            "
partitions:
  - { id: 1, name: p1 }
  - { id: 3, name: p3 }
",
        )
        .unwrap();
        ctrl.reload_config(&reloaded).unwrap();

        assert_eq!(ctrl.dom_state(1).unwrap(), DomState::On);
        assert_eq!(ctrl.dom_state(2).unwrap(), DomState::Delete);
        assert_eq!(ctrl.dom_state(3).unwrap(), DomState::Off);
        assert!(hv.calls().contains(&"destroy p2".to_string()));
        assert!(hv
            .calls()
            .contains(&"create -qp /etc/xen/mcpp3.cfg".to_string()));
        // The schedule is cleared so the next set_schedule reprograms.
        assert_eq!(ctrl.schedule(), 0);
    }

    #[test]
    fn shutdown_destroys_everything() {
        let mct = sample_mct();
        let (ctrl, hv, _) = controller(&mct);
        ctrl.shutdown();
        let calls = hv.calls();
        assert!(calls.contains(&"destroy p1".to_string()));
        assert!(calls.contains(&"destroy p2".to_string()));
        assert_eq!(calls.last().unwrap(), "close");
    }

    #[test]
    fn vm_state_mapping_table() {
        assert_eq!(vm_state_for(HvState::Unknown), VmState::Error);
        assert_eq!(vm_state_for(HvState::Dying), VmState::Error);
        assert_eq!(vm_state_for(HvState::Shutdown), VmState::Error);
        assert_eq!(vm_state_for(HvState::Paused), VmState::Paused);
        assert_eq!(vm_state_for(HvState::Blocked), VmState::Started);
        assert_eq!(vm_state_for(HvState::Running), VmState::Started);
    }
}
