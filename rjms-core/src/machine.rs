//! Machine state tracking and the machine registry (C2, SPEC_FULL.md §4.2).
//!
//! Grounded on `original_source/src/machines.hpp` (`Machine`, `Machines`): the
//! `jobs_being_computed` set and the idle/computing/transiting state machine carry
//! over directly; the tracer-notification-on-front-change rule is implemented here
//! via `MachineRegistry::on_job_run`/`on_job_end` returning whether the front job
//! changed, which callers forward to a `ScheduleTracer`.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::error::{SimError, UnknownMachine};
use crate::job::JobId;

pub use crate::machine_range::MachineId;
use crate::machine_range::MachineRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Sleeping,
    Idle,
    Computing,
    TransitingSleepToComputing,
    TransitingComputingToSleeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PstateKind {
    Compute,
    Sleep,
    Transition,
}

/// Per-pstate kind and power-draw catalog, shared by every machine in a
/// registry (§4.2, §8). `watts` defaults to `0.0` for any pstate it doesn't
/// name, so callers that only care about the compute/sleep/transition kind
/// matrix (tests, mostly) can build one from a bare kind map.
#[derive(Debug, Clone, Default)]
pub struct PstateCatalog {
    kinds: HashMap<u32, PstateKind>,
    watts: HashMap<u32, f64>,
}

impl PstateCatalog {
    pub fn new(kinds: HashMap<u32, PstateKind>, watts: HashMap<u32, f64>) -> Self {
        PstateCatalog { kinds, watts }
    }

    fn kind(&self, pstate: u32) -> Option<PstateKind> {
        self.kinds.get(&pstate).copied()
    }

    fn watts(&self, pstate: u32) -> f64 {
        self.watts.get(&pstate).copied().unwrap_or(0.0)
    }

    fn default_compute_pstate(&self) -> u32 {
        self.kinds
            .iter()
            .find(|(_, kind)| **kind == PstateKind::Compute)
            .map(|(p, _)| *p)
            .unwrap_or(0)
    }
}

impl From<HashMap<u32, PstateKind>> for PstateCatalog {
    fn from(kinds: HashMap<u32, PstateKind>) -> Self {
        PstateCatalog { kinds, watts: HashMap::new() }
    }
}

#[derive(Debug, Clone)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    pub state: MachineState,
    pub pstate: u32,
    catalog: PstateCatalog,
    /// Joules accumulated up to `residency_since`; energy drawn since then at
    /// the current pstate's wattage is folded in on demand (§8 `-E`).
    energy_settled: f64,
    residency_since: f64,
    /// Insertion-ordered so the "top" (front) job is deterministic under
    /// space-sharing.
    jobs: VecDeque<JobId>,
}

impl Machine {
    pub fn new(id: MachineId, name: impl Into<String>, catalog: impl Into<PstateCatalog>) -> Self {
        let catalog = catalog.into();
        let pstate = catalog.default_compute_pstate();
        Machine {
            id,
            name: name.into(),
            state: MachineState::Idle,
            pstate,
            catalog,
            energy_settled: 0.0,
            residency_since: 0.0,
            jobs: VecDeque::new(),
        }
    }

    pub fn pstate_kind(&self, pstate: u32) -> Option<PstateKind> {
        self.catalog.kind(pstate)
    }

    pub fn current_kind(&self) -> Option<PstateKind> {
        self.pstate_kind(self.pstate)
    }

    pub fn front_job(&self) -> Option<&JobId> {
        self.jobs.front()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, MachineState::Idle)
    }

    pub fn is_transiting(&self) -> bool {
        matches!(
            self.state,
            MachineState::TransitingSleepToComputing | MachineState::TransitingComputingToSleeping
        )
    }

    /// Folds the energy drawn since the last settlement into `energy_settled`
    /// and resets the residency clock. Must be called right before `pstate`
    /// changes, while it still reads the wattage the machine drew up to `now`.
    fn settle_energy(&mut self, now: f64) {
        let dt = (now - self.residency_since).max(0.0);
        self.energy_settled += self.catalog.watts(self.pstate) * dt;
        self.residency_since = now;
    }

    /// Energy drawn so far, including the unsettled interval since the last
    /// pstate change (§8 `-E`, `SCHED_QUERY_ENERGY`).
    fn energy_at(&self, now: f64) -> f64 {
        let dt = (now - self.residency_since).max(0.0);
        self.energy_settled + self.catalog.watts(self.pstate) * dt
    }
}

/// `true` iff the front job of a machine's job-set changed, signalling that a
/// tracer should be notified (§4.2).
pub type FrontChanged = bool;

pub struct MachineRegistry {
    machines: Vec<Machine>,
    master: Machine,
    name_index: HashMap<String, MachineId>,
}

impl MachineRegistry {
    /// Builds the registry from a host name list plus per-pstate kind catalog.
    /// The host named `master_name` is pulled out as the master machine and never
    /// appears in the compute pool; its absence is a fatal configuration error
    /// (§4.2). `limit`, if `Some`, truncates the compute pool to the first N hosts
    /// by name order.
    pub fn create(
        hosts: &[String],
        master_name: &str,
        pstate_catalog: impl Into<PstateCatalog>,
        limit: Option<usize>,
    ) -> Result<Self, SimError> {
        let pstate_catalog = pstate_catalog.into();
        let mut sorted: Vec<String> = hosts.to_vec();
        sorted.sort();

        let master_pos = sorted.iter().position(|h| h == master_name).ok_or_else(|| {
            SimError::configuration(format!("master host '{master_name}' not found in platform"))
        })?;
        let master_host = sorted.remove(master_pos);

        if let Some(n) = limit {
            sorted.truncate(n);
        }

        let mut machines = Vec::with_capacity(sorted.len());
        let mut name_index = HashMap::with_capacity(sorted.len());
        for (id, name) in sorted.into_iter().enumerate() {
            let id = id as MachineId;
            name_index.insert(name.clone(), id);
            machines.push(Machine::new(id, name, pstate_catalog.clone()));
        }

        let master = Machine::new(MachineId::MAX, master_host, pstate_catalog);

        Ok(MachineRegistry { machines, master, name_index })
    }

    pub fn exists(&self, id: MachineId) -> bool {
        self.machines.get(id as usize).is_some()
    }

    pub fn lookup(&self, id: MachineId) -> Option<&Machine> {
        self.machines.get(id as usize)
    }

    pub fn lookup_mut(&mut self, id: MachineId) -> Option<&mut Machine> {
        self.machines.get_mut(id as usize)
    }

    pub fn master_machine(&self) -> &Machine {
        &self.master
    }

    pub fn by_name(&self, name: &str) -> Option<MachineId> {
        self.name_index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Machine> {
        self.machines.iter()
    }

    /// Marks every listed machine as computing `job_id`. Returns, per machine,
    /// whether its front job changed (so callers can notify a tracer).
    pub fn on_job_run(
        &mut self,
        job_id: &JobId,
        target: &MachineRange,
    ) -> Result<Vec<(MachineId, FrontChanged)>, SimError> {
        let mut changes = Vec::with_capacity(target.cardinality());
        for id in target.iter() {
            let machine = self
                .lookup_mut(id)
                .ok_or_else(|| SimError::protocol(UnknownMachine(id).to_string()))?;
            let was_front = machine.jobs.front().cloned();
            machine.jobs.push_back(job_id.clone());
            machine.state = MachineState::Computing;
            let front_changed = was_front.as_ref() != machine.jobs.front();
            changes.push((id, front_changed));
        }
        debug!(job = %job_id, machines = %target, "machines now computing job");
        Ok(changes)
    }

    /// Removes `job_id` from every listed machine's job-set. A machine becomes
    /// `Idle` iff its set empties.
    pub fn on_job_end(
        &mut self,
        job_id: &JobId,
        target: &MachineRange,
    ) -> Result<Vec<(MachineId, FrontChanged)>, SimError> {
        let mut changes = Vec::with_capacity(target.cardinality());
        for id in target.iter() {
            let machine = self
                .lookup_mut(id)
                .ok_or_else(|| SimError::protocol(UnknownMachine(id).to_string()))?;
            let was_front = machine.jobs.front().cloned();
            machine.jobs.retain(|j| j != job_id);
            if machine.jobs.is_empty() {
                machine.state = MachineState::Idle;
            }
            let front_changed = was_front.as_ref() != machine.jobs.front();
            changes.push((id, front_changed));
        }
        debug!(job = %job_id, machines = %target, "job finished on machines");
        Ok(changes)
    }

    /// Whether allocating `target` to a fresh job is legal under the space-sharing
    /// policy: every target machine must be idle (§4.1 SCHED_ALLOCATION handling).
    pub fn allocation_is_idle(&self, target: &MachineRange) -> bool {
        target.iter().all(|id| self.lookup(id).map(Machine::is_idle).unwrap_or(false))
    }

    /// Whether any target machine is mid pstate-transition — such an allocation is
    /// always rejected regardless of space-sharing policy (§4.1 matrix, §5).
    pub fn allocation_hits_transiting(&self, target: &MachineRange) -> bool {
        target.iter().any(|id| self.lookup(id).map(Machine::is_transiting).unwrap_or(false))
    }

    /// Whether every target machine is currently in a COMPUTE-kind pstate (the
    /// energy-enabled precondition for SCHED_ALLOCATION, §4.1).
    pub fn allocation_is_powered_on(&self, target: &MachineRange) -> bool {
        target.iter().all(|id| {
            self.lookup(id)
                .and_then(Machine::current_kind)
                .map(|k| k == PstateKind::Compute)
                .unwrap_or(false)
        })
    }

    /// Sum of joules drawn by every compute-pool machine up to `now`, folding
    /// in the unsettled interval since each machine's last pstate change (§1,
    /// §8 `-E`). The master host is never part of the compute pool and is
    /// excluded, matching `allocation_is_idle` and friends.
    pub fn total_consumed_energy(&self, now: f64) -> f64 {
        self.machines.iter().map(|m| m.energy_at(now)).sum()
    }

    /// Starts a pstate transition for `target`, branching on the matrix in §4.1.
    /// Returns the machines that transitioned directly (no switcher spawned, the
    /// caller should emit their completion immediately) versus the ones now in a
    /// TRANSIT_* state awaiting a C4 switcher.
    pub fn begin_pstate_change(
        &mut self,
        target: &MachineRange,
        new_pstate: u32,
        now: f64,
    ) -> Result<PstateChangePlan, SimError> {
        let mut direct = Vec::new();
        let mut spawn_off = Vec::new();
        let mut spawn_on = Vec::new();

        for id in target.iter() {
            let machine = self
                .lookup_mut(id)
                .ok_or_else(|| SimError::protocol(UnknownMachine(id).to_string()))?;
            if machine.is_transiting() {
                return Err(SimError::policy_violation(format!(
                    "pstate change on machine {id} rejected: a transition is already in flight"
                )));
            }
            let from_kind = machine.current_kind().ok_or_else(|| {
                SimError::protocol(format!("machine {id} has no kind for pstate {}", machine.pstate))
            })?;
            let to_kind = machine.pstate_kind(new_pstate).ok_or_else(|| {
                SimError::protocol(format!("machine {id} has no pstate {new_pstate}"))
            })?;

            match (from_kind, to_kind) {
                (PstateKind::Compute, PstateKind::Compute) => {
                    machine.settle_energy(now);
                    machine.pstate = new_pstate;
                    direct.push(id);
                }
                (PstateKind::Compute, PstateKind::Sleep) => {
                    machine.state = MachineState::TransitingComputingToSleeping;
                    spawn_off.push(id);
                }
                (PstateKind::Sleep, PstateKind::Compute) => {
                    machine.state = MachineState::TransitingSleepToComputing;
                    spawn_on.push(id);
                }
                _ => {
                    return Err(SimError::policy_violation(format!(
                        "pstate change on machine {id} from {from_kind:?} to {to_kind:?} is not allowed"
                    )))
                }
            }
        }

        Ok(PstateChangePlan { direct: MachineRange::from_ids(direct), spawn_off, spawn_on, new_pstate })
    }

    /// Completes a switcher-driven transition for one machine (C4 -> C1, §4.4).
    pub fn finish_switch(&mut self, id: MachineId, pstate: u32, turning_on: bool, now: f64) -> Result<(), SimError> {
        let machine = self
            .lookup_mut(id)
            .ok_or_else(|| SimError::protocol(UnknownMachine(id).to_string()))?;
        machine.settle_energy(now);
        machine.pstate = pstate;
        machine.state = if turning_on {
            if machine.jobs.is_empty() {
                MachineState::Idle
            } else {
                warn!(machine = id, "machine switched on with jobs already queued");
                MachineState::Computing
            }
        } else {
            MachineState::Sleeping
        };
        Ok(())
    }
}

pub struct PstateChangePlan {
    pub direct: MachineRange,
    pub spawn_off: Vec<MachineId>,
    pub spawn_on: Vec<MachineId>,
    pub new_pstate: u32,
}
