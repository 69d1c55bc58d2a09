//! Server loop (C1, SPEC_FULL.md §4.1): the single central actor.
//!
//! Grounded on `original_source/src/server.cpp` (`uds_server_process`): the
//! message switch, the pstate transition matrix, the flush rule and the
//! termination predicate are all translated from there message-for-message. All
//! registry and counter mutation happens on this task alone — C3/C4 communicate
//! results back through the mailbox rather than touching the registry directly,
//! which is what lets §5's "no locks required on shared state" claim still hold
//! true under tokio's scheduler rather than only under the original's green
//! threads (§10.1).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::clock::{SimClock, SimTime};
use crate::error::SimError;
use crate::events::{Allocation, JobStatus, OutboundEvent, OutboundBuffer, ServerMessage, TimestampedEvent};
use crate::executor;
use crate::job::{Job, JobId, JobOutcome, JobState};
use crate::machine::MachineRegistry;
use crate::machine_range::{MachineId, MachineRange};
use crate::profile::Profile;
use crate::protocol::{self, transport, wire, WireFormat};
use crate::pstate;
use crate::tracer::ScheduleTracer;

/// Owns the scheduler socket for the lifetime of a run (§4.5, §5 "exactly one
/// request/reply in flight at a time"). Wrapped in a mutex rather than passed by
/// unique ownership because the round-trip itself runs in a spawned task
/// (`flush_if_ready`) while `Server` keeps a handle to hand to the next one;
/// `ready_flag` already guarantees only one such task is ever active.
#[derive(Clone)]
pub struct SchedulerTransport {
    stream: Arc<AsyncMutex<UnixStream>>,
    wire_format: WireFormat,
}

impl SchedulerTransport {
    pub fn new(stream: UnixStream, wire_format: WireFormat) -> Self {
        SchedulerTransport { stream: Arc::new(AsyncMutex::new(stream)), wire_format }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub submitters_active: u32,
    pub submitters_finished: u32,
    pub jobs_submitted: u32,
    pub jobs_completed: u32,
    pub jobs_running: u32,
    pub jobs_scheduled: u32,
    pub machines_switching: u32,
    pub waiters_armed: u32,
}

struct PendingPstateRequest {
    target: MachineRange,
    new_pstate: u32,
    remaining: HashSet<MachineId>,
}

/// The server's owned state: registry, counters, job table and scheduler-channel
/// bookkeeping (§3). Lives entirely inside `Server::run`'s task.
pub struct Server {
    clock: SimClock,
    registry: MachineRegistry,
    profiles: HashMap<String, Profile>,
    jobs: HashMap<JobId, Job>,
    counters: Counters,
    ready_flag: bool,
    outbound: OutboundBuffer,
    submitters: HashSet<String>,
    callbacks: HashMap<String, Sender<JobId>>,
    origin_of_jobs: HashMap<JobId, String>,
    pending_pstate_requests: Vec<PendingPstateRequest>,
    space_sharing: bool,
    energy_enabled: bool,
    mailbox_tx: Sender<ServerMessage>,
    mailbox_rx: Receiver<ServerMessage>,
    tracer: Box<dyn ScheduleTracer>,
    transition_seconds: HashMap<u32, f64>,
    transport: SchedulerTransport,
}

impl Server {
    pub fn new(
        registry: MachineRegistry,
        profiles: HashMap<String, Profile>,
        space_sharing: bool,
        energy_enabled: bool,
        tracer: Box<dyn ScheduleTracer>,
        transition_seconds: HashMap<u32, f64>,
        transport: SchedulerTransport,
    ) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(1024);
        Server {
            clock: SimClock::start(),
            registry,
            profiles,
            jobs: HashMap::new(),
            counters: Counters::default(),
            ready_flag: true,
            outbound: OutboundBuffer::new(),
            submitters: HashSet::new(),
            callbacks: HashMap::new(),
            origin_of_jobs: HashMap::new(),
            pending_pstate_requests: Vec::new(),
            space_sharing,
            energy_enabled,
            mailbox_tx,
            mailbox_rx,
            tracer,
            transition_seconds,
            transport,
        }
    }

    pub fn mailbox(&self) -> Sender<ServerMessage> {
        self.mailbox_tx.clone()
    }

    /// Materializes a job from a loaded workload at submission time; called by
    /// the submitter before it posts `JobSubmitted`.
    pub fn register_job(&mut self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    fn termination_predicate(&self) -> bool {
        self.counters.submitters_active > 0
            && self.counters.submitters_finished == self.counters.submitters_active
            && self.counters.jobs_completed == self.counters.jobs_submitted
            && self.ready_flag
            && self.counters.machines_switching == 0
            && self.counters.waiters_armed == 0
    }

    /// Blocks until the termination predicate holds, consuming mailbox messages
    /// in FIFO order (§4.1, §5).
    pub async fn run(&mut self) -> Result<(), SimError> {
        self.outbound.push(self.clock.now(), OutboundEvent::SimulationBegins);
        self.flush_if_ready();

        while !self.termination_predicate() {
            let message = match self.mailbox_rx.recv().await {
                Some(m) => m,
                None => {
                    return Err(SimError::kernel_error("server mailbox closed before termination"));
                }
            };
            self.handle_message(message).await?;
            self.flush_if_ready();
        }

        self.outbound.push(self.clock.now(), OutboundEvent::SimulationEnds);
        let _ = self.tracer.finish();
        info!("simulation terminated cleanly");
        Ok(())
    }

    async fn handle_message(&mut self, message: ServerMessage) -> Result<(), SimError> {
        let now = self.clock.now();
        match message {
            ServerMessage::SubmitterHello { name, callback } => {
                if self.submitters.contains(&name) {
                    return Err(SimError::protocol(format!("duplicate submitter name '{name}'")));
                }
                if let Some(tx) = callback {
                    self.callbacks.insert(name.clone(), tx);
                }
                self.submitters.insert(name);
                self.counters.submitters_active += 1;
            }
            ServerMessage::SubmitterBye { name } => {
                self.submitters.remove(&name);
                self.counters.submitters_finished += 1;
            }
            ServerMessage::JobSubmitted { submitter, job_id } => {
                let job = self
                    .jobs
                    .get_mut(&job_id)
                    .ok_or_else(|| SimError::protocol(format!("unknown job '{job_id}'")))?;
                job.submit();
                self.counters.jobs_submitted += 1;
                if self.callbacks.contains_key(&submitter) {
                    self.origin_of_jobs.insert(job_id.clone(), submitter);
                }
                self.outbound.push(now, OutboundEvent::JobSubmitted { job_ids: vec![job_id] });
            }
            ServerMessage::JobCompleted { job_id, outcome } => {
                self.complete_job(job_id, outcome, now)?;
            }
            ServerMessage::SchedAllocation { allocations } => {
                for allocation in allocations {
                    self.handle_allocation(allocation, now)?;
                }
            }
            ServerMessage::SchedRejection { job_id } => {
                let job = self
                    .jobs
                    .get_mut(&job_id)
                    .ok_or_else(|| SimError::protocol(format!("unknown job '{job_id}'")))?;
                job.reject().map_err(|e| SimError::protocol(e))?;
                self.counters.jobs_completed += 1;
            }
            ServerMessage::SchedCallMeLater { at } => {
                if at <= now {
                    let race = SimError::resource_event_race(format!(
                        "CALL_ME_LATER requested wake at {at}, which is not after current time {now}"
                    ));
                    warn!(%race, "ignoring non-future CALL_ME_LATER");
                } else {
                    self.counters.waiters_armed += 1;
                    let mailbox = self.mailbox();
                    let clock = self.clock.clone();
                    tokio::spawn(async move {
                        clock.sleep_until(at).await;
                        let _ = mailbox.send(ServerMessage::WaitingDone).await;
                    });
                }
            }
            ServerMessage::WaitingDone => {
                self.counters.waiters_armed -= 1;
                self.outbound.push(now, OutboundEvent::Nop);
            }
            ServerMessage::SchedPstateChange { target, new_pstate } => {
                self.handle_pstate_change(target, new_pstate, now)?;
            }
            ServerMessage::SchedQueryEnergy => {
                let energy = self.registry.total_consumed_energy(now);
                self.tracer.energy_sample(now, energy);
                self.outbound.push(now, OutboundEvent::QueryReply { energy_consumed: energy });
            }
            ServerMessage::SchedReady => {
                self.ready_flag = true;
            }
            ServerMessage::SwitchedOn { id, pstate } => {
                self.finish_switch(id, pstate, true, now)?;
            }
            ServerMessage::SwitchedOff { id, pstate } => {
                self.finish_switch(id, pstate, false, now)?;
            }
        }

        self.check_for_deadlock();
        Ok(())
    }

    fn handle_allocation(&mut self, allocation: Allocation, now: f64) -> Result<(), SimError> {
        let Allocation { job_id, machines } = allocation;
        let job = self
            .jobs
            .get(&job_id)
            .ok_or_else(|| SimError::protocol(format!("unknown job '{job_id}'")))?;
        if job.state != JobState::Submitted {
            return Err(SimError::protocol(format!(
                "allocation for job '{job_id}' in state {:?}, expected Submitted",
                job.state
            )));
        }
        if machines.cardinality() as u32 != job.required_resources {
            return Err(SimError::protocol(format!(
                "allocation cardinality {} does not match job '{job_id}' requirement {}",
                machines.cardinality(),
                job.required_resources
            )));
        }
        if self.registry.allocation_hits_transiting(&machines) {
            return Err(SimError::policy_violation(format!(
                "allocation for job '{job_id}' targets a transitioning machine"
            )));
        }
        if !self.space_sharing && !self.registry.allocation_is_idle(&machines) {
            return Err(SimError::policy_violation(format!(
                "allocation for job '{job_id}' targets a non-idle machine while space sharing is forbidden"
            )));
        }
        if self.energy_enabled && !self.registry.allocation_is_powered_on(&machines) {
            return Err(SimError::policy_violation(format!(
                "allocation for job '{job_id}' targets a machine not in a compute pstate"
            )));
        }

        let allocation_ids: Vec<MachineId> = machines.iter().collect();
        {
            let job = self.jobs.get_mut(&job_id).expect("checked above");
            if self.energy_enabled {
                job.energy_before = Some(self.registry.total_consumed_energy(now));
            }
            job.run(allocation_ids, now).map_err(|e| SimError::protocol(e))?;
        }

        for (_, front_changed) in self.registry.on_job_run(&job_id, &machines)? {
            if front_changed {
                debug!(job = %job_id, "front job changed on an allocated machine");
            }
        }

        self.counters.jobs_running += 1;
        self.counters.jobs_scheduled += 1;

        let clock = self.clock.clone();
        let profiles = self.profiles.clone();
        let profile_name = self.jobs[&job_id].profile.clone();
        let walltime = self.jobs[&job_id].walltime;
        let mailbox = self.mailbox();
        let spawned_job_id = job_id.clone();
        tokio::spawn(async move {
            let outcome = executor::run_profile(&clock, &profile_name, &profiles, walltime)
                .await
                .unwrap_or(JobOutcome::Killed);
            let _ = mailbox.send(ServerMessage::JobCompleted { job_id: spawned_job_id, outcome }).await;
        });

        Ok(())
    }

    fn complete_job(&mut self, job_id: JobId, outcome: JobOutcome, now: f64) -> Result<(), SimError> {
        let machines = {
            let job = self
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| SimError::protocol(format!("unknown job '{job_id}'")))?;
            let machines = MachineRange::from_ids(job.allocation.iter().copied());
            if self.energy_enabled {
                job.energy_after = Some(self.registry.total_consumed_energy(now));
            }
            job.finish(outcome, now);
            machines
        };

        self.registry.on_job_end(&job_id, &machines)?;

        if let Some(job) = self.jobs.get(&job_id) {
            self.tracer.job_finished(job);
        }

        self.counters.jobs_running -= 1;
        self.counters.jobs_completed += 1;

        let status = match outcome {
            JobOutcome::Success => JobStatus::Success,
            JobOutcome::Killed => JobStatus::Killed,
        };
        self.outbound.push(now, OutboundEvent::JobCompleted { job_id: job_id.clone(), status });

        if let Some(submitter) = self.origin_of_jobs.remove(&job_id) {
            if let Some(tx) = self.callbacks.get(&submitter) {
                if tx.try_send(job_id.clone()).is_err() {
                    debug!(job = %job_id, submitter, "submitter callback channel full or closed, dropping");
                }
            }
        }

        Ok(())
    }

    fn handle_pstate_change(
        &mut self,
        target: MachineRange,
        new_pstate: u32,
        now: f64,
    ) -> Result<(), SimError> {
        let plan = self.registry.begin_pstate_change(&target, new_pstate, now)?;
        let transition_seconds = self.transition_seconds.get(&new_pstate).copied().unwrap_or(0.0);

        let switching: HashSet<MachineId> = plan.spawn_off.iter().chain(&plan.spawn_on).copied().collect();

        for id in plan.spawn_off.iter().chain(&plan.spawn_on) {
            self.counters.machines_switching += 1;
            let turning_on = plan.spawn_on.contains(id);
            let clock = self.clock.clone();
            let mailbox = self.mailbox();
            let machine = *id;
            tokio::spawn(pstate::run_switch(clock, mailbox, machine, new_pstate, transition_seconds, turning_on));
        }

        if !plan.direct.is_empty() {
            self.tracer.pstate_change(now, &plan.direct, new_pstate);
            self.outbound.push(
                now,
                OutboundEvent::ResourceStateChanged { resources: plan.direct, state: new_pstate },
            );
        }

        if !switching.is_empty() {
            let switching_target = MachineRange::from_ids(switching.iter().copied());
            self.pending_pstate_requests.push(PendingPstateRequest {
                target: switching_target,
                new_pstate,
                remaining: switching,
            });
        }

        Ok(())
    }

    fn finish_switch(&mut self, id: MachineId, pstate: u32, turning_on: bool, now: f64) -> Result<(), SimError> {
        self.registry.finish_switch(id, pstate, turning_on, now)?;
        self.counters.machines_switching -= 1;

        let mut completed_request = None;
        for (idx, request) in self.pending_pstate_requests.iter_mut().enumerate() {
            if request.remaining.remove(&id) && request.remaining.is_empty() {
                completed_request = Some(idx);
                break;
            }
        }
        if let Some(idx) = completed_request {
            let request = self.pending_pstate_requests.remove(idx);
            self.tracer.pstate_change(now, &request.target, request.new_pstate);
            self.outbound.push(
                now,
                OutboundEvent::ResourceStateChanged { resources: request.target, state: request.new_pstate },
            );
        }
        Ok(())
    }

    /// §4.1 deadlock detection: a warning, not a fatal error.
    fn check_for_deadlock(&self) {
        if self.counters.jobs_running > 0 {
            return;
        }
        if self.counters.machines_switching > 0 || self.counters.waiters_armed > 0 {
            return;
        }
        let pending: Vec<&JobId> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.state == JobState::Submitted)
            .map(|(id, _)| id)
            .collect();
        if !pending.is_empty() {
            warn!(jobs = ?pending, "scheduler produced no actions while jobs remain submitted and unscheduled");
        }
    }

    /// §4.1 flush rule: spawn the protocol adapter round-trip (C5) iff the
    /// scheduler is ready and there is something to send. C1 does not block on
    /// the round-trip — it flips `ready_flag` and keeps draining its mailbox; the
    /// spawned task re-injects the scheduler's reply as ordinary mailbox messages
    /// and finally posts `SchedReady`, which is what flips `ready_flag` back.
    fn flush_if_ready(&mut self) {
        if !(self.ready_flag && !self.outbound.is_empty()) {
            return;
        }
        self.ready_flag = false;
        let batch = self.outbound.drain();
        let now = self.clock.now();
        let stream = self.transport.stream.clone();
        let wire_format = self.transport.wire_format;
        let mailbox = self.mailbox_tx.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            if let Err(e) = run_round_trip(stream, wire_format, batch, now, &clock, &mailbox).await {
                // §7 item 2/3: a protocol error or policy violation here means the
                // scheduler and simulator have desynchronized with no safe
                // recovery; there is no `Result` to bubble this through since the
                // round-trip runs detached from `Server::run`'s loop, so it is
                // fatal on the spot.
                error!(error = %e, "protocol adapter round-trip failed");
                std::process::exit(1);
            }
        });
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn jobs(&self) -> &HashMap<JobId, Job> {
        &self.jobs
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }
}

/// One full C5 round-trip: encode the drained batch, exchange it over the
/// socket, decode the reply, and re-inject each event in order — sleeping until
/// its timestamp first (§4.5 "wait-before-injection rule") — before finally
/// telling C1 the scheduler is ready for another batch.
async fn run_round_trip(
    stream: Arc<AsyncMutex<UnixStream>>,
    wire_format: WireFormat,
    batch: Vec<TimestampedEvent>,
    now: SimTime,
    clock: &SimClock,
    mailbox: &Sender<ServerMessage>,
) -> Result<(), SimError> {
    let payload = wire::encode(&batch, now, wire_format);
    let reply = {
        let mut guard = stream.lock().await;
        transport::request_reply(&mut guard, &payload).await?
    };
    let envelope = wire::decode(&reply, wire_format)
        .map_err(|e| SimError::protocol(format!("malformed scheduler reply: {e}")))?;

    for (timestamp, event) in envelope.events {
        clock.sleep_until(timestamp).await;
        if let Some(message) = protocol::to_server_message(event) {
            mailbox
                .send(message)
                .await
                .map_err(|_| SimError::kernel_error("server mailbox closed mid round-trip"))?;
        }
    }

    mailbox
        .send(ServerMessage::SchedReady)
        .await
        .map_err(|_| SimError::kernel_error("server mailbox closed mid round-trip"))?;
    Ok(())
}
