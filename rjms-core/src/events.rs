//! The server's mailbox message set (C1, §4.1) and the internal outbound event
//! sequence that replaces the legacy stringly-typed buffer (§9).
//!
//! Grounded on `original_source/src/ipp.hpp` (`IPMessageType` and its per-variant
//! payload structs) for the mailbox shape, and on `bpmn-lite-core/src/events.rs`
//! (`RuntimeEvent`, a flat tagged enum logged in arrival order) for the idiom of
//! representing an outbound buffer as a `Vec` of tagged values rather than a
//! concatenated string.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

use crate::clock::SimTime;
use crate::job::{JobId, JobOutcome};
use crate::machine_range::{MachineId, MachineRange};

/// Everything producers (submitters, executors, switchers, the waiter, the
/// protocol adapter) post to the server's single mailbox.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    /// `callback`, if present, is the channel C1 uses to dispatch a
    /// `SUBMITTER_CALLBACK` (§4.1) for every job this submitter submits — mirrors
    /// `original_source/src/server.cpp`'s `should_be_called_back` flag, except the
    /// "mailbox to call back to" is carried directly rather than looked up by name.
    SubmitterHello { name: String, callback: Option<Sender<JobId>> },
    SubmitterBye { name: String },
    JobSubmitted { submitter: String, job_id: JobId },
    /// `outcome` is carried alongside the job id because C1 owns the job table
    /// exclusively (§9 "Replacing global mutable state") and needs it to finish
    /// the job's bookkeeping — the executor computed it, so it reports it here
    /// rather than reaching into shared state to set it itself.
    JobCompleted { job_id: JobId, outcome: JobOutcome },
    SchedAllocation { allocations: Vec<Allocation> },
    SchedRejection { job_id: JobId },
    SchedCallMeLater { at: SimTime },
    SchedPstateChange { target: MachineRange, new_pstate: u32 },
    SchedQueryEnergy,
    SchedReady,
    WaitingDone,
    SwitchedOn { id: MachineId, pstate: u32 },
    SwitchedOff { id: MachineId, pstate: u32 },
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub job_id: JobId,
    pub machines: MachineRange,
}

/// Status of a finished job as reported to the scheduler (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Success,
    Killed,
}

/// One entry of the outbound buffer: a tagged value, not a pre-formatted string
/// (§9 "Replacing the stringly-typed sched_message buffer"). Serialization to
/// either wire form is a pure function of a sequence of these plus `now`
/// (`protocol::wire`).
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    SimulationBegins,
    SimulationEnds,
    JobSubmitted { job_ids: Vec<JobId> },
    JobCompleted { job_id: JobId, status: JobStatus },
    JobKilled { job_ids: Vec<JobId> },
    ResourceStateChanged { resources: MachineRange, state: u32 },
    QueryReply { energy_consumed: f64 },
    Nop,
}

/// A timestamped outbound event, the unit the buffer actually holds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedEvent {
    pub timestamp: SimTime,
    pub event: OutboundEvent,
}

/// The ordered, append-only outbound buffer owned by the protocol adapter between
/// flushes (§3 "Scheduler-channel state").
#[derive(Debug, Clone, Default)]
pub struct OutboundBuffer {
    events: Vec<TimestampedEvent>,
    last_date: Option<SimTime>,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        OutboundBuffer::default()
    }

    /// Appends an event, asserting the non-decreasing timestamp invariant (§8).
    pub fn push(&mut self, timestamp: SimTime, event: OutboundEvent) {
        if let Some(last) = self.last_date {
            debug_assert!(
                timestamp >= last,
                "outbound event timestamp {timestamp} precedes previous {last}"
            );
        }
        self.last_date = Some(timestamp);
        self.events.push(TimestampedEvent { timestamp, event });
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Drains the buffer, returning its contents in order. `last_date` is
    /// preserved so the monotonicity guard spans flushes.
    pub fn drain(&mut self) -> Vec<TimestampedEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn as_slice(&self) -> &[TimestampedEvent] {
        &self.events
    }
}
