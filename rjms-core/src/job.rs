//! Job identity and lifecycle (SPEC_FULL.md §3).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::SimTime;
use crate::machine::MachineId;

/// `(workload_name, job_number)`, the job's unique identity.
///
/// Textual form is `WORKLOAD_NAME!JOB_NUMBER`; an absent workload name in the wire
/// protocol defaults to `"static"` (§4.5).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub workload: String,
    pub number: u64,
}

impl JobId {
    pub fn new(workload: impl Into<String>, number: u64) -> Self {
        JobId { workload: workload.into(), number }
    }

    /// Parses `WORKLOAD!NUMBER`, defaulting the workload to `"static"` when the
    /// `!` separator is absent.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.split_once('!') {
            Some((workload, number)) => {
                let number = number
                    .parse()
                    .map_err(|_| format!("invalid job number in '{s}'"))?;
                Ok(JobId::new(workload, number))
            }
            None => {
                let number = s.parse().map_err(|_| format!("invalid job number in '{s}'"))?;
                Ok(JobId::new("static", number))
            }
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.workload, self.number)
    }
}

/// Job lifecycle state machine (SPEC_FULL.md §3).
///
/// `Rejected` is reachable only from `Submitted`; `Running` only from `Submitted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    NotSubmitted,
    Submitted,
    Rejected,
    Running,
    CompletedSuccessfully,
    CompletedKilled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Rejected | JobState::CompletedSuccessfully | JobState::CompletedKilled
        )
    }
}

/// The outcome a job executor (C3) reports back to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Killed,
}

/// A job as tracked by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub required_resources: u32,
    /// Seconds, or `None` for unbounded.
    pub walltime: Option<f64>,
    pub profile: String,
    pub submission_time: SimTime,

    pub state: JobState,
    pub starting_time: Option<SimTime>,
    pub runtime: Option<f64>,
    pub energy_before: Option<f64>,
    pub energy_after: Option<f64>,
    pub allocation: Vec<MachineId>,
}

impl Job {
    pub fn new(
        id: JobId,
        required_resources: u32,
        walltime: Option<f64>,
        profile: impl Into<String>,
        submission_time: SimTime,
    ) -> Self {
        Job {
            id,
            required_resources,
            walltime,
            profile: profile.into(),
            submission_time,
            state: JobState::NotSubmitted,
            starting_time: None,
            runtime: None,
            energy_before: None,
            energy_after: None,
            allocation: Vec::new(),
        }
    }

    pub fn submit(&mut self) {
        debug_assert_eq!(self.state, JobState::NotSubmitted);
        self.state = JobState::Submitted;
    }

    pub fn reject(&mut self) -> Result<(), String> {
        if self.state != JobState::Submitted {
            return Err(format!("job {} cannot be rejected from state {:?}", self.id, self.state));
        }
        self.state = JobState::Rejected;
        Ok(())
    }

    pub fn run(&mut self, allocation: Vec<MachineId>, now: SimTime) -> Result<(), String> {
        if self.state != JobState::Submitted {
            return Err(format!("job {} cannot be allocated from state {:?}", self.id, self.state));
        }
        if allocation.len() as u32 != self.required_resources {
            return Err(format!(
                "job {} requires {} resources, got allocation of {}",
                self.id,
                self.required_resources,
                allocation.len()
            ));
        }
        self.allocation = allocation;
        self.starting_time = Some(now);
        self.state = JobState::Running;
        Ok(())
    }

    pub fn finish(&mut self, outcome: JobOutcome, now: SimTime) {
        debug_assert_eq!(self.state, JobState::Running);
        let start = self.starting_time.unwrap_or(now);
        self.runtime = Some(now - start);
        self.state = match outcome {
            JobOutcome::Success => JobState::CompletedSuccessfully,
            JobOutcome::Killed => JobState::CompletedKilled,
        };
    }

    pub fn turnaround_time(&self) -> Option<f64> {
        let start = self.starting_time?;
        let runtime = self.runtime?;
        Some(start + runtime - self.submission_time)
    }

    pub fn waiting_time(&self) -> Option<f64> {
        let start = self.starting_time?;
        Some(start - self.submission_time)
    }

    pub fn stretch(&self) -> Option<f64> {
        let turnaround = self.turnaround_time()?;
        let runtime = self.runtime?;
        if runtime == 0.0 {
            None
        } else {
            Some(turnaround / runtime)
        }
    }

    pub fn consumed_energy(&self) -> Option<f64> {
        match (self.energy_before, self.energy_after) {
            (Some(before), Some(after)) => Some(after - before),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_parses_with_and_without_workload() {
        assert_eq!(JobId::parse("w0!3").unwrap(), JobId::new("w0", 3));
        assert_eq!(JobId::parse("3").unwrap(), JobId::new("static", 3));
        assert!(JobId::parse("nope").is_err());
    }

    #[test]
    fn job_id_display_round_trips_through_parse() {
        let id = JobId::new("w0", 7);
        assert_eq!(JobId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn reject_requires_submitted_state() {
        let mut job = Job::new(JobId::new("static", 0), 1, Some(10.0), "delay", 0.0);
        assert!(job.reject().is_err());
        job.submit();
        assert!(job.reject().is_ok());
        assert_eq!(job.state, JobState::Rejected);
    }

    #[test]
    fn run_checks_allocation_cardinality() {
        let mut job = Job::new(JobId::new("static", 0), 2, Some(10.0), "delay", 0.0);
        job.submit();
        assert!(job.run(vec![0], 1.0).is_err());
        assert!(job.run(vec![0, 1], 1.0).is_ok());
        assert_eq!(job.state, JobState::Running);
    }

    #[test]
    fn turnaround_and_stretch_computed_from_finish() {
        let mut job = Job::new(JobId::new("static", 0), 1, Some(10.0), "delay", 0.0);
        job.submit();
        job.run(vec![0], 2.0).unwrap();
        job.finish(JobOutcome::Success, 7.0);
        assert_eq!(job.runtime, Some(5.0));
        assert_eq!(job.waiting_time(), Some(2.0));
        assert_eq!(job.turnaround_time(), Some(7.0));
        assert_eq!(job.stretch(), Some(1.4));
    }
}
