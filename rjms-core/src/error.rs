//! Error taxonomy for the simulation core.
//!
//! Six categories, matching how the server loop must react to each: abort startup,
//! abort the whole run, warn and continue, or fold into an ordinary job outcome.

use std::fmt;

use crate::job::JobId;
use crate::machine::MachineId;

/// A single taxonomy-classified failure.
///
/// `Protocol`, `PolicyViolation` and `KernelError` are fatal: the caller should log
/// `Display` at `error` level and terminate the process. `Configuration` is fatal at
/// startup, before the server loop exists. `ResourceEventRace` is a warning, not an
/// abort. `KilledByWalltime` is not surfaced through this type at all in practice —
/// it is represented directly as `JobOutcome::Killed` — but the variant exists so
/// taxonomy-wide code (e.g. exit-code mapping) can match on it uniformly.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("policy violation: {reason}")]
    PolicyViolation { reason: String },

    #[error("resource event race: {reason}")]
    ResourceEventRace { reason: String },

    #[error("simulation kernel error: {reason}")]
    KernelError { reason: String },

    #[error("job {job_id} killed by walltime")]
    KilledByWalltime { job_id: JobId },
}

impl SimError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        SimError::Configuration { reason: reason.into() }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        SimError::Protocol { reason: reason.into() }
    }

    pub fn policy_violation(reason: impl Into<String>) -> Self {
        SimError::PolicyViolation { reason: reason.into() }
    }

    pub fn resource_event_race(reason: impl Into<String>) -> Self {
        SimError::ResourceEventRace { reason: reason.into() }
    }

    pub fn kernel_error(reason: impl Into<String>) -> Self {
        SimError::KernelError { reason: reason.into() }
    }

    /// True for the categories that must terminate the whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimError::Configuration { .. }
                | SimError::Protocol { .. }
                | SimError::PolicyViolation { .. }
                | SimError::KernelError { .. }
        )
    }
}

/// Helper for the unknown-machine case, used in several components.
#[derive(Debug)]
pub struct UnknownMachine(pub MachineId);

impl fmt::Display for UnknownMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown machine {}", self.0)
    }
}
