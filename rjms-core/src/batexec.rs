//! Sequential no-scheduler mode (§11.1): the `-c` CLI flag.
//!
//! Grounded on the original's `batexec` binary concept — reuses the job executor
//! (C3, `executor::run_profile`) and machine registry (C2, `MachineRegistry`)
//! exactly as the socket-driven path does, but replaces "wait for SCHED_ALLOCATION"
//! with a greedy first-fit allocator running in-process. Never opens the socket,
//! never enables space sharing.

use std::collections::{HashMap, VecDeque};

use tracing::info;

use crate::clock::SimClock;
use crate::error::SimError;
use crate::executor;
use crate::job::{Job, JobId, JobOutcome, JobState};
use crate::machine::MachineRegistry;
use crate::machine_range::{MachineId, MachineRange};
use crate::profile::Profile;
use crate::tracer::ScheduleTracer;

enum Event {
    JobDone { job_id: JobId, outcome: JobOutcome },
}

/// Runs every job in `jobs` (already sorted by submission time) to completion,
/// greedily first-fitting each head-of-queue job onto currently idle machines
/// before advancing the clock. Returns the finished jobs, keyed by id.
pub async fn run_batexec(
    mut registry: MachineRegistry,
    profiles: HashMap<String, Profile>,
    mut jobs: Vec<Job>,
    tracer: &mut dyn ScheduleTracer,
) -> Result<HashMap<JobId, Job>, SimError> {
    jobs.sort_by(|a, b| a.submission_time.partial_cmp(&b.submission_time).unwrap());
    for job in &mut jobs {
        job.submit();
    }

    let clock = SimClock::start();
    let mut pending: VecDeque<Job> = jobs.into_iter().collect();
    let mut finished: HashMap<JobId, Job> = HashMap::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(1024);
    let mut running: usize = 0;

    loop {
        while let Some(job) = pending.front() {
            let idle = idle_machines(&registry, job.required_resources as usize);
            match idle {
                Some(machines) => {
                    let mut job = pending.pop_front().expect("checked front above");
                    let allocation: Vec<MachineId> = machines.iter().collect();
                    job.run(allocation, clock.now()).map_err(|e| SimError::protocol(e))?;
                    registry.on_job_run(&job.id, &machines)?;
                    running += 1;

                    let job_id = job.id.clone();
                    let profile_name = job.profile.clone();
                    let walltime = job.walltime;
                    let clock = clock.clone();
                    let profiles = profiles.clone();
                    let tx = tx.clone();
                    pending_jobs_insert(&mut finished, job);
                    tokio::spawn(async move {
                        let outcome = executor::run_profile(&clock, &profile_name, &profiles, walltime)
                            .await
                            .unwrap_or(JobOutcome::Killed);
                        let _ = tx.send(Event::JobDone { job_id, outcome }).await;
                    });
                }
                None => break,
            }
        }

        if pending.is_empty() && running == 0 {
            break;
        }

        match rx.recv().await {
            Some(Event::JobDone { job_id, outcome }) => {
                running -= 1;
                let now = clock.now();
                if let Some(job) = finished.get_mut(&job_id) {
                    let machines = MachineRange::from_ids(job.allocation.iter().copied());
                    job.finish(outcome, now);
                    registry.on_job_end(&job_id, &machines)?;
                    tracer.job_finished(job);
                }
            }
            None => {
                return Err(SimError::kernel_error("batexec executor channel closed unexpectedly"));
            }
        }
    }

    tracer.finish().map_err(|e| SimError::kernel_error(e.to_string()))?;
    info!(jobs = finished.len(), "batexec run complete");
    Ok(finished)
}

/// Finds `count` currently idle machines, lowest id first. `None` if fewer than
/// `count` are idle right now — the caller waits for the next completion.
fn idle_machines(registry: &MachineRegistry, count: usize) -> Option<MachineRange> {
    let ids: Vec<MachineId> = registry.iter().filter(|m| m.is_idle()).map(|m| m.id).take(count).collect();
    if ids.len() == count {
        Some(MachineRange::from_ids(ids))
    } else {
        None
    }
}

fn pending_jobs_insert(finished: &mut HashMap<JobId, Job>, job: Job) {
    debug_assert_eq!(job.state, JobState::Running);
    finished.insert(job.id.clone(), job);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::PstateKind;
    use crate::tracer::NullTracer;

    fn kinds() -> HashMap<u32, PstateKind> {
        let mut m = HashMap::new();
        m.insert(0, PstateKind::Compute);
        m
    }

    #[tokio::test(start_paused = true)]
    async fn runs_two_jobs_on_two_machines_concurrently() {
        let hosts = vec!["m0".to_string(), "m1".to_string(), "master".to_string()];
        let registry = MachineRegistry::create(&hosts, "master", kinds(), None).unwrap();

        let mut profiles = HashMap::new();
        profiles.insert("d1".to_string(), Profile::Delay { seconds: 1.0 });

        let jobs = vec![
            Job::new(JobId::new("static", 0), 1, Some(10.0), "d1", 0.0),
            Job::new(JobId::new("static", 1), 1, Some(10.0), "d1", 0.0),
        ];

        let mut tracer = NullTracer;
        let finished = run_batexec(registry, profiles, jobs, &mut tracer).await.unwrap();
        assert_eq!(finished.len(), 2);
        for job in finished.values() {
            assert_eq!(job.state, JobState::CompletedSuccessfully);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn third_job_waits_for_a_free_machine() {
        let hosts = vec!["m0".to_string(), "master".to_string()];
        let registry = MachineRegistry::create(&hosts, "master", kinds(), None).unwrap();

        let mut profiles = HashMap::new();
        profiles.insert("d1".to_string(), Profile::Delay { seconds: 1.0 });
        profiles.insert("d5".to_string(), Profile::Delay { seconds: 5.0 });

        let jobs = vec![
            Job::new(JobId::new("static", 0), 1, Some(10.0), "d5", 0.0),
            Job::new(JobId::new("static", 1), 1, Some(10.0), "d1", 1.0),
        ];

        let mut tracer = NullTracer;
        let finished = run_batexec(registry, profiles, jobs, &mut tracer).await.unwrap();
        let second = &finished[&JobId::new("static", 1)];
        assert!(second.starting_time.unwrap() >= 5.0);
    }
}
