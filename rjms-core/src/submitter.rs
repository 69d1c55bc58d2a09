//! Submitter: posts `JOB_SUBMITTED` for one workload's jobs in submission-time
//! order, then says goodbye (§2 data flow, §4.1 `SUBMITTER_HELLO`/`SUBMITTER_BYE`).
//!
//! Grounded on `original_source/job_submitter.hpp` (`job_submitter_process`): one
//! such process per loaded workload file in the original, driving submission off
//! the workload's declared `subtime`s against the simulated clock.

use tokio::sync::mpsc::{self, Sender};
use tracing::debug;

use crate::clock::{SimClock, SimTime};
use crate::events::ServerMessage;
use crate::job::JobId;

/// One job's identity and declared submission time, as handed to a submitter.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: JobId,
    pub subtime: SimTime,
}

/// Sends `SubmitterHello`, then one `JobSubmitted` per job at its declared
/// `subtime` (sleeping in between), then `SubmitterBye`. `jobs` need not be
/// pre-sorted; this function sorts by `subtime` itself.
///
/// Flat workload files (§6) never need the per-completion callback the original
/// exposes via `enable_callback_on_job_completion` (`original_source/src/server.cpp`)
/// — there is no dynamic follow-up submission to drive from it here — so
/// `want_callback` is `false` for every caller today. The channel plumbing still
/// exists end-to-end so a future dynamic submitter can ask for it.
pub async fn run_submitter(
    clock: SimClock,
    mailbox: Sender<ServerMessage>,
    name: String,
    mut jobs: Vec<ScheduledJob>,
    want_callback: bool,
) {
    jobs.sort_by(|a, b| a.subtime.partial_cmp(&b.subtime).unwrap());

    let callback = if want_callback {
        let (tx, mut rx) = mpsc::channel::<JobId>(64);
        let submitter_name = name.clone();
        tokio::spawn(async move {
            while let Some(job_id) = rx.recv().await {
                debug!(submitter = %submitter_name, job = %job_id, "submitter callback received");
            }
        });
        Some(tx)
    } else {
        None
    };

    if mailbox.send(ServerMessage::SubmitterHello { name: name.clone(), callback }).await.is_err() {
        return;
    }

    for job in jobs {
        clock.sleep_until(job.subtime).await;
        if mailbox
            .send(ServerMessage::JobSubmitted { submitter: name.clone(), job_id: job.id })
            .await
            .is_err()
        {
            return;
        }
    }

    let _ = mailbox.send(ServerMessage::SubmitterBye { name }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn submits_jobs_in_subtime_order_then_says_goodbye() {
        let clock = SimClock::start();
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let jobs = vec![
            ScheduledJob { id: JobId::new("w0", 1), subtime: 5.0 },
            ScheduledJob { id: JobId::new("w0", 0), subtime: 0.0 },
        ];
        tokio::spawn(run_submitter(clock, tx, "w0".to_string(), jobs, false));

        match rx.recv().await.unwrap() {
            ServerMessage::SubmitterHello { name, .. } => assert_eq!(name, "w0"),
            other => panic!("unexpected: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ServerMessage::JobSubmitted { job_id, .. } => assert_eq!(job_id, JobId::new("w0", 0)),
            other => panic!("unexpected: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ServerMessage::JobSubmitted { job_id, .. } => assert_eq!(job_id, JobId::new("w0", 1)),
            other => panic!("unexpected: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            ServerMessage::SubmitterBye { name } => assert_eq!(name, "w0"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
