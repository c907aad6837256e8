use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio::time::MissedTickBehavior;

use crate::core::{
    domain::{Submission, SubmissionFilter, SubmissionId, SubmissionPatch, SubmissionStatus},
    pipeline::{CompileJob, ExecuteJob},
    traits::store::SubmissionStore,
};

/// Discovers waiting submissions, claims them and feeds the compile queue.
#[derive(Debug)]
pub struct Scheduler {
    submissions: Arc<dyn SubmissionStore>,
    compile_tx: Sender<CompileJob>,
    /// Present only until startup recovery ran.
    execute_tx: Option<Sender<ExecuteJob>>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        submissions: Arc<dyn SubmissionStore>,
        compile_tx: Sender<CompileJob>,
        execute_tx: Option<Sender<ExecuteJob>>,
        interval: Duration,
    ) -> Self {
        Scheduler {
            submissions,
            compile_tx,
            execute_tx,
            interval,
        }
    }

    /// Polls until `shutdown` resolves. Dropping the scheduler closes the compile queue.
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        if let Some(execute_tx) = self.execute_tx.take() {
            let recovered = self.recover(&execute_tx).await;
            if recovered > 0 {
                tracing::info!(recovered, "Recovered unfinished submissions");
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One polling round. Returns how many submissions were enqueued.
    pub async fn tick(&self) -> usize {
        let waiting = match self
            .submissions
            .get_by_filter(&SubmissionFilter::status(SubmissionStatus::Waiting))
            .await
        {
            Ok(waiting) => waiting,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to query waiting submissions");
                return 0;
            }
        };

        let mut enqueued = 0;
        for submission in waiting {
            let id = submission.id;
            let claim = SubmissionPatch::status(SubmissionStatus::Working)
                .expecting(SubmissionStatus::Waiting);

            let claimed = match self.submissions.update(id, claim).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::debug!(submission_id = id, error = %e, "Claim failed, skipping");
                    continue;
                }
            };

            tracing::debug!(submission_id = id, "Claimed submission");
            if !self.enqueue_compile(claimed).await {
                break;
            }
            enqueued += 1;
        }
        enqueued
    }

    /// Re-adopts submissions a previous process claimed but never finished.
    pub async fn recover(&self, execute_tx: &Sender<ExecuteJob>) -> usize {
        let filter = SubmissionFilter::statuses(&[
            SubmissionStatus::Working,
            SubmissionStatus::Compiling,
            SubmissionStatus::Executing,
        ]);
        let stale = match self.submissions.get_by_filter(&filter).await {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(error = %e, "Recovery query failed");
                return 0;
            }
        };

        let mut recovered = 0;
        for submission in stale {
            let id = submission.id;
            let requeued = if submission.status == SubmissionStatus::Executing {
                let artifact_exists = match &submission.artifact {
                    Some(artifact) => tokio::fs::try_exists(artifact).await.unwrap_or(false),
                    None => false,
                };
                if !artifact_exists {
                    self.mark_failed(id, "artifact lost before execution finished")
                        .await;
                    continue;
                }
                execute_tx.send(ExecuteJob { submission }).await.is_ok()
            } else {
                self.enqueue_compile(submission).await
            };

            if !requeued {
                break;
            }
            tracing::debug!(submission_id = id, "Requeued submission");
            recovered += 1;
        }
        recovered
    }

    /// Pushes onto the compile queue, waiting while it is full.
    async fn enqueue_compile(&self, submission: Submission) -> bool {
        let id = submission.id;
        match self.compile_tx.send(CompileJob { submission }).await {
            Ok(()) => true,
            Err(_) => {
                self.mark_failed(id, "compile queue closed").await;
                false
            }
        }
    }

    async fn mark_failed(&self, id: SubmissionId, reason: &str) {
        tracing::error!(submission_id = id, reason, "Marking submission internal error");
        let patch =
            SubmissionPatch::status(SubmissionStatus::InternalError).with_compile_output(reason);
        if let Err(e) = self.submissions.update(id, patch).await {
            tracing::error!(submission_id = id, error = %e, "Failed to mark internal error");
        }
    }
}
