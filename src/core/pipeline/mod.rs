use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc::Receiver};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::AppConfig;
use crate::constants::{WALL_TIME_FACTOR, WALL_TIME_PADDING_MS};
use crate::core::{
    domain::{LanguageSpec, Problem, Submission, SubmissionId, SubmissionPatch, SubmissionStatus, Test},
    traits::{
        sandbox::{ResourceLimits, SandboxError, SandboxManager},
        store::{ProblemStore, StoreError, SubmissionStore, SubmissionTestStore, TestManager, TestStore},
    },
};

pub mod compiling;
pub mod polling;
pub mod running;

/// A claimed submission waiting for the compile stage.
#[derive(Debug, Clone)]
pub struct CompileJob {
    pub submission: Submission,
}

/// A compiled submission waiting for the execute stage.
#[derive(Debug, Clone)]
pub struct ExecuteJob {
    pub submission: Submission,
}

/// Storage collaborators shared by every stage.
#[derive(Debug, Clone)]
pub struct Services {
    pub submissions: Arc<dyn SubmissionStore>,
    pub submission_tests: Arc<dyn SubmissionTestStore>,
    pub tests: Arc<dyn TestStore>,
    pub test_manager: Arc<dyn TestManager>,
    pub problems: Arc<dyn ProblemStore>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub languages: BTreeMap<String, LanguageSpec>,
    pub compile_limits: ResourceLimits,
    pub run_output_bytes: u64,
    pub run_processes: u32,
    pub compile_path: PathBuf,
    pub max_compile_attempts: u32,
    pub max_execute_attempts: u32,
    pub retry_delay: Duration,
    pub keep_artifacts: bool,
    /// Jobs in flight per stage.
    pub concurrency: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            languages: config.languages.clone(),
            compile_limits: (&config.compile_limits).into(),
            run_output_bytes: config.execution.output_bytes,
            run_processes: config.execution.processes,
            compile_path: config.evaluator.compile_path.clone(),
            max_compile_attempts: config.evaluator.max_compile_attempts.max(1),
            max_execute_attempts: config.evaluator.max_execute_attempts.max(1),
            retry_delay: Duration::from_millis(config.evaluator.retry_delay_ms),
            keep_artifacts: config.evaluator.keep_artifacts,
            concurrency: config.evaluator.max_sandboxes.max(1),
        }
    }

    /// Limits of one test run. A zero limit on the test falls back to the problem's.
    pub fn test_limits(&self, problem: &Problem, test: &Test) -> ResourceLimits {
        let or_default = |value: u64, default: u64| if value == 0 { default } else { value };
        let time_ms = or_default(test.time_limit_ms, problem.time_limit_ms);

        ResourceLimits {
            time_ms,
            wall_time_ms: time_ms * WALL_TIME_FACTOR + WALL_TIME_PADDING_MS,
            memory_kb: or_default(test.memory_limit_kb, problem.memory_limit_kb),
            output_bytes: self.run_output_bytes,
            processes: self.run_processes,
        }
    }

    pub fn artifact_dir(&self, id: SubmissionId) -> PathBuf {
        self.compile_path.join(id.to_string())
    }
}

/// Everything a stage worker needs, cloned into each job.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub services: Services,
    pub sandbox: Arc<dyn SandboxManager>,
    pub settings: Arc<PipelineSettings>,
}

/// Why a stage gave up on a job.
#[derive(Debug, thiserror::Error)]
pub(crate) enum JobError {
    /// Another worker or a previous run already moved the submission on.
    #[error("submission was taken over: {0}")]
    Superseded(StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("{0}")]
    Internal(String),
}

impl JobError {
    /// Maps errors of a status change: losing a race is not a failure.
    pub(crate) fn from_transition(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { .. } | StoreError::InvalidTransition { .. } => {
                JobError::Superseded(e)
            }
            e => JobError::Store(e),
        }
    }

    pub(crate) fn is_transient(&self) -> bool {
        matches!(
            self,
            JobError::Sandbox(_) | JobError::Store(StoreError::Unavailable(_))
        )
    }
}

/// Marks `id` internal-error with `reason` as diagnostic.
pub(crate) async fn fail_submission(services: &Services, id: SubmissionId, reason: &str) {
    tracing::error!(submission_id = id, reason, "submission failed");

    let patch =
        SubmissionPatch::status(SubmissionStatus::InternalError).with_compile_output(reason);
    if let Err(e) = services.submissions.update(id, patch).await {
        tracing::error!(submission_id = id, error = %e, "failed to mark internal error");
    }
}

/// Receives jobs and runs up to `concurrency` of them at once. Returns after the
/// channel closed and every started job finished. A panicking job marks its
/// submission internal-error.
pub(crate) fn dispatch<J, F, Fut>(
    stage: &'static str,
    mut rx: Receiver<J>,
    services: Services,
    concurrency: usize,
    handle: F,
) -> JoinHandle<()>
where
    J: Send + 'static,
    F: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    J: JobSubject,
{
    tokio::spawn(async move {
        let workers = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut jobs = JoinSet::new();

        loop {
            let Ok(permit) = workers.clone().acquire_owned().await else {
                break;
            };
            let Some(job) = rx.recv().await else {
                break;
            };

            let id = job.submission_id();
            let services = services.clone();
            let work = handle(job);

            jobs.spawn(async move {
                let _permit = permit;
                if AssertUnwindSafe(work).catch_unwind().await.is_err() {
                    tracing::error!(stage, submission_id = id, "job panicked");
                    fail_submission(&services, id, "evaluation crashed").await;
                }
            });

            while jobs.try_join_next().is_some() {}
        }

        while jobs.join_next().await.is_some() {}
        tracing::info!(stage, "stage stopped");
    })
}

pub(crate) trait JobSubject {
    fn submission_id(&self) -> SubmissionId;
}

impl JobSubject for CompileJob {
    fn submission_id(&self) -> SubmissionId {
        self.submission.id
    }
}

impl JobSubject for ExecuteJob {
    fn submission_id(&self) -> SubmissionId {
        self.submission.id
    }
}
