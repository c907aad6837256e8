use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;

use crate::core::{
    domain::{
        LanguageSpec, Problem, Submission, SubmissionId, SubmissionPatch, SubmissionStatus, SubmissionTest,
        Test, Verdict,
    },
    judging::{judge_run, summarize},
    pipeline::{ExecuteJob, JobError, StageContext, dispatch, fail_submission},
    traits::{
        sandbox::{RunRequest, SandboxFile},
        store::StoreError,
    },
};

#[tracing::instrument(skip_all)]
pub fn handle_running(ctx: StageContext, run_rx: Receiver<ExecuteJob>) -> JoinHandle<()> {
    let concurrency = ctx.settings.concurrency;
    let services = ctx.services.clone();

    dispatch("execute", run_rx, services, concurrency, move |job| {
        let ctx = ctx.clone();
        async move { process_job(ctx, job).await }
    })
}

#[tracing::instrument(skip_all, fields(submission_id = job.submission.id))]
async fn process_job(ctx: StageContext, job: ExecuteJob) {
    let id = job.submission.id;
    let max_attempts = ctx.settings.max_execute_attempts;
    let mut attempt = 1;

    loop {
        match execute(&ctx, id).await {
            Ok(()) => break,
            Err(JobError::Superseded(e)) => {
                tracing::info!(error = %e, "Skipping submission");
                return;
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(attempt, error = %e, "Execution attempt failed, retrying");
                tokio::time::sleep(ctx.settings.retry_delay * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                fail_submission(&ctx.services, id, &e.to_string()).await;
                break;
            }
        }
    }

    if !ctx.settings.keep_artifacts {
        let dir = ctx.settings.artifact_dir(id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, dir = %dir.display(), "Failed to remove artifact");
            }
        }
    }
}

/// Runs every not yet recorded test and finishes the submission.
async fn execute(ctx: &StageContext, id: SubmissionId) -> Result<(), JobError> {
    let services = &ctx.services;

    // The queued copy may be stale; the store decides whether work remains.
    let submission = services.submissions.get_by_id(id).await?;
    if submission.status.is_terminal() {
        return Err(JobError::Superseded(StoreError::InvalidTransition {
            from: submission.status,
            to: SubmissionStatus::Executing,
        }));
    }

    let Some(artifact) = submission.artifact.clone() else {
        return Err(JobError::Internal("no compiled artifact".to_string()));
    };
    let Some(spec) = ctx.settings.languages.get(&submission.language) else {
        return Err(JobError::Internal(format!(
            "language {:?} is no longer configured",
            submission.language
        )));
    };

    services
        .submissions
        .update(id, SubmissionPatch::status(SubmissionStatus::Executing))
        .await
        .map_err(JobError::from_transition)?;

    let problem = services.problems.get_by_id(submission.problem_id).await?;
    let tests = services.tests.get_by_problem_id(problem.id).await?;
    if tests.is_empty() {
        return Err(JobError::Internal("problem has no tests".to_string()));
    }

    let recorded: HashSet<_> = services
        .submission_tests
        .get_by_submission_id(id)
        .await?
        .into_iter()
        .map(|r| r.test_id)
        .collect();

    let pending: Vec<&Test> = tests.iter().filter(|t| !recorded.contains(&t.id)).collect();
    tracing::debug!(
        total = tests.len(),
        pending = pending.len(),
        "Running tests"
    );

    let mut runs: FuturesUnordered<_> = pending
        .into_iter()
        .map(|test| run_test(ctx, &submission, &problem, test, &artifact, spec))
        .collect();

    while let Some(record) = runs.next().await {
        let test_id = record.test_id;
        match services.submission_tests.create(record).await {
            Ok(()) => {}
            Err(e @ StoreError::Duplicate { .. }) => {
                tracing::warn!(test_id, error = %e, "Result already recorded");
            }
            Err(e) => tracing::error!(test_id, error = %e, "Failed to record test result"),
        }
    }

    let results = services.submission_tests.get_by_submission_id(id).await?;
    let missing = tests
        .iter()
        .filter(|t| !results.iter().any(|r| r.test_id == t.id))
        .count();
    if missing > 0 {
        return Err(JobError::Internal(format!("{missing} test results were not recorded")));
    }

    let Some(summary) = summarize(&problem, &tests, &results) else {
        return Err(JobError::Internal("no test results".to_string()));
    };
    tracing::info!(verdict = %summary.verdict, score = summary.score, "Submission judged");

    let patch = SubmissionPatch {
        expect_status: Some(SubmissionStatus::Executing),
        status: Some(SubmissionStatus::Finished),
        verdict: Some(summary.verdict),
        score: Some(summary.score),
        max_time_ms: Some(summary.max_time_ms),
        max_memory_kb: Some(summary.max_memory_kb),
        ..Default::default()
    };
    services
        .submissions
        .update(id, patch)
        .await
        .map_err(JobError::from_transition)?;

    Ok(())
}

#[tracing::instrument(skip_all, fields(test_id = test.id))]
async fn run_test(
    ctx: &StageContext,
    submission: &Submission,
    problem: &Problem,
    test: &Test,
    artifact: &Path,
    spec: &LanguageSpec,
) -> SubmissionTest {
    let result = async {
        let input = ctx.services.test_manager.input(test).await?;
        let expected = ctx.services.test_manager.expected_output(test).await?;

        let request = RunRequest {
            argv: spec.run.clone(),
            stdin: input,
            files: vec![SandboxFile::path(&spec.artifact_file, artifact, true)],
            collect: vec![],
            limits: ctx.settings.test_limits(problem, test),
        };
        let outcome = ctx.sandbox.run(request).await?;
        let (verdict, message) = judge_run(&outcome, &expected, problem.checker);
        Ok::<_, JobError>((verdict, message, outcome.time_ms, outcome.memory_kb))
    }
    .await;

    let (verdict, message, time_ms, memory_kb) = match result {
        Ok(judged) => judged,
        Err(e) => {
            tracing::error!(error = %e, "Test could not be evaluated");
            (Verdict::InternalError, Some(e.to_string()), 0, 0)
        }
    };
    tracing::debug!(%verdict, time_ms, memory_kb, "Test finished");

    SubmissionTest {
        submission_id: submission.id,
        test_id: test.id,
        verdict,
        time_ms,
        memory_kb,
        message,
        created_at: Utc::now(),
    }
}
