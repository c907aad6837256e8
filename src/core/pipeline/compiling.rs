use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;

use crate::{
    constants::COMPILE_LOG_LIMIT,
    core::{
        domain::{Submission, SubmissionPatch, SubmissionStatus},
        pipeline::{
            CompileJob, ExecuteJob, JobError, StageContext, dispatch, fail_submission,
        },
        traits::{
            sandbox::{RunOutcome, RunRequest, RunStatus, SandboxFile},
            store::StoreError,
        },
    },
};

/// Result of a compile attempt that reached a decision.
#[derive(Debug)]
enum Compiled {
    Artifact(PathBuf),
    /// Caused by the submission; the message becomes the compiler output.
    Rejected(String),
}

#[tracing::instrument(skip_all)]
pub fn handle_compiling(
    ctx: StageContext,
    compile_rx: Receiver<CompileJob>,
    run_tx: Sender<ExecuteJob>,
) -> JoinHandle<()> {
    let concurrency = ctx.settings.concurrency;
    let services = ctx.services.clone();

    dispatch("compile", compile_rx, services, concurrency, move |job| {
        let ctx = ctx.clone();
        let run_tx = run_tx.clone();
        async move { handle_job(ctx, job, run_tx).await }
    })
}

#[tracing::instrument(skip_all, fields(submission_id = job.submission.id))]
async fn handle_job(ctx: StageContext, job: CompileJob, run_tx: Sender<ExecuteJob>) {
    let id = job.submission.id;
    let max_attempts = ctx.settings.max_compile_attempts;
    let mut attempt = 1;

    let compiled = loop {
        match compile(&ctx, &job.submission).await {
            Ok(compiled) => break compiled,
            Err(JobError::Superseded(e)) => {
                tracing::info!(error = %e, "Skipping submission");
                return;
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(attempt, error = %e, "Compilation attempt failed, retrying");
                tokio::time::sleep(ctx.settings.retry_delay * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                fail_submission(&ctx.services, id, &e.to_string()).await;
                return;
            }
        }
    };

    match compiled {
        Compiled::Rejected(msg) => {
            tracing::info!("Compilation failed");
            let patch =
                SubmissionPatch::status(SubmissionStatus::CompileError).with_compile_output(msg);
            if let Err(e) = ctx.services.submissions.update(id, patch).await {
                tracing::error!(error = %e, "Failed to persist compile error");
            }
        }
        Compiled::Artifact(artifact) => {
            let patch = SubmissionPatch::default().with_artifact(artifact);
            let submission = match ctx.services.submissions.update(id, patch).await {
                Ok(submission) => submission,
                Err(e) => {
                    fail_submission(&ctx.services, id, &e.to_string()).await;
                    return;
                }
            };

            tracing::debug!("Compiled, forwarding to execution");
            if run_tx.send(ExecuteJob { submission }).await.is_err() {
                fail_submission(&ctx.services, id, "execute queue closed").await;
            }
        }
    }
}

async fn compile(ctx: &StageContext, submission: &Submission) -> Result<Compiled, JobError> {
    let id = submission.id;
    ctx.services
        .submissions
        .update(id, SubmissionPatch::status(SubmissionStatus::Compiling))
        .await
        .map_err(JobError::from_transition)?;

    let Some(spec) = ctx.settings.languages.get(&submission.language) else {
        return Ok(Compiled::Rejected(format!(
            "unsupported language {:?}",
            submission.language
        )));
    };

    let problem = ctx
        .services
        .problems
        .get_by_id(submission.problem_id)
        .await
        .map_err(|e| match e {
            StoreError::ProblemNotFound(_) => JobError::Internal(e.to_string()),
            e => JobError::Store(e),
        })?;
    if !problem.allows(&submission.language) {
        return Ok(Compiled::Rejected(format!(
            "language {:?} is not allowed for problem {}",
            submission.language, problem.name
        )));
    }

    let request = RunRequest {
        argv: spec.compile.clone(),
        stdin: vec![],
        files: vec![SandboxFile::bytes(
            &spec.source_file,
            submission.source.as_bytes(),
        )],
        collect: vec![spec.artifact_file.clone()],
        limits: ctx.settings.compile_limits.clone(),
    };
    let mut outcome = ctx.sandbox.run(request).await?;
    tracing::debug!(status = %outcome.status, time_ms = outcome.time_ms, "Compiler finished");

    if !outcome.success() {
        return Ok(Compiled::Rejected(diagnostic(&outcome)));
    }
    let Some(artifact) = outcome.take_collected(&spec.artifact_file) else {
        return Ok(Compiled::Rejected(format!(
            "compiler did not produce {}",
            spec.artifact_file
        )));
    };

    let dir = ctx.settings.artifact_dir(id);
    let path = dir.join(&spec.artifact_file);
    store_artifact(&dir, &path, &artifact.contents)
        .await
        .map_err(|e| JobError::Internal(format!("storing artifact {}: {e}", path.display())))?;

    Ok(Compiled::Artifact(path))
}

async fn store_artifact(
    dir: &std::path::Path,
    path: &std::path::Path,
    contents: &[u8],
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, contents).await?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

/// Compiler output shown to the submitter.
fn diagnostic(outcome: &RunOutcome) -> String {
    let text = match outcome.status {
        RunStatus::TimeLimitExceeded
        | RunStatus::MemoryLimitExceeded
        | RunStatus::OutputLimitExceeded => return format!("compilation {}", outcome.status),
        _ if !outcome.stderr.is_empty() => &outcome.stderr,
        _ if !outcome.stdout.is_empty() => &outcome.stdout,
        _ => return format!("compiler failed with {}", outcome.status),
    };

    let text = String::from_utf8_lossy(text);
    if text.len() <= COMPILE_LOG_LIMIT {
        return text.into_owned();
    }
    let mut cut = COMPILE_LOG_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated]", &text[..cut])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::core::{
        domain::SubmissionStatus::*,
        test_support::{self, Fixture},
        traits::sandbox::{CollectedFile, MockSandboxManager, SandboxError, SandboxManager},
    };

    fn outcome(status: RunStatus, stderr: &str, collected: &[(&str, &str)]) -> RunOutcome {
        RunOutcome {
            status,
            stdout: vec![],
            stderr: stderr.as_bytes().to_vec(),
            time_ms: 120,
            wall_time_ms: 150,
            memory_kb: 10_000,
            collected: collected
                .iter()
                .map(|(name, contents)| CollectedFile {
                    name: name.to_string(),
                    contents: contents.as_bytes().to_vec(),
                })
                .collect(),
        }
    }

    struct Stage {
        fixture: Fixture,
        compile_tx: mpsc::Sender<CompileJob>,
        run_rx: mpsc::Receiver<ExecuteJob>,
        handle: JoinHandle<()>,
        _artifacts: tempfile::TempDir,
    }

    fn start(sandbox: impl SandboxManager + 'static, language: &str) -> Stage {
        let artifacts = tempfile::tempdir().unwrap();
        let fixture = Fixture::new(language, "echo hi", &[("", "")]);
        let mut settings = test_support::settings(artifacts.path());
        settings.retry_delay = Duration::from_millis(1);

        let ctx = StageContext {
            services: fixture.stores.services(),
            sandbox: Arc::new(sandbox),
            settings: Arc::new(settings),
        };
        let (compile_tx, compile_rx) = mpsc::channel(4);
        let (run_tx, run_rx) = mpsc::channel(4);
        let handle = handle_compiling(ctx, compile_rx, run_tx);

        Stage {
            fixture,
            compile_tx,
            run_rx,
            handle,
            _artifacts: artifacts,
        }
    }

    impl Stage {
        async fn submit(&self) {
            let submission = self.fixture.claim().await;
            self.compile_tx
                .send(CompileJob { submission })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_successful_compilation() {
        let mut sandbox = MockSandboxManager::new();
        sandbox
            .expect_run()
            .withf(|r| r.argv[0] == "/bin/sh" && r.collect == vec!["main.sh".to_string()])
            .times(1)
            .returning(|_| Ok(outcome(RunStatus::Exited(0), "", &[("main.sh", "echo hi")])));

        let mut stage = start(sandbox, "sh");
        stage.submit().await;

        let job = stage.run_rx.recv().await.unwrap();
        let artifact = job.submission.artifact.clone().unwrap();
        assert_eq!(job.submission.status, Compiling);
        assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "echo hi");

        let mode = std::fs::metadata(&artifact).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            stage.fixture.history(),
            vec![Waiting, Working, Compiling]
        );
    }

    #[tokio::test]
    async fn test_compilation_failed() {
        let mut sandbox = MockSandboxManager::new();
        sandbox
            .expect_run()
            .returning(|_| Ok(outcome(RunStatus::Exited(2), "main.sh: 1: Syntax error", &[])));

        let mut stage = start(sandbox, "sh");
        stage.submit().await;

        let submission = stage.fixture.wait_for(CompileError).await;
        assert_eq!(
            submission.compile_output.as_deref(),
            Some("main.sh: 1: Syntax error")
        );
        assert!(stage.fixture.stores.submission_tests.is_empty());

        tokio::time::timeout(Duration::from_millis(100), stage.run_rx.recv())
            .await
            .expect_err("Should not receive job in run channel on compilation failure");
    }

    #[tokio::test]
    async fn test_compilation_limits_exceeded() {
        let mut sandbox = MockSandboxManager::new();
        sandbox
            .expect_run()
            .returning(|_| Ok(outcome(RunStatus::TimeLimitExceeded, "", &[])));

        let stage = start(sandbox, "sh");
        stage.submit().await;

        let submission = stage.fixture.wait_for(CompileError).await;
        assert_eq!(
            submission.compile_output.as_deref(),
            Some("compilation time limit exceeded")
        );
    }

    #[tokio::test]
    async fn test_missing_artifact_is_compile_error() {
        let mut sandbox = MockSandboxManager::new();
        sandbox
            .expect_run()
            .returning(|_| Ok(outcome(RunStatus::Exited(0), "", &[])));

        let stage = start(sandbox, "sh");
        stage.submit().await;

        let submission = stage.fixture.wait_for(CompileError).await;
        assert!(submission.compile_output.unwrap().contains("main.sh"));
    }

    #[tokio::test]
    async fn test_unknown_language_never_reaches_sandbox() {
        let mut sandbox = MockSandboxManager::new();
        sandbox.expect_run().never();

        let stage = start(sandbox, "brainfuck");
        stage.submit().await;

        let submission = stage.fixture.wait_for(CompileError).await;
        assert!(submission.compile_output.unwrap().contains("brainfuck"));
    }

    #[tokio::test]
    async fn test_sandbox_error_is_retried() {
        let mut sandbox = MockSandboxManager::new();
        let mut seq = mockall::Sequence::new();
        sandbox
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(SandboxError::Setup("no space left on device".to_string())));
        sandbox
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(outcome(RunStatus::Exited(0), "", &[("main.sh", "echo hi")])));

        let mut stage = start(sandbox, "sh");
        stage.submit().await;

        let job = stage.run_rx.recv().await.unwrap();
        assert!(job.submission.artifact.is_some());
    }

    #[tokio::test]
    async fn test_sandbox_error_exhausts_attempts() {
        let mut sandbox = MockSandboxManager::new();
        sandbox
            .expect_run()
            .times(3)
            .returning(|_| Err(SandboxError::Supervise("wait4 failed".to_string())));

        let stage = start(sandbox, "sh");
        stage.submit().await;

        let submission = stage.fixture.wait_for(InternalError).await;
        assert!(submission.compile_output.unwrap().contains("wait4 failed"));
    }

    #[tokio::test]
    async fn test_terminal_submission_is_skipped() {
        let mut sandbox = MockSandboxManager::new();
        sandbox.expect_run().never();

        let stage = start(sandbox, "sh");
        let submission = stage.fixture.claim().await;
        stage
            .fixture
            .stores
            .submissions
            .insert(Submission {
                status: Finished,
                ..submission.clone()
            });

        stage.compile_tx.send(CompileJob { submission }).await.unwrap();
        drop(stage.compile_tx);
        stage.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_stops_when_queue_closes() {
        let stage = start(MockSandboxManager::new(), "sh");
        drop(stage.compile_tx);

        tokio::time::timeout(Duration::from_secs(1), stage.handle)
            .await
            .expect("stage should stop")
            .unwrap();
    }

    #[test]
    fn test_long_diagnostic_is_truncated() {
        let long = "e".repeat(COMPILE_LOG_LIMIT * 2);
        let text = diagnostic(&outcome(RunStatus::Exited(1), &long, &[]));

        let kept = text.strip_suffix("\n[truncated]").unwrap();
        assert_eq!(kept.len(), COMPILE_LOG_LIMIT);
        assert!(text.len() < long.len());

        let short = "e".repeat(COMPILE_LOG_LIMIT);
        assert_eq!(diagnostic(&outcome(RunStatus::Exited(1), &short, &[])), short);
    }
}
