use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::{
    gate::{GatedSandbox, SandboxGate},
    pipeline::{
        PipelineSettings, Services, StageContext, compiling::handle_compiling,
        polling::Scheduler, running::handle_running,
    },
    traits::sandbox::SandboxManager,
};
use crate::error::EvaluatorError;

/// Composition root: owns the queues and the sandbox gate and drives the stages.
#[derive(Debug)]
pub struct Evaluator {
    services: Services,
    sandbox: Arc<dyn SandboxManager>,
    gate: Arc<SandboxGate>,
    settings: Arc<PipelineSettings>,
    poll_interval: Duration,
    recover_on_start: bool,
}

impl Evaluator {
    pub fn new(
        config: &AppConfig,
        services: Services,
        sandbox: Arc<dyn SandboxManager>,
    ) -> Result<Self, EvaluatorError> {
        config.validate()?;

        for dir in [&config.evaluator.compile_path, &config.evaluator.output_path] {
            std::fs::create_dir_all(dir).map_err(|e| EvaluatorError::io(dir, e))?;
        }

        let gate = Arc::new(SandboxGate::new(config.evaluator.max_sandboxes));
        let sandbox: Arc<dyn SandboxManager> = Arc::new(GatedSandbox::new(sandbox, gate.clone()));

        Ok(Evaluator {
            services,
            sandbox,
            gate,
            settings: Arc::new(PipelineSettings::from_config(config)),
            poll_interval: Duration::from_millis(config.evaluator.poll_interval_ms),
            recover_on_start: config.evaluator.recover_on_start,
        })
    }

    pub fn gate(&self) -> Arc<SandboxGate> {
        self.gate.clone()
    }

    /// Runs the pipeline until `shutdown` resolves, then lets both stages drain.
    #[tracing::instrument(skip_all)]
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<(), EvaluatorError> {
        let capacity = self.gate.capacity();
        let (compile_tx, compile_rx) = mpsc::channel(capacity);
        let (run_tx, run_rx) = mpsc::channel(capacity);

        let ctx = StageContext {
            services: self.services.clone(),
            sandbox: self.sandbox.clone(),
            settings: self.settings.clone(),
        };
        let compiling = handle_compiling(ctx.clone(), compile_rx, run_tx.clone());
        let running = handle_running(ctx, run_rx);

        let recovery_tx = self.recover_on_start.then_some(run_tx);
        let scheduler = Scheduler::new(
            self.services.submissions.clone(),
            compile_tx,
            recovery_tx,
            self.poll_interval,
        );

        tracing::info!(
            max_sandboxes = capacity,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Evaluator started"
        );
        scheduler.run(shutdown).await;

        for (stage, handle) in [("compile", compiling), ("execute", running)] {
            if let Err(e) = handle.await {
                tracing::error!(stage, error = %e, "Stage task failed");
            }
        }
        tracing::info!(peak_sandboxes = self.gate.peak(), "Evaluator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        domain::{Submission, SubmissionStatus, Verdict},
        test_support::{Fixture, wait_for_status},
        traits::sandbox::{MockSandboxManager, RunOutcome, RunStatus, CollectedFile},
    };

    fn config(root: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.evaluator.compile_path = root.join("compile");
        config.evaluator.output_path = root.join("output");
        config.evaluator.poll_interval_ms = 10;
        config.evaluator.max_sandboxes = 2;
        config
    }

    fn echo_sandbox() -> MockSandboxManager {
        let mut sandbox = MockSandboxManager::new();
        sandbox.expect_run().returning(|request| {
            let collected = request
                .collect
                .iter()
                .map(|name| CollectedFile {
                    name: name.clone(),
                    contents: b"cat".to_vec(),
                })
                .collect();
            Ok(RunOutcome {
                status: RunStatus::Exited(0),
                stdout: request.stdin,
                stderr: vec![],
                time_ms: 5,
                wall_time_ms: 6,
                memory_kb: 1000,
                collected,
            })
        });
        sandbox
    }

    #[tokio::test]
    async fn test_new_creates_directories() {
        let root = tempfile::tempdir().unwrap();
        let fixture = Fixture::new("sh", "cat", &[("1", "1")]);

        let evaluator = Evaluator::new(
            &config(root.path()),
            fixture.stores.services(),
            Arc::new(MockSandboxManager::new()),
        )
        .unwrap();

        assert!(root.path().join("compile").is_dir());
        assert!(root.path().join("output").is_dir());
        assert_eq!(evaluator.gate().capacity(), 2);
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path());
        config.evaluator.poll_interval_ms = 0;

        let result = Evaluator::new(
            &config,
            Fixture::new("sh", "", &[]).stores.services(),
            Arc::new(MockSandboxManager::new()),
        );
        assert!(matches!(result, Err(EvaluatorError::Config(_))));
    }

    #[tokio::test]
    async fn test_serve_judges_and_shuts_down() {
        let root = tempfile::tempdir().unwrap();
        let fixture = Fixture::new("sh", "cat", &[("1", "1"), ("2", "2")]);
        for id in 2..=5 {
            fixture
                .stores
                .submissions
                .insert(Submission::new(id, 1, 1, "sh", "cat"));
        }

        let evaluator = Evaluator::new(
            &config(root.path()),
            fixture.stores.services(),
            Arc::new(echo_sandbox()),
        )
        .unwrap();
        let gate = evaluator.gate();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(evaluator.serve(async move {
            stop_rx.await.ok();
        }));

        for id in 1..=5 {
            let submission =
                wait_for_status(&fixture.stores, id, SubmissionStatus::Finished).await;
            assert_eq!(submission.verdict, Some(Verdict::Accepted));
            assert_eq!(submission.score, Some(100));
        }

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();

        assert!(gate.peak() <= 2);
        assert_eq!(gate.active(), 0);
        assert_eq!(fixture.stores.submission_tests.len(), 10);
    }
}
