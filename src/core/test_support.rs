use std::path::Path;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{
    domain::{
        CheckerKind, Problem, ScoringKind, Submission, SubmissionId, SubmissionPatch,
        SubmissionStatus, Test,
    },
    pipeline::PipelineSettings,
    traits::store::SubmissionStore,
};
use crate::memory::MemoryStores;

/// Pipeline settings with artifacts stored under `compile_path`.
pub(crate) fn settings(compile_path: &Path) -> PipelineSettings {
    let mut config = AppConfig::default();
    config.evaluator.compile_path = compile_path.to_path_buf();
    config.evaluator.retry_delay_ms = 10;
    PipelineSettings::from_config(&config)
}

pub(crate) fn problem(id: i64) -> Problem {
    Problem {
        id,
        name: format!("problem-{id}"),
        time_limit_ms: 1000,
        memory_limit_kb: 64 * 1024,
        checker: CheckerKind::Whitespace,
        scoring: ScoringKind::Fraction,
        languages: vec![],
    }
}

/// One problem, its tests with inline data and one waiting submission.
pub(crate) struct Fixture {
    pub stores: MemoryStores,
    pub submission_id: SubmissionId,
    pub tests: Vec<Test>,
}

impl Fixture {
    pub fn new(language: &str, source: &str, cases: &[(&str, &str)]) -> Self {
        let stores = MemoryStores::new();
        let problem = problem(1);

        let tests: Vec<Test> = cases
            .iter()
            .enumerate()
            .map(|(i, (input, expected))| {
                let test = Test {
                    id: i as i64 + 1,
                    problem_id: problem.id,
                    index: i as u32,
                    input: format!("{}.in", i + 1),
                    expected_output: format!("{}.out", i + 1),
                    time_limit_ms: problem.time_limit_ms,
                    memory_limit_kb: problem.memory_limit_kb,
                    points: None,
                };
                stores
                    .tests
                    .insert_with_data(test.clone(), *input, *expected);
                test
            })
            .collect();

        stores
            .submissions
            .insert(Submission::new(1, 1, problem.id, language, source));
        stores.problems.insert(problem);

        Fixture {
            stores,
            submission_id: 1,
            tests,
        }
    }

    pub async fn submission(&self) -> Submission {
        self.stores
            .submissions
            .get_by_id(self.submission_id)
            .await
            .unwrap()
    }

    pub async fn update(&self, patch: SubmissionPatch) -> Submission {
        self.stores
            .submissions
            .update(self.submission_id, patch)
            .await
            .unwrap()
    }

    /// Claims the submission the way the scheduler does.
    pub async fn claim(&self) -> Submission {
        self.update(
            SubmissionPatch::status(SubmissionStatus::Working)
                .expecting(SubmissionStatus::Waiting),
        )
        .await
    }

    pub fn history(&self) -> Vec<SubmissionStatus> {
        self.stores.submissions.status_history(self.submission_id)
    }

    pub async fn wait_for(&self, status: SubmissionStatus) -> Submission {
        wait_for_status(&self.stores, self.submission_id, status).await
    }
}

/// Polls the store until the submission reaches `status`; panics after 10 s.
pub(crate) async fn wait_for_status(
    stores: &MemoryStores,
    id: SubmissionId,
    status: SubmissionStatus,
) -> Submission {
    let poll = async {
        loop {
            let submission = stores.submissions.get_by_id(id).await.unwrap();
            if submission.status == status {
                return submission;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    match tokio::time::timeout(Duration::from_secs(10), poll).await {
        Ok(submission) => submission,
        Err(_) => panic!(
            "submission {id} never reached {status}, history: {:?}",
            stores.submissions.status_history(id)
        ),
    }
}
