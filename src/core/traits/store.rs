use crate::core::domain::{
    Problem, ProblemId, Submission, SubmissionFilter, SubmissionId, SubmissionPatch,
    SubmissionStatus, SubmissionTest, Test, TestId,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("submission {0} not found")]
    SubmissionNotFound(SubmissionId),

    #[error("problem {0} not found")]
    ProblemNotFound(ProblemId),

    #[error("status conflict: expected {expected}, found {actual}")]
    Conflict {
        expected: SubmissionStatus,
        actual: SubmissionStatus,
    },

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },

    #[error("result of submission {submission_id} on test {test_id} already recorded")]
    Duplicate {
        submission_id: SubmissionId,
        test_id: TestId,
    },

    #[error("fixture error: {0}")]
    Fixture(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait SubmissionStore: std::fmt::Debug + Send + Sync {
    async fn get_by_filter(&self, filter: &SubmissionFilter)
    -> Result<Vec<Submission>, StoreError>;

    async fn get_by_id(&self, id: SubmissionId) -> Result<Submission, StoreError>;

    /// Applies `patch` as one atomic read-modify-write and returns the updated
    /// submission. Fails with `Conflict` when `patch.expect_status` does not
    /// match and with `InvalidTransition` when the status would regress.
    async fn update(
        &self,
        id: SubmissionId,
        patch: SubmissionPatch,
    ) -> Result<Submission, StoreError>;
}

#[async_trait::async_trait]
pub trait SubmissionTestStore: std::fmt::Debug + Send + Sync {
    /// Fails with `Duplicate` when the (submission, test) pair already exists.
    async fn create(&self, record: SubmissionTest) -> Result<(), StoreError>;

    async fn get_by_submission_id(
        &self,
        id: SubmissionId,
    ) -> Result<Vec<SubmissionTest>, StoreError>;
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait TestStore: std::fmt::Debug + Send + Sync {
    /// Tests of a problem ordered by their index.
    async fn get_by_problem_id(&self, problem_id: ProblemId) -> Result<Vec<Test>, StoreError>;
}

/// Materializes test data on demand.
#[async_trait::async_trait]
pub trait TestManager: std::fmt::Debug + Send + Sync {
    async fn input(&self, test: &Test) -> Result<Vec<u8>, StoreError>;

    async fn expected_output(&self, test: &Test) -> Result<Vec<u8>, StoreError>;
}

#[async_trait::async_trait]
pub trait ProblemStore: std::fmt::Debug + Send + Sync {
    async fn get_by_id(&self, id: ProblemId) -> Result<Problem, StoreError>;
}
