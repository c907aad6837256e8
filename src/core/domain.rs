use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SubmissionId = i64;
pub type ProblemId = i64;
pub type TestId = i64;
pub type UserId = i64;

/// Pipeline state of a submission.
///
/// The lattice only moves forward: `Waiting -> Working -> Compiling ->
/// {CompileError | Executing} -> Finished`, with `InternalError` reachable from
/// every non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmissionStatus {
    Waiting,
    Working,
    Compiling,
    CompileError,
    Executing,
    Finished,
    InternalError,
}

impl SubmissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubmissionStatus::CompileError
                | SubmissionStatus::Finished
                | SubmissionStatus::InternalError
        )
    }

    /// Whether a store may move a submission from `self` to `next`.
    pub fn can_transition_to(self, next: SubmissionStatus) -> bool {
        use SubmissionStatus::*;

        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, next),
            (_, InternalError)
                | (Waiting, Working)
                | (Working, Compiling)
                | (Working, CompileError)
                | (Working, Executing)
                | (Compiling, CompileError)
                | (Compiling, Executing)
                | (Executing, Finished)
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubmissionStatus::Waiting => "waiting",
            SubmissionStatus::Working => "working",
            SubmissionStatus::Compiling => "compiling",
            SubmissionStatus::CompileError => "compile-error",
            SubmissionStatus::Executing => "executing",
            SubmissionStatus::Finished => "finished",
            SubmissionStatus::InternalError => "internal-error",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    InternalError,
}

impl Verdict {
    /// Rank used when folding per-test verdicts into a submission verdict.
    /// Higher is worse.
    pub fn severity(self) -> u8 {
        match self {
            Verdict::Accepted => 0,
            Verdict::WrongAnswer => 1,
            Verdict::OutputLimitExceeded => 2,
            Verdict::TimeLimitExceeded => 3,
            Verdict::MemoryLimitExceeded => 4,
            Verdict::RuntimeError => 5,
            Verdict::InternalError => 6,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::OutputLimitExceeded => "OLE",
            Verdict::RuntimeError => "RE",
            Verdict::InternalError => "IE",
        };
        f.write_str(code)
    }
}

/// How a test's actual output is compared with the expected one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckerKind {
    Exact,
    #[default]
    Whitespace,
}

/// How per-test results are turned into a submission score.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoringKind {
    #[default]
    Fraction,
    Weighted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub id: ProblemId,
    pub name: String,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
    #[serde(default)]
    pub checker: CheckerKind,
    #[serde(default)]
    pub scoring: ScoringKind,
    /// Languages accepted for this problem. Empty means every configured one.
    #[serde(default)]
    pub languages: Vec<String>,
}

impl Problem {
    pub fn allows(&self, language: &str) -> bool {
        self.languages.is_empty() || self.languages.iter().any(|l| l == language)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    pub id: TestId,
    pub problem_id: ProblemId,
    pub index: u32,
    /// Reference resolved by a `TestManager` to the input bytes.
    pub input: String,
    /// Reference resolved by a `TestManager` to the expected output bytes.
    pub expected_output: String,
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
    #[serde(default)]
    pub points: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub user_id: UserId,
    pub problem_id: ProblemId,
    pub source: String,
    pub language: String,
    #[serde(default = "default_status")]
    pub status: SubmissionStatus,
    #[serde(default)]
    pub compile_output: Option<String>,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub score: Option<u32>,
    #[serde(default)]
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub max_time_ms: Option<u64>,
    #[serde(default)]
    pub max_memory_kb: Option<u64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> SubmissionStatus {
    SubmissionStatus::Waiting
}

impl Submission {
    pub fn new(
        id: SubmissionId,
        user_id: UserId,
        problem_id: ProblemId,
        language: &str,
        source: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            problem_id,
            source: source.to_string(),
            language: language.to_string(),
            status: SubmissionStatus::Waiting,
            compile_output: None,
            verdict: None,
            score: None,
            artifact: None,
            max_time_ms: None,
            max_memory_kb: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies the patch fields onto `self`. Status checks are the store's job.
    pub fn apply(&mut self, patch: &SubmissionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(output) = &patch.compile_output {
            self.compile_output = Some(output.clone());
        }
        if let Some(verdict) = patch.verdict {
            self.verdict = Some(verdict);
        }
        if let Some(score) = patch.score {
            self.score = Some(score);
        }
        if let Some(artifact) = &patch.artifact {
            self.artifact = Some(artifact.clone());
        }
        if let Some(time) = patch.max_time_ms {
            self.max_time_ms = Some(time);
        }
        if let Some(memory) = patch.max_memory_kb {
            self.max_memory_kb = Some(memory);
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of a submission. `expect_status` turns the update into a
/// compare-and-set on the current status.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubmissionPatch {
    pub expect_status: Option<SubmissionStatus>,
    pub status: Option<SubmissionStatus>,
    pub compile_output: Option<String>,
    pub verdict: Option<Verdict>,
    pub score: Option<u32>,
    pub artifact: Option<PathBuf>,
    pub max_time_ms: Option<u64>,
    pub max_memory_kb: Option<u64>,
}

impl SubmissionPatch {
    pub fn status(status: SubmissionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn expecting(mut self, status: SubmissionStatus) -> Self {
        self.expect_status = Some(status);
        self
    }

    pub fn with_compile_output(mut self, output: impl Into<String>) -> Self {
        self.compile_output = Some(output.into());
        self
    }

    pub fn with_artifact(mut self, artifact: PathBuf) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubmissionFilter {
    pub statuses: Vec<SubmissionStatus>,
}

impl SubmissionFilter {
    pub fn status(status: SubmissionStatus) -> Self {
        Self {
            statuses: vec![status],
        }
    }

    pub fn statuses(statuses: &[SubmissionStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
        }
    }

    pub fn matches(&self, submission: &Submission) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&submission.status)
    }
}

/// Append-only result of one submission against one test.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionTest {
    pub submission_id: SubmissionId,
    pub test_id: TestId,
    pub verdict: Verdict,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Toolchain description of one language, keyed by name in the config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageSpec {
    /// File name the submitted source is written to.
    pub source_file: String,
    /// File the compile step must leave behind. May equal `source_file` for
    /// interpreted languages whose compile step only checks syntax.
    pub artifact_file: String,
    pub compile: Vec<String>,
    pub run: Vec<String>,
}
