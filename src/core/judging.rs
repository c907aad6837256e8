use std::collections::HashSet;

use crate::core::domain::{
    CheckerKind, Problem, ScoringKind, SubmissionTest, Test, TestId, Verdict,
};
use crate::core::traits::sandbox::{RunOutcome, RunStatus};

/// Compares program output with the expected output.
pub fn outputs_match(checker: CheckerKind, expected: &[u8], actual: &[u8]) -> bool {
    match checker {
        CheckerKind::Exact => expected == actual,
        CheckerKind::Whitespace => tokens(expected).eq(tokens(actual)),
    }
}

fn tokens(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|b| b.is_ascii_whitespace())
        .filter(|token| !token.is_empty())
}

/// Derives the verdict of one test run plus an optional diagnostic.
pub fn judge_run(
    outcome: &RunOutcome,
    expected: &[u8],
    checker: CheckerKind,
) -> (Verdict, Option<String>) {
    match outcome.status {
        RunStatus::TimeLimitExceeded => (Verdict::TimeLimitExceeded, None),
        RunStatus::MemoryLimitExceeded => (Verdict::MemoryLimitExceeded, None),
        RunStatus::OutputLimitExceeded => (Verdict::OutputLimitExceeded, None),
        RunStatus::Signaled(signal) => (
            Verdict::RuntimeError,
            Some(format!("killed by signal {signal}")),
        ),
        RunStatus::Exited(0) => {
            if outputs_match(checker, expected, &outcome.stdout) {
                (Verdict::Accepted, None)
            } else {
                (Verdict::WrongAnswer, None)
            }
        }
        RunStatus::Exited(code) => (
            Verdict::RuntimeError,
            Some(format!("exited with code {code}")),
        ),
    }
}

/// Worst verdict by severity, `None` when there are no results.
pub fn aggregate_verdict(results: &[SubmissionTest]) -> Option<Verdict> {
    results
        .iter()
        .map(|r| r.verdict)
        .max_by_key(|v| v.severity())
}

/// Scoring policy; the returned score is in `0..=100`.
pub trait ScorePolicy: std::fmt::Debug + Send + Sync {
    fn score(&self, tests: &[Test], results: &[SubmissionTest]) -> u32;
}

/// Percentage of accepted tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct FractionScore;

impl ScorePolicy for FractionScore {
    fn score(&self, tests: &[Test], results: &[SubmissionTest]) -> u32 {
        if tests.is_empty() {
            return 0;
        }
        let accepted = accepted_ids(results);
        let passed = tests.iter().filter(|t| accepted.contains(&t.id)).count();
        (passed * 100 / tests.len()) as u32
    }
}

/// Accepted points over total points; tests without points weigh 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedScore;

impl ScorePolicy for WeightedScore {
    fn score(&self, tests: &[Test], results: &[SubmissionTest]) -> u32 {
        let accepted = accepted_ids(results);
        let weight = |t: &Test| u64::from(t.points.unwrap_or(1));

        let total: u64 = tests.iter().map(weight).sum();
        if total == 0 {
            return 0;
        }
        let earned: u64 = tests
            .iter()
            .filter(|t| accepted.contains(&t.id))
            .map(weight)
            .sum();
        (earned * 100 / total) as u32
    }
}

fn accepted_ids(results: &[SubmissionTest]) -> HashSet<TestId> {
    results
        .iter()
        .filter(|r| r.verdict == Verdict::Accepted)
        .map(|r| r.test_id)
        .collect()
}

impl ScoringKind {
    pub fn policy(self) -> Box<dyn ScorePolicy> {
        match self {
            ScoringKind::Fraction => Box::new(FractionScore),
            ScoringKind::Weighted => Box::new(WeightedScore),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub verdict: Verdict,
    pub score: u32,
    pub max_time_ms: u64,
    pub max_memory_kb: u64,
}

/// Folds the results of every test of `problem` into the submission outcome.
pub fn summarize(problem: &Problem, tests: &[Test], results: &[SubmissionTest]) -> Option<Summary> {
    let verdict = aggregate_verdict(results)?;
    Some(Summary {
        verdict,
        score: problem.scoring.policy().score(tests, results),
        max_time_ms: results.iter().map(|r| r.time_ms).max().unwrap_or(0),
        max_memory_kb: results.iter().map(|r| r.memory_kb).max().unwrap_or(0),
    })
}
