use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::core::domain::{Problem, Submission, Test};
use crate::error::EvaluatorError;

/// Initial contents of the in-memory stores.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub problems: Vec<Problem>,
    #[serde(default)]
    pub tests: Vec<Test>,
    #[serde(default)]
    pub submissions: Vec<Submission>,
}

impl Seed {
    pub async fn load(path: &Path) -> Result<Self, EvaluatorError> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| EvaluatorError::io(path, e))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> Result<Self, EvaluatorError> {
        let seed: Seed =
            serde_json::from_slice(raw).map_err(|e| EvaluatorError::Seed(e.to_string()))?;
        seed.validate()?;
        Ok(seed)
    }

    fn validate(&self) -> Result<(), EvaluatorError> {
        let problems: HashSet<_> = self.problems.iter().map(|p| p.id).collect();

        if let Some(test) = self.tests.iter().find(|t| !problems.contains(&t.problem_id)) {
            return Err(EvaluatorError::Seed(format!(
                "test {} refers to unknown problem {}",
                test.id, test.problem_id
            )));
        }
        if let Some(submission) = self
            .submissions
            .iter()
            .find(|s| !problems.contains(&s.problem_id))
        {
            return Err(EvaluatorError::Seed(format!(
                "submission {} refers to unknown problem {}",
                submission.id, submission.problem_id
            )));
        }
        Ok(())
    }
}
