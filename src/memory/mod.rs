//! In-memory implementations of the store interfaces, used by the binary
//! and by tests in place of a relational backend.
use std::sync::Arc;

use crate::core::{pipeline::Services, traits::store::TestManager};

mod problems;
mod seed;
mod submissions;

pub use problems::{MemoryProblemStore, MemoryTestStore};
pub use seed::Seed;
pub use submissions::{MemorySubmissionStore, MemorySubmissionTestStore};

#[derive(Debug, Clone, Default)]
pub struct MemoryStores {
    pub submissions: Arc<MemorySubmissionStore>,
    pub submission_tests: Arc<MemorySubmissionTestStore>,
    pub problems: Arc<MemoryProblemStore>,
    pub tests: Arc<MemoryTestStore>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let stores = Self::new();
        seed.problems
            .into_iter()
            .for_each(|p| stores.problems.insert(p));
        seed.tests.into_iter().for_each(|t| stores.tests.insert(t));
        seed.submissions
            .into_iter()
            .for_each(|s| stores.submissions.insert(s));
        stores
    }

    /// Services whose test data is read through `test_manager`.
    pub fn services_with(&self, test_manager: Arc<dyn TestManager>) -> Services {
        Services {
            submissions: self.submissions.clone(),
            submission_tests: self.submission_tests.clone(),
            tests: self.tests.clone(),
            test_manager,
            problems: self.problems.clone(),
        }
    }

    /// Services serving test data inserted with `MemoryTestStore::insert_with_data`.
    pub fn services(&self) -> Services {
        self.services_with(self.tests.clone())
    }
}
