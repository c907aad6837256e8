use dashmap::DashMap;
use itertools::Itertools;

use crate::core::{
    domain::{Problem, ProblemId, Test, TestId},
    traits::store::{ProblemStore, StoreError, TestManager, TestStore},
};

#[derive(Debug, Default)]
pub struct MemoryProblemStore {
    problems: DashMap<ProblemId, Problem>,
}

impl MemoryProblemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, problem: Problem) {
        self.problems.insert(problem.id, problem);
    }
}

#[async_trait::async_trait]
impl ProblemStore for MemoryProblemStore {
    async fn get_by_id(&self, id: ProblemId) -> Result<Problem, StoreError> {
        self.problems
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or(StoreError::ProblemNotFound(id))
    }
}

/// Test metadata plus, optionally, the test data itself.
///
/// Tests inserted with [`MemoryTestStore::insert_with_data`] can be served by
/// this store acting as a `TestManager`; the others need a separate manager.
#[derive(Debug, Default)]
pub struct MemoryTestStore {
    tests: DashMap<TestId, Test>,
    data: DashMap<TestId, (Vec<u8>, Vec<u8>)>,
}

impl MemoryTestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, test: Test) {
        self.tests.insert(test.id, test);
    }

    pub fn insert_with_data(
        &self,
        test: Test,
        input: impl Into<Vec<u8>>,
        expected_output: impl Into<Vec<u8>>,
    ) {
        self.data
            .insert(test.id, (input.into(), expected_output.into()));
        self.insert(test);
    }

    fn data_of<T>(&self, test: &Test, pick: impl Fn(&(Vec<u8>, Vec<u8>)) -> T) -> Result<T, StoreError> {
        self.data
            .get(&test.id)
            .map(|d| pick(d.value()))
            .ok_or_else(|| StoreError::Fixture(format!("no data for test {}", test.id)))
    }
}

#[async_trait::async_trait]
impl TestStore for MemoryTestStore {
    async fn get_by_problem_id(&self, problem_id: ProblemId) -> Result<Vec<Test>, StoreError> {
        Ok(self
            .tests
            .iter()
            .filter(|t| t.problem_id == problem_id)
            .map(|t| t.value().clone())
            .sorted_by_key(|t| (t.index, t.id))
            .collect())
    }
}

#[async_trait::async_trait]
impl TestManager for MemoryTestStore {
    async fn input(&self, test: &Test) -> Result<Vec<u8>, StoreError> {
        self.data_of(test, |(input, _)| input.clone())
    }

    async fn expected_output(&self, test: &Test) -> Result<Vec<u8>, StoreError> {
        self.data_of(test, |(_, expected)| expected.clone())
    }
}
