use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use itertools::Itertools;

use crate::core::{
    domain::{
        Submission, SubmissionFilter, SubmissionId, SubmissionPatch, SubmissionStatus,
        SubmissionTest, TestId,
    },
    traits::store::{StoreError, SubmissionStore, SubmissionTestStore},
};

#[derive(Debug, Default)]
pub struct MemorySubmissionStore {
    submissions: DashMap<SubmissionId, Submission>,
    history: DashMap<SubmissionId, Vec<SubmissionStatus>>,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, submission: Submission) {
        self.history.insert(submission.id, vec![submission.status]);
        self.submissions.insert(submission.id, submission);
    }

    /// Every status the submission has held, oldest first.
    pub fn status_history(&self, id: SubmissionId) -> Vec<SubmissionStatus> {
        self.history
            .get(&id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn get_by_filter(
        &self,
        filter: &SubmissionFilter,
    ) -> Result<Vec<Submission>, StoreError> {
        Ok(self
            .submissions
            .iter()
            .filter(|s| filter.matches(s.value()))
            .map(|s| s.value().clone())
            .sorted_by_key(|s| s.id)
            .collect())
    }

    async fn get_by_id(&self, id: SubmissionId) -> Result<Submission, StoreError> {
        self.submissions
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(StoreError::SubmissionNotFound(id))
    }

    async fn update(
        &self,
        id: SubmissionId,
        patch: SubmissionPatch,
    ) -> Result<Submission, StoreError> {
        let mut entry = self
            .submissions
            .get_mut(&id)
            .ok_or(StoreError::SubmissionNotFound(id))?;
        let current = entry.status;

        if let Some(expected) = patch.expect_status {
            if expected != current {
                return Err(StoreError::Conflict {
                    expected,
                    actual: current,
                });
            }
        }
        if let Some(next) = patch.status {
            if !current.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    from: current,
                    to: next,
                });
            }
        }

        entry.apply(&patch);
        let updated = entry.value().clone();

        // Recorded under the entry lock so history follows the order of updates.
        if updated.status != current {
            self.history.entry(id).or_default().push(updated.status);
        }
        drop(entry);
        Ok(updated)
    }
}

#[derive(Debug, Default)]
pub struct MemorySubmissionTestStore {
    records: DashMap<(SubmissionId, TestId), SubmissionTest>,
}

impl MemorySubmissionTestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait::async_trait]
impl SubmissionTestStore for MemorySubmissionTestStore {
    async fn create(&self, record: SubmissionTest) -> Result<(), StoreError> {
        match self.records.entry((record.submission_id, record.test_id)) {
            Entry::Occupied(_) => Err(StoreError::Duplicate {
                submission_id: record.submission_id,
                test_id: record.test_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get_by_submission_id(
        &self,
        id: SubmissionId,
    ) -> Result<Vec<SubmissionTest>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.key().0 == id)
            .map(|r| r.value().clone())
            .sorted_by_key(|r| r.test_id)
            .collect())
    }
}
