use std::path::{Component, Path, PathBuf};

use crate::core::{
    domain::Test,
    traits::store::{StoreError, TestManager},
};

/// Reads test data from files named by the test's references, relative to `root`.
#[derive(Debug, Clone)]
pub struct DiskTestManager {
    root: PathBuf,
}

impl DiskTestManager {
    pub fn new<T: AsRef<Path>>(root: T) -> Self {
        DiskTestManager {
            root: root.as_ref().into(),
        }
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(reference);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

        if reference.is_empty() || escapes {
            return Err(StoreError::Fixture(format!(
                "reference {reference:?} leaves the fixture root"
            )));
        }
        Ok(self.root.join(relative))
    }

    async fn read(&self, reference: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(reference)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::Fixture(format!("{}: {e}", path.display())))
    }
}

#[async_trait::async_trait]
impl TestManager for DiskTestManager {
    async fn input(&self, test: &Test) -> Result<Vec<u8>, StoreError> {
        self.read(&test.input).await
    }

    async fn expected_output(&self, test: &Test) -> Result<Vec<u8>, StoreError> {
        self.read(&test.expected_output).await
    }
}
