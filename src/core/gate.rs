use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::core::traits::sandbox::{RunOutcome, RunRequest, SandboxError, SandboxManager};

/// Counting semaphore bounding simultaneously active sandboxes.
#[derive(Debug)]
pub struct SandboxGate {
    semaphore: Semaphore,
    capacity: usize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl SandboxGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of sandboxes seen active at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<GatePass<'_>, SandboxError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| SandboxError::Setup("sandbox gate closed".to_string()))?;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(GatePass {
            gate: self,
            _permit: permit,
        })
    }
}

struct GatePass<'a> {
    gate: &'a SandboxGate,
    _permit: SemaphorePermit<'a>,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Wraps any `SandboxManager` so that callers above the cap wait for a slot.
#[derive(Debug, Clone)]
pub struct GatedSandbox {
    inner: Arc<dyn SandboxManager>,
    gate: Arc<SandboxGate>,
}

impl GatedSandbox {
    pub fn new(inner: Arc<dyn SandboxManager>, gate: Arc<SandboxGate>) -> Self {
        Self { inner, gate }
    }
}

#[async_trait::async_trait]
impl SandboxManager for GatedSandbox {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, SandboxError> {
        let _pass = self.gate.enter().await?;
        self.inner.run(request).await
    }
}
