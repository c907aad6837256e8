use std::fmt;
use std::path::PathBuf;

/// Ceilings applied to one sandboxed run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU time (user + system), milliseconds.
    pub time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_kb: u64,
    /// Cap on each of stdout and stderr.
    pub output_bytes: u64,
    pub processes: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_ms: 1_000,
            wall_time_ms: 3_000,
            memory_kb: 256 * 1024,
            output_bytes: 64 * 1024 * 1024,
            processes: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileSource {
    Bytes(Vec<u8>),
    /// Host file copied into the sandbox.
    Path(PathBuf),
}

/// File placed into the run's scratch directory before the command starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxFile {
    pub name: String,
    pub source: FileSource,
    pub executable: bool,
}

impl SandboxFile {
    pub fn bytes(name: &str, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            source: FileSource::Bytes(contents.into()),
            executable: false,
        }
    }

    pub fn path(name: &str, path: impl Into<PathBuf>, executable: bool) -> Self {
        Self {
            name: name.to_string(),
            source: FileSource::Path(path.into()),
            executable,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub stdin: Vec<u8>,
    pub files: Vec<SandboxFile>,
    /// Scratch-relative files read back after the run, if they exist.
    pub collect: Vec<String>,
    pub limits: ResourceLimits,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Exited(i32),
    Signaled(i32),
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Exited(code) => write!(f, "exit code {code}"),
            RunStatus::Signaled(signal) => write!(f, "signal {signal}"),
            RunStatus::TimeLimitExceeded => f.write_str("time limit exceeded"),
            RunStatus::MemoryLimitExceeded => f.write_str("memory limit exceeded"),
            RunStatus::OutputLimitExceeded => f.write_str("output limit exceeded"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectedFile {
    pub name: String,
    pub contents: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_kb: u64,
    pub collected: Vec<CollectedFile>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.status == RunStatus::Exited(0)
    }

    pub fn take_collected(&mut self, name: &str) -> Option<CollectedFile> {
        let index = self.collected.iter().position(|f| f.name == name)?;
        Some(self.collected.swap_remove(index))
    }
}

/// Failure of the sandbox itself, never of the program under test.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox setup failed: {0}")]
    Setup(String),

    #[error("failed to launch {program}: {msg}")]
    Launch { program: String, msg: String },

    #[error("sandbox supervision failed: {0}")]
    Supervise(String),
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait SandboxManager: std::fmt::Debug + Send + Sync {
    /// Runs `request` in a fresh sandbox that is destroyed before returning.
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, SandboxError>;
}
