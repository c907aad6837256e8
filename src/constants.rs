use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "JUDGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/judge";
pub const ENV_PREFIX: &str = "JUDGE";

/// `PATH` handed to every sandboxed process; the rest of the environment is cleared.
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Wall-clock limit of a test run is `time_limit * factor + padding`.
pub const WALL_TIME_FACTOR: u64 = 2;
pub const WALL_TIME_PADDING_MS: u64 = 1_000;

/// Cgroup below the configured root that holds one child cgroup per run.
pub const CGROUP_PARENT: &str = "judge-evaluator";

/// How long stdout/stderr readers may lag behind the reaped child.
pub const READER_GRACE: Duration = Duration::from_secs(2);

pub const COMPILE_LOG_LIMIT: usize = 64 * 1024;
