use std::collections::BTreeMap;
use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::constants::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH, ENV_PREFIX};
use crate::core::domain::LanguageSpec;
use crate::core::traits::sandbox::ResourceLimits;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Pipeline-level settings.
#[derive(Debug, Deserialize, Clone)]
pub struct EvaluatorConfig {
    /// Upper bound on simultaneously running sandboxes; also sizes both queues.
    #[serde(default = "default_max_sandboxes")]
    pub max_sandboxes: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Total compile attempts per submission when the sandbox itself fails.
    #[serde(default = "default_max_compile_attempts")]
    pub max_compile_attempts: u32,
    /// Total execute attempts per submission when the sandbox or a store is unavailable.
    #[serde(default = "default_max_execute_attempts")]
    pub max_execute_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Where compiled artifacts are kept between the two stages.
    #[serde(default = "default_compile_path")]
    pub compile_path: PathBuf,
    /// Root of the per-run scratch directories.
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    #[serde(default)]
    pub keep_artifacts: bool,
    #[serde(default = "default_true")]
    pub recover_on_start: bool,
    /// Log file; stderr when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// JSON file with problems, tests and submissions loaded into memory at startup.
    #[serde(default)]
    pub seed_path: Option<PathBuf>,
}

fn default_max_sandboxes() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_max_compile_attempts() -> u32 {
    3
}
fn default_max_execute_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_compile_path() -> PathBuf {
    "/tmp/judge/compile".into()
}
fn default_output_path() -> PathBuf {
    "/tmp/judge/output".into()
}
fn default_true() -> bool {
    true
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_sandboxes: default_max_sandboxes(),
            poll_interval_ms: default_poll_interval_ms(),
            max_compile_attempts: default_max_compile_attempts(),
            max_execute_attempts: default_max_execute_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            compile_path: default_compile_path(),
            output_path: default_output_path(),
            keep_artifacts: false,
            recover_on_start: true,
            log_path: None,
            seed_path: None,
        }
    }
}

/// Limits of the compile step. Test runs take time and memory from the test.
#[derive(Debug, Deserialize, Clone)]
pub struct CompileLimitsConfig {
    #[serde(default = "default_compile_time_ms")]
    pub time_ms: u64,
    #[serde(default = "default_compile_wall_time_ms")]
    pub wall_time_ms: u64,
    #[serde(default = "default_compile_memory_kb")]
    pub memory_kb: u64,
    #[serde(default = "default_compile_output_bytes")]
    pub output_bytes: u64,
    #[serde(default = "default_compile_processes")]
    pub processes: u32,
}

fn default_compile_time_ms() -> u64 {
    10_000
}
fn default_compile_wall_time_ms() -> u64 {
    20_000
}
fn default_compile_memory_kb() -> u64 {
    1024 * 1024
}
fn default_compile_output_bytes() -> u64 {
    1024 * 1024
}
fn default_compile_processes() -> u32 {
    64
}

impl Default for CompileLimitsConfig {
    fn default() -> Self {
        Self {
            time_ms: default_compile_time_ms(),
            wall_time_ms: default_compile_wall_time_ms(),
            memory_kb: default_compile_memory_kb(),
            output_bytes: default_compile_output_bytes(),
            processes: default_compile_processes(),
        }
    }
}

impl From<&CompileLimitsConfig> for ResourceLimits {
    fn from(c: &CompileLimitsConfig) -> Self {
        ResourceLimits {
            time_ms: c.time_ms,
            wall_time_ms: c.wall_time_ms,
            memory_kb: c.memory_kb,
            output_bytes: c.output_bytes,
            processes: c.processes,
        }
    }
}

/// Limits shared by every test run.
#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_run_output_bytes")]
    pub output_bytes: u64,
    #[serde(default = "default_run_processes")]
    pub processes: u32,
}

fn default_run_output_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_run_processes() -> u32 {
    8
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            output_bytes: default_run_output_bytes(),
            processes: default_run_processes(),
        }
    }
}

/// Which cgroup hierarchy carries the per-run memory and process caps.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CgroupMode {
    /// Unified hierarchy when usable, otherwise the legacy one.
    #[default]
    Auto,
    V1,
    V2,
}

/// Isolation knobs of the native sandbox.
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxSettings {
    /// Mount point of the cgroup hierarchy; with v1, the directory holding the
    /// `memory` and `pids` controller mounts.
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
    #[serde(default)]
    pub cgroup_mode: CgroupMode,
    /// Restrict runs with Landlock to `read_only_paths`, `/dev` and their scratch directory.
    #[serde(default = "default_true")]
    pub confine_filesystem: bool,
    /// Read and execute only. Missing entries are skipped.
    #[serde(default = "default_read_only_paths")]
    pub read_only_paths: Vec<PathBuf>,
    /// Unshare user, network, IPC and UTS namespaces before exec.
    #[serde(default)]
    pub isolate_namespaces: bool,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
    /// Permission bits of files staged into the scratch directory.
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}

fn default_cgroup_root() -> PathBuf {
    "/sys/fs/cgroup".into()
}
fn default_read_only_paths() -> Vec<PathBuf> {
    ["/bin", "/etc", "/lib", "/lib64", "/usr"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}
fn default_max_open_files() -> u64 {
    64
}
fn default_file_mode() -> u32 {
    0o644
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            cgroup_root: default_cgroup_root(),
            cgroup_mode: CgroupMode::default(),
            confine_filesystem: true,
            read_only_paths: default_read_only_paths(),
            isolate_namespaces: false,
            uid: None,
            gid: None,
            max_open_files: default_max_open_files(),
            file_mode: default_file_mode(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FixturesConfig {
    /// Directory test input/expected-output references are resolved against.
    #[serde(default = "default_fixtures_root")]
    pub root: PathBuf,
}

fn default_fixtures_root() -> PathBuf {
    "fixtures".into()
}

impl Default for FixturesConfig {
    fn default() -> Self {
        Self {
            root: default_fixtures_root(),
        }
    }
}

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

pub fn default_languages() -> BTreeMap<String, LanguageSpec> {
    BTreeMap::from([
        (
            "c".to_string(),
            LanguageSpec {
                source_file: "main.c".to_string(),
                artifact_file: "main".to_string(),
                compile: argv(&["gcc", "-O2", "-std=c11", "-o", "main", "main.c", "-lm"]),
                run: argv(&["./main"]),
            },
        ),
        (
            "cpp".to_string(),
            LanguageSpec {
                source_file: "main.cpp".to_string(),
                artifact_file: "main".to_string(),
                compile: argv(&["g++", "-O2", "-std=c++17", "-o", "main", "main.cpp"]),
                run: argv(&["./main"]),
            },
        ),
        (
            "python3".to_string(),
            LanguageSpec {
                source_file: "main.py".to_string(),
                artifact_file: "main.py".to_string(),
                compile: argv(&["python3", "-m", "py_compile", "main.py"]),
                run: argv(&["python3", "main.py"]),
            },
        ),
        (
            "sh".to_string(),
            LanguageSpec {
                source_file: "main.sh".to_string(),
                artifact_file: "main.sh".to_string(),
                compile: argv(&["/bin/sh", "-n", "main.sh"]),
                run: argv(&["/bin/sh", "main.sh"]),
            },
        ),
    ])
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub compile_limits: CompileLimitsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub fixtures: FixturesConfig,
    /// Replaces the built-in table entirely when present.
    #[serde(default = "default_languages")]
    pub languages: BTreeMap<String, LanguageSpec>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            evaluator: EvaluatorConfig::default(),
            compile_limits: CompileLimitsConfig::default(),
            execution: ExecutionConfig::default(),
            sandbox: SandboxSettings::default(),
            fixtures: FixturesConfig::default(),
            languages: default_languages(),
        }
    }
}

impl AppConfig {
    /// Loads the file named by `JUDGE_CONFIG` (if it exists) and `JUDGE__*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("evaluator.max_sandboxes", default_max_sandboxes() as i64)?
            .set_default("evaluator.poll_interval_ms", default_poll_interval_ms() as i64)?
            .set_default("evaluator.keep_artifacts", false)?
            .set_default("evaluator.recover_on_start", true)?
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.evaluator.max_sandboxes == 0 {
            return invalid("evaluator.max_sandboxes must be at least 1".to_string());
        }
        if self.evaluator.poll_interval_ms == 0 {
            return invalid("evaluator.poll_interval_ms must be positive".to_string());
        }
        if self.evaluator.max_compile_attempts == 0 {
            return invalid("evaluator.max_compile_attempts must be at least 1".to_string());
        }
        if self.evaluator.max_execute_attempts == 0 {
            return invalid("evaluator.max_execute_attempts must be at least 1".to_string());
        }
        if let Some(path) = self.sandbox.read_only_paths.iter().find(|p| p.is_relative()) {
            return invalid(format!(
                "sandbox.read_only_paths: {} is not absolute",
                path.display()
            ));
        }
        if self.languages.is_empty() {
            return invalid("no languages configured".to_string());
        }

        for (name, spec) in &self.languages {
            if spec.compile.is_empty() || spec.run.is_empty() {
                return invalid(format!("language {name}: compile and run must not be empty"));
            }
            for file in [&spec.source_file, &spec.artifact_file] {
                if file.is_empty() || file.contains('/') || file == ".." {
                    return invalid(format!("language {name}: bad file name {file:?}"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.evaluator.poll_interval_ms, 100);
        assert!(config.languages.contains_key("sh"));
        assert_eq!(config.sandbox.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(config.sandbox.cgroup_mode, CgroupMode::Auto);
        assert!(config.sandbox.confine_filesystem);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from("/nonexistent/judge-config").unwrap();
        assert_eq!(config.evaluator.max_compile_attempts, 3);
        assert_eq!(config.evaluator.max_execute_attempts, 3);
        assert_eq!(config.compile_limits.time_ms, 10_000);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("judge.toml")).unwrap();
        writeln!(
            file,
            r#"
[evaluator]
max_sandboxes = 2
keep_artifacts = true

[sandbox]
isolate_namespaces = true
cgroup_mode = "v1"
read_only_paths = ["/usr", "/opt/jdk"]

[languages.sh]
source_file = "main.sh"
artifact_file = "main.sh"
compile = ["/bin/sh", "-n", "main.sh"]
run = ["/bin/sh", "main.sh"]
"#
        )
        .unwrap();

        let path = dir.path().join("judge");
        let config = AppConfig::load_from(path.to_str().unwrap()).unwrap();

        assert_eq!(config.evaluator.max_sandboxes, 2);
        assert!(config.evaluator.keep_artifacts);
        assert!(config.sandbox.isolate_namespaces);
        assert_eq!(config.sandbox.cgroup_mode, CgroupMode::V1);
        assert!(config.sandbox.confine_filesystem);
        assert_eq!(
            config.sandbox.read_only_paths,
            vec![PathBuf::from("/usr"), PathBuf::from("/opt/jdk")]
        );
        assert_eq!(config.languages.len(), 1);
    }

    #[test]
    fn test_rejects_zero_sandboxes() {
        let mut config = AppConfig::default();
        config.evaluator.max_sandboxes = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_path_in_file_name() {
        let mut config = AppConfig::default();
        if let Some(spec) = config.languages.get_mut("c") {
            spec.artifact_file = "../main".to_string();
        }
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_relative_read_only_path() {
        let mut config = AppConfig::default();
        config.sandbox.read_only_paths.push(PathBuf::from("usr/local"));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
