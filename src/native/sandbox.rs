use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;
use uuid::Uuid;

use crate::config::SandboxSettings;
use crate::core::traits::sandbox::{
    CollectedFile, FileSource, ResourceLimits, RunOutcome, RunRequest, RunStatus, SandboxError,
    SandboxFile, SandboxManager,
};
use crate::native::{
    cgroup::{CgroupTree, RunCgroup},
    landlock::{self, Ruleset},
    process::{self, Evidence, Launch},
};

/// Runs each request as a child process inside its own cgroup, confined by
/// rlimits and, by default, a Landlock ruleset limiting writes to its scratch
/// directory.
#[derive(Clone, Debug)]
pub struct NativeSandboxManager {
    settings: Arc<SandboxSettings>,
    scratch_root: PathBuf,
    cgroups: CgroupTree,
}

impl NativeSandboxManager {
    pub fn new<T>(settings: SandboxSettings, scratch_root: T) -> Result<Self, SandboxError>
    where
        T: AsRef<Path>,
    {
        let scratch_root = scratch_root.as_ref().to_path_buf();
        fs::create_dir_all(&scratch_root).map_err(|e| {
            SandboxError::Setup(format!("scratch root {}: {e}", scratch_root.display()))
        })?;

        let cgroups = CgroupTree::detect(settings.cgroup_mode, &settings.cgroup_root)?;
        let landlock_abi = if settings.confine_filesystem {
            let abi = landlock::abi().map_err(|e| {
                SandboxError::Setup(format!(
                    "filesystem confinement needs Landlock: {e}; \
                     set sandbox.confine_filesystem = false to run without it"
                ))
            })?;
            Some(abi)
        } else {
            tracing::warn!("Filesystem confinement is disabled");
            None
        };
        tracing::info!(?cgroups, ?landlock_abi, "Native sandbox ready");

        Ok(NativeSandboxManager {
            settings: Arc::new(settings),
            scratch_root,
            cgroups,
        })
    }

    fn run_blocking(&self, request: RunRequest) -> Result<RunOutcome, SandboxError> {
        let run_id = Uuid::new_v4();
        let scratch = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| SandboxError::Setup(format!("scratch dir: {e}")))?;

        if let Some(uid) = self.settings.uid {
            let gid = self.settings.gid.unwrap_or(uid);
            std::os::unix::fs::chown(scratch.path(), Some(uid), Some(gid))
                .map_err(|e| SandboxError::Setup(format!("chown scratch dir: {e}")))?;
        }
        stage_files(scratch.path(), &request.files, self.settings.file_mode)?;

        let cgroup = RunCgroup::create(
            &self.cgroups,
            &format!("run-{run_id}"),
            request.limits.memory_kb * 1024,
            request.limits.processes,
        )?;
        let ruleset = if self.settings.confine_filesystem {
            Some(Ruleset::new(&self.settings.read_only_paths, scratch.path())?)
        } else {
            None
        };

        tracing::debug!(%run_id, argv = %request.argv.iter().join(" "), "Starting sandboxed run");
        let mut evidence = process::run(Launch {
            argv: &request.argv,
            workdir: scratch.path(),
            stdin: request.stdin,
            limits: &request.limits,
            settings: &self.settings,
            cgroup_procs: cgroup.procs_paths()?,
            landlock: ruleset.as_ref().map(Ruleset::raw_fd),
        })?;
        drop(ruleset);

        let observed = cgroup.evidence();
        evidence.oom_killed = observed.oom_killed;
        if let Some(peak) = observed.peak_bytes {
            evidence.memory_kb = evidence.memory_kb.max(peak / 1024);
        }
        drop(cgroup);

        let status = classify(&evidence, &request.limits);
        let collected = collect_files(scratch.path(), &request.collect)?;
        tracing::debug!(
            %run_id,
            %status,
            cpu_ms = evidence.cpu_ms,
            wall_ms = evidence.wall_ms,
            memory_kb = evidence.memory_kb,
            "Sandboxed run finished"
        );

        if let Err(e) = scratch.close() {
            tracing::warn!(%run_id, error = %e, "Failed to remove scratch dir");
        }

        Ok(RunOutcome {
            status,
            stdout: evidence.stdout,
            stderr: evidence.stderr,
            time_ms: evidence.cpu_ms,
            wall_time_ms: evidence.wall_ms,
            memory_kb: evidence.memory_kb,
            collected,
        })
    }
}

#[async_trait::async_trait]
impl SandboxManager for NativeSandboxManager {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, SandboxError> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.run_blocking(request))
            .await
            .map_err(|e| SandboxError::Supervise(e.to_string()))?
    }
}

/// Limit breaches take precedence over how the process ended: a program
/// killed for exceeding its budget is reported as that breach.
pub(crate) fn classify(evidence: &Evidence, limits: &ResourceLimits) -> RunStatus {
    let signal = evidence.signal;

    if evidence.wall_killed || evidence.cpu_ms > limits.time_ms || signal == Some(libc::SIGXCPU) {
        RunStatus::TimeLimitExceeded
    } else if evidence.oom_killed || evidence.memory_kb > limits.memory_kb {
        RunStatus::MemoryLimitExceeded
    } else if evidence.output_exceeded || signal == Some(libc::SIGXFSZ) {
        RunStatus::OutputLimitExceeded
    } else if let Some(signal) = signal {
        RunStatus::Signaled(signal)
    } else {
        RunStatus::Exited(evidence.exit_code.unwrap_or(-1))
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

fn stage_files(dir: &Path, files: &[SandboxFile], file_mode: u32) -> Result<(), SandboxError> {
    for file in files {
        if !valid_name(&file.name) {
            return Err(SandboxError::Setup(format!("invalid file name {:?}", file.name)));
        }
        let dest = dir.join(&file.name);
        let written = match &file.source {
            FileSource::Bytes(contents) => fs::write(&dest, contents),
            FileSource::Path(source) => fs::copy(source, &dest).map(|_| ()),
        };
        let mode = if file.executable { 0o755 } else { file_mode };
        written
            .and_then(|()| fs::set_permissions(&dest, fs::Permissions::from_mode(mode)))
            .map_err(|e| SandboxError::Setup(format!("staging {}: {e}", file.name)))?;
    }
    Ok(())
}

fn collect_files(dir: &Path, names: &[String]) -> Result<Vec<CollectedFile>, SandboxError> {
    let mut collected = Vec::new();
    for name in names {
        if !valid_name(name) {
            return Err(SandboxError::Setup(format!("invalid file name {name:?}")));
        }
        match fs::read(dir.join(name)) {
            Ok(contents) => collected.push(CollectedFile {
                name: name.clone(),
                contents,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SandboxError::Supervise(format!("collecting {name}: {e}"))),
        }
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CgroupMode;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            time_ms: 1000,
            wall_time_ms: 5000,
            memory_kb: 256 * 1024,
            output_bytes: 1024 * 1024,
            processes: 8,
        }
    }

    fn manager() -> (NativeSandboxManager, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let manager = NativeSandboxManager::new(SandboxSettings::default(), root.path()).unwrap();
        (manager, root)
    }

    fn shell(script: &str) -> RunRequest {
        RunRequest {
            argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
            limits: limits(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_precedence() {
        let limits = limits();
        let exited = Evidence {
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(classify(&exited, &limits), RunStatus::Exited(0));

        let timed_out = Evidence {
            signal: Some(libc::SIGKILL),
            wall_killed: true,
            oom_killed: true,
            ..Default::default()
        };
        assert_eq!(classify(&timed_out, &limits), RunStatus::TimeLimitExceeded);

        let over_cpu = Evidence {
            exit_code: Some(0),
            cpu_ms: 1001,
            ..Default::default()
        };
        assert_eq!(classify(&over_cpu, &limits), RunStatus::TimeLimitExceeded);

        let xcpu = Evidence {
            signal: Some(libc::SIGXCPU),
            ..Default::default()
        };
        assert_eq!(classify(&xcpu, &limits), RunStatus::TimeLimitExceeded);

        let oom = Evidence {
            signal: Some(libc::SIGKILL),
            oom_killed: true,
            output_exceeded: true,
            ..Default::default()
        };
        assert_eq!(classify(&oom, &limits), RunStatus::MemoryLimitExceeded);

        let heavy = Evidence {
            exit_code: Some(0),
            memory_kb: limits.memory_kb + 1,
            ..Default::default()
        };
        assert_eq!(classify(&heavy, &limits), RunStatus::MemoryLimitExceeded);

        let chatty = Evidence {
            signal: Some(libc::SIGKILL),
            output_exceeded: true,
            ..Default::default()
        };
        assert_eq!(classify(&chatty, &limits), RunStatus::OutputLimitExceeded);

        let xfsz = Evidence {
            signal: Some(libc::SIGXFSZ),
            ..Default::default()
        };
        assert_eq!(classify(&xfsz, &limits), RunStatus::OutputLimitExceeded);

        let segv = Evidence {
            signal: Some(libc::SIGSEGV),
            ..Default::default()
        };
        assert_eq!(classify(&segv, &limits), RunStatus::Signaled(libc::SIGSEGV));
    }

    #[test]
    fn test_rejects_unsafe_names() {
        for name in ["", ".", "..", "../x", "a/b"] {
            assert!(!valid_name(name), "{name:?}");
        }
        assert!(valid_name("main.cpp"));
    }

    #[tokio::test]
    async fn test_pipes_stdin_to_stdout() {
        let (manager, _root) = manager();
        let outcome = manager
            .run(RunRequest {
                argv: vec!["cat".into()],
                stdin: b"hello\n".to_vec(),
                limits: limits(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert_eq!(outcome.stdout, b"hello\n");
        assert!(outcome.memory_kb > 0);
    }

    #[tokio::test]
    async fn test_reports_exit_code_and_stderr() {
        let (manager, _root) = manager();
        let outcome = manager.run(shell("echo oops >&2; exit 3")).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Exited(3));
        assert_eq!(outcome.stderr, b"oops\n");
        assert!(outcome.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_reports_fatal_signal() {
        let (manager, _root) = manager();
        let outcome = manager.run(shell("kill -SEGV $$")).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Signaled(libc::SIGSEGV));
    }

    #[tokio::test]
    async fn test_wall_clock_kill() {
        let (manager, _root) = manager();
        let mut request = shell("sleep 5");
        request.limits.wall_time_ms = 300;

        let outcome = manager.run(request).await.unwrap();
        assert_eq!(outcome.status, RunStatus::TimeLimitExceeded);
        assert!(outcome.wall_time_ms < 3000, "{}", outcome.wall_time_ms);
    }

    #[tokio::test]
    async fn test_cpu_limit() {
        let (manager, _root) = manager();
        let mut request = shell("while :; do :; done");
        request.limits.time_ms = 300;
        request.limits.wall_time_ms = 10_000;

        let outcome = manager.run(request).await.unwrap();
        assert_eq!(outcome.status, RunStatus::TimeLimitExceeded);
    }

    #[tokio::test]
    async fn test_output_limit() {
        let (manager, _root) = manager();
        let mut request = RunRequest {
            argv: vec!["yes".into()],
            limits: limits(),
            ..Default::default()
        };
        request.limits.output_bytes = 4096;

        let outcome = manager.run(request).await.unwrap();
        assert_eq!(outcome.status, RunStatus::OutputLimitExceeded);
        assert_eq!(outcome.stdout.len(), 4096);
    }

    #[tokio::test]
    async fn test_memory_limit() {
        let (manager, _root) = manager();
        let mut request = shell(r"x=$(head -c 100000000 /dev/zero | tr '\000' a); echo ${#x}");
        request.limits.memory_kb = 16 * 1024;
        request.limits.wall_time_ms = 20_000;
        request.limits.time_ms = 10_000;

        let outcome = manager.run(request).await.unwrap();
        assert_eq!(outcome.status, RunStatus::MemoryLimitExceeded);
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let (manager, _root) = manager();
        let result = manager
            .run(RunRequest {
                argv: vec!["./main".into()],
                limits: limits(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(SandboxError::Launch { .. })));

        let empty = manager.run(RunRequest::default()).await;
        assert!(matches!(empty, Err(SandboxError::Launch { .. })));
    }

    #[tokio::test]
    async fn test_stages_and_collects_files() {
        let (manager, root) = manager();
        let host = tempfile::tempdir().unwrap();
        let script = host.path().join("prog.sh");
        fs::write(&script, "#!/bin/sh\ntr a-z A-Z < in.txt > out.txt\n").unwrap();

        let outcome = manager
            .run(RunRequest {
                argv: vec!["./prog.sh".into()],
                files: vec![
                    SandboxFile::bytes("in.txt", "abc"),
                    SandboxFile::path("prog.sh", &script, true),
                ],
                collect: vec!["out.txt".into(), "missing.txt".into()],
                limits: limits(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert_eq!(
            outcome.collected,
            vec![CollectedFile {
                name: "out.txt".into(),
                contents: b"ABC".to_vec(),
            }]
        );
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_staged_files_use_configured_mode() {
        let root = tempfile::tempdir().unwrap();
        let settings = SandboxSettings {
            file_mode: 0o600,
            ..Default::default()
        };
        let manager = NativeSandboxManager::new(settings, root.path()).unwrap();

        let mut request = shell("stat -c %a in.txt");
        request.files = vec![SandboxFile::bytes("in.txt", "1")];
        let outcome = manager.run(request).await.unwrap();
        assert_eq!(outcome.stdout, b"600\n");
    }

    #[tokio::test]
    async fn test_invalid_file_name_is_setup_error() {
        let (manager, root) = manager();
        let mut request = shell("true");
        request.files = vec![SandboxFile::bytes("../escape", "x")];

        let result = manager.run(request).await;
        assert!(matches!(result, Err(SandboxError::Setup(_))));
        assert!(!root.path().join("escape").exists());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_non_cgroup_root() {
        let root = tempfile::tempdir().unwrap();
        for cgroup_mode in [CgroupMode::Auto, CgroupMode::V1, CgroupMode::V2] {
            let settings = SandboxSettings {
                cgroup_root: root.path().to_path_buf(),
                cgroup_mode,
                ..Default::default()
            };
            let result = NativeSandboxManager::new(settings, root.path().join("scratch"));
            assert!(matches!(result, Err(SandboxError::Setup(_))), "{cgroup_mode:?}");
        }
    }

    #[tokio::test]
    async fn test_cannot_touch_files_outside_scratch() {
        let (manager, root) = manager();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("1.out"), "expected answer").unwrap();

        let dir = outside.path().display();
        let script = format!(
            "cat {dir}/1.out; echo planted > {dir}/planted; \
             echo scratch > note.txt && cat note.txt"
        );
        let outcome = manager.run(shell(&script)).await.unwrap();

        assert_eq!(outcome.stdout, b"scratch\n");
        assert!(!outcome.stderr.is_empty());
        assert!(!outside.path().join("planted").exists());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_system_paths_are_read_only() {
        let (manager, _root) = manager();
        let outcome = manager
            .run(shell("head -c 1 /etc/passwd >/dev/null && touch /etc/judge-planted"))
            .await
            .unwrap();

        assert_ne!(outcome.status, RunStatus::Exited(0));
        assert!(!Path::new("/etc/judge-planted").exists());
    }

    #[tokio::test]
    async fn test_one_shot_allocation_is_memory_limit() {
        let (manager, _root) = manager();
        let mut request = shell("dd if=/dev/zero of=/dev/null bs=200M count=1");
        request.limits.memory_kb = 16 * 1024;

        let outcome = manager.run(request).await.unwrap();
        assert_eq!(outcome.status, RunStatus::MemoryLimitExceeded);
    }

    #[tokio::test]
    async fn test_process_cap_applies_without_dedicated_uid() {
        let (manager, _root) = manager();
        let mut request = shell("for i in 1 2 3 4 5 6 7 8; do sleep 1 & done; wait");
        request.limits.processes = 4;

        let outcome = manager.run(request).await.unwrap();
        assert_ne!(outcome.status, RunStatus::Exited(0));
        let stderr = String::from_utf8_lossy(&outcome.stderr).to_lowercase();
        assert!(stderr.contains("fork"), "{stderr}");
    }
}
