use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::CgroupMode;
use crate::constants::CGROUP_PARENT;
use crate::core::traits::sandbox::SandboxError;

const CONTROLLERS: [&str; 2] = ["memory", "pids"];

/// Where per-run cgroups are created. Resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CgroupTree {
    /// Unified hierarchy: one parent with memory and pids enabled for children.
    V2 { parent: PathBuf },
    /// Legacy hierarchy: a parent under each controller mount.
    V1 { memory: PathBuf, pids: PathBuf },
}

fn setup_err(what: &str, path: &Path, e: std::io::Error) -> SandboxError {
    SandboxError::Setup(format!("cgroup {what} {}: {e}", path.display()))
}

impl CgroupTree {
    pub fn detect(mode: CgroupMode, root: &Path) -> Result<Self, SandboxError> {
        match mode {
            CgroupMode::V2 => Self::unified(root),
            CgroupMode::V1 => Self::legacy(root),
            CgroupMode::Auto => Self::unified(root).or_else(|v2| {
                Self::legacy(root).map_err(|v1| {
                    SandboxError::Setup(format!(
                        "no usable cgroup hierarchy under {}: v2: {v2}; v1: {v1}",
                        root.display()
                    ))
                })
            }),
        }
    }

    fn unified(root: &Path) -> Result<Self, SandboxError> {
        let available = root.join("cgroup.controllers");
        let controllers =
            fs::read_to_string(&available).map_err(|e| setup_err("read", &available, e))?;
        if let Some(missing) = missing_controller(&controllers) {
            return Err(SandboxError::Setup(format!(
                "{missing} controller is not available in {}",
                root.display()
            )));
        }

        enable_controllers(root)?;
        let parent = root.join(CGROUP_PARENT);
        fs::create_dir_all(&parent).map_err(|e| setup_err("create", &parent, e))?;
        enable_controllers(&parent)?;

        Ok(CgroupTree::V2 { parent })
    }

    fn legacy(root: &Path) -> Result<Self, SandboxError> {
        let [memory, pids] = CONTROLLERS.map(|controller| root.join(controller));
        for mount in [&memory, &pids] {
            if !mount.join("cgroup.procs").exists() {
                return Err(SandboxError::Setup(format!(
                    "{} is not a cgroup v1 controller mount",
                    mount.display()
                )));
            }
        }

        let [memory, pids] = [memory, pids].map(|mount| mount.join(CGROUP_PARENT));
        for parent in [&memory, &pids] {
            fs::create_dir_all(parent).map_err(|e| setup_err("create", parent, e))?;
        }
        Ok(CgroupTree::V1 { memory, pids })
    }
}

fn missing_controller(listed: &str) -> Option<&'static str> {
    CONTROLLERS
        .into_iter()
        .find(|wanted| !listed.split_whitespace().any(|c| c == *wanted))
}

/// Lets children of `dir` use the memory and pids controllers.
fn enable_controllers(dir: &Path) -> Result<(), SandboxError> {
    let control = dir.join("cgroup.subtree_control");
    let enabled = fs::read_to_string(&control).unwrap_or_default();
    if missing_controller(&enabled).is_none() {
        return Ok(());
    }
    fs::write(&control, "+memory +pids").map_err(|e| setup_err("write", &control, e))
}

/// Per-run cgroup. Its members are killed and its directories removed on drop.
#[derive(Debug)]
pub(crate) enum RunCgroup {
    V2 { path: PathBuf },
    V1 { memory: PathBuf, pids: PathBuf },
}

/// What the cgroup observed about a finished run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CgroupEvidence {
    pub oom_killed: bool,
    pub peak_bytes: Option<u64>,
}

impl RunCgroup {
    pub fn create(
        tree: &CgroupTree,
        name: &str,
        memory_bytes: u64,
        processes: u32,
    ) -> Result<Self, SandboxError> {
        let memory_bytes = memory_bytes.to_string();
        let processes = processes.max(1).to_string();

        match tree {
            CgroupTree::V2 { parent } => {
                let path = parent.join(name);
                fs::create_dir(&path).map_err(|e| setup_err("create", &path, e))?;
                let cgroup = RunCgroup::V2 { path: path.clone() };

                write(&path, "memory.max", &memory_bytes)?;
                write(&path, "pids.max", &processes)?;
                for (file, value) in [("memory.swap.max", "0"), ("memory.oom.group", "1")] {
                    if let Err(e) = write(&path, file, value) {
                        tracing::debug!(error = %e, "Optional cgroup knob unavailable");
                    }
                }
                Ok(cgroup)
            }
            CgroupTree::V1 { memory, pids } => {
                let (memory, pids) = (memory.join(name), pids.join(name));
                fs::create_dir(&memory).map_err(|e| setup_err("create", &memory, e))?;
                let cgroup = RunCgroup::V1 {
                    memory: memory.clone(),
                    pids: pids.clone(),
                };
                fs::create_dir(&pids).map_err(|e| setup_err("create", &pids, e))?;

                write(&memory, "memory.limit_in_bytes", &memory_bytes)?;
                // memsw must not drop below the plain limit, so it goes second.
                if memory.join("memory.memsw.limit_in_bytes").exists() {
                    write(&memory, "memory.memsw.limit_in_bytes", &memory_bytes)?;
                }
                write(&pids, "pids.max", &processes)?;
                Ok(cgroup)
            }
        }
    }

    fn dirs(&self) -> Vec<&Path> {
        match self {
            RunCgroup::V2 { path } => vec![path],
            RunCgroup::V1 { memory, pids } => vec![memory, pids],
        }
    }

    /// `cgroup.procs` files the child writes "0" into from `pre_exec`.
    pub fn procs_paths(&self) -> Result<Vec<CString>, SandboxError> {
        self.dirs()
            .into_iter()
            .map(|dir| {
                CString::new(dir.join("cgroup.procs").as_os_str().as_bytes())
                    .map_err(|e| SandboxError::Setup(format!("cgroup path: {e}")))
            })
            .collect()
    }

    /// Kills every process still in the cgroup.
    pub fn kill_all(&self) {
        if let RunCgroup::V2 { path } = self {
            let kill = path.join("cgroup.kill");
            if kill.exists() && fs::write(kill, "1").is_ok() {
                return;
            }
        }
        let procs = match self {
            RunCgroup::V2 { path } => path.join("cgroup.procs"),
            RunCgroup::V1 { pids, .. } => pids.join("cgroup.procs"),
        };
        let members = fs::read_to_string(procs).unwrap_or_default();
        for pid in members.lines().filter_map(|l| l.trim().parse::<libc::pid_t>().ok()) {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }

    pub fn evidence(&self) -> CgroupEvidence {
        let read = |dir: &Path, file: &str| fs::read_to_string(dir.join(file)).ok();
        let (events, peak) = match self {
            RunCgroup::V2 { path } => (read(path, "memory.events"), read(path, "memory.peak")),
            RunCgroup::V1 { memory, .. } => (
                read(memory, "memory.oom_control"),
                read(memory, "memory.max_usage_in_bytes"),
            ),
        };

        CgroupEvidence {
            oom_killed: oom_kills(&events.unwrap_or_default()) > 0,
            peak_bytes: peak.and_then(|s| s.trim().parse().ok()),
        }
    }
}

fn write(dir: &Path, file: &str, value: &str) -> Result<(), SandboxError> {
    let path = dir.join(file);
    fs::write(&path, value).map_err(|e| setup_err("write", &path, e))
}

/// The `oom_kill` counter of `memory.events` (v2) or `memory.oom_control` (v1).
fn oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

impl Drop for RunCgroup {
    fn drop(&mut self) {
        self.kill_all();
        for dir in self.dirs() {
            remove_when_empty(dir);
        }
    }
}

fn remove_when_empty(dir: &Path) {
    // rmdir fails with EBUSY until the last member has been reaped.
    for _ in 0..50 {
        match fs::remove_dir(dir) {
            Ok(()) => return,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(_) => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    tracing::warn!(path = %dir.display(), "Failed to remove cgroup");
}
