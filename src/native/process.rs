use std::ffi::CString;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use wait4::{ResUse, ResourceUsage, Wait4};

use crate::config::SandboxSettings;
use crate::constants::{READER_GRACE, SANDBOX_PATH};
use crate::core::traits::sandbox::{ResourceLimits, SandboxError};
use crate::native::landlock;

const MIN_FILE_SIZE_BYTES: u64 = 64 * 1024 * 1024;
const SPAWN_ATTEMPTS: u32 = 5;

#[cfg(target_env = "gnu")]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(target_env = "gnu"))]
type Resource = libc::c_int;

/// One process to start inside an already prepared scratch directory.
pub(crate) struct Launch<'a> {
    pub argv: &'a [String],
    pub workdir: &'a Path,
    pub stdin: Vec<u8>,
    pub limits: &'a ResourceLimits,
    pub settings: &'a SandboxSettings,
    /// `cgroup.procs` files of the run's cgroups, joined by the child before exec.
    pub cgroup_procs: Vec<CString>,
    /// Landlock ruleset enforced right before exec. Must stay open until `run` returns.
    pub landlock: Option<RawFd>,
}

/// Raw facts about a finished run, before classification.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Evidence {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub cpu_ms: u64,
    pub wall_ms: u64,
    pub memory_kb: u64,
    pub wall_killed: bool,
    pub output_exceeded: bool,
    pub oom_killed: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Ceilings installed by the child between fork and exec. Plain values only:
/// nothing in `pre_exec` may allocate.
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    cpu_secs: u64,
    file_size_bytes: u64,
    open_files: u64,
    processes: Option<u64>,
    uid: Option<u32>,
    gid: Option<u32>,
    unshare: bool,
}

impl ChildLimits {
    fn new(limits: &ResourceLimits, settings: &SandboxSettings) -> Self {
        ChildLimits {
            cpu_secs: limits.time_ms.div_ceil(1000) + 1,
            file_size_bytes: limits.output_bytes.max(MIN_FILE_SIZE_BYTES),
            open_files: settings.max_open_files,
            // RLIMIT_NPROC counts every process of the uid, so it only helps
            // under a dedicated one. pids.max of the run cgroup always applies.
            processes: settings.uid.map(|_| u64::from(limits.processes.max(1))),
            uid: settings.uid,
            gid: settings.gid.or(settings.uid),
            unshare: settings.isolate_namespaces,
        }
    }
}

fn set_limit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn join_cgroup(procs: &CString) -> io::Result<()> {
    unsafe {
        let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, b"0".as_ptr().cast(), 1);
        libc::close(fd);
        if written != 1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Runs in the forked child, right before exec.
fn confine(
    limits: ChildLimits,
    cgroup_procs: &[CString],
    ruleset: Option<RawFd>,
) -> io::Result<()> {
    for procs in cgroup_procs {
        join_cgroup(procs)?;
    }

    set_limit(libc::RLIMIT_CPU, limits.cpu_secs, limits.cpu_secs + 1)?;
    set_limit(libc::RLIMIT_FSIZE, limits.file_size_bytes, limits.file_size_bytes)?;
    set_limit(libc::RLIMIT_CORE, 0, 0)?;
    set_limit(libc::RLIMIT_NOFILE, limits.open_files, limits.open_files)?;
    if let Some(processes) = limits.processes {
        set_limit(libc::RLIMIT_NPROC, processes, processes)?;
    }

    if let Some(uid) = limits.uid {
        let gid = limits.gid.unwrap_or(uid);
        unsafe {
            if libc::setgroups(0, std::ptr::null()) != 0
                || libc::setgid(gid) != 0
                || libc::setuid(uid) != 0
            {
                return Err(io::Error::last_os_error());
            }
        }
    }

    if limits.unshare {
        let flags = libc::CLONE_NEWUSER | libc::CLONE_NEWNET | libc::CLONE_NEWIPC | libc::CLONE_NEWUTS;
        if unsafe { libc::unshare(flags) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(fd) = ruleset {
        landlock::restrict(fd)?;
    }
    Ok(())
}

fn kill_group(pgid: i32) {
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

/// `./name` is looked up in the scratch directory; anything else through `PATH`.
fn resolve_program(program: &str, workdir: &Path) -> PathBuf {
    match program.strip_prefix("./") {
        Some(local) => workdir.join(local),
        None => PathBuf::from(program),
    }
}

fn spawn_reader<R>(
    mut source: R,
    cap: u64,
    pgid: i32,
    exceeded: Arc<AtomicBool>,
) -> mpsc::Receiver<Vec<u8>>
where
    R: Read + Send + 'static,
{
    let cap = usize::try_from(cap).unwrap_or(usize::MAX);
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let mut output = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let room = cap.saturating_sub(output.len());
                    if n > room {
                        output.extend_from_slice(&chunk[..room]);
                        exceeded.store(true, Ordering::SeqCst);
                        kill_group(pgid);
                        break;
                    }
                    output.extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send(output);
    });
    rx
}

/// Starts `launch`, enforces the wall clock and output caps, and reaps it.
pub(crate) fn run(launch: Launch<'_>) -> Result<Evidence, SandboxError> {
    let Some((program, args)) = launch.argv.split_first() else {
        return Err(SandboxError::Launch {
            program: String::new(),
            msg: "empty command".to_string(),
        });
    };

    let child_limits = ChildLimits::new(launch.limits, launch.settings);
    let cgroup_procs = launch.cgroup_procs;
    let ruleset = launch.landlock;

    let mut command = Command::new(resolve_program(program, launch.workdir));
    command
        .args(args)
        .current_dir(launch.workdir)
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", launch.workdir)
        .env("TMPDIR", launch.workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    unsafe {
        command.pre_exec(move || confine(child_limits, &cgroup_procs, ruleset));
    }

    let mut attempt = 1;
    let mut child = loop {
        match command.spawn() {
            Ok(child) => break child,
            // A concurrent fork may briefly hold a write handle to a freshly copied binary.
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_ATTEMPTS => {
                attempt += 1;
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                return Err(SandboxError::Launch {
                    program: program.clone(),
                    msg: e.to_string(),
                });
            }
        }
    };

    let start = Instant::now();
    let pgid = child.id() as i32;
    let output_exceeded = Arc::new(AtomicBool::new(false));
    let wall_killed = Arc::new(AtomicBool::new(false));

    if let Some(mut stdin) = child.stdin.take() {
        let input = launch.stdin;
        thread::spawn(move || {
            // The program may exit without reading its input.
            let _ = stdin.write_all(&input);
        });
    }

    let stdout = child
        .stdout
        .take()
        .map(|s| spawn_reader(s, launch.limits.output_bytes, pgid, output_exceeded.clone()));
    let stderr = child
        .stderr
        .take()
        .map(|s| spawn_reader(s, launch.limits.output_bytes, pgid, output_exceeded.clone()));

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let wall = Duration::from_millis(launch.limits.wall_time_ms.max(1));
    let watchdog_flag = wall_killed.clone();
    thread::spawn(move || {
        if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(wall) {
            watchdog_flag.store(true, Ordering::SeqCst);
            kill_group(pgid);
        }
    });

    let waited = child.wait4();
    let wall_ms = start.elapsed().as_millis() as u64;
    let _ = done_tx.send(());
    // Leftover members of the group must not outlive the run.
    kill_group(pgid);

    let ResUse {
        status,
        rusage: ResourceUsage {
            utime,
            stime,
            maxrss,
        },
    } = waited.map_err(|e| SandboxError::Supervise(format!("wait4: {e}")))?;

    let collect = |rx: Option<mpsc::Receiver<Vec<u8>>>| {
        rx.and_then(|rx| rx.recv_timeout(READER_GRACE).ok())
            .unwrap_or_default()
    };

    Ok(Evidence {
        exit_code: status.code(),
        signal: status.signal(),
        cpu_ms: (utime + stime).as_millis() as u64,
        wall_ms,
        memory_kb: maxrss / 1024,
        wall_killed: wall_killed.load(Ordering::SeqCst),
        output_exceeded: output_exceeded.load(Ordering::SeqCst),
        oom_killed: false,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}
