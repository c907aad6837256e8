//! Filesystem confinement through Landlock.
//!
//! The ruleset is assembled by the supervisor, where allocation is allowed, and
//! only enforced by the child between fork and exec.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::core::traits::sandbox::SandboxError;

const CREATE_RULESET_VERSION: u32 = 1 << 0;
const RULE_PATH_BENEATH: u32 = 1;

const FS_EXECUTE: u64 = 1 << 0;
const FS_WRITE_FILE: u64 = 1 << 1;
const FS_READ_FILE: u64 = 1 << 2;
const FS_READ_DIR: u64 = 1 << 3;
const FS_REMOVE_DIR: u64 = 1 << 4;
const FS_REMOVE_FILE: u64 = 1 << 5;
const FS_MAKE_CHAR: u64 = 1 << 6;
const FS_MAKE_DIR: u64 = 1 << 7;
const FS_MAKE_REG: u64 = 1 << 8;
const FS_MAKE_SOCK: u64 = 1 << 9;
const FS_MAKE_FIFO: u64 = 1 << 10;
const FS_MAKE_BLOCK: u64 = 1 << 11;
const FS_MAKE_SYM: u64 = 1 << 12;
const FS_REFER: u64 = 1 << 13;
const FS_TRUNCATE: u64 = 1 << 14;
const FS_IOCTL_DEV: u64 = 1 << 15;

const SCOPE_ABSTRACT_UNIX_SOCKET: u64 = 1 << 0;
const SCOPE_SIGNAL: u64 = 1 << 1;

/// Rights that make sense on a single file rather than a directory.
const FILE_ACCESS: u64 = FS_EXECUTE | FS_WRITE_FILE | FS_READ_FILE | FS_TRUNCATE | FS_IOCTL_DEV;

const READ_ACCESS: u64 = FS_EXECUTE | FS_READ_FILE | FS_READ_DIR;
const DEVICE_ACCESS: u64 = FS_READ_FILE | FS_READ_DIR | FS_WRITE_FILE | FS_TRUNCATE | FS_IOCTL_DEV;
const SCRATCH_ACCESS: u64 = READ_ACCESS
    | FS_WRITE_FILE
    | FS_REMOVE_DIR
    | FS_REMOVE_FILE
    | FS_MAKE_DIR
    | FS_MAKE_REG
    | FS_MAKE_SYM
    | FS_MAKE_FIFO
    | FS_MAKE_SOCK
    | FS_REFER
    | FS_TRUNCATE;

#[repr(C)]
struct RulesetAttr {
    handled_access_fs: u64,
    handled_access_net: u64,
    scoped: u64,
}

#[repr(C, packed)]
struct PathBeneathAttr {
    allowed_access: u64,
    parent_fd: RawFd,
}

/// Landlock ABI of the running kernel.
pub(crate) fn abi() -> io::Result<u32> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_landlock_create_ruleset,
            std::ptr::null::<RulesetAttr>(),
            0usize,
            CREATE_RULESET_VERSION,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u32)
}

/// Every filesystem right the given ABI knows about.
fn handled_fs(abi: u32) -> u64 {
    let mut access = FS_EXECUTE
        | FS_WRITE_FILE
        | FS_READ_FILE
        | FS_READ_DIR
        | FS_REMOVE_DIR
        | FS_REMOVE_FILE
        | FS_MAKE_CHAR
        | FS_MAKE_DIR
        | FS_MAKE_REG
        | FS_MAKE_SOCK
        | FS_MAKE_FIFO
        | FS_MAKE_BLOCK
        | FS_MAKE_SYM;
    if abi >= 2 {
        access |= FS_REFER;
    }
    if abi >= 3 {
        access |= FS_TRUNCATE;
    }
    if abi >= 5 {
        access |= FS_IOCTL_DEV;
    }
    access
}

fn scoped(abi: u32) -> u64 {
    if abi >= 6 {
        SCOPE_ABSTRACT_UNIX_SOCKET | SCOPE_SIGNAL
    } else {
        0
    }
}

/// A ruleset granting read and execute on system paths, plain file access on
/// `/dev` and full access below one scratch directory.
#[derive(Debug)]
pub(crate) struct Ruleset {
    fd: OwnedFd,
    handled: u64,
}

impl Ruleset {
    pub fn new<P>(read_only: &[P], scratch: &Path) -> Result<Self, SandboxError>
    where
        P: AsRef<Path>,
    {
        let abi = abi().map_err(|e| SandboxError::Setup(format!("landlock unavailable: {e}")))?;
        let attr = RulesetAttr {
            handled_access_fs: handled_fs(abi),
            handled_access_net: 0,
            scoped: scoped(abi),
        };

        let fd = unsafe {
            libc::syscall(
                libc::SYS_landlock_create_ruleset,
                &attr as *const RulesetAttr,
                std::mem::size_of::<RulesetAttr>(),
                0u32,
            )
        };
        if fd < 0 {
            let e = io::Error::last_os_error();
            return Err(SandboxError::Setup(format!("landlock ruleset: {e}")));
        }
        let ruleset = Ruleset {
            fd: unsafe { OwnedFd::from_raw_fd(fd as RawFd) },
            handled: attr.handled_access_fs,
        };

        for path in read_only {
            let path = path.as_ref();
            match ruleset.allow(path, READ_ACCESS) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::trace!(path = %path.display(), "Skipping missing read-only path");
                }
                Err(e) => {
                    return Err(SandboxError::Setup(format!(
                        "landlock rule for {}: {e}",
                        path.display()
                    )));
                }
            }
        }
        ruleset
            .allow(Path::new("/dev"), DEVICE_ACCESS)
            .map_err(|e| SandboxError::Setup(format!("landlock rule for /dev: {e}")))?;
        ruleset
            .allow(scratch, SCRATCH_ACCESS)
            .map_err(|e| SandboxError::Setup(format!("landlock rule for scratch dir: {e}")))?;

        Ok(ruleset)
    }

    fn allow(&self, path: &Path, access: u64) -> io::Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_PATH | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let parent = unsafe { OwnedFd::from_raw_fd(fd) };

        let is_dir = std::fs::metadata(path)?.is_dir();
        let rule = PathBeneathAttr {
            allowed_access: rule_access(access, self.handled, is_dir),
            parent_fd: parent.as_raw_fd(),
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_landlock_add_rule,
                self.fd.as_raw_fd(),
                RULE_PATH_BENEATH,
                &rule as *const PathBeneathAttr,
                0u32,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Rights of one rule: limited to what the ruleset handles, and to file rights
/// when the path is not a directory.
fn rule_access(access: u64, handled: u64, is_dir: bool) -> u64 {
    let access = access & handled;
    if is_dir { access } else { access & FILE_ACCESS }
}

/// Runs in the forked child after `PR_SET_NO_NEW_PRIVS`. Nothing here allocates.
pub(crate) fn restrict(ruleset_fd: RawFd) -> io::Result<()> {
    if unsafe { libc::syscall(libc::SYS_landlock_restrict_self, ruleset_fd, 0u32) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
