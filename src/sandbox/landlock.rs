use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

const CREATE_RULESET_VERSION: u32 = 1;
const RULE_PATH_BENEATH: u32 = 1;

const ACCESS_EXECUTE: u64 = 1;
const ACCESS_WRITE_FILE: u64 = 1 << 1;
const ACCESS_READ_FILE: u64 = 1 << 2;
const ACCESS_READ_DIR: u64 = 1 << 3;
const ACCESS_REMOVE_DIR: u64 = 1 << 4;
const ACCESS_REMOVE_FILE: u64 = 1 << 5;
const ACCESS_MAKE_CHAR: u64 = 1 << 6;
const ACCESS_MAKE_DIR: u64 = 1 << 7;
const ACCESS_MAKE_REG: u64 = 1 << 8;
const ACCESS_MAKE_SOCK: u64 = 1 << 9;
const ACCESS_MAKE_FIFO: u64 = 1 << 10;
const ACCESS_MAKE_BLOCK: u64 = 1 << 11;
const ACCESS_MAKE_SYM: u64 = 1 << 12;
// ABI 2
const ACCESS_REFER: u64 = 1 << 13;
// ABI 3
const ACCESS_TRUNCATE: u64 = 1 << 14;

const ACCESS_ABI_1: u64 = ACCESS_EXECUTE
    | ACCESS_WRITE_FILE
    | ACCESS_READ_FILE
    | ACCESS_READ_DIR
    | ACCESS_REMOVE_DIR
    | ACCESS_REMOVE_FILE
    | ACCESS_MAKE_CHAR
    | ACCESS_MAKE_DIR
    | ACCESS_MAKE_REG
    | ACCESS_MAKE_SOCK
    | ACCESS_MAKE_FIFO
    | ACCESS_MAKE_BLOCK
    | ACCESS_MAKE_SYM;

// Rights that make sense on a rule whose target is not a directory
const FILE_ACCESS: u64 = ACCESS_EXECUTE | ACCESS_WRITE_FILE | ACCESS_READ_FILE | ACCESS_TRUNCATE;
const READ_ONLY: u64 = ACCESS_EXECUTE | ACCESS_READ_FILE | ACCESS_READ_DIR;
const DEVICE: u64 = ACCESS_READ_FILE | ACCESS_WRITE_FILE | ACCESS_TRUNCATE;

/// System locations a toolchain needs to start: interpreters, compilers, headers,
/// shared libraries and the loader configuration
pub const DEFAULT_READONLY_PATHS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/libx32", "/etc", "/opt",
];

const DEVICES: &[&str] = &["/dev/null", "/dev/zero", "/dev/random", "/dev/urandom"];

#[repr(C)]
struct RulesetAttr {
    handled_access_fs: u64,
}

#[repr(C, packed)]
struct PathBeneathAttr {
    allowed_access: u64,
    parent_fd: i32,
}

/// Which parts of the host filesystem a sandboxed process may see
///
/// The workspace is fully accessible, `readonly` paths can be read and
/// executed, a few character devices can be read and written, and everything
/// else (sibling workspaces, `/tmp`, home directories) is denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemPolicy {
    pub readonly: Vec<PathBuf>,
}

impl Default for FilesystemPolicy {
    fn default() -> Self {
        Self {
            readonly: DEFAULT_READONLY_PATHS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl FilesystemPolicy {
    pub fn new(readonly: Vec<PathBuf>) -> Self {
        Self { readonly }
    }

    /// Landlock ABI version of the running kernel, `None` when Landlock is unavailable
    pub fn abi_version() -> Option<u32> {
        let version = unsafe {
            libc::syscall(
                libc::SYS_landlock_create_ruleset,
                std::ptr::null::<RulesetAttr>(),
                0usize,
                CREATE_RULESET_VERSION,
            )
        };
        u32::try_from(version).ok().filter(|v| *v >= 1)
    }

    pub fn is_supported() -> bool {
        Self::abi_version().is_some()
    }

    /// Builds the ruleset for one process whose workspace is `workdir`
    ///
    /// Built in the parent; the child only has to enforce it, which keeps the
    /// work done between fork and exec to two syscalls.
    pub fn ruleset(&self, workdir: &Path) -> io::Result<Ruleset> {
        let abi = Self::abi_version().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "Landlock is not available")
        })?;
        let mut handled = ACCESS_ABI_1;
        if abi >= 2 {
            handled |= ACCESS_REFER;
        }
        if abi >= 3 {
            handled |= ACCESS_TRUNCATE;
        }

        let attr = RulesetAttr {
            handled_access_fs: handled,
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
            return Err(io::Error::last_os_error());
        }
        let ruleset = Ruleset {
            fd: unsafe { OwnedFd::from_raw_fd(fd as RawFd) },
            handled,
        };

        for path in &self.readonly {
            ruleset.allow(path, READ_ONLY, false)?;
        }
        for device in DEVICES {
            ruleset.allow(Path::new(device), DEVICE, false)?;
        }
        ruleset.allow(workdir, handled, true)?;
        Ok(ruleset)
    }
}

/// A Landlock ruleset ready to be enforced on a child process
#[derive(Debug)]
pub struct Ruleset {
    fd: OwnedFd,
    handled: u64,
}

impl Ruleset {
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn allow(&self, path: &Path, access: u64, required: bool) -> io::Result<()> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if !required && e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut access = access & self.handled;
        if !metadata.is_dir() {
            access &= FILE_ACCESS;
        }

        let target = open_path(path)?;
        let attr = PathBeneathAttr {
            allowed_access: access,
            parent_fd: target.as_raw_fd(),
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_landlock_add_rule,
                self.fd.as_raw_fd(),
                RULE_PATH_BENEATH,
                &attr as *const PathBeneathAttr,
                0u32,
            )
        };
        if ret < 0 {
            let e = io::Error::last_os_error();
            return Err(io::Error::new(
                e.kind(),
                format!("landlock rule for {}: {e}", path.display()),
            ));
        }
        Ok(())
    }
}

fn open_path(path: &Path) -> io::Result<OwnedFd> {
    let file = fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_PATH | libc::O_CLOEXEC)
        .open(path)?;
    Ok(file.into())
}

/// Confines the calling process to `ruleset`; irreversible
///
/// Runs in the forked child between fork and exec, so it only issues syscalls.
pub(super) fn restrict_self(ruleset: RawFd) -> io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::syscall(libc::SYS_landlock_restrict_self, ruleset, 0u32) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_covers_toolchain_locations() {
        let policy = FilesystemPolicy::default();
        assert!(policy.readonly.contains(&PathBuf::from("/usr")));
        assert!(policy.readonly.contains(&PathBuf::from("/etc")));
        assert!(!policy.readonly.iter().any(|p| p.starts_with("/tmp")));
    }

    #[test]
    fn test_ruleset_skips_missing_readonly_paths() {
        if !FilesystemPolicy::is_supported() {
            return;
        }
        let workdir = tempfile::tempdir().unwrap();
        let policy = FilesystemPolicy::new(vec![
            PathBuf::from("/usr"),
            PathBuf::from("/does/not/exist"),
        ]);
        let ruleset = policy.ruleset(workdir.path()).unwrap();
        assert!(ruleset.raw_fd() >= 0);
    }

    #[test]
    fn test_ruleset_requires_workdir() {
        if !FilesystemPolicy::is_supported() {
            return;
        }
        let policy = FilesystemPolicy::default();
        assert!(policy.ruleset(Path::new("/does/not/exist")).is_err());
    }
}
