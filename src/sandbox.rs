mod landlock;
mod limits;
mod output;
mod process_runner;
mod runner;
mod workspace;

pub use landlock::{DEFAULT_READONLY_PATHS, FilesystemPolicy};
pub use limits::ResourceLimits;
pub use output::OutputBuffer;
pub use process_runner::ProcessRunner;
pub use runner::SandboxRunner;
pub use workspace::{Workspace, prepare_work_root};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::JudgeConfig;
use crate::error::{JudgeError, Result};

/// Exit code reported for executions stopped by a time limit
pub const TIME_LIMIT_EXIT_CODE: i32 = 124;

/// A program ready to be started inside a workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

/// How a sandboxed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Exited(i32),
    /// Terminated by a signal other than the CPU limit one
    Signaled(i32),
    /// Wall-clock or CPU limit exceeded
    TimedOut,
    /// Interactive session saw no input and no output for the idle timeout
    IdleTimeout,
    /// Stopped on request (caller cancellation or shutdown)
    Cancelled,
}

impl RunStatus {
    /// Shell-style exit code: signals map to 128 + signal number
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(signal) => 128 + signal,
            Self::TimedOut | Self::IdleTimeout => TIME_LIMIT_EXIT_CODE,
            Self::Cancelled => 128 + libc::SIGKILL,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut | Self::IdleTimeout)
    }
}

/// Result of one sandboxed execution
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    /// Time from spawn until the process exited or was killed
    pub wall_time: Duration,
    pub output_truncated: bool,
}

/// Called with the pid of a freshly spawned process
pub type SpawnHook<'a> = Box<dyn FnOnce(u32) + Send + 'a>;

/// Channels connecting an interactive process to its session
pub struct InteractiveIo {
    /// Lines to write to the process's stdin, in order; `\n` is appended to each
    pub input: mpsc::Receiver<String>,
    /// Receives stdout and stderr interleaved as they arrive
    pub output: Arc<OutputBuffer>,
    pub idle_timeout: Duration,
    /// Invoked with the pid once the process is alive
    pub on_spawn: Box<dyn FnOnce(u32) + Send>,
}

/// Creates the sandbox runner for this host
///
/// Network isolation needs unprivileged user namespaces. When the host does not
/// allow them, processes still get their own process group, a scrubbed
/// environment, a private working directory and resource limits.
///
/// Filesystem confinement needs Landlock. Without it one execution could read
/// another's workspace, so a host lacking it is refused unless confinement is
/// disabled by configuration.
pub fn create_sandbox_runner(config: &JudgeConfig) -> Result<Arc<dyn SandboxRunner>> {
    let isolate_network = if !config.network_isolation {
        log::warn!("Network isolation disabled by configuration");
        false
    } else if ProcessRunner::supports_network_isolation() {
        true
    } else {
        log::warn!(
            "Unprivileged namespaces unavailable: sandboxed processes will NOT be cut off from the network"
        );
        false
    };

    let mut runner = ProcessRunner::new(isolate_network);
    if config.filesystem_isolation {
        let Some(abi) = FilesystemPolicy::abi_version() else {
            return Err(JudgeError::Internal(
                "Landlock is unavailable on this kernel; set `filesystem_isolation` to false to run unconfined".to_string(),
            ));
        };
        log::info!("Confining sandboxed processes with Landlock ABI v{abi}");
        runner = runner.confine_filesystem(FilesystemPolicy::new(config.readonly_paths.clone()));
    } else {
        log::warn!("Filesystem isolation disabled by configuration");
    }

    log::info!(
        "Creating ProcessRunner (network isolation: {}, filesystem isolation: {})",
        runner.isolates_network(),
        runner.confines_filesystem()
    );
    Ok(Arc::new(runner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Exited(3).exit_code(), 3);
        assert_eq!(RunStatus::Signaled(libc::SIGSEGV).exit_code(), 139);
        assert_eq!(RunStatus::TimedOut.exit_code(), TIME_LIMIT_EXIT_CODE);
        assert_eq!(RunStatus::IdleTimeout.exit_code(), TIME_LIMIT_EXIT_CODE);
        assert!(RunStatus::Exited(0).is_success());
        assert!(!RunStatus::Signaled(9).is_success());
        assert!(RunStatus::IdleTimeout.is_timeout());
    }
}
