use std::io;
use std::time::Duration;

use crate::config::LimitsConfig;

/// Limits enforced on one sandboxed process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub wall_time: Duration,
    pub cpu_time: Duration,
    /// Address space in bytes
    pub memory: u64,
    /// Bytes kept per captured stream
    pub output: usize,
    /// Largest file the process may create, in bytes
    pub file_size: u64,
    pub open_files: u64,
}

impl ResourceLimits {
    /// CPU limit in whole seconds, rounded up and never below one
    pub fn cpu_seconds(&self) -> u64 {
        let millis = self.cpu_time.as_millis() as u64;
        millis.div_ceil(1000).max(1)
    }

    pub(super) fn rlimits(&self) -> RlimitSet {
        RlimitSet {
            address_space: self.memory,
            stack: self.memory / 2,
            cpu_seconds: self.cpu_seconds(),
            file_size: self.file_size,
            open_files: self.open_files,
        }
    }
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            wall_time: config.time_limit.into(),
            cpu_time: config.cpu_limit.into(),
            memory: config.memory_limit.bytes(),
            output: config.output_limit.bytes() as usize,
            file_size: config.file_size_limit.bytes(),
            open_files: config.open_files,
        }
    }
}

/// Plain values copied into the child between fork and exec
#[derive(Debug, Clone, Copy)]
pub(super) struct RlimitSet {
    address_space: u64,
    stack: u64,
    cpu_seconds: u64,
    file_size: u64,
    open_files: u64,
}

impl RlimitSet {
    /// Applies every limit to the calling process.
    ///
    /// Runs in the forked child, so it must stay async-signal-safe: no allocation, no locks.
    pub(super) fn apply(&self) -> io::Result<()> {
        // SIGXCPU at the soft CPU limit, SIGKILL one second later
        let limits = [
            (libc::RLIMIT_AS, self.address_space, self.address_space),
            (libc::RLIMIT_STACK, self.stack, self.stack),
            (libc::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1),
            (libc::RLIMIT_FSIZE, self.file_size, self.file_size),
            (libc::RLIMIT_NOFILE, self.open_files, self.open_files),
            (libc::RLIMIT_CORE, 0, 0),
        ];

        for (resource, soft, hard) in limits {
            let mut current = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
                return Err(io::Error::last_os_error());
            }
            // An unprivileged process can only lower its hard limits
            let hard = (hard as libc::rlim_t).min(current.rlim_max);
            let limit = libc::rlimit {
                rlim_cur: (soft as libc::rlim_t).min(hard),
                rlim_max: hard,
            };
            if unsafe { libc::setrlimit(resource, &limit) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KiloByte, MilliSecond};

    #[test]
    fn test_limits_from_config() {
        let config = LimitsConfig {
            time_limit: MilliSecond(1500),
            cpu_limit: MilliSecond(1200),
            memory_limit: KiloByte(1024),
            output_limit: KiloByte(4),
            file_size_limit: KiloByte(8),
            open_files: 16,
        };
        let limits = ResourceLimits::from(&config);
        assert_eq!(limits.wall_time, Duration::from_millis(1500));
        assert_eq!(limits.memory, 1024 * 1024);
        assert_eq!(limits.output, 4096);
        assert_eq!(limits.file_size, 8192);
        assert_eq!(limits.cpu_seconds(), 2);
    }

    #[test]
    fn test_cpu_seconds_never_zero() {
        let limits = ResourceLimits {
            cpu_time: Duration::from_millis(10),
            ..ResourceLimits::from(&LimitsConfig::batch())
        };
        assert_eq!(limits.cpu_seconds(), 1);
    }
}
