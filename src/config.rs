use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Deserialize;

use crate::sandbox::DEFAULT_READONLY_PATHS;

#[derive(Parser, Debug, Default)]
#[command(name = "arena-judge", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Number of sandbox workers, i.e. how many executions may run at once
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<usize>,

    /// Address to bind the HTTP server to
    #[arg(long = "bind")]
    pub bind_address: Option<String>,

    /// Port to bind the HTTP server to
    #[arg(long = "port", short = 'p')]
    pub bind_port: Option<u16>,

    /// Directory holding `<problem_id>/driver.*` and `<problem_id>/test_data.txt`
    #[arg(long = "problems-dir")]
    pub problems_dir: Option<PathBuf>,
}

impl CliArgs {
    /// Load the configuration file (if any), apply command line overrides and validate
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("Failed to open config file {path}"))?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)
                    .with_context(|| format!("Failed to parse config file {path}"))?
            }
            None => Config::default(),
        };

        if let Some(workers) = self.workers {
            config.judge.workers = workers;
        }
        if let Some(address) = &self.bind_address {
            config.server.bind_address = Some(address.clone());
        }
        if let Some(port) = self.bind_port {
            config.server.bind_port = Some(port);
        }
        if let Some(dir) = &self.problems_dir {
            config.judge.problems_dir = Some(dir.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub judge: JudgeConfig,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.judge.workers == 0 {
            bail!("The number of workers must not be 0");
        }
        for (name, limits) in [
            ("batch_limits", &self.judge.batch_limits),
            ("compile_limits", &self.judge.compile_limits),
            ("playground_limits", &self.judge.playground_limits),
        ] {
            if limits.time_limit.0 == 0 || limits.cpu_limit.0 == 0 {
                bail!("{name}: time limits must be positive");
            }
            if limits.memory_limit.0 == 0 || limits.output_limit.0 == 0 {
                bail!("{name}: memory and output limits must be positive");
            }
        }
        if self.judge.idle_timeout.0 == 0 || self.judge.reap_interval.0 == 0 {
            bail!("idle_timeout and reap_interval must be positive");
        }
        if self.judge.max_pending_inputs == 0 {
            bail!("max_pending_inputs must not be 0");
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JudgeConfig {
    /// Concurrency budget: one worker supervises one sandboxed session at a time
    pub workers: usize,
    /// How many admitted jobs may wait for a worker before `Overloaded` is returned
    pub queue_capacity: usize,
    pub batch_limits: LimitsConfig,
    pub compile_limits: LimitsConfig,
    pub playground_limits: LimitsConfig,
    /// An interactive session with neither input nor output for this long is timed out
    pub idle_timeout: MilliSecond,
    /// How long a finished interactive session stays pollable
    pub session_retention: MilliSecond,
    pub reap_interval: MilliSecond,
    pub max_pending_inputs: usize,
    /// Run children in fresh user + network namespaces when the host allows it
    pub network_isolation: bool,
    /// Confine each child to its workspace with Landlock; startup fails when the kernel lacks it
    pub filesystem_isolation: bool,
    /// Host paths sandboxed processes may read and execute besides their workspace
    pub readonly_paths: Vec<PathBuf>,
    pub work_root: Option<PathBuf>,
    pub problems_dir: Option<PathBuf>,
    pub toolchains: ToolchainConfig,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 16,
            batch_limits: LimitsConfig::batch(),
            compile_limits: LimitsConfig::compile(),
            playground_limits: LimitsConfig::playground(),
            idle_timeout: MilliSecond(30_000),
            session_retention: MilliSecond(30_000),
            reap_interval: MilliSecond(5_000),
            max_pending_inputs: 64,
            network_isolation: true,
            filesystem_isolation: true,
            readonly_paths: DEFAULT_READONLY_PATHS.iter().map(PathBuf::from).collect(),
            work_root: None,
            problems_dir: None,
            toolchains: ToolchainConfig::default(),
        }
    }
}

/// Resource profile of one class of executions
///
/// Fields missing from a configured block fall back to the batch profile.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Wall-clock limit
    pub time_limit: MilliSecond,
    /// CPU time limit, rounded up to whole seconds when applied
    pub cpu_limit: MilliSecond,
    /// Address space limit
    pub memory_limit: KiloByte,
    /// Captured output kept per stream, the rest is discarded
    pub output_limit: KiloByte,
    /// Largest file the process may write
    pub file_size_limit: KiloByte,
    pub open_files: u64,
}

impl LimitsConfig {
    pub fn batch() -> Self {
        Self {
            time_limit: MilliSecond(2_000),
            cpu_limit: MilliSecond(2_000),
            memory_limit: KiloByte(262_144),
            output_limit: KiloByte(1_024),
            file_size_limit: KiloByte(16_384),
            open_files: 64,
        }
    }

    pub fn compile() -> Self {
        Self {
            time_limit: MilliSecond(15_000),
            cpu_limit: MilliSecond(15_000),
            memory_limit: KiloByte(2_097_152),
            output_limit: KiloByte(256),
            file_size_limit: KiloByte(65_536),
            open_files: 512,
        }
    }

    pub fn playground() -> Self {
        Self {
            time_limit: MilliSecond(60_000),
            cpu_limit: MilliSecond(10_000),
            ..Self::batch()
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self::batch()
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ToolchainConfig {
    pub python: String,
    pub cxx: String,
    pub cc: String,
    pub cxx_std: String,
    pub c_std: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            cxx: "g++".to_string(),
            cc: "gcc".to_string(),
            cxx_std: "c++17".to_string(),
            c_std: "c11".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KiloByte(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}

impl KiloByte {
    pub fn bytes(self) -> u64 {
        self.0.saturating_mul(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let file = std::fs::File::open("data/example.json").unwrap();
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader).unwrap();
        assert_eq!(config.server.bind_address, Some("127.0.0.1".to_string()));
        assert_eq!(config.judge.workers, 2);
        assert_eq!(config.judge.batch_limits.time_limit, MilliSecond(2000));
        assert_eq!(config.judge.playground_limits.time_limit, MilliSecond(60000));
        // Not present in the file
        assert_eq!(config.judge.compile_limits, LimitsConfig::compile());
        assert_eq!(config.judge.toolchains.python, "python3");
        assert!(config.judge.filesystem_isolation);
        assert!(config.judge.readonly_paths.contains(&PathBuf::from("/usr")));
    }

    #[test]
    fn test_partial_limits_fall_back_to_batch_profile() {
        let config: Config = serde_json::from_str(
            r#"{ "judge": { "compile_limits": { "time_limit": 5000 } } }"#,
        )
        .unwrap();
        assert_eq!(config.judge.compile_limits.time_limit, MilliSecond(5000));
        assert_eq!(
            config.judge.compile_limits.memory_limit,
            LimitsConfig::batch().memory_limit
        );
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config: Config = serde_json::from_str(r#"{ "judge": { "workers": 0 } }"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliArgs::parse_from(["arena-judge", "--workers", "7", "--port", "9000"]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.judge.workers, 7);
        assert_eq!(config.server.bind_port, Some(9000));
        assert_eq!(config.server.bind_address, None);
    }

    #[test]
    fn test_durations() {
        assert_eq!(Duration::from(MilliSecond(1500)), Duration::from_millis(1500));
        assert_eq!(KiloByte(2).bytes(), 2048);
    }
}
