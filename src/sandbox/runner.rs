use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

use super::{Artifact, InteractiveIo, ResourceLimits, RunResult, SpawnHook};

/// Trait for the different ways of executing untrusted programs
///
/// A runner owns every OS process it spawns for the whole lifetime of the
/// call: when `run`/`run_interactive` returns, the process and all of its
/// descendants are gone, whatever the outcome.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Runs the artifact to completion, feeding `stdin` and capturing both streams
    ///
    /// Exceeding the wall-clock limit is reported as [`super::RunStatus::TimedOut`],
    /// not as an error. An error means the process could not be run at all.
    async fn run(
        &self,
        artifact: &Artifact,
        limits: &ResourceLimits,
        stdin: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        self.run_observed(artifact, limits, stdin, Box::new(|_pid: u32| {}), cancel)
            .await
    }

    /// Like [`SandboxRunner::run`], calling `on_spawn` with the pid once the process is alive
    async fn run_observed(
        &self,
        artifact: &Artifact,
        limits: &ResourceLimits,
        stdin: Option<String>,
        on_spawn: SpawnHook<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunResult>;

    /// Runs the artifact with stdin fed from a queue and output merged into a shared buffer
    ///
    /// The returned result carries the status and timing only; the output is in
    /// `io.output`.
    async fn run_interactive(
        &self,
        artifact: &Artifact,
        limits: &ResourceLimits,
        io: InteractiveIo,
        cancel: &CancellationToken,
    ) -> Result<RunResult>;
}
