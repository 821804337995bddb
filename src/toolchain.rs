use tokio_util::sync::CancellationToken;

use crate::config::ToolchainConfig;
use crate::error::{JudgeError, Result};
use crate::harness::Sources;
use crate::language::{BuildContext, Language};
use crate::sandbox::{Artifact, ResourceLimits, RunStatus, SandboxRunner, SpawnHook, Workspace};

/// Turns assembled sources into something the sandbox can run
pub struct Toolchain {
    toolchains: ToolchainConfig,
    compile_limits: ResourceLimits,
}

impl Toolchain {
    pub fn new(toolchains: ToolchainConfig, compile_limits: ResourceLimits) -> Self {
        Self {
            toolchains,
            compile_limits,
        }
    }

    /// Runs the language's build step, if any, and returns the program to execute
    ///
    /// A build that exits non-zero or runs out of time is a
    /// [`JudgeError::CompileError`] carrying the toolchain's diagnostics.
    pub async fn prepare(
        &self,
        runner: &dyn SandboxRunner,
        language: Language,
        workspace: &Workspace,
        sources: &Sources,
        on_spawn: SpawnHook<'_>,
        cancel: &CancellationToken,
    ) -> Result<Artifact> {
        let profile = language.profile();
        let ctx = BuildContext {
            toolchains: &self.toolchains,
            workdir: workspace.path(),
            entry: &sources.entry,
            sources: &sources.files,
        };

        if let Some(command) = (profile.build)(&ctx) {
            let build = artifact(command, workspace)?;
            log::debug!("Building {language} sources with `{}`", build.program);
            let result = runner
                .run_observed(&build, &self.compile_limits, None, on_spawn, cancel)
                .await?;

            match result.status {
                RunStatus::Exited(0) => {}
                RunStatus::Cancelled => return Err(JudgeError::Cancelled),
                status => {
                    let mut diagnostics = result.stderr;
                    if !result.stdout.is_empty() {
                        if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
                            diagnostics.push('\n');
                        }
                        diagnostics.push_str(&result.stdout);
                    }
                    if status.is_timeout() {
                        diagnostics.push_str("\nCompilation time limit exceeded");
                    }
                    log::info!("{language} build failed with {status:?}");
                    return Err(JudgeError::CompileError {
                        diagnostics,
                        exit_code: Some(status.exit_code()),
                    });
                }
            }
        }

        artifact((profile.invoke)(&ctx), workspace)
    }
}

fn artifact(command: Vec<String>, workspace: &Workspace) -> Result<Artifact> {
    let mut parts = command.into_iter();
    let program = parts
        .next()
        .ok_or_else(|| JudgeError::Internal("empty toolchain command".to_string()))?;
    Ok(Artifact {
        program,
        args: parts.collect(),
        workdir: workspace.path().to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::RunResult;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records every artifact and answers with a canned status
    struct FakeRunner {
        status: RunStatus,
        stderr: &'static str,
        seen: Mutex<Vec<Artifact>>,
    }

    impl FakeRunner {
        fn new(status: RunStatus, stderr: &'static str) -> Self {
            Self {
                status,
                stderr,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SandboxRunner for FakeRunner {
        async fn run_observed(
            &self,
            artifact: &Artifact,
            _limits: &ResourceLimits,
            _stdin: Option<String>,
            on_spawn: SpawnHook<'_>,
            _cancel: &CancellationToken,
        ) -> Result<RunResult> {
            self.seen.lock().push(artifact.clone());
            on_spawn(4242);
            Ok(RunResult {
                status: self.status,
                stdout: String::new(),
                stderr: self.stderr.to_string(),
                wall_time: Duration::from_millis(1),
                output_truncated: false,
            })
        }

        async fn run_interactive(
            &self,
            _artifact: &Artifact,
            _limits: &ResourceLimits,
            _io: crate::sandbox::InteractiveIo,
            _cancel: &CancellationToken,
        ) -> Result<RunResult> {
            unreachable!("toolchain never runs interactively")
        }
    }

    fn toolchain() -> Toolchain {
        Toolchain::new(
            ToolchainConfig::default(),
            ResourceLimits::from(&crate::config::LimitsConfig::compile()),
        )
    }

    fn sources(entry: &str, files: &[&str]) -> Sources {
        Sources {
            entry: entry.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_successful_build_yields_invoke_artifact() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let runner = FakeRunner::new(RunStatus::Exited(0), "");
        let build_pid = Mutex::new(None);

        let artifact = toolchain()
            .prepare(
                &runner,
                Language::Cpp,
                &workspace,
                &sources("driver.cpp", &["solution.cpp", "driver.cpp"]),
                Box::new(|pid: u32| *build_pid.lock() = Some(pid)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // The compiler's pid is reported like the program's
        assert_eq!(*build_pid.lock(), Some(4242));

        assert_eq!(runner.seen.lock()[0].program, "g++");
        assert_eq!(artifact.program, workspace.join("solution").to_string_lossy());
        assert_eq!(artifact.workdir, workspace.path());
    }

    #[tokio::test]
    async fn test_failed_build_is_compile_error() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let runner = FakeRunner::new(RunStatus::Exited(1), "SyntaxError: invalid syntax");

        let err = toolchain()
            .prepare(
                &runner,
                Language::Python,
                &workspace,
                &sources("solution.py", &["solution.py"]),
                Box::new(|_pid: u32| {}),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            JudgeError::CompileError {
                diagnostics,
                exit_code,
            } => {
                assert!(diagnostics.contains("SyntaxError"));
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // The run step is never reached
        assert_eq!(runner.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_build() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        let runner = FakeRunner::new(RunStatus::Cancelled, "");

        let err = toolchain()
            .prepare(
                &runner,
                Language::C,
                &workspace,
                &sources("solution.c", &["solution.c"]),
                Box::new(|_pid: u32| {}),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::Cancelled));
    }
}
