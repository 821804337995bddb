use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::JudgeConfig;
use crate::error::{JudgeError, Result};
use crate::harness::{self, ParseWarning, TestCase, Verdict};
use crate::sandbox::{
    Artifact, InteractiveIo, ResourceLimits, RunResult, RunStatus, SandboxRunner,
    TIME_LIMIT_EXIT_CODE, Workspace,
};
use crate::session::{ExecutionRequest, LimitProfile, Session, SessionState, seconds};
use crate::toolchain::Toolchain;

const TIME_LIMIT_MESSAGE: &str = "Time Limit Exceeded";
const CANCELLED_MESSAGE: &str = "Execution cancelled";
const TRUNCATED_MESSAGE: &str = "[output truncated]";
// Shell convention for "command not found"
const SPAWN_FAILED_EXIT_CODE: i32 = 127;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Executed,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    Error,
}

/// Outcome of a batch execution as returned to callers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// Raw stdout including every `CASE|` line
    pub output: String,
    pub exit_code: i32,
    pub status: ReportStatus,
    /// Seconds
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    pub cases: Vec<TestCase>,
    pub warnings: Vec<ParseWarning>,
}

impl ExecutionReport {
    fn failure(output: String, exit_code: i32) -> Self {
        Self {
            output,
            exit_code,
            status: ReportStatus::Error,
            execution_time: 0.0,
            verdict: None,
            cases: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Runs sessions end to end: workspace, assembly, build, sandboxed execution
pub struct Judge {
    runner: Arc<dyn SandboxRunner>,
    toolchain: Toolchain,
    work_root: PathBuf,
    judge_limits: ResourceLimits,
    playground_limits: ResourceLimits,
    idle_timeout: Duration,
}

impl Judge {
    pub fn new(config: &JudgeConfig, work_root: PathBuf, runner: Arc<dyn SandboxRunner>) -> Self {
        Self {
            runner,
            toolchain: Toolchain::new(
                config.toolchains.clone(),
                ResourceLimits::from(&config.compile_limits),
            ),
            work_root,
            judge_limits: ResourceLimits::from(&config.batch_limits),
            playground_limits: ResourceLimits::from(&config.playground_limits),
            idle_timeout: config.idle_timeout.into(),
        }
    }

    fn limits(&self, profile: LimitProfile) -> &ResourceLimits {
        match profile {
            LimitProfile::Judge => &self.judge_limits,
            LimitProfile::Playground => &self.playground_limits,
        }
    }

    async fn build(
        &self,
        request: &ExecutionRequest,
        session: &Session,
    ) -> Result<(Workspace, Artifact, Option<String>)> {
        let workspace = Workspace::create(&self.work_root)?;
        let assembled = harness::assemble(request, &workspace)?;
        let artifact = self
            .toolchain
            .prepare(
                self.runner.as_ref(),
                request.language,
                &workspace,
                &assembled.sources,
                Box::new(|pid: u32| session.set_pid(pid)),
                session.cancel_token(),
            )
            .await;
        // The build process is gone whatever the outcome
        session.clear_pid();
        Ok((workspace, artifact?, assembled.stdin))
    }

    /// Runs a batch session and shapes its outcome into a report
    ///
    /// Compile errors, spawn failures, timeouts and crashes are all reports;
    /// only failures of the judge itself are errors.
    pub async fn run_batch(&self, session: &Session) -> Result<ExecutionReport> {
        let request = session.take_request().ok_or_else(|| {
            JudgeError::Internal(format!("session {} has no request", session.id()))
        })?;

        if !session.mark_running() {
            return Ok(ExecutionReport::failure(
                CANCELLED_MESSAGE.to_string(),
                RunStatus::Cancelled.exit_code(),
            ));
        }

        let judging = request.driver_code.is_some();
        let outcome = match self.build(&request, session).await {
            Ok((_workspace, artifact, stdin)) => {
                self.runner
                    .run_observed(
                        &artifact,
                        self.limits(request.limits),
                        stdin,
                        Box::new(|pid: u32| session.set_pid(pid)),
                        session.cancel_token(),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                session.finish(
                    terminal_state(result.status),
                    Some(result.status.exit_code()),
                    Some(result.wall_time),
                );
                Ok(report(result, judging))
            }
            Err(JudgeError::CompileError {
                diagnostics,
                exit_code,
            }) => {
                let exit_code = exit_code.unwrap_or(1);
                session.finish(SessionState::Failed, Some(exit_code), None);
                Ok(ExecutionReport::failure(diagnostics, exit_code))
            }
            Err(JudgeError::Cancelled) => {
                let exit_code = RunStatus::Cancelled.exit_code();
                session.finish(SessionState::Killed, Some(exit_code), None);
                Ok(ExecutionReport::failure(CANCELLED_MESSAGE.to_string(), exit_code))
            }
            Err(e @ JudgeError::SpawnFailed { .. }) => {
                session.finish(SessionState::Failed, Some(SPAWN_FAILED_EXIT_CODE), None);
                Ok(ExecutionReport::failure(e.to_string(), SPAWN_FAILED_EXIT_CODE))
            }
            Err(e) => {
                log::error!("Session {} failed: {e}", session.id());
                session.finish(SessionState::Failed, None, None);
                Err(e)
            }
        }
    }

    /// Runs an interactive session until its process ends, streaming into the session
    pub async fn run_interactive(&self, session: &Arc<Session>) {
        let (Some(request), Some(input)) = (session.take_request(), session.take_input()) else {
            log::error!("Session {} was already consumed", session.id());
            session.finish(SessionState::Failed, None, None);
            return;
        };
        if !session.mark_running() {
            return;
        }

        let outcome = match self.build(&request, session).await {
            Ok((_workspace, artifact, _)) => {
                let pid_sink = session.clone();
                let io = InteractiveIo {
                    input,
                    output: session.output().clone(),
                    idle_timeout: self.idle_timeout,
                    on_spawn: Box::new(move |pid| pid_sink.set_pid(pid)),
                };
                self.runner
                    .run_interactive(
                        &artifact,
                        self.limits(request.limits),
                        io,
                        session.cancel_token(),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        let output = session.output();
        match outcome {
            Ok(result) => {
                if result.status.is_timeout() {
                    output.append_str(&format!("\n{TIME_LIMIT_MESSAGE}\n"));
                }
                session.finish(
                    terminal_state(result.status),
                    Some(result.status.exit_code()),
                    Some(result.wall_time),
                );
            }
            Err(JudgeError::CompileError {
                diagnostics,
                exit_code,
            }) => {
                output.append_str(&diagnostics);
                session.finish(SessionState::Failed, Some(exit_code.unwrap_or(1)), None);
            }
            Err(JudgeError::Cancelled) => {
                session.finish(
                    SessionState::Killed,
                    Some(RunStatus::Cancelled.exit_code()),
                    None,
                );
            }
            Err(e @ JudgeError::SpawnFailed { .. }) => {
                output.append_str(&e.to_string());
                session.finish(SessionState::Failed, Some(SPAWN_FAILED_EXIT_CODE), None);
            }
            Err(e) => {
                log::error!("Session {} failed: {e}", session.id());
                output.append_str("Internal error");
                session.finish(SessionState::Failed, None, None);
            }
        }
    }
}

fn terminal_state(status: RunStatus) -> SessionState {
    match status {
        RunStatus::Exited(0) => SessionState::Completed,
        RunStatus::Exited(_) | RunStatus::Signaled(_) => SessionState::Failed,
        RunStatus::TimedOut | RunStatus::IdleTimeout => SessionState::TimedOut,
        RunStatus::Cancelled => SessionState::Killed,
    }
}

fn append_line(output: &mut String, line: &str) {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(line);
}

fn report(result: RunResult, judging: bool) -> ExecutionReport {
    let parsed = harness::parse_results(&result.stdout);
    let mut output = result.stdout;
    if result.output_truncated {
        append_line(&mut output, TRUNCATED_MESSAGE);
    }

    let (status, exit_code) = match result.status {
        RunStatus::Exited(0) => (ReportStatus::Executed, 0),
        RunStatus::TimedOut | RunStatus::IdleTimeout => {
            append_line(&mut output, TIME_LIMIT_MESSAGE);
            (ReportStatus::TimeLimitExceeded, TIME_LIMIT_EXIT_CODE)
        }
        RunStatus::Cancelled => {
            append_line(&mut output, CANCELLED_MESSAGE);
            (ReportStatus::Error, result.status.exit_code())
        }
        status => {
            if !result.stderr.is_empty() {
                append_line(&mut output, &result.stderr);
            }
            (ReportStatus::Error, status.exit_code())
        }
    };

    ExecutionReport {
        output,
        exit_code,
        status,
        execution_time: seconds(result.wall_time),
        verdict: judging.then(|| parsed.verdict()),
        cases: parsed.cases,
        warnings: parsed.warnings,
    }
}
