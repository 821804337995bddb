use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::JudgeConfig;
use crate::error::{JudgeError, Result};
use crate::harness::TestData;
use crate::judge::ExecutionReport;
use crate::language::Language;
use crate::queue::{JobMessage, JobQueue};
use crate::sandbox::{OutputBuffer, ResourceLimits};

// Headroom added to the configured limits before a waiting batch caller gives up
const CEILING_SLACK: Duration = Duration::from_secs(5);
// How often a waiting batch caller looks at a session that is still queued
const CEILING_CHECK: Duration = Duration::from_millis(100);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Batch,
    Interactive,
}

/// Which configured resource profile an execution runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitProfile {
    Judge,
    Playground,
}

/// Everything needed to run one piece of user code, consumed by its worker
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: Language,
    pub source_code: String,
    pub driver_code: Option<String>,
    pub test_data: Option<TestData>,
    pub mode: Mode,
    pub limits: LimitProfile,
}

impl ExecutionRequest {
    fn validate(&self) -> Result<()> {
        if self.source_code.trim().is_empty() {
            return Err(JudgeError::InvalidRequest("code must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Killed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    exit_code: Option<i32>,
    execution_time: Option<Duration>,
}

/// Lifetime record of one sandboxed execution
pub struct Session {
    id: String,
    created_time: String,
    inner: Mutex<SessionInner>,
    output: Arc<OutputBuffer>,
    input_tx: mpsc::Sender<String>,
    input_rx: Mutex<Option<mpsc::Receiver<String>>>,
    request: Mutex<Option<ExecutionRequest>>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        request: ExecutionRequest,
        max_pending_inputs: usize,
        output_limit: usize,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (input_tx, input_rx) = mpsc::channel(max_pending_inputs);
        Arc::new(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            created_time: crate::create_timestamp(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Pending,
                pid: None,
                started_at: None,
                finished_at: None,
                exit_code: None,
                execution_time: None,
            }),
            output: Arc::new(OutputBuffer::new(output_limit)),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            request: Mutex::new(Some(request)),
            cancel: parent.child_token(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_time(&self) -> &str {
        &self.created_time
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.inner.lock().started_at
    }

    pub fn output(&self) -> &Arc<OutputBuffer> {
        &self.output
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The request can be taken exactly once, by the worker that runs the session
    pub fn take_request(&self) -> Option<ExecutionRequest> {
        self.request.lock().take()
    }

    pub fn take_input(&self) -> Option<mpsc::Receiver<String>> {
        self.input_rx.lock().take()
    }

    /// Pending -> Running; refused when the session was cancelled or already ended
    pub fn mark_running(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Pending {
            return false;
        }
        if self.cancel.is_cancelled() {
            inner.state = SessionState::Killed;
            inner.finished_at = Some(Instant::now());
            return false;
        }
        inner.state = SessionState::Running;
        inner.started_at = Some(Instant::now());
        log::debug!("Session {} running", self.id);
        true
    }

    /// Records the live sandboxed process, the compiler during a build and the program afterwards
    pub fn set_pid(&self, pid: u32) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Running {
            inner.pid = Some(pid);
        }
    }

    pub fn clear_pid(&self) {
        self.inner.lock().pid = None;
    }

    /// Moves the session into a terminal state; a session that already ended keeps its outcome
    pub fn finish(
        &self,
        state: SessionState,
        exit_code: Option<i32>,
        execution_time: Option<Duration>,
    ) -> bool {
        debug_assert!(state.is_terminal());
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            log::debug!(
                "Session {} already {:?}, ignoring transition to {state:?}",
                self.id,
                inner.state
            );
            return false;
        }
        inner.state = state;
        inner.pid = None;
        inner.finished_at = Some(Instant::now());
        inner.exit_code = exit_code;
        inner.execution_time = execution_time;
        log::info!("Session {} ended as {state:?} (exit code {exit_code:?})", self.id);
        true
    }

    /// Output produced since the previous poll, plus the current status
    ///
    /// Once the session has ended its output buffer is complete, so the delta
    /// returned from then on includes everything that is left.
    pub fn poll(&self) -> PollResult {
        let (state, exit_code, execution_time) = {
            let inner = self.inner.lock();
            (inner.state, inner.exit_code, inner.execution_time)
        };
        let output = self.output.read_delta(state.is_terminal());

        PollResult {
            output,
            running: !state.is_terminal(),
            exit_code,
            execution_time: execution_time.map(seconds),
        }
    }

    pub fn send_input(&self, text: String) -> Result<()> {
        if self.state().is_terminal() {
            return Err(JudgeError::SessionClosed(self.id.clone()));
        }
        self.input_tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => JudgeError::InputBacklog(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => JudgeError::SessionClosed(self.id.clone()),
        })
    }

    fn expired(&self, retention: Duration, now: Instant) -> bool {
        let inner = self.inner.lock();
        matches!(inner.finished_at, Some(at) if now.duration_since(at) >= retention)
    }
}

/// Seconds with millisecond precision, as reported to callers
pub fn seconds(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0).round() / 1000.0
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PollResult {
    pub output: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct JudgeStats {
    pub workers: usize,
    pub busy_workers: usize,
    pub queued: usize,
    pub sessions: usize,
    pub started_time: String,
}

/// Registry of sessions and front door of the worker pool
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    queue: Arc<JobQueue>,
    workers: usize,
    retention: Duration,
    max_pending_inputs: usize,
    judge_output_limit: usize,
    playground_output_limit: usize,
    judge_ceiling: Duration,
    playground_ceiling: Duration,
    shutdown: CancellationToken,
    started_time: String,
}

impl SessionManager {
    pub fn new(config: &JudgeConfig, queue: Arc<JobQueue>, shutdown: CancellationToken) -> Self {
        let compile = ResourceLimits::from(&config.compile_limits);
        let judge = ResourceLimits::from(&config.batch_limits);
        let playground = ResourceLimits::from(&config.playground_limits);

        Self {
            sessions: Mutex::new(HashMap::new()),
            queue,
            workers: config.workers,
            retention: config.session_retention.into(),
            max_pending_inputs: config.max_pending_inputs,
            judge_output_limit: judge.output,
            playground_output_limit: playground.output,
            judge_ceiling: compile.wall_time + judge.wall_time + CEILING_SLACK,
            playground_ceiling: compile.wall_time + playground.wall_time + CEILING_SLACK,
            shutdown,
            started_time: crate::create_timestamp(),
        }
    }

    fn register(&self, request: ExecutionRequest) -> Result<Arc<Session>> {
        request.validate()?;
        let output_limit = match request.limits {
            LimitProfile::Judge => self.judge_output_limit,
            LimitProfile::Playground => self.playground_output_limit,
        };
        let session = Session::new(
            request,
            self.max_pending_inputs,
            output_limit,
            &self.shutdown,
        );
        self.sessions
            .lock()
            .insert(session.id().to_string(), session.clone());
        Ok(session)
    }

    fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| JudgeError::SessionNotFound(session_id.to_string()))
    }

    /// Admits an interactive session and returns its id without waiting for it to run
    pub async fn start(&self, request: ExecutionRequest) -> Result<String> {
        let language = request.language;
        let session = self.register(request)?;
        let id = session.id().to_string();
        let created_time = session.created_time().to_string();

        if let Err(e) = self.queue.push(JobMessage::Interactive { session }).await {
            self.remove(&id);
            return Err(e);
        }
        log::info!("Interactive {language} session {id} admitted at {created_time}");
        Ok(id)
    }

    /// Runs a batch execution to completion and returns its report
    ///
    /// The wait is bounded by the configured limits plus some slack, counted
    /// from the moment a worker starts the session. Past that the session is
    /// cancelled and reported as such. The session is gone once this returns.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport> {
        let ceiling = match request.limits {
            LimitProfile::Judge => self.judge_ceiling,
            LimitProfile::Playground => self.playground_ceiling,
        };
        let language = request.language;
        let session = self.register(request)?;
        let registration = Registration {
            manager: self,
            session: session.clone(),
        };

        let (responder, mut report) = oneshot::channel();
        self.queue
            .push(JobMessage::Blocking {
                session: session.clone(),
                responder,
            })
            .await?;
        log::info!("Batch {language} session {} admitted", session.id());

        let outcome = loop {
            let wait = match session.started_at() {
                Some(started) if !session.cancel_token().is_cancelled() => {
                    ceiling.saturating_sub(started.elapsed())
                }
                _ => CEILING_CHECK,
            };
            tokio::select! {
                outcome = &mut report => break outcome,
                _ = tokio::time::sleep(wait) => {
                    if let Some(started) = session.started_at()
                        && started.elapsed() >= ceiling
                        && !session.cancel_token().is_cancelled()
                    {
                        log::warn!(
                            "Session {} exceeded its {ceiling:?} ceiling, cancelling",
                            session.id()
                        );
                        session.cancel_token().cancel();
                    }
                }
            }
        };
        drop(registration);

        match outcome {
            Ok(report) => report,
            // The job was dropped before a worker ran it
            Err(_) => {
                session.finish(SessionState::Killed, None, None);
                Err(JudgeError::Cancelled)
            }
        }
    }

    pub fn poll(&self, session_id: &str) -> Result<PollResult> {
        Ok(self.get(session_id)?.poll())
    }

    pub fn send_input(&self, session_id: &str, text: String) -> Result<()> {
        self.get(session_id)?.send_input(text)
    }

    /// Stops a session: queued sessions never start, running ones are killed
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let session = self.get(session_id)?;
        if session.state().is_terminal() {
            return Ok(());
        }

        session.cancel_token().cancel();
        if self.queue.cancel(session_id).await {
            session.finish(SessionState::Killed, None, None);
        }
        log::info!("Session {session_id} cancelled");
        Ok(())
    }

    /// Drops terminal sessions whose retention period is over
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.expired(self.retention, now));
        let reaped = before - sessions.len();
        if reaped > 0 {
            log::debug!("Reaped {reaped} expired sessions");
        }
        reaped
    }

    /// Periodically reaps expired sessions until shutdown
    pub async fn reaper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap_expired();
                }
            }
        }
        log::info!("Session reaper stopped");
    }

    pub async fn stats(&self) -> JudgeStats {
        let queued = self.queue.len().await;
        let idle = self.queue.idle_workers();
        let sessions = self.sessions.lock().len();
        JudgeStats {
            workers: self.workers,
            busy_workers: self.workers.saturating_sub(idle),
            queued,
            sessions,
            started_time: self.started_time.clone(),
        }
    }
}

/// Keeps a batch session registered while its caller waits
///
/// Dropping it (also when the caller goes away mid-wait) cancels the session
/// and unregisters it.
struct Registration<'a> {
    manager: &'a SessionManager,
    session: Arc<Session>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if !self.session.state().is_terminal() {
            self.session.cancel_token().cancel();
        }
        self.manager.remove(self.session.id());
    }
}
