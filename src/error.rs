use thiserror::Error;

/// Errors surfaced by judge operations
///
/// Timeouts and crashes of user code are not errors: they are reported through
/// [`crate::sandbox::RunStatus`]. Malformed `CASE|` lines are parse warnings.
#[derive(Debug, Error)]
pub enum JudgeError {
    /// The toolchain rejected the assembled sources
    #[error("compilation failed")]
    CompileError {
        diagnostics: String,
        exit_code: Option<i32>,
    },

    /// The interpreter or compiler could not be started at all
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("judge is overloaded, retry later")]
    Overloaded,

    /// The execution was stopped before it finished (stop request or shutdown)
    #[error("execution cancelled")]
    Cancelled,

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} is closed")]
    SessionClosed(String),

    #[error("session {0} has too many pending inputs")]
    InputBacklog(String),

    #[error("problem {0} not found")]
    ProblemNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = JudgeError> = std::result::Result<T, E>;
