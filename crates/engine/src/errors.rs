use thiserror::Error;

/// Structured failure kinds the engine surfaces to callers. They travel on
/// the anyhow chain and stay downcastable even when a failure is delivered
/// to multiple deduplicated waiters.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("no type registered under identifier {0:?}")]
    UnknownType(String),

    #[error("action exited with code {exit_code}")]
    ExecutionFailed { exit_code: i32 },

    #[error("operation not supported by this implementation")]
    Unsupported,

    #[error("not implemented")]
    Unimplemented,
}
