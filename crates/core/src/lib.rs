pub mod runtime;

pub use runtime::cancel::CancelCell;
pub use runtime::context_cache::{ContextCache, ContextHandle, ContextKey};
pub use runtime::engine::{EngineContext, SynthesisEngine};
pub use runtime::host::{HostArgs, JobHandle, WorkerHost};
pub use runtime::protocol::{JobId, Request, RequestBody, Response, ResponseBody};

pub type Result<T> = anyhow::Result<T>;

#[derive(Debug, thiserror::Error)]
pub enum SynthdError {
    #[error("Worker host is not initialized")]
    Uninitialized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Engine operation failed: {0}")]
    EngineError(String),

    #[error("Worker transport failed: {0}")]
    TransportError(String),

    #[error("Task cancelled")]
    TaskCancelled,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Bad argument: {0}")]
    BadArgument(&'static str),
}

impl SynthdError {
    pub fn invalid_operation(msg: &str) -> anyhow::Error {
        SynthdError::InvalidOperation(msg.to_owned()).into()
    }

    pub fn not_found(what: impl Into<String>) -> anyhow::Error {
        SynthdError::NotFound(what.into()).into()
    }
}
