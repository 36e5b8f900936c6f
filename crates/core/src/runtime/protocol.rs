//! Wire envelope for the caller/worker transport.
//!
//! Every logical call is a [`Request`] tagged with a unique [`JobId`]; the
//! worker answers with any number of `Progress` responses followed by exactly
//! one terminal response (`Ok` or `Error`) carrying the same id.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context_cache::ContextKey;
use super::engine::{AggregateType, DatasetInput, SynthesisParameters};
use crate::SynthdError;

/// Correlation id attached to a request and echoed on all of its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: JobId,

    #[serde(flatten)]
    pub body: RequestBody,
}

impl Request {
    pub fn new(body: RequestBody) -> Self {
        Request { id: JobId::new(), body }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RequestBody {
    /// Readiness probe; answered as soon as the worker loop is serving.
    Init,

    /// Release every engine context held by the worker's cache.
    ClearContexts,

    /// Build (or reuse) the context for `parameters`, run the synthesis and
    /// the evaluation over it, and return the evaluation summary.
    GenerateAndEvaluate {
        data: DatasetInput,
        parameters: SynthesisParameters,
        reporting_length: usize,
    },

    /// Prepare an already-generated context for result navigation.
    Navigate { key: ContextKey },

    SelectAttributes { key: ContextKey, attributes: Vec<String> },

    AttributesIntersectionsByColumn { key: ContextKey, columns: Vec<String> },

    GetAggregateResult { key: ContextKey, aggregate_type: AggregateType },

    GetGenerateResult { key: ContextKey },

    GetEvaluateResult { key: ContextKey },
}

impl RequestBody {
    /// The job-class key this request should be routed by, if it has one.
    ///
    /// Requests that name (or imply) a context key must land on the worker
    /// that owns that context; everything else may go to any worker.
    pub fn routing_key(&self) -> Option<ContextKey> {
        match self {
            RequestBody::Init | RequestBody::ClearContexts => None,
            RequestBody::GenerateAndEvaluate { parameters, .. } => Some(ContextKey::derive(parameters)),
            RequestBody::Navigate { key }
            | RequestBody::SelectAttributes { key, .. }
            | RequestBody::AttributesIntersectionsByColumn { key, .. }
            | RequestBody::GetAggregateResult { key, .. }
            | RequestBody::GetGenerateResult { key }
            | RequestBody::GetEvaluateResult { key } => Some(key.clone()),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            RequestBody::Init => "Init",
            RequestBody::ClearContexts => "ClearContexts",
            RequestBody::GenerateAndEvaluate { .. } => "GenerateAndEvaluate",
            RequestBody::Navigate { .. } => "Navigate",
            RequestBody::SelectAttributes { .. } => "SelectAttributes",
            RequestBody::AttributesIntersectionsByColumn { .. } => "AttributesIntersectionsByColumn",
            RequestBody::GetAggregateResult { .. } => "GetAggregateResult",
            RequestBody::GetGenerateResult { .. } => "GetGenerateResult",
            RequestBody::GetEvaluateResult { .. } => "GetEvaluateResult",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: JobId,

    #[serde(flatten)]
    pub body: ResponseBody,

    /// Milliseconds since the Unix epoch, set when the worker produced it.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ResponseBody {
    Progress {
        value: f64,
    },

    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },

    Error {
        error: ErrorPayload,
    },
}

impl ResponseBody {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseBody::Progress { .. })
    }
}

impl Response {
    pub fn ok(id: JobId, payload: Option<serde_json::Value>) -> Self {
        Response { id, body: ResponseBody::Ok { payload }, timestamp: now_millis() }
    }

    pub fn error(id: JobId, error: ErrorPayload) -> Self {
        Response { id, body: ResponseBody::Error { error }, timestamp: now_millis() }
    }

    pub fn progress(id: JobId, value: f64) -> Self {
        Response { id, body: ResponseBody::Progress { value }, timestamp: now_millis() }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Error half of a terminal response.
///
/// Errors never propagate across the worker boundary as panics or exceptions;
/// they always travel as the terminal response of the request that caused
/// them, with enough structure for the caller to rebuild a typed error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Uninitialized,
    NotFound,
    Engine,
    Transport,
    Cancelled,
    InvalidOperation,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorPayload { kind, message: message.into() }
    }

    pub fn from_error(err: &anyhow::Error) -> Self {
        let kind = match err.downcast_ref::<SynthdError>() {
            Some(SynthdError::Uninitialized) => ErrorKind::Uninitialized,
            Some(SynthdError::NotFound(_)) => ErrorKind::NotFound,
            Some(SynthdError::TransportError(_)) => ErrorKind::Transport,
            Some(SynthdError::TaskCancelled) => ErrorKind::Cancelled,
            Some(SynthdError::InvalidOperation(_)) | Some(SynthdError::BadArgument(_)) => ErrorKind::InvalidOperation,
            _ => ErrorKind::Engine,
        };
        ErrorPayload { kind, message: format!("{err:#}") }
    }

    pub fn into_error(self) -> anyhow::Error {
        match self.kind {
            ErrorKind::Uninitialized => SynthdError::Uninitialized.into(),
            ErrorKind::NotFound => SynthdError::NotFound(self.message).into(),
            ErrorKind::Engine => SynthdError::EngineError(self.message).into(),
            ErrorKind::Transport => SynthdError::TransportError(self.message).into(),
            ErrorKind::Cancelled => SynthdError::TaskCancelled.into(),
            ErrorKind::InvalidOperation => SynthdError::InvalidOperation(self.message).into(),
        }
    }
}
