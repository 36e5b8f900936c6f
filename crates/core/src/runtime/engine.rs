//! Trait seam for the opaque synthesis engine.
//!
//! The actual privacy-preserving synthesis and evaluation algorithms live in
//! an external engine; this crate only drives it. The host programs against
//! `Box<dyn EngineContext>` and never looks inside.

use serde::{Deserialize, Serialize};

/// Tabular input loaded into a fresh engine context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInput {
    pub headers: Vec<String>,
    pub records: Vec<Vec<String>>,
}

impl DatasetInput {
    pub fn new(headers: Vec<String>, records: Vec<Vec<String>>) -> Self {
        DatasetInput { headers, records }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// The parameters that define a computation context. Two requests with equal
/// parameters share one engine context (see `ContextKey::derive`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisParameters {
    /// Privacy resolution: minimum count below which attribute combinations
    /// are suppressed.
    pub resolution: usize,

    /// Maximum size of the engine's internal working cache, in rows.
    pub cache_max_size: usize,

    #[serde(default)]
    pub mode: SynthesisMode,

    /// Epsilon for the differential-privacy noise modes, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_epsilon: Option<f64>,

    /// Columns to treat as sensitive; empty means all.
    #[serde(default)]
    pub sensitive_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisMode {
    #[default]
    Unseeded,
    RowSeeded,
    ValueSeeded,
    AggregateSeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Sensitive,
    Reportable,
    Synthetic,
}

/// Per-iteration callback given to the long-running engine operations.
///
/// Receives the percent complete (0-100). The engine must stop scheduling
/// further iterations once the callback returns `false`; that is the whole
/// cooperative-cancellation contract.
pub type ProgressFn<'a> = &'a mut dyn FnMut(f64) -> bool;

pub trait SynthesisEngine: Send + Sync {
    /// Load a dataset into a new computation context (`setData`).
    fn create_context(
        &self,
        data: &DatasetInput,
        parameters: &SynthesisParameters,
    ) -> crate::Result<Box<dyn EngineContext>>;
}

/// One expensive, reusable computation context.
///
/// Operations run to completion on the calling thread and block it for the
/// duration. `free` releases the engine's native resources and must
/// be invoked exactly once per context — [`super::context_cache::ContextHandle`]
/// takes care of that.
pub trait EngineContext: Send {
    /// Run the synthesis pass, mutating context state.
    fn generate(&mut self, on_progress: ProgressFn) -> crate::Result<()>;

    /// Run the evaluation pass over the generated data.
    fn evaluate(&mut self, reporting_length: usize, on_progress: ProgressFn) -> crate::Result<()>;

    /// Prepare the generated result for attribute navigation.
    fn navigate(&mut self) -> crate::Result<()>;

    fn select_attributes(&mut self, attributes: &[String]) -> crate::Result<()>;

    fn attributes_intersections_by_column(&self, columns: &[String]) -> crate::Result<serde_json::Value>;

    fn aggregate_result(&self, aggregate_type: AggregateType) -> crate::Result<serde_json::Value>;

    fn generate_result(&self) -> crate::Result<serde_json::Value>;

    fn evaluate_result(&self) -> crate::Result<serde_json::Value>;

    /// Release native resources. Called exactly once, by the owning handle.
    fn free(&mut self);
}
