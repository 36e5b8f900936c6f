//! A stand-in synthesis engine for demonstrations and smoke runs.
//!
//! It burns a little CPU time per record, reports progress and honors the
//! cancellation callback, but the "synthetic" data it produces is just a
//! shuffled resample of the input.

use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::json;
use synthd_core::runtime::engine::{
    AggregateType, DatasetInput, EngineContext, ProgressFn, SynthesisEngine, SynthesisParameters,
};
use synthd_core::{Result, SynthdError};

const STEP_DELAY: Duration = Duration::from_millis(25);

pub struct SimulatedEngine;

impl SynthesisEngine for SimulatedEngine {
    fn create_context(&self, data: &DatasetInput, parameters: &SynthesisParameters) -> Result<Box<dyn EngineContext>> {
        if data.headers.is_empty() {
            return Err(SynthdError::BadArgument("data").into());
        }
        if parameters.resolution == 0 {
            return Err(SynthdError::BadArgument("resolution").into());
        }
        Ok(Box::new(SimulatedContext {
            data: data.clone(),
            parameters: parameters.clone(),
            synthetic: Vec::new(),
            evaluated: false,
            selected_attributes: Vec::new(),
        }))
    }
}

struct SimulatedContext {
    data: DatasetInput,
    parameters: SynthesisParameters,
    synthetic: Vec<Vec<String>>,
    evaluated: bool,
    selected_attributes: Vec<String>,
}

impl SimulatedContext {
    /// Walk `steps` slices of pretend work, reporting after each one. Stops
    /// early when the callback asks to.
    fn work(&self, steps: usize, on_progress: ProgressFn) -> bool {
        for i in 1..=steps {
            std::thread::sleep(STEP_DELAY);
            if !on_progress(i as f64 * 100.0 / steps as f64) {
                return false;
            }
        }
        true
    }

    fn require_generated(&self) -> Result<()> {
        if self.synthetic.is_empty() {
            return Err(SynthdError::InvalidOperation("generate must run before navigation".to_owned()).into());
        }
        Ok(())
    }
}

impl EngineContext for SimulatedContext {
    fn generate(&mut self, on_progress: ProgressFn) -> Result<()> {
        let steps = (self.data.record_count() / 4).clamp(4, 40);
        if !self.work(steps, on_progress) {
            return Ok(());
        }

        let mut rng = rand::thread_rng();
        let mut synthetic = self.data.records.clone();
        synthetic.shuffle(&mut rng);
        // Drop a resolution-sized tail to mimic suppression of rare rows.
        let keep = synthetic.len().saturating_sub(self.parameters.resolution.min(synthetic.len()) / 2);
        synthetic.truncate(keep.max(1));
        self.synthetic = synthetic;
        Ok(())
    }

    fn evaluate(&mut self, reporting_length: usize, on_progress: ProgressFn) -> Result<()> {
        self.require_generated()?;
        let steps = reporting_length.clamp(2, 20);
        if self.work(steps, on_progress) {
            self.evaluated = true;
        }
        Ok(())
    }

    fn navigate(&mut self) -> Result<()> {
        self.require_generated()
    }

    fn select_attributes(&mut self, attributes: &[String]) -> Result<()> {
        for attribute in attributes {
            if !self.data.headers.contains(attribute) {
                return Err(SynthdError::NotFound(format!("attribute '{attribute}'")).into());
            }
        }
        self.selected_attributes = attributes.to_vec();
        Ok(())
    }

    fn attributes_intersections_by_column(&self, columns: &[String]) -> Result<serde_json::Value> {
        self.require_generated()?;
        let mut rng = rand::thread_rng();
        let intersections: Vec<_> = columns
            .iter()
            .map(|column| {
                json!({
                    "column": column,
                    "selected": self.selected_attributes,
                    "count": rng.gen_range(0..=self.synthetic.len()),
                })
            })
            .collect();
        Ok(json!(intersections))
    }

    fn aggregate_result(&self, aggregate_type: AggregateType) -> Result<serde_json::Value> {
        self.require_generated()?;
        let count = match aggregate_type {
            AggregateType::Sensitive => self.data.record_count(),
            AggregateType::Reportable | AggregateType::Synthetic => self.synthetic.len(),
        };
        Ok(json!({ "record_count": count, "resolution": self.parameters.resolution }))
    }

    fn generate_result(&self) -> Result<serde_json::Value> {
        self.require_generated()?;
        Ok(json!({
            "headers": self.data.headers,
            "synthetic_count": self.synthetic.len(),
            "suppressed_count": self.data.record_count() - self.synthetic.len(),
        }))
    }

    fn evaluate_result(&self) -> Result<serde_json::Value> {
        if !self.evaluated {
            return Err(SynthdError::InvalidOperation("evaluate has not run".to_owned()).into());
        }
        let mut rng = rand::thread_rng();
        Ok(json!({
            "record_count": self.data.record_count(),
            "synthetic_count": self.synthetic.len(),
            "mean_combination_error": rng.gen_range(0.0..0.15),
        }))
    }

    fn free(&mut self) {
        self.synthetic.clear();
    }
}
