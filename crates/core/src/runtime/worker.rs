//! Worker execution context.
//!
//! Each worker runs on a dedicated OS thread because engine operations are
//! blocking and CPU-bound; within one worker they execute to completion
//! sequentially. The worker owns its context cache exclusively — the only
//! state shared across the boundary is each job's cancel cell, and all other
//! communication happens through the request/response channels.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use super::cancel::CancelCell;
use super::context_cache::{ContextCache, ContextHandle, ContextKey};
use super::engine::SynthesisEngine;
use super::protocol::{ErrorPayload, JobId, Request, RequestBody, Response};
use crate::SynthdError;

/// One job as handed to a worker: the request plus its cancel cell.
#[derive(Debug)]
pub(crate) struct JobDispatch {
    pub request: Request,
    pub cancel: CancelCell,
}

/// Handle to a spawned worker thread, held by the host.
///
/// Dropping (or taking) the dispatch sender closes the worker's inbox; the
/// thread drains it, releases its cache and exits.
pub(crate) struct Worker {
    index: usize,
    tx: Option<mpsc::UnboundedSender<JobDispatch>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(
        index: usize,
        engine: Arc<dyn SynthesisEngine>,
        cache_capacity: usize,
        responses: mpsc::UnboundedSender<Response>,
    ) -> crate::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new().name(format!("synthd-worker-{index}")).spawn(move || {
            WorkerLoop { index, engine, cache: ContextCache::new(cache_capacity), rx, responses }.run();
        })?;
        Ok(Worker { index, tx: Some(tx), thread: Some(thread) })
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn dispatch(&self, job: JobDispatch) -> crate::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(job)
                .map_err(|_| SynthdError::TransportError(format!("worker #{} inbox closed", self.index)).into()),
            None => Err(SynthdError::TransportError(format!("worker #{} is shutting down", self.index)).into()),
        }
    }

    /// Close the inbox and wait for the thread to drain and exit. The join is
    /// blocking; the host calls this from a blocking task.
    pub(crate) fn shutdown(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Worker #{} thread panicked during shutdown", self.index);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct WorkerLoop {
    index: usize,
    engine: Arc<dyn SynthesisEngine>,
    cache: ContextCache,
    rx: mpsc::UnboundedReceiver<JobDispatch>,
    responses: mpsc::UnboundedSender<Response>,
}

impl WorkerLoop {
    fn run(mut self) {
        log::debug!("Worker #{} started", self.index);
        while let Some(job) = self.rx.blocking_recv() {
            let id = job.request.id;
            let kind = job.request.body.kind_str();
            log::debug!("Worker #{}: handling {kind} ({id})", self.index);

            let outcome = catch_unwind(AssertUnwindSafe(|| self.handle(id, &job.request.body, &job.cancel)));
            let response = match outcome {
                Ok(Ok(payload)) => Response::ok(id, payload),
                Ok(Err(err)) => {
                    log::warn!("Worker #{}: {kind} ({id}) failed: {err:#}", self.index);
                    Response::error(id, ErrorPayload::from_error(&err))
                }
                Err(panic) => {
                    let message = panic_message(&panic);
                    log::error!("Worker #{}: {kind} ({id}) panicked: {message}", self.index);
                    let err: anyhow::Error = SynthdError::EngineError(message).into();
                    Response::error(id, ErrorPayload::from_error(&err))
                }
            };

            if self.responses.send(response).is_err() {
                // Host is gone; no one is listening any more.
                break;
            }
        }
        self.cache.clear();
        log::debug!("Worker #{} stopped", self.index);
    }

    fn handle(
        &mut self,
        id: JobId,
        body: &RequestBody,
        cancel: &CancelCell,
    ) -> crate::Result<Option<serde_json::Value>> {
        match body {
            RequestBody::Init => Ok(None),

            RequestBody::ClearContexts => {
                self.cache.clear();
                Ok(None)
            }

            RequestBody::GenerateAndEvaluate { data, parameters, reporting_length } => {
                let key = ContextKey::derive(parameters);
                if !self.cache.contains(&key) {
                    log::info!("Worker #{}: building context '{key}' ({} records)", self.index, data.record_count());
                    let context = self.engine.create_context(data, parameters).map_err(as_engine_error)?;
                    self.cache.insert(key.clone(), ContextHandle::new(context), parameters.clone());
                } else {
                    log::info!("Worker #{}: reusing context '{key}'", self.index);
                }

                let responses = self.responses.clone();
                let entry = self.cache.get_or_err(&key)?;

                // Synthesis contributes the first half of the progress range,
                // evaluation the second.
                let mut on_progress = |p: f64| {
                    let _ = responses.send(Response::progress(id, p * 0.5));
                    cancel.should_continue()
                };
                entry.handle.context_mut().generate(&mut on_progress).map_err(as_engine_error)?;
                if cancel.is_cancelled() {
                    return Err(SynthdError::TaskCancelled.into());
                }

                let mut on_progress = |p: f64| {
                    let _ = responses.send(Response::progress(id, 50.0 + p * 0.5));
                    cancel.should_continue()
                };
                entry.handle.context_mut().evaluate(*reporting_length, &mut on_progress).map_err(as_engine_error)?;
                if cancel.is_cancelled() {
                    return Err(SynthdError::TaskCancelled.into());
                }

                let evaluate = entry.handle.context().evaluate_result().map_err(as_engine_error)?;
                Ok(Some(json!({ "key": key, "evaluate": evaluate })))
            }

            RequestBody::Navigate { key } => {
                self.cache.get_or_err(key)?.handle.context_mut().navigate().map_err(as_engine_error)?;
                Ok(None)
            }

            RequestBody::SelectAttributes { key, attributes } => {
                self.cache.get_or_err(key)?.handle.context_mut().select_attributes(attributes).map_err(as_engine_error)?;
                Ok(None)
            }

            RequestBody::AttributesIntersectionsByColumn { key, columns } => {
                let result = self
                    .cache
                    .get_or_err(key)?
                    .handle
                    .context()
                    .attributes_intersections_by_column(columns)
                    .map_err(as_engine_error)?;
                Ok(Some(result))
            }

            RequestBody::GetAggregateResult { key, aggregate_type } => {
                let result =
                    self.cache.get_or_err(key)?.handle.context().aggregate_result(*aggregate_type).map_err(as_engine_error)?;
                Ok(Some(result))
            }

            RequestBody::GetGenerateResult { key } => {
                let result = self.cache.get_or_err(key)?.handle.context().generate_result().map_err(as_engine_error)?;
                Ok(Some(result))
            }

            RequestBody::GetEvaluateResult { key } => {
                let result = self.cache.get_or_err(key)?.handle.context().evaluate_result().map_err(as_engine_error)?;
                Ok(Some(result))
            }
        }
    }
}

/// Engine failures surface to the caller as `EngineError`; cache lookups and
/// cancellations keep their own kinds.
fn as_engine_error(err: anyhow::Error) -> anyhow::Error {
    match err.downcast_ref::<SynthdError>() {
        Some(_) => err,
        None => SynthdError::EngineError(format!("{err:#}")).into(),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "engine panicked".to_owned()
    }
}
