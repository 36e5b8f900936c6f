//! Worker host: owns the worker execution contexts and presents each
//! outstanding job as a cancelable future plus a progress stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::cancel::CancelCell;
use super::context_cache::ContextKey;
use super::correlation::{CorrelationTable, PendingJob};
use super::engine::SynthesisEngine;
use super::progress::{ProgressChannel, ProgressMessage, ProgressReceiver};
use super::protocol::{ErrorKind, ErrorPayload, JobId, Request, RequestBody, Response, ResponseBody};
use super::worker::{JobDispatch, Worker};
use crate::SynthdError;

#[derive(Debug, Clone, Deserialize)]
pub struct HostArgs {
    /// Number of worker execution contexts to spawn.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Engine contexts each worker may keep alive at once.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_workers() -> usize {
    1
}

fn default_cache_capacity() -> usize {
    8
}

impl Default for HostArgs {
    fn default() -> Self {
        HostArgs { workers: default_workers(), cache_capacity: default_cache_capacity() }
    }
}

impl HostArgs {
    pub fn load(cfg: Option<&config::Config>) -> crate::Result<Self> {
        match cfg {
            Some(cfg) => match cfg.get::<Self>("runtime.host") {
                Ok(res) => Ok(res),
                Err(config::ConfigError::NotFound(_)) => Ok(Self::default()),
                Err(e) => Err(e.into()),
            },
            _ => Ok(Self::default()),
        }
    }
}

/// Caller-side handle for one outstanding job.
///
/// The future resolves exactly once, on the terminal response. Progress
/// updates arrive on their own stream and never resume the result await.
#[derive(Debug)]
pub struct JobHandle {
    pub id: JobId,
    reply: oneshot::Receiver<Response>,
    progress: Option<ProgressReceiver>,
    cancel: CancelCell,
}

impl JobHandle {
    /// Request cooperative cancellation. The terminal response still arrives,
    /// possibly some time later.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Take the job's ordered progress stream (percent, 0-100). The stream
    /// closes right after the terminal response is delivered. Returns `None`
    /// once taken.
    pub fn take_progress(&mut self) -> Option<ProgressReceiver> {
        self.progress.take()
    }

    /// Await the terminal response, consuming the handle. An error terminal
    /// is rebuilt into the typed error that produced it.
    pub async fn result(self) -> crate::Result<Option<serde_json::Value>> {
        let response = self
            .reply
            .await
            .map_err(|_| SynthdError::TransportError("job dispatcher dropped before completion".to_owned()))?;
        match response.body {
            ResponseBody::Ok { payload } => Ok(payload),
            ResponseBody::Error { error } => Err(error.into_error()),
            ResponseBody::Progress { .. } => {
                // The correlation table never completes the reply with a
                // progress body.
                Err(SynthdError::InvalidOperation("progress delivered as terminal response".to_owned()).into())
            }
        }
    }
}

#[derive(Clone)]
pub struct WorkerHost {
    inner: Arc<InnerHost>,
}

struct InnerHost {
    engine: Arc<dyn SynthesisEngine>,
    args: HostArgs,
    correlations: CorrelationTable,
    progress_channel: ProgressChannel,
    next_worker: AtomicUsize,
    state: tokio::sync::RwLock<HostState>,
}

#[derive(Default)]
struct HostState {
    running: bool,
    workers: Vec<Worker>,
    pump: Option<tokio::task::JoinHandle<()>>,
}

impl WorkerHost {
    /// Build a host around an engine. The cache and workers are owned by this
    /// instance; independent hosts are fully isolated from one another.
    pub fn new(engine: Arc<dyn SynthesisEngine>, args: HostArgs) -> Self {
        WorkerHost {
            inner: Arc::new(InnerHost {
                engine,
                args,
                correlations: CorrelationTable::new(),
                progress_channel: ProgressChannel::default(),
                next_worker: AtomicUsize::new(0),
                state: tokio::sync::RwLock::new(HostState::default()),
            }),
        }
    }

    pub fn args(&self) -> &HostArgs {
        &self.inner.args
    }

    pub fn is_running(&self) -> bool {
        match self.inner.state.try_read() {
            Ok(state) => state.running,
            Err(_) => {
                log::warn!("Failed to read host state, assuming running");
                true
            }
        }
    }

    /// Subscribe to progress updates for every job of this host.
    pub fn subscribe_progress(&self) -> tokio::sync::broadcast::Receiver<ProgressMessage> {
        self.inner.progress_channel.subscribe()
    }

    /// Spawn the worker execution context(s) and the response pump, then wait
    /// until every worker answers the readiness probe.
    pub async fn init(&self) -> crate::Result<()> {
        let worker_count = self.inner.args.workers.max(1);
        {
            let mut state = self.inner.state.try_write()?;
            if state.running {
                return Err(SynthdError::invalid_operation("already initialized."));
            }
            log::info!(
                "-- Starting worker host: {worker_count} worker(s), cache capacity {}...",
                self.inner.args.cache_capacity
            );

            let (response_tx, response_rx) = mpsc::unbounded_channel();
            let mut workers = Vec::with_capacity(worker_count);
            for index in 0..worker_count {
                workers.push(Worker::spawn(
                    index,
                    self.inner.engine.clone(),
                    self.inner.args.cache_capacity,
                    response_tx.clone(),
                )?);
            }
            // Workers hold the only response senders; when the last one stops,
            // the pump sees the channel close and rejects whatever is left.
            drop(response_tx);

            state.pump = Some(self.spawn_pump(response_rx));
            state.workers = workers;
            state.running = true;
        }

        // Readiness barrier: one probe per worker, answered once its loop is
        // serving requests.
        for index in 0..worker_count {
            let handle = self.start_on(index, RequestBody::Init).await?;
            handle.result().await?;
        }
        log::info!("-- Worker host ready.");
        Ok(())
    }

    /// Submit a job. Fails fast with `Uninitialized` before `init()`.
    pub async fn start(&self, body: RequestBody) -> crate::Result<JobHandle> {
        let state = self.inner.state.read().await;
        if !state.running {
            return Err(SynthdError::Uninitialized.into());
        }
        // Every worker owns contexts of its own, so clearing must reach all
        // of them, not whichever one the round-robin lands on.
        if matches!(body, RequestBody::ClearContexts) {
            return self.broadcast(&state.workers, body);
        }
        let index = self.route(&body, state.workers.len());
        self.submit(&state.workers[index], body)
    }

    /// Submit a job to one specific worker, bypassing routing.
    async fn start_on(&self, index: usize, body: RequestBody) -> crate::Result<JobHandle> {
        let state = self.inner.state.read().await;
        if !state.running {
            return Err(SynthdError::Uninitialized.into());
        }
        let worker = state
            .workers
            .get(index)
            .ok_or(SynthdError::BadArgument("index"))?;
        self.submit(worker, body)
    }

    /// Stop the workers, releasing every engine context they own, and reject
    /// any still-outstanding job. Idempotent: repeated calls are a no-op.
    pub async fn terminate(&self) -> crate::Result<()> {
        let mut state = self.inner.state.write().await;
        if !state.running {
            return Ok(());
        }
        log::info!("-- Stopping worker host...");

        // Ask in-flight jobs to wind down before waiting on the threads.
        self.inner.correlations.cancel_all();

        let workers = std::mem::take(&mut state.workers);
        tokio::task::spawn_blocking(move || {
            for mut worker in workers {
                worker.shutdown();
            }
        })
        .await
        .map_err(|e| SynthdError::TransportError(format!("worker shutdown task failed: {e}")))?;

        // All response senders are gone now; the pump drains the channel,
        // rejects the leftovers and exits.
        if let Some(pump) = state.pump.take()
            && let Err(e) = pump.await
        {
            log::error!("Response pump task failed: {e}");
        }

        state.running = false;
        log::info!("-- Worker host stopped.");
        Ok(())
    }

    fn submit(&self, worker: &Worker, body: RequestBody) -> crate::Result<JobHandle> {
        let request = Request::new(body);
        let id = request.id;
        let (reply_tx, reply_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let cancel = CancelCell::new();

        self.inner.correlations.register(id, PendingJob::new(reply_tx, progress_tx, cancel.clone()));
        log::debug!("Dispatching {} ({id}) to worker #{}", request.body.kind_str(), worker.index());

        if let Err(e) = worker.dispatch(JobDispatch { request, cancel: cancel.clone() }) {
            // Never leave a registered entry behind for a job that was never
            // accepted.
            self.inner.correlations.resolve(Response::error(id, ErrorPayload::new(ErrorKind::Transport, format!("{e:#}"))));
            return Err(e);
        }

        Ok(JobHandle { id, reply: reply_rx, progress: Some(progress_rx), cancel })
    }

    /// Fan a request out to every worker as its own sub-job. The caller's job
    /// resolves once each worker has acked its copy; any failed copy turns the
    /// aggregate terminal into that error.
    fn broadcast(&self, workers: &[Worker], body: RequestBody) -> crate::Result<JobHandle> {
        let id = JobId::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let cancel = CancelCell::new();
        self.inner.correlations.register(id, PendingJob::new(reply_tx, progress_tx, cancel.clone()));
        log::debug!("Broadcasting {} ({id}) to {} worker(s)", body.kind_str(), workers.len());

        let mut replies = Vec::with_capacity(workers.len());
        for worker in workers {
            match self.submit(worker, body.clone()) {
                Ok(handle) => replies.push(handle),
                Err(e) => {
                    self.inner
                        .correlations
                        .resolve(Response::error(id, ErrorPayload::new(ErrorKind::Transport, format!("{e:#}"))));
                    return Err(e);
                }
            }
        }

        let host = self.clone();
        tokio::spawn(async move {
            let mut failure = None;
            for reply in replies {
                if let Err(e) = reply.result().await {
                    failure = Some(ErrorPayload::from_error(&e));
                }
            }
            let response = match failure {
                Some(error) => Response::error(id, error),
                None => Response::ok(id, None),
            };
            host.inner.correlations.resolve(response);
        });

        Ok(JobHandle { id, reply: reply_rx, progress: Some(progress_rx), cancel })
    }

    /// Keyed requests go to the worker owning that context; everything else
    /// round-robins.
    fn route(&self, body: &RequestBody, worker_count: usize) -> usize {
        match body.routing_key() {
            Some(key) => key_slot(&key, worker_count),
            None => self.inner.next_worker.fetch_add(1, Ordering::Relaxed) % worker_count,
        }
    }

    fn spawn_pump(&self, mut response_rx: mpsc::UnboundedReceiver<Response>) -> tokio::task::JoinHandle<()> {
        let host = self.clone();
        tokio::spawn(async move {
            while let Some(response) = response_rx.recv().await {
                host.route_response(response);
            }
            host.inner.correlations.reject_all("worker transport closed");
            log::debug!("Response pump stopped");
        })
    }

    fn route_response(&self, response: Response) {
        if let ResponseBody::Progress { value } = response.body {
            self.inner.progress_channel.send(ProgressMessage {
                job_id: response.id,
                value,
                timestamp: response.timestamp,
            });
        }
        self.inner.correlations.resolve(response);
    }
}

impl std::fmt::Debug for WorkerHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHost").field("workers", &self.inner.args.workers).finish()
    }
}

fn key_slot(key: &ContextKey, worker_count: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % worker_count
}

/// Lifecycle of the whole host scoped to a cancellation token: terminates the
/// host when the token fires. Convenience for binaries wiring CTRL-C.
pub async fn run_until_cancelled(host: &WorkerHost, cancel: CancellationToken) -> crate::Result<()> {
    cancel.cancelled().await;
    host.terminate().await
}
