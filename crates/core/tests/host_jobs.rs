use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use synthd_core::runtime::engine::{
    AggregateType, DatasetInput, EngineContext, ProgressFn, SynthesisEngine, SynthesisParameters,
};
use synthd_core::{ContextKey, HostArgs, RequestBody, SynthdError, WorkerHost};

#[ctor::ctor]
fn init_logs() {
    let stderr = log4rs::append::console::ConsoleAppender::builder()
        .target(log4rs::append::console::Target::Stderr)
        .build();
    let config = log4rs::Config::builder()
        .appender(log4rs::config::Appender::builder().build("stderr", Box::new(stderr)))
        .build(log4rs::config::Root::builder().appender("stderr").build(log::LevelFilter::Warn));
    if let Ok(config) = config {
        let _ = log4rs::init_config(config);
    }
}

/// Engine double: counts context constructions and releases, runs short
/// sleep-stepped loops that honor the cooperative-cancellation callback.
struct MockEngine {
    steps: usize,
    step_delay: Duration,
    constructions: Arc<AtomicUsize>,
    frees: Arc<AtomicUsize>,
}

impl MockEngine {
    fn new(steps: usize, step_delay: Duration) -> Self {
        MockEngine {
            steps,
            step_delay,
            constructions: Arc::new(AtomicUsize::new(0)),
            frees: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

impl SynthesisEngine for MockEngine {
    fn create_context(
        &self,
        data: &DatasetInput,
        parameters: &SynthesisParameters,
    ) -> anyhow::Result<Box<dyn EngineContext>> {
        self.constructions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContext {
            steps: self.steps,
            step_delay: self.step_delay,
            record_count: data.record_count(),
            resolution: parameters.resolution,
            generated: false,
            evaluated: false,
            frees: self.frees.clone(),
        }))
    }
}

struct MockContext {
    steps: usize,
    step_delay: Duration,
    record_count: usize,
    resolution: usize,
    generated: bool,
    evaluated: bool,
    frees: Arc<AtomicUsize>,
}

impl MockContext {
    fn step_loop(&self, on_progress: ProgressFn) {
        for i in 1..=self.steps {
            std::thread::sleep(self.step_delay);
            let keep_going = on_progress(i as f64 * 100.0 / self.steps as f64);
            if !keep_going {
                return;
            }
        }
    }
}

impl EngineContext for MockContext {
    fn generate(&mut self, on_progress: ProgressFn) -> anyhow::Result<()> {
        self.step_loop(on_progress);
        self.generated = true;
        Ok(())
    }

    fn evaluate(&mut self, _reporting_length: usize, on_progress: ProgressFn) -> anyhow::Result<()> {
        self.step_loop(on_progress);
        self.evaluated = true;
        Ok(())
    }

    fn navigate(&mut self) -> anyhow::Result<()> {
        if !self.generated {
            anyhow::bail!("nothing generated yet");
        }
        Ok(())
    }

    fn select_attributes(&mut self, _attributes: &[String]) -> anyhow::Result<()> {
        Ok(())
    }

    fn attributes_intersections_by_column(&self, columns: &[String]) -> anyhow::Result<serde_json::Value> {
        Ok(json!({ "columns": columns }))
    }

    fn aggregate_result(&self, aggregate_type: AggregateType) -> anyhow::Result<serde_json::Value> {
        Ok(json!({ "aggregate": format!("{aggregate_type:?}") }))
    }

    fn generate_result(&self) -> anyhow::Result<serde_json::Value> {
        Ok(json!({ "records": self.record_count, "resolution": self.resolution }))
    }

    fn evaluate_result(&self) -> anyhow::Result<serde_json::Value> {
        Ok(json!({ "evaluated": self.evaluated, "records": self.record_count }))
    }

    fn free(&mut self) {
        self.frees.fetch_add(1, Ordering::SeqCst);
    }
}

fn dataset() -> DatasetInput {
    DatasetInput::new(
        vec!["age".into(), "zip".into()],
        vec![vec!["30".into(), "98101".into()], vec!["40".into(), "98102".into()]],
    )
}

fn parameters(resolution: usize) -> SynthesisParameters {
    SynthesisParameters {
        resolution,
        cache_max_size: 100_000,
        mode: Default::default(),
        noise_epsilon: None,
        sensitive_columns: Vec::new(),
    }
}

fn generate_and_evaluate(resolution: usize) -> RequestBody {
    RequestBody::GenerateAndEvaluate { data: dataset(), parameters: parameters(resolution), reporting_length: 3 }
}

async fn started_host(engine: Arc<MockEngine>, workers: usize) -> WorkerHost {
    let host = WorkerHost::new(engine, HostArgs { workers, cache_capacity: 4 });
    host.init().await.unwrap();
    host
}

#[tokio::test]
async fn test_generate_and_evaluate_end_to_end() {
    let engine = Arc::new(MockEngine::new(5, Duration::from_millis(2)));
    let host = started_host(engine.clone(), 1).await;

    let mut handle = host.start(generate_and_evaluate(10)).await.unwrap();
    let mut progress = handle.take_progress().unwrap();
    let collector = tokio::spawn(async move {
        let mut values = Vec::new();
        while let Some(value) = progress.recv().await {
            values.push(value);
        }
        values
    });

    let payload = handle.result().await.unwrap().unwrap();
    assert_eq!(payload["key"], json!(ContextKey::derive(&parameters(10)).as_str()));
    assert_eq!(payload["evaluate"]["evaluated"], json!(true));

    // The stream closed because the terminal response arrived; everything in
    // it was produced before that, in order.
    let values = collector.await.unwrap();
    assert!(!values.is_empty());
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "progress must be ordered: {values:?}");
    assert!(values.iter().all(|v| (0.0..=100.0).contains(v)));
    assert_eq!(*values.last().unwrap(), 100.0);

    host.terminate().await.unwrap();
}

#[tokio::test]
async fn test_same_configuration_reuses_cached_context() {
    let engine = Arc::new(MockEngine::new(2, Duration::from_millis(1)));
    let host = started_host(engine.clone(), 1).await;

    let first = host.start(generate_and_evaluate(10)).await.unwrap();
    first.result().await.unwrap();
    let second = host.start(generate_and_evaluate(10)).await.unwrap();
    second.result().await.unwrap();

    assert_eq!(engine.constructions(), 1, "identical configurations must share one context");

    // A different configuration builds its own context.
    let third = host.start(generate_and_evaluate(42)).await.unwrap();
    third.result().await.unwrap();
    assert_eq!(engine.constructions(), 2);

    host.terminate().await.unwrap();
}

#[tokio::test]
async fn test_second_job_with_same_key_queued_while_first_in_flight() {
    let engine = Arc::new(MockEngine::new(10, Duration::from_millis(3)));
    let host = started_host(engine.clone(), 1).await;

    let first = host.start(generate_and_evaluate(10)).await.unwrap();
    let second = host.start(generate_and_evaluate(10)).await.unwrap();

    first.result().await.unwrap();
    second.result().await.unwrap();
    assert_eq!(engine.constructions(), 1);

    host.terminate().await.unwrap();
}

#[tokio::test]
async fn test_cancel_immediately_still_terminates() {
    let engine = Arc::new(MockEngine::new(1000, Duration::from_millis(2)));
    let host = started_host(engine.clone(), 1).await;

    let mut handle = host.start(generate_and_evaluate(10)).await.unwrap();
    let mut progress = handle.take_progress().unwrap();
    handle.cancel();

    let result = tokio::time::timeout(Duration::from_secs(10), handle.result())
        .await
        .expect("cancelled job must not hang");

    let err = result.unwrap_err();
    assert!(matches!(err.downcast_ref::<SynthdError>(), Some(SynthdError::TaskCancelled)));

    // The terminal response closes the stream, so draining it must end.
    // Of the 1000 steps at most the callback in flight when the flag flipped
    // plus the one that observed it can have reported.
    let mut buffered = 0usize;
    while let Some(value) = progress.recv().await {
        assert!((0.0..=100.0).contains(&value));
        buffered += 1;
    }
    assert!(buffered <= 2, "cancelled job kept reporting progress: {buffered} updates");

    host.terminate().await.unwrap();
}

#[tokio::test]
async fn test_navigate_after_generate_uses_cached_context() {
    let engine = Arc::new(MockEngine::new(2, Duration::from_millis(1)));
    let host = started_host(engine.clone(), 1).await;

    let handle = host.start(generate_and_evaluate(10)).await.unwrap();
    let payload = handle.result().await.unwrap().unwrap();
    let key = ContextKey::from_raw(payload["key"].as_str().unwrap());

    host.start(RequestBody::Navigate { key: key.clone() }).await.unwrap().result().await.unwrap();

    let result = host
        .start(RequestBody::GetGenerateResult { key })
        .await
        .unwrap()
        .result()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result["resolution"], json!(10));
    assert_eq!(engine.constructions(), 1);

    host.terminate().await.unwrap();
}

#[tokio::test]
async fn test_missing_context_surfaces_not_found() {
    let engine = Arc::new(MockEngine::new(2, Duration::from_millis(1)));
    let host = started_host(engine.clone(), 1).await;

    let handle = host.start(RequestBody::Navigate { key: ContextKey::from_raw("never-created") }).await.unwrap();
    let err = handle.result().await.unwrap_err();
    assert!(matches!(err.downcast_ref::<SynthdError>(), Some(SynthdError::NotFound(_))));

    host.terminate().await.unwrap();
}

#[tokio::test]
async fn test_start_before_init_fails_fast() {
    let engine = Arc::new(MockEngine::new(2, Duration::from_millis(1)));
    let host = WorkerHost::new(engine, HostArgs::default());

    let err = host.start(generate_and_evaluate(10)).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<SynthdError>(), Some(SynthdError::Uninitialized)));
}

#[tokio::test]
async fn test_terminate_is_idempotent_and_releases_contexts() {
    let engine = Arc::new(MockEngine::new(2, Duration::from_millis(1)));
    let host = started_host(engine.clone(), 1).await;

    host.start(generate_and_evaluate(1)).await.unwrap().result().await.unwrap();
    host.start(generate_and_evaluate(2)).await.unwrap().result().await.unwrap();
    assert_eq!(engine.constructions(), 2);

    host.terminate().await.unwrap();
    host.terminate().await.unwrap();
    assert!(!host.is_running());
    assert_eq!(engine.frees(), engine.constructions(), "every context must be released exactly once");
}

#[tokio::test]
async fn test_clear_contexts_releases_handles() {
    let engine = Arc::new(MockEngine::new(2, Duration::from_millis(1)));
    let host = started_host(engine.clone(), 1).await;

    host.start(generate_and_evaluate(7)).await.unwrap().result().await.unwrap();
    assert_eq!(engine.frees(), 0);

    host.start(RequestBody::ClearContexts).await.unwrap().result().await.unwrap();
    assert_eq!(engine.frees(), 1);

    host.terminate().await.unwrap();
    assert_eq!(engine.frees(), 1);
}

#[tokio::test]
async fn test_clear_contexts_reaches_every_worker() {
    let engine = Arc::new(MockEngine::new(2, Duration::from_millis(1)));
    let host = started_host(engine.clone(), 2).await;

    // Distinct configurations spread contexts across both workers.
    for resolution in 1..=8 {
        host.start(generate_and_evaluate(resolution)).await.unwrap().result().await.unwrap();
    }
    assert_eq!(engine.constructions(), 8);

    host.start(RequestBody::ClearContexts).await.unwrap().result().await.unwrap();
    assert_eq!(
        engine.frees(),
        engine.constructions(),
        "clearing must release the contexts held by every worker, not just one"
    );

    host.terminate().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_jobs_resolve_to_their_own_handlers() {
    let engine = Arc::new(MockEngine::new(3, Duration::from_millis(1)));
    let host = started_host(engine.clone(), 2).await;

    let resolutions: Vec<usize> = (1..=8).collect();
    let mut handles = Vec::new();
    for &resolution in &resolutions {
        handles.push((resolution, host.start(generate_and_evaluate(resolution)).await.unwrap()));
    }

    // Jobs complete out of submission order across workers; each payload must
    // still carry the key derived from its own configuration.
    let results = futures::future::join_all(
        handles.into_iter().map(|(resolution, handle)| async move { (resolution, handle.result().await) }),
    )
    .await;
    for (resolution, result) in results {
        let payload = result.unwrap().unwrap();
        assert_eq!(payload["key"], json!(ContextKey::derive(&parameters(resolution)).as_str()));
    }

    host.terminate().await.unwrap();
}

#[tokio::test]
async fn test_progress_broadcast_carries_job_ids() {
    let engine = Arc::new(MockEngine::new(4, Duration::from_millis(1)));
    let host = started_host(engine.clone(), 1).await;
    let mut subscription = host.subscribe_progress();

    let handle = host.start(generate_and_evaluate(10)).await.unwrap();
    let id = handle.id;
    handle.result().await.unwrap();

    let message = subscription.recv().await.unwrap();
    assert_eq!(message.job_id, id);
    assert!((0.0..=100.0).contains(&message.value));

    host.terminate().await.unwrap();
}

#[tokio::test]
async fn test_outstanding_jobs_rejected_on_terminate() {
    let engine = Arc::new(MockEngine::new(200, Duration::from_millis(2)));
    let host = started_host(engine.clone(), 1).await;

    // The second job waits behind the first in the single worker's inbox; it
    // is cancelled and resolved during terminate rather than left hanging.
    let first = host.start(generate_and_evaluate(1)).await.unwrap();
    let second = host.start(generate_and_evaluate(2)).await.unwrap();

    host.terminate().await.unwrap();

    for handle in [first, second] {
        let result = tokio::time::timeout(Duration::from_secs(10), handle.result())
            .await
            .expect("terminated job must resolve");
        match result {
            Err(err) => {
                let kind = err.downcast_ref::<SynthdError>();
                assert!(
                    matches!(kind, Some(SynthdError::TaskCancelled) | Some(SynthdError::TransportError(_))),
                    "unexpected error: {err:#}"
                );
            }
            // Completing before the shutdown landed is also a valid outcome.
            Ok(_) => {}
        }
    }
    assert_eq!(engine.frees(), engine.constructions());
}
