use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use synthd_core::runtime::engine::{DatasetInput, SynthesisParameters};
use synthd_core::{HostArgs, JobHandle, RequestBody, WorkerHost};

use crate::cliargs::{CliArgs, Commands};
use crate::config::load_config;
use crate::consts;
use crate::logging;
use crate::sim::SimulatedEngine;

pub async fn run_app(cli_args: Arc<CliArgs>) -> anyhow::Result<()> {
    match &cli_args.command {
        Some(Commands::Run { .. }) | None => run_app_internal(cli_args.clone()).await,
        Some(Commands::List) => list_job_kinds(),
    }
}

fn list_job_kinds() -> anyhow::Result<()> {
    println!("Supported job kinds:");
    for kind in [
        "GenerateAndEvaluate",
        "Navigate",
        "SelectAttributes",
        "AttributesIntersectionsByColumn",
        "GetAggregateResult",
        "GetGenerateResult",
        "GetEvaluateResult",
        "ClearContexts",
    ] {
        println!("  {kind}");
    }
    Ok(())
}

async fn run_app_internal(cli_args: Arc<CliArgs>) -> anyhow::Result<()> {
    if cli_args.verbose > 0 {
        eprintln!("Synthd v{}\n", consts::APP_VERSION);
        eprintln!("Loading configuration...");
    }

    let cfg = load_config(&cli_args)?;

    logging::log_init(&cli_args)?;
    if cli_args.verbose > 0 {
        eprintln!("Logging sub-system initialized.\n");
    }

    log::info!("Synthd Version={}", consts::APP_VERSION);
    log::info!("==========================================================\n");

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let ctrl_c_token = cancel.clone();
    tokio::task::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            log::error!("Failed to install CTRL+C signal handler");
            return;
        }
        log::info!("CTRL+C pressed, cancelling jobs...");
        ctrl_c_token.cancel();
    });

    log::info!("Starting the worker host...");
    log::info!("Press CTRL+C to terminate.");

    let host = WorkerHost::new(Arc::new(SimulatedEngine), HostArgs::load(Some(&cfg))?);
    host.init().await?;

    // Terminating the host cancels every outstanding job and rejects whatever
    // is still queued, so CTRL+C resolves the awaits below.
    let shutdown_host = host.clone();
    let shutdown_token = cancel.clone();
    let shutdown = tokio::task::spawn(async move {
        if let Err(e) = synthd_core::runtime::host::run_until_cancelled(&shutdown_host, shutdown_token).await {
            log::error!("Shutdown failed: {e:#}");
        }
    });

    let jobs = match cfg.get_string("jobs_path") {
        Ok(jobs_path) => load_jobs(&jobs_path)?,
        Err(_) => demo_jobs(),
    };

    let result = run_jobs(&host, jobs, &cancel).await;

    shutdown.abort();
    host.terminate().await?;
    log::info!("Bye!");

    result
}

/// Read a batch of jobs from a JSON file holding an array of request bodies.
fn load_jobs(path: &str) -> anyhow::Result<Vec<RequestBody>> {
    log::info!("Loading jobs from '{path}'...");
    let text = std::fs::read_to_string(path)?;
    let jobs: Vec<RequestBody> = serde_json::from_str(&text)?;
    if jobs.is_empty() {
        anyhow::bail!("The jobs file '{path}' holds no jobs");
    }
    Ok(jobs)
}

/// One synthesis run over a tiny in-memory dataset.
fn demo_jobs() -> Vec<RequestBody> {
    log::info!("No jobs file given, running the built-in demonstration job.");
    let headers: Vec<String> = vec!["age_band".into(), "zip".into(), "diagnosis".into()];
    let records = (0..200)
        .map(|i| vec![format!("{}0s", 2 + i % 6), format!("981{:02}", i % 20), format!("d{}", i % 7)])
        .collect();
    let data = DatasetInput::new(headers, records);
    let parameters = SynthesisParameters {
        resolution: 10,
        cache_max_size: 100_000,
        mode: Default::default(),
        noise_epsilon: None,
        sensitive_columns: Vec::new(),
    };
    vec![RequestBody::GenerateAndEvaluate { data, parameters, reporting_length: 3 }]
}

async fn run_jobs(host: &WorkerHost, jobs: Vec<RequestBody>, cancel: &CancellationToken) -> anyhow::Result<()> {
    let mut handles: Vec<JobHandle> = Vec::with_capacity(jobs.len());
    for job in jobs {
        let kind = job.kind_str();
        let handle = host.start(job).await?;
        log::info!("Submitted {kind} as job {}", handle.id);
        handles.push(handle);
    }

    // Mirror progress updates to the log as whole percents.
    let mut progress_rx = host.subscribe_progress();
    let progress_printer = tokio::task::spawn(async move {
        let mut last = -1i64;
        while let Ok(message) = progress_rx.recv().await {
            let whole = message.value.floor() as i64;
            if whole != last {
                last = whole;
                log::info!("Job {}: {whole}%", message.job_id);
            }
        }
    });

    let mut failures = 0usize;
    for handle in handles {
        let id = handle.id;
        match handle.result().await {
            Ok(Some(payload)) => log::info!("Job {id} finished: {payload}"),
            Ok(None) => log::info!("Job {id} finished."),
            Err(err) => {
                failures += 1;
                log::error!("Job {id} failed: {err:#}");
            }
        }
    }

    progress_printer.abort();

    if failures > 0 && !cancel.is_cancelled() {
        anyhow::bail!("{failures} job(s) failed");
    }
    Ok(())
}
