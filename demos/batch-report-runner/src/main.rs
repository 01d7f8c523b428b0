//! # Batch Report Runner
//!
//! Renders a batch of synthetic reports on a bounded worker pool and prints a
//! summary with the final pool statistics.
//!
//! Each report is a multi-page task. Pages are rendered one at a time and the
//! task checks its cancellation scope between pages, so Ctrl-C, per-report
//! timeouts and a drain timeout all stop work part-way through a report.
//!
//! ## Usage
//! ```bash
//! # 4 workers, 40 reports, results collected by the caller
//! cargo run --package batch-report-runner -- --workers 4 --reports 40
//!
//! # Shed load instead of waiting for queue space
//! cargo run --package batch-report-runner -- --queue-capacity 0 --shed
//!
//! # Inject failures and panics, push results to a callback
//! cargo run --package batch-report-runner -- --fail-every 7 --panic-every 11 --mode callback
//!
//! # Short drain budget: exits non-zero when in-flight reports are cancelled
//! cargo run --package batch-report-runner -- --work-ms 200 --drain-timeout-ms 50
//! ```
//!
//! A TOML file passed with `--config` supplies the pool configuration; flags
//! given on the command line override it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use turul_task_dispatcher::prelude::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of workers (overrides the config file)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Queue capacity, 0 for rendezvous (overrides the config file)
    #[arg(short, long)]
    queue_capacity: Option<usize>,

    /// Number of reports to render
    #[arg(short, long, default_value = "20")]
    reports: u64,

    /// Time to render one page, in milliseconds
    #[arg(long, default_value = "25")]
    work_ms: u64,

    /// Per-report timeout in milliseconds (overrides the config file)
    #[arg(long)]
    task_timeout_ms: Option<u64>,

    /// Drain budget for shutdown in milliseconds (overrides the config file)
    #[arg(long)]
    drain_timeout_ms: Option<u64>,

    /// Fail every Nth report (0 disables)
    #[arg(long, default_value = "0")]
    fail_every: u64,

    /// Panic in every Nth report (0 disables)
    #[arg(long, default_value = "0")]
    panic_every: u64,

    /// Dispatcher configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How results are consumed
    #[arg(long, value_enum, default_value = "collect")]
    mode: ResultMode,

    /// Use try_submit and count rejected reports instead of waiting for space
    #[arg(long, default_value = "false")]
    shed: bool,

    /// Enable debug logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ResultMode {
    /// Drain results from a bounded channel
    Collect,
    /// Push results to a callback as they complete
    Callback,
    /// Log and count results only
    FireAndForget,
}

/// What a rendered report produces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderedReport {
    report_id: u64,
    pages: u32,
    bytes: u64,
}

struct ReportTask {
    report_id: u64,
    pages: u32,
    page_time: Duration,
    fail: bool,
    panic: bool,
}

#[async_trait]
impl Task for ReportTask {
    type Output = RenderedReport;

    fn id(&self) -> TaskId {
        TaskId::from(format!("report-{}", self.report_id))
    }

    async fn execute(self: Box<Self>, scope: CancellationScope) -> Result<RenderedReport, TaskError> {
        let mut bytes = 0u64;
        for page in 1..=self.pages {
            scope
                .run_until_done(tokio::time::sleep(self.page_time))
                .await?;
            bytes += 2048 + u64::from(page) * 128;

            if page == self.pages / 2 {
                if self.panic {
                    panic!("layout engine crashed on report {}", self.report_id);
                }
                if self.fail {
                    return Err(TaskError::failed(format!(
                        "missing data source for report {}",
                        self.report_id
                    )));
                }
            }
        }
        Ok(RenderedReport {
            report_id: self.report_id,
            pages: self.pages,
            bytes,
        })
    }
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    largest: Mutex<Option<RenderedReport>>,
}

impl Tally {
    fn record(&self, result: &TaskResult<RenderedReport>) {
        match &result.outcome {
            Ok(report) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(report.bytes, Ordering::Relaxed);
                let mut largest = self.largest.lock().unwrap_or_else(PoisonError::into_inner);
                if largest.as_ref().is_none_or(|current| report.bytes > current.bytes) {
                    *largest = Some(report.clone());
                }
                debug!(
                    task_id = %result.task_id,
                    worker_id = %result.worker_id,
                    pages = report.pages,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "Report rendered"
                );
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %result.task_id, error = %e, "Report failed");
            }
        }
    }
}

fn load_config(args: &Args) -> Result<DispatcherConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        }
        None => DispatcherConfig {
            name: "batch-reports".to_string(),
            ..DispatcherConfig::default()
        },
    };

    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(capacity) = args.queue_capacity {
        config.queue_capacity = capacity;
    }
    if args.task_timeout_ms.is_some() {
        config.default_task_timeout_ms = args.task_timeout_ms;
    }
    if let Some(drain) = args.drain_timeout_ms {
        config.drain_timeout_ms = drain;
    }
    Ok(config)
}

fn report_task(args: &Args, report_id: u64) -> ReportTask {
    let nth = |every: u64| every > 0 && report_id % every == 0;
    ReportTask {
        report_id,
        pages: 2 + (report_id % 5) as u32,
        page_time: Duration::from_millis(args.work_ms),
        fail: nth(args.fail_every),
        panic: nth(args.panic_every),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = load_config(&args)?;
    let tally = Arc::new(Tally::default());

    let builder = Dispatcher::<RenderedReport>::builder().config(config);
    let builder = match args.mode {
        ResultMode::Collect => builder,
        ResultMode::Callback => {
            let tally = Arc::clone(&tally);
            builder.on_result(move |result| tally.record(&result))
        }
        ResultMode::FireAndForget => builder.fire_and_forget(),
    };
    let dispatcher = builder.build().context("Invalid dispatcher configuration")?;

    let root = CancellationScope::new();
    {
        let root = root.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; cancelling outstanding reports");
                root.cancel();
            }
        });
    }

    // Consume while submitting so a full result buffer never stalls the workers.
    let consumer = dispatcher.drain().map(|mut results| {
        let tally = Arc::clone(&tally);
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                tally.record(&result);
            }
        })
    });

    dispatcher.start(root.clone())?;
    info!(
        reports = args.reports,
        mode = ?args.mode,
        shed = args.shed,
        "Submitting reports"
    );

    let started = Instant::now();
    let mut shed_count = 0u64;
    for report_id in 1..=args.reports {
        let task = report_task(&args, report_id);
        let outcome = if args.shed {
            dispatcher.try_submit(task)
        } else {
            dispatcher.submit(task).await
        };
        match outcome {
            Ok(()) => {}
            Err(DispatchError::QueueFull) => shed_count += 1,
            Err(DispatchError::DispatcherClosed) => {
                warn!(report_id, "Dispatcher closed; not submitting remaining reports");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let drain_timeout = dispatcher.config().drain_timeout();
    let shutdown = dispatcher.shutdown(drain_timeout).await;
    if let Some(consumer) = consumer {
        consumer.await.context("Result consumer failed")?;
    }
    let stats = dispatcher.stats();

    println!("Batch report run ({})", dispatcher.name());
    println!("  elapsed:   {:?}", started.elapsed());
    println!("  rendered:  {}", tally.succeeded.load(Ordering::Relaxed));
    println!("  failed:    {}", tally.failed.load(Ordering::Relaxed));
    println!("  shed:      {}", shed_count);
    println!("  bytes:     {}", tally.bytes.load(Ordering::Relaxed));
    let largest = tally
        .largest
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(report) = largest {
        println!("  largest:   {}", serde_json::to_string(&report)?);
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);

    match shutdown {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(DispatchError::DrainTimeout { drain_timeout }) => {
            eprintln!("Drain did not finish within {drain_timeout:?}; in-flight reports were cancelled");
            Ok(ExitCode::FAILURE)
        }
        Err(DispatchError::ScopeEnded(reason)) => {
            eprintln!("Run ended early: {reason}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}
