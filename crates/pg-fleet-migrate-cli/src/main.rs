//! pg-fleet-migrate CLI - batch PostgreSQL migrations between cloud instances.

use clap::{Parser, Subcommand};
use pg_fleet_migrate::core::ConnectionProvider;
use pg_fleet_migrate::error::EXIT_TRANSFER_ERROR;
use pg_fleet_migrate::orchestrator::{BatchProgress, ProgressCallback};
use pg_fleet_migrate::progress::{format_bytes, format_duration};
use pg_fleet_migrate::{
    BatchReport, BatchResult, Config, Endpoint, ExecutionEngine, JsonProgress, Mapping,
    MigrateError, MigrationTool, Orchestrator, PgConnectionProvider, PgDumpTools, PgPermissions,
    ProgressSink, TracingProgress,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pg-fleet-migrate")]
#[command(about = "Batch PostgreSQL migrations between managed cloud instances")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every migration task of the mapping
    Run {
        /// Override maximum tasks in flight
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Stop admitting tasks after the first failure
        #[arg(long)]
        stop_on_error: bool,

        /// Retry failed tasks once, sequentially
        #[arg(long)]
        retry_failed: bool,

        /// Replicate roles and database grants
        #[arg(long)]
        include_users: bool,
    },

    /// Show the planned migration tasks
    Plan {
        /// Connect to sources and estimate size and duration
        #[arg(long)]
        estimate: bool,

        /// Override maximum tasks in flight (affects the estimate)
        #[arg(long)]
        max_parallel: Option<usize>,
    },

    /// Validate the mapping without connecting to any instance
    Validate,

    /// Test connections to every source and target instance
    HealthCheck,
}

/// Batch option overrides from the `run` and `plan` flags.
#[derive(Default)]
struct Overrides {
    max_parallel: Option<usize>,
    stop_on_error: bool,
    retry_failed: bool,
    include_users: bool,
}

impl Overrides {
    fn apply(self, mapping: Mapping) -> Result<Mapping, MigrateError> {
        let mut options = mapping.options().clone();
        if let Some(n) = self.max_parallel {
            if n == 0 {
                return Err(MigrateError::Config(
                    "--max-parallel must be at least 1".to_string(),
                ));
            }
            options.max_parallel = n;
        }
        options.stop_on_error |= self.stop_on_error;
        options.retry_failed |= self.retry_failed;
        options.include_users |= self.include_users;
        Ok(mapping.with_options(options))
    }
}

/// Connection result for one instance.
#[derive(Debug, Serialize)]
struct EndpointHealth {
    endpoint: String,
    role: &'static str,
    connected: bool,
    latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    healthy: bool,
    endpoints: Vec<EndpointHealth>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);
    let mapping = config.mapping()?;

    match cli.command {
        Commands::Validate => {
            validate(&mapping, cli.output_json)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Plan {
            estimate,
            max_parallel,
        } => {
            let mapping = Overrides {
                max_parallel,
                ..Overrides::default()
            }
            .apply(mapping)?;
            let (orchestrator, connections) = build_orchestrator(&config, cli.progress)?;
            let result = plan(&orchestrator, &mapping, estimate, cli.output_json).await;
            connections.close_all_connections().await;
            result.map(|()| ExitCode::SUCCESS)
        }

        Commands::HealthCheck => {
            let connections = Arc::new(PgConnectionProvider::new(config.connection.clone())?);
            let report = health_check(connections.as_ref(), &mapping).await;
            connections.close_all_connections().await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_health(&report);
            }
            if !report.healthy {
                return Err(MigrateError::connectivity(
                    "health-check",
                    "one or more instances are unreachable",
                ));
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            max_parallel,
            stop_on_error,
            retry_failed,
            include_users,
        } => {
            let mapping = Overrides {
                max_parallel,
                stop_on_error,
                retry_failed,
                include_users,
            }
            .apply(mapping)?;

            let (orchestrator, connections) = build_orchestrator(&config, cli.progress)?;
            let orchestrator = Arc::new(orchestrator);

            let cancel_token = setup_signal_handler()?;
            let watcher = {
                let orchestrator = orchestrator.clone();
                let token = cancel_token.clone();
                tokio::spawn(async move {
                    token.cancelled().await;
                    orchestrator.cancel_batch();
                })
            };

            let on_progress: &ProgressCallback<'_> = &|p: &BatchProgress| {
                info!(
                    "Progress: {}/{} ({:.1}%), {} failed, last {}",
                    p.completed, p.total, p.percentage, p.failed, p.current
                );
            };
            let outcome = orchestrator.execute_batch(&mapping, Some(on_progress)).await;

            watcher.abort();
            connections.close_all_connections().await;

            match outcome {
                Ok(report) => {
                    if cli.output_json {
                        println!("{}", report.to_json()?);
                    } else {
                        print_report(&report);
                    }
                    if orchestrator.is_cancelled() {
                        return Err(MigrateError::Cancelled);
                    }
                    if !report.is_success() {
                        eprintln!(
                            "{} of {} task(s) failed",
                            report.summary.failed, report.summary.total_tasks
                        );
                        return Ok(ExitCode::from(EXIT_TRANSFER_ERROR));
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(MigrateError::BatchAborted {
                    task_id,
                    reason,
                    result,
                }) => {
                    if cli.output_json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    } else {
                        print_partial(&result);
                    }
                    Err(MigrateError::BatchAborted {
                        task_id,
                        reason,
                        result,
                    })
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn build_orchestrator(
    config: &Config,
    progress: bool,
) -> Result<(Orchestrator, Arc<PgConnectionProvider>), MigrateError> {
    let connections = Arc::new(PgConnectionProvider::new(config.connection.clone())?);
    let dump = Arc::new(PgDumpTools::new(config.tools.clone(), connections.clone()));
    let engine = ExecutionEngine::new(connections.clone(), dump.clone(), dump)
        .with_permissions(Arc::new(PgPermissions::new(connections.clone())));

    let sink: Arc<dyn ProgressSink> = if progress {
        Arc::new(JsonProgress::stderr())
    } else {
        Arc::new(TracingProgress)
    };

    let orchestrator = Orchestrator::new(Arc::new(MigrationTool::new(engine)))
        .with_progress(sink)
        .with_work_dir(config.tools.work_dir());
    Ok((orchestrator, connections))
}

fn validate(mapping: &Mapping, output_json: bool) -> Result<(), MigrateError> {
    let validation = mapping.validate();
    let tasks = mapping.generate_execution_plan();

    if output_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "valid": validation.is_valid(),
                "errors": validation.errors,
                "warnings": validation.warnings,
                "tasks": tasks.len(),
            }))?
        );
    } else {
        for error in &validation.errors {
            println!("  ERROR: {}", error);
        }
        for warning in &validation.warnings {
            println!("  WARN:  {}", warning);
        }
        if validation.is_valid() {
            println!(
                "Mapping is valid: strategy {}, {} ({} task(s))",
                mapping.strategy().name(),
                mapping.mapping_type(),
                tasks.len()
            );
        }
    }

    validation.into_result().map(|_| ())
}

async fn plan(
    orchestrator: &Orchestrator,
    mapping: &Mapping,
    estimate: bool,
    output_json: bool,
) -> Result<(), MigrateError> {
    let plan = orchestrator.plan(mapping)?;
    let estimate = if estimate {
        Some(orchestrator.estimate_batch(mapping).await?)
    } else {
        None
    };

    if output_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "plan": plan,
                "estimate": estimate,
            }))?
        );
        return Ok(());
    }

    println!(
        "Plan: strategy {}, {}, {} task(s)",
        plan.strategy,
        plan.mapping_type,
        plan.operations.len()
    );
    for op in &plan.operations {
        println!("  {}", op.label());
    }
    for warning in &plan.warnings {
        println!("  WARN: {}", warning);
    }

    if let Some(estimate) = estimate {
        println!("\nEstimate:");
        for e in &estimate.estimates {
            println!(
                "  {}: {} database(s), {}, ~{}",
                e.operation_id,
                e.database_count,
                format_bytes(e.total_bytes),
                format_duration(Duration::from_secs(e.estimated_seconds))
            );
        }
        println!(
            "  Total: {} database(s), {}",
            estimate.total_databases,
            format_bytes(estimate.total_bytes)
        );
        println!(
            "  Duration: ~{} sequential, ~{} with max_parallel={}",
            format_duration(Duration::from_secs(estimate.sequential_seconds)),
            format_duration(Duration::from_secs(estimate.parallel_seconds)),
            mapping.options().max_parallel
        );
    }
    Ok(())
}

/// Distinct endpoints of a mapping, sources first.
fn mapping_endpoints(mapping: &Mapping) -> Vec<(&'static str, &Endpoint)> {
    let strategy = mapping.strategy();
    let mut seen = BTreeSet::new();
    let mut endpoints = Vec::new();
    let tagged = strategy
        .source_endpoints()
        .into_iter()
        .map(|ep| ("source", ep))
        .chain(strategy.target_endpoints().into_iter().map(|ep| ("target", ep)));
    for (role, ep) in tagged {
        if seen.insert(format!("{}/{}", role, ep.key())) {
            endpoints.push((role, ep));
        }
    }
    endpoints
}

async fn health_check(connections: &PgConnectionProvider, mapping: &Mapping) -> HealthReport {
    let mut endpoints = Vec::new();
    for (role, endpoint) in mapping_endpoints(mapping) {
        let started = Instant::now();
        let outcome = connections.test_connection(endpoint, None).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = &outcome {
            warn!("{} {} unreachable: {}", role, endpoint, e);
        }
        endpoints.push(EndpointHealth {
            endpoint: endpoint.key(),
            role,
            connected: outcome.is_ok(),
            latency_ms,
            error: outcome.err().map(|e| e.to_string()),
        });
    }

    HealthReport {
        healthy: endpoints.iter().all(|e| e.connected),
        endpoints,
    }
}

fn print_health(report: &HealthReport) {
    println!("Health Check Results:");
    for ep in &report.endpoints {
        println!(
            "  {} ({}): {} ({}ms)",
            ep.endpoint,
            ep.role,
            if ep.connected { "OK" } else { "FAILED" },
            ep.latency_ms
        );
        if let Some(ref err) = ep.error {
            println!("    Error: {}", err);
        }
    }
    println!(
        "\n  Overall: {}",
        if report.healthy { "HEALTHY" } else { "UNHEALTHY" }
    );
}

fn print_report(report: &BatchReport) {
    let summary = &report.summary;
    println!("\nBatch completed!");
    println!("  Batch ID: {}", report.batch_id);
    println!("  Strategy: {} ({})", summary.strategy, summary.mapping_type);
    println!("  Duration: {}", summary.duration);
    println!(
        "  Tasks: {} succeeded, {} failed, {} skipped of {} ({})",
        summary.successful, summary.failed, summary.skipped, summary.total_tasks, summary.success_rate
    );

    for task in &report.tasks {
        println!("  [{}] {} {} -> {}", task.status, task.id, task.source, task.target);
        if !task.databases.is_empty() {
            println!("      databases: {}", task.databases.join(", "));
        }
        match (&task.error, &task.phase) {
            (Some(err), Some(phase)) => println!("      error ({}): {}", phase, err),
            (Some(err), None) => println!("      error: {}", err),
            _ => {}
        }
    }

    for audit in &report.consolidation {
        println!(
            "  Consolidated {} database(s) on {}",
            audit.databases.len(),
            audit.target
        );
        if !audit.merged.is_empty() {
            println!("      merged: {}", audit.merged.join(", "));
        }
    }

    if let Some(ref perf) = report.performance {
        println!(
            "  Task duration: avg {}, min {}, max {}",
            format_duration(Duration::from_millis(perf.average_ms)),
            format_duration(Duration::from_millis(perf.min_ms)),
            format_duration(Duration::from_millis(perf.max_ms))
        );
    }
}

fn print_partial(result: &BatchResult) {
    println!("\nBatch stopped after a failure:");
    for task in &result.successful {
        println!("  [completed] {}", task.operation.label());
    }
    for task in &result.failed {
        match &task.phase {
            Some(phase) => println!("  [failed] {} during {}: {}", task.operation.label(), phase, task.error),
            None => println!("  [failed] {}: {}", task.operation.label(), task.error),
        }
    }
    for task in &result.skipped {
        println!("  [skipped] {}: {}", task.operation.label(), task.reason);
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM.
///
/// The batch stops admitting tasks; running tasks finish and clean up.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!("\nReceived {}. Finishing running tasks, no new tasks will start...", name);
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing running tasks, no new tasks will start...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
