use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use orbit_orchestrator::bridge::memory::seed;
use orbit_orchestrator::bridge::{
    FaultInjector, InMemoryStorage, InMemoryStore, MockAnalysisService, MockEmbeddingService,
};
use orbit_orchestrator::engine::parse_duration;
use orbit_orchestrator::prelude::*;
use serde_json::json;
use tracing_subscriber::EnvFilter;
#[cfg(feature = "otel")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(feature = "otel")]
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "orbit-orchestrator")]
#[command(about = "Drive pending orders through the ORBIT image pipeline", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to an orchestrator YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use mock analysis and embedding services
    #[arg(long, global = true)]
    mock: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one orchestration pass over the pending work items
    Run {
        /// Process only this work item
        #[arg(short, long)]
        item: Option<String>,

        /// Overall run timeout (e.g. "90s", "5m"), overrides the config
        #[arg(short, long)]
        timeout: Option<String>,
    },

    /// Check every collaborator and print the aggregated health
    Health,

    /// Run a recovery procedure outside of any run
    Recover {
        /// database, storage, analysis or embedding
        #[arg(value_name = "CATEGORY")]
        category: String,

        /// Description of the failure being recovered from
        #[arg(value_name = "DETAILS")]
        details: String,
    },

    /// Print the agent brief for the current state
    Brief {
        /// Detail one phase instead of the overview
        #[arg(short, long)]
        phase: Option<String>,
    },

    /// Validate the configuration without contacting anything
    Validate,

    /// Run the whole pipeline against in-memory collaborators
    Simulate {
        /// Work items to seed
        #[arg(long, default_value_t = 2)]
        orders: usize,

        /// Sub-items per work item
        #[arg(long, default_value_t = 3)]
        images: usize,

        /// Make embedding of every second image fail
        #[arg(long)]
        fail_embedding: bool,
    },
}

fn filter(verbose: bool) -> &'static str {
    if verbose {
        "orbit_orchestrator=debug"
    } else {
        "orbit_orchestrator=info"
    }
}

#[cfg(feature = "otel")]
fn init_otel_tracing(verbose: bool) {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;
    use opentelemetry_sdk::trace::TracerProvider;

    let otlp_endpoint =
        std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://localhost:4317".to_string());

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otlp_endpoint)
        .build()
        .expect("Failed to create OTLP exporter");

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .build();

    let tracer = provider.tracer("orbit-orchestrator");
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter(verbose)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(otel_layer)
        .init();

    opentelemetry::global::set_tracer_provider(provider);
}

#[cfg(not(feature = "otel"))]
fn init_tracing(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter(verbose)))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(feature = "otel")]
    init_otel_tracing(cli.verbose);

    #[cfg(not(feature = "otel"))]
    init_tracing(cli.verbose);

    let result = run(cli).await;

    #[cfg(feature = "otel")]
    opentelemetry::global::shutdown_tracer_provider();

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            tracing::error!(error = %e, "Orchestrator failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = OrchestratorConfig::resolve(cli.config.as_deref())?;
    if cli.mock {
        config.mock_mode = true;
    }

    match cli.command {
        Commands::Run { item, timeout } => run_workflow(config, item, timeout).await,
        Commands::Health => health(config).await,
        Commands::Recover { category, details } => recover(config, &category, &details).await,
        Commands::Brief { phase } => brief(config, phase).await,
        Commands::Validate => validate(&config),
        Commands::Simulate {
            orders,
            images,
            fail_embedding,
        } => simulate(config, orders, images, fail_embedding).await,
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn connect(config: OrchestratorConfig) -> anyhow::Result<WorkflowOrchestrator> {
    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("invalid configuration: {}", problems.join("; "));
    }
    Ok(WorkflowOrchestrator::from_config(config)?)
}

async fn run_workflow(
    config: OrchestratorConfig,
    item: Option<String>,
    timeout: Option<String>,
) -> anyhow::Result<bool> {
    let mut orchestrator = connect(config)?;
    if let Some(timeout) = timeout {
        let timeout = parse_duration(&timeout).context("invalid --timeout")?;
        orchestrator = orchestrator.with_run_timeout(timeout);
    }

    let outcome = orchestrator.run_once(item.as_deref()).await;
    let report = orchestrator.generate_report().await;
    print_json(&json!({ "outcome": outcome, "report": report }))?;
    Ok(outcome.is_success())
}

async fn health(config: OrchestratorConfig) -> anyhow::Result<bool> {
    let orchestrator = connect(config)?;
    let report = orchestrator.health_check().await;
    print_json(&report)?;
    Ok(report.status != HealthStatus::Unhealthy)
}

async fn recover(config: OrchestratorConfig, category: &str, details: &str) -> anyhow::Result<bool> {
    let category: RecoveryCategory = category.parse()?;
    let orchestrator = connect(config)?;
    let result = orchestrator.execute_recovery(category, details).await;
    print_json(&result)?;
    Ok(result.is_success())
}

async fn brief(config: OrchestratorConfig, phase: Option<String>) -> anyhow::Result<bool> {
    let phase = phase
        .map(|p| p.parse::<PhaseId>())
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;
    let orchestrator = connect(config)?;
    println!("{}", orchestrator.brief(phase).await?);
    Ok(true)
}

fn validate(config: &OrchestratorConfig) -> anyhow::Result<bool> {
    let problems = config.validate();
    if problems.is_empty() {
        println!("✓ Configuration is valid");
        print_json(&config.summary())?;
        return Ok(true);
    }

    println!("✗ Configuration has {} problem(s):", problems.len());
    for problem in &problems {
        println!("  - {}", problem);
    }
    Ok(false)
}

async fn simulate(
    mut config: OrchestratorConfig,
    orders: usize,
    images: usize,
    fail_embedding: bool,
) -> anyhow::Result<bool> {
    config.mock_mode = true;
    let bucket = config.storage.bucket.clone();

    let faults = FaultInjector::new();
    if fail_embedding {
        for image in (2..=images).step_by(2) {
            faults.fail_matching(
                "embed",
                &format!("image-{}.jpg", image),
                "Metadata embedding failed: 503 Service Unavailable",
            );
        }
    }

    let store = InMemoryStore::new();
    let storage = InMemoryStorage::new();
    seed(&store, &storage, &bucket, orders, images).await;

    let services = Services::new(
        Arc::new(store.clone()),
        Arc::new(storage.clone()),
        Arc::new(MockAnalysisService::new()),
        Arc::new(
            MockEmbeddingService::new()
                .with_faults(faults)
                .with_output(storage, bucket),
        ),
    );
    let orchestrator = WorkflowOrchestrator::new(config, services, Arc::new(MockClock::new()));

    let outcome = orchestrator.run_once(None).await;
    let report = orchestrator.generate_report().await;
    print_json(&json!({
        "outcome": outcome,
        "report": report,
        "notifications": store.notifications().await,
    }))?;
    Ok(outcome.is_success())
}
