//! vigil CLI entrypoint.
//!
//! ```bash
//! vigil run --topology "detect ! track ! classify" --frames 120 --json
//! vigil run --config pipeline.json
//! vigil graph --topology "detect ! track name=t ! t.classify ! t.reid" --json
//! vigil kinds --json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vigil_core::{BufferAudit, PipelineError, Result};
use vigil_pipeline::synthetic::{SyntheticBackend, SyntheticTransform, synthetic_buffer};
use vigil_pipeline::{
    PipelineController, PipelineSettings, StageDescriptor, StageMetricsSnapshot, StageRegistry,
    chain_summary, parse_description,
};

const SUMMARY_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    version,
    about = "Streaming video-analytics pipeline",
    arg_required_else_help = true,
    after_help = "Examples:\n  vigil kinds --json\n  vigil graph --topology \"detect ! track name=t ! t.classify ! t.reid\"\n  vigil run --frames 120 --json\n  vigil run --config pipeline.json --pool-capacity 2"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive a pipeline end-to-end on synthetic frames and report stats.
    Run(RunArgs),
    /// Parse a topology description and print the resulting graph.
    Graph(GraphArgs),
    /// List registered stage kinds.
    Kinds(KindsArgs),
}

#[derive(Args, Debug, Clone)]
struct SharedPipelineArgs {
    /// Topology description (stages separated by `!`).
    #[arg(short = 't', long = "topology")]
    topology: Option<String>,

    /// JSON settings file; flags below override its values.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    shared: SharedPipelineArgs,

    /// Number of synthetic frames to feed.
    #[arg(short = 'n', long = "frames", default_value_t = 60)]
    frames: u64,

    /// Synthetic frame width.
    #[arg(long = "width", default_value_t = 640)]
    width: u32,

    /// Synthetic frame height.
    #[arg(long = "height", default_value_t = 480)]
    height: u32,

    /// Inter-stage queue capacity override.
    #[arg(long = "queue-capacity")]
    queue_capacity: Option<usize>,

    /// Request pool capacity override.
    #[arg(long = "pool-capacity")]
    pool_capacity: Option<usize>,

    /// Simulated per-inference latency in microseconds.
    #[arg(long = "latency-us", default_value_t = 500)]
    latency_us: u64,

    /// Emit the run summary as JSON on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct GraphArgs {
    #[command(flatten)]
    shared: SharedPipelineArgs,

    /// Emit the parsed graph as JSON on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct KindsArgs {
    /// Emit the kind list as JSON on stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Serialize)]
struct StageReport {
    name: String,
    #[serde(flatten)]
    metrics: StageMetricsSnapshot,
}

#[derive(Serialize)]
struct RunSummary {
    schema_version: u32,
    topology: String,
    frames_submitted: u64,
    frames_retrieved: u64,
    objects_retrieved: u64,
    elapsed_ms: u64,
    stages: Vec<StageReport>,
    buffers_created: u64,
    buffers_released: u64,
    buffers_live: u64,
}

#[derive(Serialize)]
struct GraphSummary {
    schema_version: u32,
    chain: String,
    nodes: Vec<StageDescriptor>,
}

fn load_settings(shared: &SharedPipelineArgs) -> Result<PipelineSettings> {
    let mut settings = match &shared.config {
        Some(path) => PipelineSettings::from_json_file(path)?,
        None => PipelineSettings::default(),
    };
    if let Some(topology) = &shared.topology {
        settings.topology = topology.clone();
    }
    settings.validate()?;
    Ok(settings)
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let mut settings = load_settings(&args.shared)?;
    if let Some(capacity) = args.queue_capacity {
        settings.queue_capacity = capacity;
    }
    if let Some(capacity) = args.pool_capacity {
        settings.pool_capacity = capacity;
    }
    settings.validate()?;

    let registry = StageRegistry::with_builtins();
    let backend = Arc::new(SyntheticBackend::with_latency(Duration::from_micros(
        args.latency_us,
    )));
    let topology = settings.topology.clone();
    let mut pipeline =
        PipelineController::create(settings, &registry, backend, Arc::new(SyntheticTransform))
            .await?;
    pipeline.start()?;

    let audit = BufferAudit::new();
    let started = Instant::now();

    let mut frames_retrieved = 0u64;
    let mut objects_retrieved = 0u64;
    for seq in 0..args.frames {
        pipeline
            .submit(synthetic_buffer(&audit, args.width, args.height, seq), None)
            .await?;
        // Opportunistic drain keeps the output queue from throttling the
        // feed on long runs.
        while let Some(frame) = pipeline.try_retrieve() {
            frames_retrieved += 1;
            objects_retrieved += frame.objects.len() as u64;
        }
    }
    pipeline.flush().await?;
    while let Some(frame) = pipeline.next_output().await {
        frames_retrieved += 1;
        objects_retrieved += frame.objects.len() as u64;
    }
    pipeline.stop().await?;

    let summary = RunSummary {
        schema_version: SUMMARY_SCHEMA_VERSION,
        topology,
        frames_submitted: args.frames,
        frames_retrieved,
        objects_retrieved,
        elapsed_ms: started.elapsed().as_millis() as u64,
        stages: pipeline
            .stage_metrics()
            .into_iter()
            .map(|(name, metrics)| StageReport { name, metrics })
            .collect(),
        buffers_created: audit.created(),
        buffers_released: audit.released(),
        buffers_live: audit.live(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary).expect("serialize summary"));
    } else {
        info!(
            frames = summary.frames_retrieved,
            objects = summary.objects_retrieved,
            elapsed_ms = summary.elapsed_ms,
            "run finished"
        );
        println!(
            "processed {}/{} frames ({} objects) in {} ms",
            summary.frames_retrieved,
            summary.frames_submitted,
            summary.objects_retrieved,
            summary.elapsed_ms
        );
        for stage in &summary.stages {
            println!(
                "  {:<10} frames={} forwarded={} dropped={} inferences={} degraded={}",
                stage.name,
                stage.metrics.frames_processed,
                stage.metrics.frames_forwarded,
                stage.metrics.frames_dropped,
                stage.metrics.inferences_total,
                stage.metrics.objects_degraded
            );
        }
        println!(
            "  buffers: created={} released={} live={}",
            summary.buffers_created, summary.buffers_released, summary.buffers_live
        );
    }
    Ok(())
}

fn cmd_graph(args: GraphArgs) -> Result<()> {
    let settings = load_settings(&args.shared)?;
    let registry = StageRegistry::with_builtins();
    let nodes = parse_description(&settings.topology, &registry)?;
    let summary = GraphSummary {
        schema_version: SUMMARY_SCHEMA_VERSION,
        chain: chain_summary(&nodes),
        nodes,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary).expect("serialize graph"));
    } else {
        println!("{}", summary.chain);
        for node in &summary.nodes {
            println!(
                "  [{}] kind={} name={} predecessor={:?} successors={:?}",
                node.id,
                node.kind,
                node.name.as_deref().unwrap_or("-"),
                node.predecessor,
                node.successors
            );
        }
    }
    Ok(())
}

fn cmd_kinds(args: KindsArgs) -> Result<()> {
    let registry = StageRegistry::with_builtins();
    let kinds = registry.kind_names();
    if args.json {
        let value = serde_json::json!({
            "schema_version": SUMMARY_SCHEMA_VERSION,
            "kinds": kinds,
        });
        println!("{}", serde_json::to_string_pretty(&value).expect("serialize kinds"));
    } else {
        for kind in kinds {
            println!("{kind}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome: Result<()> = match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Graph(args) => cmd_graph(args),
        Commands::Kinds(args) => cmd_kinds(args),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "command failed");
            eprintln!("error: {err}");
            match err {
                PipelineError::Topology(_)
                | PipelineError::UnknownStageKind(_)
                | PipelineError::Settings(_) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
