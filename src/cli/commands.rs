//! CLI command definitions for dx-forge.
//!
//! Runs diagnostic pipelines, reviews paused ones, runs ad-hoc verification
//! batches and exposes the output recovery routine for debugging generator
//! output.

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::llm::HttpTextGenerator;
use crate::pipeline::{
    CheckpointStore, FileCheckpointStore, Orchestrator, PipelineConfig, PipelineState,
    ReviewDecision, Stage,
};
use crate::recovery::recover;
use crate::tasks::{CapabilityManifest, CapabilityRegistry, TaskRequest};

/// Multi-stage diagnostic pipeline runner.
#[derive(Parser)]
#[command(name = "dx-forge")]
#[command(about = "Run multi-stage diagnostic pipelines with verification tasks and review checkpoints")]
#[command(version)]
#[command(
    long_about = "dx-forge threads a case through intake, reasoning, verification and synthesis stages.\n\nPipelines can pause after any stage for review and be resumed later.\n\nExample usage:\n  dx-forge run --case case.json --capabilities capabilities.yaml --checkpoint-after reasoning"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a pipeline for a case until it completes, fails or pauses.
    Run(RunArgs),

    /// Record a review decision for a paused pipeline and continue it.
    Resume(ResumeArgs),

    /// List checkpoints awaiting review.
    #[command(alias = "ls")]
    Checkpoints(CheckpointsArgs),

    /// Run a task plan directly, outside any pipeline.
    Batch(BatchArgs),

    /// Recover a structured record from free text.
    Recover(RecoverArgs),
}

/// Text generator connection settings.
#[derive(Parser, Debug, Clone)]
pub struct GeneratorArgs {
    /// Base URL of an OpenAI-compatible API.
    #[arg(long, env = "DXFORGE_LLM_API_BASE")]
    pub api_base: Option<String>,

    /// Bearer token for the generator API.
    #[arg(long, env = "DXFORGE_LLM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Model name.
    #[arg(short = 'm', long, env = "DXFORGE_LLM_MODEL")]
    pub model: Option<String>,
}

/// Settings shared by every command that runs a pipeline.
#[derive(Parser, Debug, Clone)]
pub struct PipelineArgs {
    /// YAML manifest of verification capabilities.
    #[arg(short = 'c', long)]
    pub capabilities: Option<PathBuf>,

    /// Directory holding checkpoint files.
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    #[command(flatten)]
    pub generator: GeneratorArgs,
}

/// Arguments for `dx-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Case file (JSON), or `-` for stdin.
    #[arg(long)]
    pub case: String,

    /// Upper bound on reasoning/execution cycles.
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Comma-separated stages to pause after (intake, reasoning, execution, synthesis).
    #[arg(long)]
    pub checkpoint_after: Option<String>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Output the final state as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `dx-forge resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Checkpoint to review.
    pub checkpoint: Uuid,

    /// Reject instead of approving; the pipeline ends in ERROR.
    #[arg(long)]
    pub reject: bool,

    /// Reviewer notes.
    #[arg(long)]
    pub notes: Option<String>,

    /// Reviewer name.
    #[arg(long)]
    pub reviewer: Option<String>,

    /// JSON object of field corrections, or `@path` to read it from a file.
    #[arg(long)]
    pub corrections: Option<String>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Output the final state as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `dx-forge checkpoints`.
#[derive(Parser, Debug)]
pub struct CheckpointsArgs {
    /// Directory holding checkpoint files.
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `dx-forge batch`.
#[derive(Parser, Debug)]
pub struct BatchArgs {
    /// JSON file holding a list of task requests, or `-` for stdin.
    #[arg(long)]
    pub plan: String,

    /// YAML manifest of verification capabilities.
    #[arg(short = 'c', long)]
    pub capabilities: PathBuf,

    /// Tasks in flight within one priority group.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `dx-forge recover`.
#[derive(Parser, Debug)]
pub struct RecoverArgs {
    /// Text file to recover from, or `-` for stdin.
    #[arg(default_value = "-")]
    pub input: String,

    /// Comma-separated keys the record should contain.
    #[arg(short = 'k', long, default_value = "")]
    pub keys: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args).await,
        Commands::Resume(args) => run_resume_command(args).await,
        Commands::Checkpoints(args) => run_checkpoints_command(args).await,
        Commands::Batch(args) => run_batch_command(args).await,
        Commands::Recover(args) => run_recover_command(args),
    }
}

// ============================================================================
// Pipeline Commands
// ============================================================================

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(max) = args.max_iterations {
        config = config.with_max_iterations(max);
    }
    if let Some(ref raw) = args.checkpoint_after {
        config = config.with_checkpoint_after(parse_stages(raw)?);
    }

    let case: Value = serde_json::from_str(&read_input(&args.case)?)
        .with_context(|| format!("Case '{}' is not valid JSON", args.case))?;

    let orchestrator = build_orchestrator(config, &args.pipeline)?;
    let state = orchestrator.run(case).await;

    print_state(&state, args.json)
}

async fn run_resume_command(args: ResumeArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    let orchestrator = build_orchestrator(config, &args.pipeline)?;

    let mut decision = if args.reject {
        ReviewDecision::reject(args.notes.clone().unwrap_or_else(|| "rejected".to_string()))
    } else {
        ReviewDecision::approve()
    };
    if let Some(notes) = args.notes {
        decision = decision.with_notes(notes);
    }
    if let Some(reviewer) = args.reviewer {
        decision = decision.with_reviewer(reviewer);
    }
    if let Some(ref raw) = args.corrections {
        for (field, value) in parse_corrections(raw)? {
            decision = decision.with_correction(field, value);
        }
    }

    let state = orchestrator.resume(args.checkpoint, decision).await?;
    let state = orchestrator.run_until_pause(state).await;

    print_state(&state, args.json)
}

#[derive(Debug, Serialize)]
struct PendingEntry {
    id: Uuid,
    pipeline: Uuid,
    stage: Stage,
    created_at: chrono::DateTime<chrono::Utc>,
    fields_requiring_approval: Vec<String>,
}

async fn run_checkpoints_command(args: CheckpointsArgs) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;
    let dir = args.checkpoint_dir.unwrap_or(config.checkpoint_dir);
    let store = FileCheckpointStore::new(&dir);

    let pending: Vec<PendingEntry> = store
        .list_pending()
        .await?
        .into_iter()
        .map(|c| PendingEntry {
            id: c.id,
            pipeline: c.state_snapshot.id,
            stage: c.stage,
            created_at: c.created_at,
            fields_requiring_approval: c.fields_requiring_approval,
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!("No checkpoints awaiting review in {}", dir.display());
        return Ok(());
    }
    println!("{} checkpoint(s) awaiting review:", pending.len());
    for entry in &pending {
        println!(
            "  {}  after {:<10} pipeline {}  created {}  review: {}",
            entry.id,
            entry.stage.as_str(),
            entry.pipeline,
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.fields_requiring_approval.join(", ")
        );
    }
    Ok(())
}

// ============================================================================
// Task and Recovery Commands
// ============================================================================

async fn run_batch_command(args: BatchArgs) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(concurrency) = args.concurrency {
        config = config.with_max_concurrent_tasks(concurrency);
        config.validate()?;
    }

    let plan: Vec<TaskRequest> = serde_json::from_str(&read_input(&args.plan)?)
        .with_context(|| format!("Plan '{}' is not a JSON list of task requests", args.plan))?;
    let registry = load_registry(Some(&args.capabilities))?;

    let scheduler = config.build_scheduler(registry);
    let batch = scheduler.run_batch(&plan).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&batch)?);
        return Ok(());
    }

    println!(
        "Batch finished in {}ms: {} completed, {} failed, {} skipped, {} cache hit(s)",
        batch.total_duration.as_millis(),
        batch.completed_count,
        batch.failed_count,
        batch.skipped_count,
        batch.cache_hits()
    );
    for result in &batch.results {
        let detail = result.error_message.as_deref().unwrap_or("");
        println!(
            "  {:<24} {:<12} items={} {}",
            result.name,
            result.status.as_str(),
            result.items_queried.join(","),
            detail
        );
    }
    Ok(())
}

fn run_recover_command(args: RecoverArgs) -> anyhow::Result<()> {
    let raw = read_input(&args.input)?;
    let keys: Vec<&str> = args
        .keys
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .collect();

    let record = recover(&raw, &keys, Map::new());
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn build_orchestrator(
    mut config: PipelineConfig,
    args: &PipelineArgs,
) -> anyhow::Result<Orchestrator> {
    if let Some(ref dir) = args.checkpoint_dir {
        config = config.with_checkpoint_dir(dir.clone());
    }
    if let Some(ref model) = args.generator.model {
        config = config.with_model(model.clone());
    }

    let api_base = args
        .generator
        .api_base
        .clone()
        .context("A generator API base is required: pass --api-base or set DXFORGE_LLM_API_BASE")?;
    let generator =
        HttpTextGenerator::new(api_base, args.generator.api_key.clone(), config.model.clone())?;

    let registry = load_registry(args.capabilities.as_deref())?;
    info!(
        tasks = registry.len(),
        model = %config.model,
        checkpoint_dir = %config.checkpoint_dir.display(),
        "Pipeline configured"
    );

    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(&config.checkpoint_dir));
    Ok(Orchestrator::standard(Arc::new(generator), registry, store, config))
}

fn load_registry(path: Option<&Path>) -> anyhow::Result<CapabilityRegistry> {
    match path {
        Some(path) => Ok(CapabilityManifest::load(path)?.into_registry()?),
        None => Ok(CapabilityRegistry::new()),
    }
}

/// Read a file, or stdin for `-`.
fn read_input(source: &str) -> anyhow::Result<String> {
    if source == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read stdin")?;
        return Ok(buffer);
    }
    fs::read_to_string(source).with_context(|| format!("Failed to read '{}'", source))
}

fn parse_stages(raw: &str) -> anyhow::Result<Vec<Stage>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Stage>().map_err(|e| anyhow::anyhow!(e)))
        .collect()
}

/// Inline JSON object, or `@path` to a file holding one.
fn parse_corrections(raw: &str) -> anyhow::Result<Map<String, Value>> {
    let text = match raw.strip_prefix('@') {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read corrections from '{}'", path))?,
        None => raw.to_string(),
    };
    match serde_json::from_str::<Value>(&text).context("Corrections are not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("Corrections must be a JSON object"),
    }
}

fn print_state(state: &PipelineState, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(state)?);
        return Ok(());
    }

    println!("Pipeline {}", state.id);
    println!("  stage:        {}", state.stage);
    println!("  iterations:   {}/{}", state.iteration, state.max_iterations());
    println!("  hypotheses:   {}", state.hypotheses.len());
    println!("  task results: {}", state.task_results.len());
    if let Some(ref error) = state.error {
        println!("  error:        {}", error);
    }
    if let (Some(id), Some(stage)) = (state.checkpoint_id, state.review_stage) {
        println!("  paused after {} for review: dx-forge resume {}", stage, id);
    }
    if let Some(ref report) = state.final_report {
        println!("  report confidence: {:.2} ({})", report.confidence, report.strategy);
        if let Some(summary) = report.get_str("summary") {
            println!("  summary: {}", summary);
        }
    }
    for warning in &state.warnings {
        println!("  warning: {}", warning);
    }
    Ok(())
}
