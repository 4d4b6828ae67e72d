//! evalmatrix - prediction matrix runner CLI
//!
//! ## Commands
//!
//! - `run`: execute (or resume) the matrix described by a run manifest
//! - `summary`: per-model statistics of a stored run
//! - `export`: annotation records of a stored run as JSON Lines
//! - `merge`: merge two persisted result-set documents
//! - `models`: list manifest models able to serve a task and modality

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn, Level};

use evalmatrix_core::{
    annotation_records, render_summary_md, write_annotation_jsonl, write_summary_json,
    write_summary_md, AdapterSet, DefaultAdapterFactory, EngineConfig, ItemCatalog, MatrixRunner,
    Modality, ModelSpec, RunManifest, SummaryReport, TaskType,
};
use evalmatrix_state::{FsResultStore, ResultSet, ResultStore, RunId, SurrealResultStore};

#[derive(Parser)]
#[command(name = "evalmatrix")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run models against datasets and aggregate the predictions", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines (and JSON summaries)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute or resume a run
    Run {
        /// Run manifest (TOML)
        #[arg(short, long)]
        manifest: PathBuf,

        /// Run id to create or resume (default: a new random id)
        #[arg(long)]
        run_id: Option<String>,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Print per-model summaries of a stored run
    Summary {
        #[arg(long)]
        run_id: String,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Write the annotation records of a stored run as JSON Lines
    Export {
        #[arg(long)]
        run_id: String,

        /// Manifest whose datasets provide the item inputs
        #[arg(short, long)]
        manifest: PathBuf,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// Merge two result-set documents into one
    Merge {
        /// Left document; wins ties
        a: PathBuf,

        /// Right document
        b: PathBuf,

        /// Output document
        #[arg(short, long)]
        out: PathBuf,
    },

    /// List the models of a manifest, optionally filtered
    Models {
        #[arg(short, long)]
        manifest: PathBuf,

        /// Task type, e.g. `chat` or `image_captioning`
        #[arg(long)]
        task: Option<TaskType>,

        /// Input modality, e.g. `text` or `image`
        #[arg(long)]
        modality: Option<Modality>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// One JSON document per run under `<results_dir>/runs/`
    Fs,
    /// SurrealDB (`EVALMATRIX_SURREAL_URL`, in-memory when unset)
    Surreal,
}

#[derive(clap::Args, Debug)]
struct StoreArgs {
    /// Result store backend
    #[arg(long, value_enum, default_value = "fs")]
    store: StoreKind,

    /// Results directory (default: engine config / EVALMATRIX_RESULTS_DIR)
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// SurrealDB endpoint for `--store surreal`
    #[arg(long, env = "EVALMATRIX_SURREAL_URL")]
    surreal_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    evalmatrix_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            manifest,
            run_id,
            store,
        } => cmd_run(&manifest, run_id, &store).await,
        Commands::Summary { run_id, store } => cmd_summary(&run_id, &store, cli.json).await,
        Commands::Export {
            run_id,
            manifest,
            out,
            store,
        } => cmd_export(&run_id, &manifest, &out, &store).await,
        Commands::Merge { a, b, out } => cmd_merge(&a, &b, &out),
        Commands::Models {
            manifest,
            task,
            modality,
        } => cmd_models(&manifest, task, modality, cli.json),
    }
}

/// Open the configured result store rooted at `results_dir`.
async fn open_store(args: &StoreArgs, results_dir: &Path) -> Result<Arc<dyn ResultStore>> {
    match args.store {
        StoreKind::Fs => {
            let store = FsResultStore::new(results_dir)
                .with_context(|| format!("Failed to open result store at {:?}", results_dir))?;
            Ok(Arc::new(store))
        }
        StoreKind::Surreal => {
            let store = match args.surreal_url.as_deref() {
                Some(url) => SurrealResultStore::connect(url).await,
                None => {
                    warn!("EVALMATRIX_SURREAL_URL not set; results are kept in memory only");
                    SurrealResultStore::in_memory().await
                }
            }
            .context("Failed to connect to result database")?;
            Ok(Arc::new(store))
        }
    }
}

fn resolve_results_dir(args: &StoreArgs, config: &EngineConfig) -> PathBuf {
    args.results_dir
        .clone()
        .unwrap_or_else(|| config.results_dir.clone())
}

async fn load_run(args: &StoreArgs, run_id: &str) -> Result<ResultSet> {
    let config = EngineConfig::from_env()?;
    let store = open_store(args, &resolve_results_dir(args, &config)).await?;
    let run_id = RunId::from(run_id);
    store
        .load(&run_id)
        .await?
        .with_context(|| format!("Run {} not found", run_id))
}

/// Write `annotations.jsonl`, `summary.json` and `summary.md` into `dir`.
fn write_artifacts(dir: &Path, set: &ResultSet, catalog: &ItemCatalog) -> Result<SummaryReport> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
    let report = SummaryReport::from_result_set(set)?;
    write_annotation_jsonl(
        &dir.join("annotations.jsonl"),
        &annotation_records(set, catalog),
    )?;
    write_summary_json(&dir.join("summary.json"), &report)?;
    write_summary_md(&dir.join("summary.md"), &report)?;
    Ok(report)
}

async fn cmd_run(manifest_path: &Path, run_id: Option<String>, args: &StoreArgs) -> Result<()> {
    let manifest = RunManifest::load(manifest_path)?;
    let config = manifest.engine.clone().with_env()?;
    let matrix = manifest
        .build_matrix()
        .context("Failed to build prediction matrix")?;
    if matrix.is_empty() {
        bail!("No compatible (model, dataset) pairs in {:?}", manifest_path);
    }
    for pair in matrix.excluded() {
        info!(model_id = %pair.model_id, dataset_id = %pair.dataset_id, "pair excluded: incompatible task or modality");
    }

    let adapters = AdapterSet::from_specs(
        &DefaultAdapterFactory,
        matrix.models().map(|spec| spec.as_ref()),
    )?;
    let results_dir = resolve_results_dir(args, &config);
    let store = open_store(args, &results_dir).await?;
    let run_id = run_id.map(RunId::from).unwrap_or_default();

    let runner = MatrixRunner::new(config, store, adapters);
    let token = runner.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; waiting for in-flight calls to finish");
            token.cancel();
        }
    });

    println!("Run {}: {} cells", run_id, matrix.len());
    let report = runner.run(&matrix, run_id).await?;

    let out_dir = results_dir.join(report.run_id.as_str());
    let summary = write_artifacts(&out_dir, &report.result_set, &matrix.catalog())?;
    println!("{}", render_summary_md(&summary));
    println!(
        "{} attempts, {} skipped, {:.1}s. Artifacts in {:?}",
        report.attempts,
        report.skipped,
        report.duration.as_secs_f64(),
        out_dir
    );

    if report.cancelled {
        println!(
            "Cancelled with {} cells incomplete. Resume with: evalmatrix run --manifest {:?} --run-id {}",
            report.incomplete, manifest_path, report.run_id
        );
    }
    Ok(())
}

async fn cmd_summary(run_id: &str, args: &StoreArgs, json: bool) -> Result<()> {
    let set = load_run(args, run_id).await?;
    let report = SummaryReport::from_result_set(&set)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", render_summary_md(&report));
    }
    Ok(())
}

async fn cmd_export(run_id: &str, manifest_path: &Path, out: &Path, args: &StoreArgs) -> Result<()> {
    let manifest = RunManifest::load(manifest_path)?;
    let datasets = manifest.load_datasets()?;
    let catalog = ItemCatalog::from_datasets(&datasets);

    let set = load_run(args, run_id).await?;
    let records = annotation_records(&set, &catalog);
    write_annotation_jsonl(out, &records)?;
    println!("Wrote {} records to {:?}", records.len(), out);
    Ok(())
}

fn cmd_merge(a: &Path, b: &Path, out: &Path) -> Result<()> {
    let left =
        FsResultStore::read_document(a).with_context(|| format!("Failed to read {:?}", a))?;
    let right =
        FsResultStore::read_document(b).with_context(|| format!("Failed to read {:?}", b))?;
    if left.run_id() != right.run_id() {
        warn!(left = %left.run_id(), right = %right.run_id(), "merging documents of different runs; keeping the left run id");
    }

    let merged = ResultSet::merge(&left, &right);
    FsResultStore::write_document(out, &merged)
        .with_context(|| format!("Failed to write {:?}", out))?;
    println!(
        "Merged {} + {} cells into {} ({} terminal) at {:?}",
        left.len(),
        right.len(),
        merged.len(),
        merged.terminal_count(),
        out
    );
    Ok(())
}

#[derive(Serialize)]
struct ModelRow<'a> {
    id: &'a str,
    provider: String,
    model_name: &'a str,
    tasks: Vec<String>,
    modalities: Vec<String>,
    max_concurrency: usize,
}

impl<'a> From<&'a ModelSpec> for ModelRow<'a> {
    fn from(spec: &'a ModelSpec) -> Self {
        Self {
            id: &spec.id,
            provider: spec.provider.to_string(),
            model_name: &spec.model_name,
            tasks: spec.tasks.iter().map(ToString::to_string).collect(),
            modalities: spec.modalities.iter().map(ToString::to_string).collect(),
            max_concurrency: spec.invocation.max_concurrency,
        }
    }
}

fn cmd_models(
    manifest_path: &Path,
    task: Option<TaskType>,
    modality: Option<Modality>,
    json: bool,
) -> Result<()> {
    let registry = RunManifest::load(manifest_path)?.registry()?;
    let models = match (task, modality) {
        (Some(task), Some(modality)) => registry.find_models(task, modality),
        (task, None) => registry.list(None, task),
        (None, Some(modality)) => registry
            .iter()
            .filter(|m| m.modalities.contains(&modality))
            .collect(),
    };

    let rows: Vec<ModelRow<'_>> = models.into_iter().map(ModelRow::from).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No matching models");
    }
    for row in rows {
        println!(
            "{:<32} {:<9} tasks={} modalities={} max_concurrency={}",
            row.id,
            row.provider,
            row.tasks.join(","),
            row.modalities.join(","),
            row.max_concurrency
        );
    }
    Ok(())
}
