//! CLI command definitions, routing, and tracing setup.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use docgraph_core::{
    BridgeClient, CallTracker, ClaimTypeConflictPolicy, ConflictPolicy, ExtractionPayload,
    NoConflicts, PipelineResult, ProgressReporter, TrackerSnapshot, run_pipeline,
};
use docgraph_shared::{
    AppConfig, DocumentRecord, ExtractionRow, FilterSpec, RunContext, init_config, load_config,
};
use docgraph_storage::{Storage, TableRegistry, TableWriter, to_row};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// DocGraph: consolidate extracted entities and claims into a knowledge graph.
#[derive(Parser)]
#[command(
    name = "docgraph",
    version,
    about = "Cluster, resolve and deduplicate extracted entities and claims into a knowledge graph.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database path (overrides `database.path` from the config file).
    #[arg(long, global = true, env = "DOCGRAPH_DB")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Load documents (and optionally their extraction rows) from JSON lines.
    Ingest {
        /// One `DocumentRecord` per line.
        documents: PathBuf,

        /// One extraction row per line.
        #[arg(long)]
        extractions: Option<PathBuf>,
    },

    /// Run entity and claim consolidation over the selected documents.
    Run {
        /// Identifier of this run.
        #[arg(long)]
        run_id: String,

        /// Skip documents processed by an earlier run.
        #[arg(long)]
        incremental: bool,

        /// Include processed documents even in incremental mode.
        #[arg(long)]
        reprocess: bool,

        /// Only documents with this fetch status.
        #[arg(long)]
        status: Option<String>,

        /// Only documents whose source locator matches this glob.
        #[arg(long)]
        pattern: Option<String>,

        /// Only documents of this document cluster.
        #[arg(long)]
        cluster: Option<i64>,

        /// Only documents of this content type.
        #[arg(long)]
        content_type: Option<String>,

        /// Process at most this many documents.
        #[arg(long)]
        limit: Option<usize>,

        /// Explicit document id (can be given multiple times).
        #[arg(long = "doc")]
        docs: Vec<String>,

        /// Do not check claims for contradictions.
        #[arg(long)]
        no_conflicts: bool,
    },

    /// Print graph row counts.
    Stats,

    /// Print the call-tracker snapshot recorded by the last run.
    Tracker,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "docgraph=info",
        1 => "docgraph=debug",
        _ => "docgraph=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Ingest {
            documents,
            extractions,
        } => {
            let config = load_config()?;
            cmd_ingest(&db_path(&config, cli.db), &documents, extractions.as_deref()).await
        }
        Command::Run {
            run_id,
            incremental,
            reprocess,
            status,
            pattern,
            cluster,
            content_type,
            limit,
            docs,
            no_conflicts,
        } => {
            let config = load_config()?;
            let filter = FilterSpec {
                document_ids: docs,
                status,
                pattern,
                cluster_id: cluster,
                content_type,
                limit,
            };
            let ctx = RunContext::new(run_id)
                .with_filter(filter)
                .with_incremental(incremental)
                .with_reprocess(reprocess);
            let db = db_path(&config, cli.db);
            cmd_run(&config, &db, ctx, no_conflicts).await
        }
        Command::Stats => {
            let config = load_config()?;
            cmd_stats(&db_path(&config, cli.db)).await
        }
        Command::Tracker => {
            let config = load_config()?;
            cmd_tracker(&db_path(&config, cli.db))
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

fn db_path(config: &AppConfig, flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| PathBuf::from(&config.database.path))
}

/// Where `run` leaves the tracker snapshot for `docgraph tracker`.
fn tracker_path(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_owned();
    name.push(".tracker.json");
    PathBuf::from(name)
}

async fn open_storage(db: &Path) -> Result<Storage> {
    if let Some(parent) = db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("cannot create {}", parent.display()))?;
    }
    Ok(Storage::open(db).await?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

/// Parse a JSON-lines file, skipping blank lines.
fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file =
        std::fs::File::open(path).wrap_err_with(|| format!("cannot open {}", path.display()))?;
    let mut items = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line)
            .map_err(|e| eyre!("{}:{}: {e}", path.display(), i + 1))?;
        items.push(item);
    }
    Ok(items)
}

async fn cmd_ingest(db: &Path, documents: &Path, extractions: Option<&Path>) -> Result<()> {
    let storage = open_storage(db).await?;
    let docs: Vec<DocumentRecord> = read_jsonl(documents)?;

    info!(db = %db.display(), documents = docs.len(), "ingesting documents");
    let bar = ProgressBar::new(docs.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    for doc in &docs {
        bar.set_message(doc.id.clone());
        storage.upsert_document(doc).await?;
        bar.inc(1);
    }
    bar.finish_and_clear();

    let mut rows_written = 0;
    if let Some(path) = extractions {
        let rows: Vec<ExtractionRow> = read_jsonl(path)?;
        let registry = TableRegistry::with_graph_tables()?;
        let writer = TableWriter::new(&storage, &registry, "extractions").await?;
        let out = rows
            .iter()
            .map(|row| {
                let payload = serde_json::to_string(&ExtractionPayload::from_row(row))?;
                Ok(to_row(&serde_json::json!({
                    "document_id": row.document_id,
                    "section_id": row.section_id,
                    "payload_json": payload,
                }))?)
            })
            .collect::<Result<Vec<_>>>()?;
        rows_written = writer.write(&out).await?.rows_written;
    }

    println!();
    println!("  Ingested into {}", db.display());
    println!("  Documents:   {}", docs.len());
    println!("  Extractions: {rows_written}");
    println!();
    Ok(())
}

async fn cmd_run(config: &AppConfig, db: &Path, ctx: RunContext, no_conflicts: bool) -> Result<()> {
    let storage = open_storage(db).await?;
    let registry = TableRegistry::with_graph_tables()?;
    let tracker = CallTracker::init_global(&config.tracker);

    let bridge = BridgeClient::spawn(&config.bridge)?;
    let policy: Box<dyn ConflictPolicy> = if no_conflicts {
        Box::new(NoConflicts)
    } else {
        Box::new(ClaimTypeConflictPolicy::new(&config.claims))
    };

    info!(
        run_id = %ctx.run_id,
        db = %db.display(),
        incremental = ctx.incremental,
        reprocess = ctx.reprocess,
        "starting run"
    );

    let reporter = CliProgress::new();
    let outcome = run_pipeline(
        config,
        &storage,
        &registry,
        ctx,
        &bridge,
        &bridge,
        policy.as_ref(),
        &reporter,
    )
    .await;
    reporter.spinner.finish_and_clear();
    bridge.shutdown();

    // The snapshot is worth keeping even when the run failed.
    let snapshot = tracker.snapshot();
    if let Err(e) = save_snapshot(&tracker_path(db), &snapshot) {
        warn!(error = %e, "could not save tracker snapshot");
    }
    if snapshot.throttled {
        warn!(
            calls_per_minute = snapshot.calls_per_minute,
            "model provider looks throttled"
        );
    }

    let result = outcome?;
    print_result(&result);
    Ok(())
}

fn print_result(result: &PipelineResult) {
    let e = &result.entities;
    let c = &result.claims;
    println!();
    println!("  Run {} complete", result.run_id);
    println!("  Documents:        {}", result.documents);
    println!(
        "  Extraction rows:  {} ({} skipped)",
        result.extraction_rows, result.rows_skipped
    );
    println!(
        "  Entities:         {} created, {} merged, {} linked, {} unresolved",
        e.entities_created, e.mentions_merged, e.mentions_linked, e.unresolved
    );
    if e.clusters_failed > 0 {
        println!("  Failed clusters:  {}", e.clusters_failed);
    }
    println!("  Relationships:    {}", e.relationships_created);
    println!(
        "  Claims:           {} created, {} duplicates, {} unresolved, {} conflicts",
        c.claims_created, c.duplicates_skipped, c.unresolved_entities, c.conflicts_detected
    );
    println!("  Time:             {:.1}s", result.elapsed_ms as f64 / 1000.0);
    println!();
}

fn save_snapshot(path: &Path, snapshot: &TrackerSnapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot)?;
    std::fs::write(path, json).wrap_err_with(|| format!("cannot write {}", path.display()))?;
    Ok(())
}

async fn cmd_stats(db: &Path) -> Result<()> {
    if !db.exists() {
        return Err(eyre!("no database at '{}', run `docgraph ingest` first", db.display()));
    }
    let storage = Storage::open_readonly(db).await?;
    let stats = storage.graph_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn cmd_tracker(db: &Path) -> Result<()> {
    let path = tracker_path(db);
    let content = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("no tracker snapshot at {}; run `docgraph run` first", path.display()))?;
    let snapshot: TrackerSnapshot = serde_json::from_str(&content)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn done(&self, _result: &PipelineResult) {
        self.spinner.finish_and_clear();
    }
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
