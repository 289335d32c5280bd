//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use helpdesk_core::{
    Collaborators, CorpusRetriever, Executor, LocalTicketSystem, OllamaClient, ProgressReporter,
    ResultCache, RunOutcome,
};
use helpdesk_shared::{
    AppConfig, HelpdeskError, ListFilter, PipelineConfig, RunConfig, Step, expand_home,
    init_config, load_config, new_checkpoint_id,
};
use helpdesk_storage::{CacheStore, CheckpointSaver, MemoryStore, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Helpdesk assistant: answer IT and HR questions from a knowledge base,
/// escalating and ticketing when the answer falls short.
#[derive(Parser)]
#[command(
    name = "helpdesk",
    version,
    about = "Answer helpdesk queries through a checkpointed RAG pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Checkpoint database (defaults to `storage.db_path` from the config file).
    #[arg(long, env = "HELPDESK_DB", global = true)]
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
    /// Run a query through the pipeline (or resume an interrupted run).
    Ask {
        /// The user's question.
        query: String,

        /// Conversation thread (defaults to a new id).
        #[arg(long)]
        thread_id: Option<String>,

        /// Checkpoint namespace (defaults to `pipeline.checkpoint_ns`).
        #[arg(long)]
        checkpoint_ns: Option<String>,

        /// Resume the run this checkpoint belongs to, or start a run with this id.
        #[arg(long)]
        checkpoint_id: Option<String>,

        /// Keep checkpoints in memory only.
        #[arg(long)]
        ephemeral: bool,

        /// Skip the retrieval result cache.
        #[arg(long)]
        no_cache: bool,

        /// Ollama server URL.
        #[arg(long, env = "HELPDESK_OLLAMA_URL")]
        ollama_url: Option<String>,

        /// Document corpus (JSON array of documents).
        #[arg(long)]
        corpus: Option<PathBuf>,
    },

    /// Inspect and maintain stored checkpoints.
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Checkpoint subcommands.
#[derive(Subcommand)]
pub(crate) enum CheckpointAction {
    /// List a thread's checkpoints, newest first.
    List {
        #[arg(long)]
        thread_id: String,

        #[arg(long)]
        checkpoint_ns: Option<String>,

        /// Only show checkpoints older than this one.
        #[arg(long)]
        before: Option<String>,

        /// Only show checkpoints of this run.
        #[arg(long)]
        run_id: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one checkpoint with its metadata and pending writes.
    Show {
        #[arg(long)]
        thread_id: String,

        #[arg(long)]
        checkpoint_id: String,

        #[arg(long)]
        checkpoint_ns: Option<String>,
    },

    /// Delete all but the newest checkpoints of a thread, and expired cache entries.
    Prune {
        #[arg(long)]
        thread_id: String,

        #[arg(long)]
        checkpoint_ns: Option<String>,

        /// Checkpoints to keep (at least one is always kept).
        #[arg(long, default_value = "10")]
        keep: usize,
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

/// Initialize tracing based on CLI flags. Logs go to stderr; stdout carries
/// command output.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "helpdesk=info",
        1 => "helpdesk=debug",
        _ => "helpdesk=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
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
    let db = cli.db;
    match cli.command {
        Command::Ask {
            query,
            thread_id,
            checkpoint_ns,
            checkpoint_id,
            ephemeral,
            no_cache,
            ollama_url,
            corpus,
        } => {
            let options = AskOptions {
                thread_id,
                checkpoint_ns,
                checkpoint_id,
                ephemeral,
                no_cache,
                ollama_url,
                corpus,
                db,
            };
            cmd_ask(&query, options).await
        }
        Command::Checkpoints { action } => match action {
            CheckpointAction::List {
                thread_id,
                checkpoint_ns,
                before,
                run_id,
                limit,
            } => {
                cmd_checkpoints_list(db, &thread_id, checkpoint_ns, before, run_id, limit).await
            }
            CheckpointAction::Show {
                thread_id,
                checkpoint_id,
                checkpoint_ns,
            } => cmd_checkpoints_show(db, &thread_id, &checkpoint_id, checkpoint_ns).await,
            CheckpointAction::Prune {
                thread_id,
                checkpoint_ns,
                keep,
            } => cmd_checkpoints_prune(db, &thread_id, checkpoint_ns, keep).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Resolve the database path: flag/env first, then the config file.
fn db_path(flag: Option<PathBuf>, config: &AppConfig) -> Result<PathBuf> {
    match flag {
        Some(path) => Ok(path),
        None => Ok(expand_home(&config.storage.db_path)?),
    }
}

/// Address a thread, falling back to the configured namespace.
fn thread_config(thread_id: &str, checkpoint_ns: Option<String>, config: &AppConfig) -> RunConfig {
    let ns = checkpoint_ns.unwrap_or_else(|| config.pipeline.checkpoint_ns.clone());
    RunConfig::new(thread_id, ns)
}

// ---------------------------------------------------------------------------
// ask
// ---------------------------------------------------------------------------

struct AskOptions {
    thread_id: Option<String>,
    checkpoint_ns: Option<String>,
    checkpoint_id: Option<String>,
    ephemeral: bool,
    no_cache: bool,
    ollama_url: Option<String>,
    corpus: Option<PathBuf>,
    db: Option<PathBuf>,
}

async fn cmd_ask(query: &str, options: AskOptions) -> Result<()> {
    if query.trim().is_empty() {
        return Err(HelpdeskError::validation("query must not be empty").into());
    }

    let config = load_config()?;
    let mut pipeline = PipelineConfig::from(&config);
    if options.no_cache {
        pipeline.cache_enabled = false;
    }

    let thread_id = options.thread_id.unwrap_or_else(new_checkpoint_id);
    let mut run = thread_config(&thread_id, options.checkpoint_ns, &config);
    if let Some(id) = options.checkpoint_id {
        run = run.at(id);
    }

    // Collaborators
    let mut ollama = config.ollama.clone();
    if let Some(url) = options.ollama_url {
        ollama.base_url = url;
    }
    let llm = Arc::new(OllamaClient::new(&ollama)?);
    let corpus_path = match options.corpus {
        Some(path) => path,
        None => expand_home(&config.retriever.corpus_path)?,
    };
    let retriever = load_corpus(&corpus_path)?;
    let collaborators = Collaborators {
        classifier: llm.clone(),
        retriever: Arc::new(retriever),
        generator: llm.clone(),
        evaluator: llm,
        tickets: Arc::new(LocalTicketSystem),
    };

    // Stores
    let mut store_durable = true;
    let (saver, cache_store): (Arc<dyn CheckpointSaver>, Arc<dyn CacheStore>) = if options.ephemeral {
        let store = Arc::new(MemoryStore::with_prefix(config.storage.checkpoint_prefix.as_str()));
        (store.clone(), store)
    } else {
        let path = db_path(options.db, &config)?;
        match Storage::open(&path).await {
            Ok(storage) => {
                let storage = Arc::new(storage);
                (storage.clone(), storage)
            }
            Err(e) if e.is_storage() => {
                warn!(path = %path.display(), error = %e, "checkpoint database unavailable, run is not resumable");
                store_durable = false;
                let store = Arc::new(MemoryStore::with_prefix(config.storage.checkpoint_prefix.as_str()));
                (store.clone(), store)
            }
            Err(e) => return Err(e.into()),
        }
    };
    let cache = ResultCache::new(cache_store, config.cache.key_prefix.clone());

    let executor = Executor::standard(&collaborators, saver, Some(cache), pipeline)?;

    info!(thread_id = %run.thread_id, ns = %run.checkpoint_ns, "running query");
    let reporter = CliProgress::new();
    let outcome = executor
        .run_pipeline_with_progress(query, &run, &reporter)
        .await?;

    let envelope = json!({
        "thread_id": run.thread_id,
        "checkpoint_ns": run.checkpoint_ns,
        "checkpoint_id": outcome.config.checkpoint_id,
        "run_id": outcome.run_id,
        "status": outcome.status,
        "durable": outcome.durable && store_durable && !options.ephemeral,
        "result": outcome.final_response,
    });
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

/// Load the corpus, or fall back to an empty one when the file is absent.
fn load_corpus(path: &Path) -> Result<CorpusRetriever> {
    if !path.exists() {
        warn!(path = %path.display(), "corpus not found, retrieval will return no documents");
        return Ok(CorpusRetriever::default());
    }
    Ok(CorpusRetriever::load(path)?)
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

fn stage_label(step: Step) -> &'static str {
    match step {
        Step::Input => "Starting",
        Step::Intent => "Classifying intent",
        Step::Retrieve => "Retrieving documents",
        Step::Generate => "Generating answer",
        Step::Evaluate => "Evaluating answer",
        Step::Reflect => "Retrying with wider retrieval",
        Step::Postprocess => "Preparing response",
        Step::Done => "Done",
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, step: Step) {
        self.spinner.set_message(stage_label(step));
    }

    fn stage_finished(&self, _step: Step) {}

    fn reflection(&self, confidence: Option<f64>, _sufficient: Option<bool>) {
        let confidence = confidence.map_or_else(|| "n/a".to_string(), |c| format!("{c:.2}"));
        self.spinner
            .println(format!("  answer below bar (confidence {confidence}), retrying once"));
    }

    fn done(&self, _outcome: &RunOutcome) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// checkpoints
// ---------------------------------------------------------------------------

async fn cmd_checkpoints_list(
    db: Option<PathBuf>,
    thread_id: &str,
    checkpoint_ns: Option<String>,
    before: Option<String>,
    run_id: Option<String>,
    limit: usize,
) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&db_path(db, &config)?).await?;
    let run = thread_config(thread_id, checkpoint_ns, &config);

    let mut filter = match run_id.as_deref() {
        Some(run_id) => ListFilter::for_run(run_id),
        None => ListFilter::default(),
    }
    .limit(limit);
    filter.before = before;

    let tuples = storage.list(&run, &filter).await?;
    if tuples.is_empty() {
        println!("No checkpoints for thread '{thread_id}' in namespace '{}'.", run.checkpoint_ns);
        return Ok(());
    }

    println!(
        "{:>4}  {:<36}  {:<11}  {:<11}  {:<9}  {:<19}  RUN",
        "SEQ", "CHECKPOINT", "STEP", "NEXT", "STATUS", "CREATED"
    );
    for tuple in &tuples {
        println!(
            "{:>4}  {:<36}  {:<11}  {:<11}  {:<9}  {:<19}  {}",
            tuple.checkpoint.seq,
            tuple.checkpoint.id,
            tuple.metadata.step.as_str(),
            tuple.metadata.next.as_str(),
            tuple.metadata.status.as_str(),
            tuple.checkpoint.created_at.format("%Y-%m-%d %H:%M:%S"),
            tuple.metadata.run_id,
        );
    }
    if let Some(last) = tuples.last().filter(|_| tuples.len() == limit) {
        println!("\nMore may exist: --before {}", last.checkpoint.id);
    }
    Ok(())
}

async fn cmd_checkpoints_show(
    db: Option<PathBuf>,
    thread_id: &str,
    checkpoint_id: &str,
    checkpoint_ns: Option<String>,
) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&db_path(db, &config)?).await?;
    let run = thread_config(thread_id, checkpoint_ns, &config).at(checkpoint_id);

    let tuple = storage
        .get_tuple(&run)
        .await?
        .ok_or_else(|| eyre!("checkpoint '{checkpoint_id}' not found on thread '{thread_id}'"))?;

    let view = json!({
        "config": tuple.config,
        "parent_config": tuple.parent_config,
        "metadata": tuple.metadata,
        "checkpoint": tuple.checkpoint,
        "pending_writes": tuple.pending_writes,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn cmd_checkpoints_prune(
    db: Option<PathBuf>,
    thread_id: &str,
    checkpoint_ns: Option<String>,
    keep: usize,
) -> Result<()> {
    let config = load_config()?;
    let path = db_path(db, &config)?;
    if !path.exists() {
        return Err(eyre!("no checkpoint database at {}", path.display()));
    }
    let storage = Storage::open(&path).await?;
    let run = thread_config(thread_id, checkpoint_ns, &config);

    info!(thread_id, keep, "pruning checkpoints");
    let removed = storage.prune(&run, keep).await?;
    let expired = storage.prune_expired_cache().await?;
    println!("Removed {removed} checkpoint(s) and {expired} expired cache entr(ies).");
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ask_with_resume_triple() {
        let cli = Cli::try_parse_from([
            "helpdesk",
            "ask",
            "How can I reset my Outlook password?",
            "--thread-id",
            "t-1",
            "--checkpoint-ns",
            "helpdesk_ns",
            "--checkpoint-id",
            "run-7",
            "--no-cache",
        ])
        .unwrap();
        match cli.command {
            Command::Ask {
                query,
                thread_id,
                checkpoint_id,
                no_cache,
                ephemeral,
                ..
            } => {
                assert_eq!(query, "How can I reset my Outlook password?");
                assert_eq!(thread_id.as_deref(), Some("t-1"));
                assert_eq!(checkpoint_id.as_deref(), Some("run-7"));
                assert!(no_cache);
                assert!(!ephemeral);
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn parses_checkpoint_prune() {
        let cli = Cli::try_parse_from([
            "helpdesk", "-v", "checkpoints", "prune", "--thread-id", "t-1", "--keep", "3",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        assert!(matches!(
            cli.command,
            Command::Checkpoints {
                action: CheckpointAction::Prune { keep: 3, .. }
            }
        ));
    }

    #[test]
    fn thread_config_uses_configured_namespace() {
        let config = AppConfig::default();
        assert_eq!(thread_config("t", None, &config).checkpoint_ns, "helpdesk_ns");
        assert_eq!(thread_config("t", Some("other".into()), &config).checkpoint_ns, "other");
    }

    #[tokio::test]
    async fn empty_query_is_rejected_before_any_io() {
        let options = AskOptions {
            thread_id: None,
            checkpoint_ns: None,
            checkpoint_id: None,
            ephemeral: true,
            no_cache: true,
            ollama_url: None,
            corpus: None,
            db: None,
        };
        let err = cmd_ask("  ", options).await.unwrap_err();
        assert!(err.to_string().contains("query must not be empty"));
    }
}
