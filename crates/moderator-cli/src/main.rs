//! `moderator` command-line interface.
//!
//! - `validate`: load a rubric and lore, print the tree outline
//! - `evaluate`: score one comment and print the result payload as JSON

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use moderator_core::load_files;
use moderator_runtime::{AdapterRegistry, EngineConfig, ModerationEngine};

#[derive(Parser, Debug)]
#[command(name = "moderator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Rubric-driven comment moderation", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and validate a rubric with its lore
    Validate {
        /// Rubric file (YAML or JSON)
        #[arg(long)]
        rubric: PathBuf,

        /// Lore file (free text)
        #[arg(long)]
        lore: PathBuf,
    },

    /// Evaluate one comment against a rubric
    Evaluate {
        #[arg(long)]
        rubric: PathBuf,

        #[arg(long)]
        lore: PathBuf,

        /// Comment text
        #[arg(long, conflicts_with = "comment_file", required_unless_present = "comment_file")]
        comment: Option<String>,

        /// Read the comment from a file
        #[arg(long)]
        comment_file: Option<PathBuf>,

        /// Conversation or thread context
        #[arg(long)]
        context_file: Option<PathBuf>,

        /// Engine configuration (YAML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Model adapter type
        #[arg(long, default_value = "anthropic")]
        provider: String,

        /// Model name passed to the adapter
        #[arg(long)]
        model: Option<String>,

        /// Maximum concurrent model calls
        #[arg(long)]
        concurrency: Option<usize>,

        /// Evaluation deadline, e.g. "30s"
        #[arg(long, value_parser = humantime::parse_duration)]
        deadline: Option<Duration>,

        /// Per-call timeout, e.g. "15s"
        #[arg(long, value_parser = humantime::parse_duration)]
        call_timeout: Option<Duration>,

        /// Print the full result including per-leaf reasons
        #[arg(long)]
        full: bool,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,
    },
}

/// Install the global subscriber. Logs go to stderr so stdout stays JSON.
fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
            .ok();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.log_json, level);

    match cli.command {
        Commands::Validate { rubric, lore } => cmd_validate(&rubric, &lore),
        Commands::Evaluate {
            rubric,
            lore,
            comment,
            comment_file,
            context_file,
            config,
            provider,
            model,
            concurrency,
            deadline,
            call_timeout,
            full,
            pretty,
        } => {
            let comment = match (comment, comment_file) {
                (Some(text), _) => text,
                (None, Some(path)) => read_text(&path, "comment")?,
                (None, None) => bail!("either --comment or --comment-file is required"),
            };
            let conversation = context_file
                .as_deref()
                .map(|path| read_text(path, "context"))
                .transpose()?;

            let mut engine_config = match config {
                Some(path) => EngineConfig::from_yaml_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => EngineConfig::default(),
            };
            if let Some(k) = concurrency {
                engine_config.concurrency = k;
            }
            if let Some(d) = deadline {
                engine_config.deadline = d;
            }
            if let Some(t) = call_timeout {
                engine_config.call_timeout = t;
            }
            engine_config.validate()?;

            let output = cmd_evaluate(EvaluateArgs {
                rubric,
                lore,
                comment,
                conversation,
                config: engine_config,
                provider,
                model,
                full,
            })
            .await?;

            if pretty {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", serde_json::to_string(&output)?);
            }
            Ok(())
        }
    }
}

fn read_text(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file {}", what, path.display()))
}

fn cmd_validate(rubric: &Path, lore: &Path) -> Result<()> {
    let tree = load_files(rubric, lore)
        .with_context(|| format!("Invalid rubric {}", rubric.display()))?;

    println!("Rubric:      {}", tree.name.as_deref().unwrap_or("(unnamed)"));
    if let Some(version) = &tree.version {
        println!("Version:     {}", version);
    }
    println!("Fingerprint: {}", tree.fingerprint);
    println!("Nodes:       {}", tree.len());
    println!("Leaves:      {}", tree.leaf_count());
    println!();
    print!("{}", tree.outline());
    Ok(())
}

struct EvaluateArgs {
    rubric: PathBuf,
    lore: PathBuf,
    comment: String,
    conversation: Option<String>,
    config: EngineConfig,
    provider: String,
    model: Option<String>,
    full: bool,
}

async fn cmd_evaluate(args: EvaluateArgs) -> Result<serde_json::Value> {
    let registry = AdapterRegistry::with_defaults();
    let mut adapter_config = registry
        .default_config(&args.provider)
        .unwrap_or_else(|| serde_json::json!({}));
    if let Some(model) = &args.model {
        adapter_config["model"] = serde_json::Value::String(model.clone());
    }
    let adapter = registry
        .create(&args.provider, &adapter_config)
        .with_context(|| format!("Failed to configure adapter '{}'", args.provider))?;

    let engine = ModerationEngine::builder()
        .adapter(adapter)
        .config(args.config)
        .build()?;

    let tree = engine
        .load_rubric_files(&args.rubric, &args.lore)
        .await
        .with_context(|| format!("Invalid rubric {}", args.rubric.display()))?;
    info!(
        rubric = tree.name.as_deref().unwrap_or("(unnamed)"),
        leaves = tree.leaf_count(),
        provider = %args.provider,
        "Rubric loaded"
    );

    let result = engine
        .evaluate_comment(&args.comment, args.conversation.as_deref(), tree)
        .await;

    let output = if args.full {
        serde_json::to_value(&result)?
    } else {
        serde_json::to_value(result.payload())?
    };
    Ok(output)
}
