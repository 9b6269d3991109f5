mod cli;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mnemon::config::MnemonConfig;
use mnemon::memory::types::FactType;
use mnemon::memory::{consolidate, FactMemory};

#[derive(Parser)]
#[command(name = "mnemon", version, about = "Fact-based memory engine with hybrid graph recall")]
struct Cli {
    /// Config file path (default: ~/.mnemon/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a new fact
    Remember {
        text: String,
        /// Fact type: world or experience
        #[arg(long = "type", default_value = "world")]
        fact_type: String,
        /// Where the fact came from (e.g. manual, notes, mail)
        #[arg(long, default_value = "manual")]
        source_type: String,
        /// Reference into the source (document id, message id)
        #[arg(long)]
        source_ref: Option<String>,
    },
    /// Query memory for relevant facts and observations
    Recall {
        query: String,
        /// Maximum facts to return
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete a fact by id
    Forget { fact_id: String },
    /// Replace a fact's text (re-embeds and re-links)
    Update { fact_id: String, text: String },
    /// Run one consolidation pass over pending facts
    Consolidate,
    /// Delete all stored memory
    Clear {
        /// Skip the confirmation check
        #[arg(long)]
        yes: bool,
    },
    /// Run the background consolidation loop until interrupted
    Run,
    /// Show row counts for facts, observations, entities, and links
    Stats,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.mnemon/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => MnemonConfig::load_from(path)?,
        None => MnemonConfig::load()?,
    };

    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Remember {
            text,
            fact_type,
            source_type,
            source_ref,
        } => {
            let fact_type = FactType::from_str(&fact_type).map_err(|e| anyhow::anyhow!(e))?;
            let memory = FactMemory::open(config)?;
            let fact = memory
                .remember(&text, fact_type, &source_type, source_ref.as_deref())
                .await?;
            println!("{}", fact.id);
        }
        Command::Recall { query, limit } => {
            let memory = FactMemory::open(config)?;
            let context = memory.recall(&query, limit).await?;
            println!("{}", serde_json::to_string_pretty(&context)?);
        }
        Command::Forget { fact_id } => {
            let memory = FactMemory::open(config)?;
            if memory.forget(&fact_id).await? {
                println!("Deleted {fact_id}");
            } else {
                println!("No fact with id {fact_id}");
            }
        }
        Command::Update { fact_id, text } => {
            let memory = FactMemory::open(config)?;
            if memory.update_fact(&fact_id, &text).await? {
                println!("Updated {fact_id}");
            } else {
                println!("No fact with id {fact_id}");
            }
        }
        Command::Consolidate => {
            let memory = FactMemory::open(config)?;
            let report = memory.consolidation_tick().await?;
            println!(
                "Examined {}: {} consolidated, {} skipped, {} failed",
                report.examined, report.consolidated, report.skipped, report.failed
            );
        }
        Command::Clear { yes } => {
            anyhow::ensure!(yes, "refusing to clear without --yes");
            let memory = FactMemory::open(config)?;
            memory.clear().await?;
            println!("Memory cleared.");
        }
        Command::Run => {
            let interval = Duration::from_secs(config.consolidation.interval_secs);
            let enabled = config.consolidation.enabled;
            let memory = Arc::new(FactMemory::open(config)?);

            anyhow::ensure!(enabled, "consolidation is disabled in config");
            let cancel = CancellationToken::new();
            let loop_handle = tokio::spawn(consolidate::run_loop(
                memory.clone(),
                interval,
                cancel.clone(),
            ));

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            cancel.cancel();
            loop_handle.await?;
        }
        Command::Stats => {
            let memory = FactMemory::open(config)?;
            let stats = memory.stats()?;
            println!(
                "facts: {}\nobservations: {}\nentities: {}\nlinks: {}",
                stats.facts, stats.observations, stats.entities, stats.links
            );
        }
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.embedding).await?;
            }
        },
    }

    Ok(())
}
