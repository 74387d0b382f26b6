//! Command-line interface for postpay.
//!
//! Provides commands for taking in checkout events, processing and retrying
//! pipelines, inspecting records, and migrating between store backends.

use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::HttpActions;
use crate::config::{self, ResolvedConfig};
use crate::core::{
    migrate, open_store, FileStore, Intake, PipelineEngine, PipelineRunner, PipelineStore,
    ProcessOutcome, RetryDecision, SqliteStore,
};
use crate::domain::{CheckoutEvent, PipelineRecord};

/// postpay - Resumable post-payment onboarding pipelines
#[derive(Parser, Debug)]
#[command(name = "postpay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a pipeline from a checkout webhook event and process it
    Intake {
        /// Event JSON file (reads from stdin if not provided)
        #[arg(short, long)]
        event: Option<PathBuf>,
    },

    /// Process a pipeline in the foreground
    Process {
        /// Pipeline ID (checkout session id)
        id: String,
    },

    /// Retry a failed or stalled pipeline
    Retry {
        /// Pipeline ID
        id: String,
    },

    /// Show a pipeline record
    Status {
        /// Pipeline ID
        id: String,

        /// Print the raw record as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent pipelines
    List {
        /// Maximum number of pipelines to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,

    /// Copy pipelines from a JSON store into a SQLite database
    Migrate {
        /// Source JSON document
        #[arg(long)]
        from: PathBuf,

        /// Target SQLite database
        #[arg(long)]
        to: PathBuf,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Intake { event } => intake(event).await,
            Commands::Process { id } => process(&id).await,
            Commands::Retry { id } => retry(&id).await,
            Commands::Status { id, json } => show_status(&id, json).await,
            Commands::List { limit } => list_pipelines(limit).await,
            Commands::Config => show_config(),
            Commands::Migrate { from, to } => migrate_store(from, to).await,
        }
    }
}

/// Wire store, actions and engine from the resolved configuration
async fn build_engine(cfg: &ResolvedConfig) -> Result<Arc<PipelineEngine>> {
    let store = open_store(&cfg.store)
        .await
        .context("Failed to open pipeline store")?;
    let actions = HttpActions::from_settings(&cfg.integrations)?;
    Ok(Arc::new(PipelineEngine::new(
        store,
        Arc::new(actions),
        cfg.retry,
    )))
}

async fn open_configured_store() -> Result<Arc<dyn PipelineStore>> {
    let cfg = config::config()?;
    open_store(&cfg.store)
        .await
        .context("Failed to open pipeline store")
}

/// Take in a checkout event and wait for processing to settle
async fn intake(event_file: Option<PathBuf>) -> Result<()> {
    let body = if let Some(path) = event_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read event file: {}", path.display()))?
    } else {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    };

    if body.trim().is_empty() {
        anyhow::bail!("No event provided. Use --event <file> or pipe to stdin");
    }

    let event = CheckoutEvent::from_json(&body)?;
    let engine = build_engine(config::config()?).await?;
    let runner = PipelineRunner::new(Arc::clone(&engine));

    match runner.intake(&event).await? {
        Intake::Ignored(reason) => {
            eprintln!("[Event ignored: {}]", reason);
        }
        Intake::Accepted { id, .. } => {
            runner.wait_idle().await;
            report(engine.store().as_ref(), &id).await?;
        }
    }

    Ok(())
}

/// Run `process` in the foreground
async fn process(id: &str) -> Result<()> {
    let engine = build_engine(config::config()?).await?;

    match engine.process(id).await? {
        ProcessOutcome::NotFound => anyhow::bail!("Pipeline not found: {}", id),
        ProcessOutcome::AlreadyFinished => {
            eprintln!("[Pipeline {} already finished]", id);
        }
        ProcessOutcome::Finished => {
            eprintln!("[Pipeline {} finished successfully]", id);
        }
        ProcessOutcome::Failed { step } => {
            eprintln!("[Pipeline {} failed at {} step]", id, step);
        }
    }

    Ok(())
}

/// Manual retry, rejected for finished pipelines
async fn retry(id: &str) -> Result<()> {
    let engine = build_engine(config::config()?).await?;
    let runner = PipelineRunner::new(Arc::clone(&engine));

    match runner.retry(id).await? {
        RetryDecision::NotFound => anyhow::bail!("Pipeline not found: {}", id),
        RetryDecision::AlreadyFinished => {
            anyhow::bail!("Pipeline {} already finished", id)
        }
        RetryDecision::AlreadyRunning => {
            eprintln!("[Pipeline {} is already being processed]", id);
        }
        RetryDecision::Started => {
            runner.wait_idle().await;
            report(engine.store().as_ref(), id).await?;
        }
    }

    Ok(())
}

async fn report(store: &dyn PipelineStore, id: &str) -> Result<()> {
    match store.get(id).await? {
        Some(record) => eprintln!("\n[Pipeline {} is {}]", record.id, record.status),
        None => eprintln!("\n[Pipeline {} not found after processing]", id),
    }
    Ok(())
}

/// Show the status of a pipeline
async fn show_status(id: &str, json: bool) -> Result<()> {
    let store = open_configured_store().await?;
    let record = store
        .get(id)
        .await?
        .with_context(|| format!("Pipeline not found: {}", id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    print_record(&record);
    Ok(())
}

fn print_record(record: &PipelineRecord) {
    println!("Pipeline ID: {}", record.id);
    println!("Email: {}", record.data.email);
    if let Some(content_id) = record.data.content_id() {
        println!("Content: {}", content_id);
    }
    println!("Status: {}", record.status);
    println!("Attempts: {}", record.attempts);
    println!("Created: {}", record.created_at);
    println!("Updated: {}", record.updated_at);

    println!("\nSteps:");
    if record.steps.is_empty() {
        println!("  (none yet)");
    }
    for (name, outcome) in &record.steps {
        let verdict = if outcome.is_ok() { "ok" } else { "failed" };
        match outcome.error() {
            Some(error) => println!(
                "  {}: {} (attempt {}) - {}",
                name,
                verdict,
                outcome.attempt(),
                error
            ),
            None => println!("  {}: {} (attempt {})", name, verdict, outcome.attempt()),
        }
    }

    println!("\nLog:");
    for entry in &record.logs {
        println!("  {} {}", entry.timestamp.format("%Y-%m-%d %H:%M:%S"), entry.message);
    }
}

/// List recent pipelines
async fn list_pipelines(limit: usize) -> Result<()> {
    let store = open_configured_store().await?;
    let records = store.list().await?;

    if records.is_empty() {
        println!("No pipelines found");
        return Ok(());
    }

    println!(
        "{:<40} {:<32} {:<12} {:<20}",
        "PIPELINE ID", "EMAIL", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(106));

    for record in records.iter().take(limit) {
        println!(
            "{:<40} {:<32} {:<12} {:<20}",
            truncate(&record.id, 40),
            truncate(&record.data.email, 32),
            record.status,
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    if records.len() > limit {
        println!("\nShowing {} of {} pipelines", limit, records.len());
    }

    Ok(())
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let kept: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Mask all but the last four characters of a secret
fn mask(secret: &str) -> String {
    let visible: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("****{}", visible)
    }
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;
    let unset = || "(not configured)".to_string();

    println!("postpay configuration");
    println!("{}", "=".repeat(40));
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Store:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Backend:  {:?}", cfg.store.backend);
    println!("  JSON:     {}", cfg.store.path.display());
    println!("  Database: {}", cfg.store.database.display());
    println!();
    println!("Retry:");
    println!("  Max attempts: {}", cfg.retry.attempts());
    println!("  Base delay:   {}ms", cfg.retry.base_delay_ms);
    println!();
    println!("Integrations:");
    println!(
        "  Community webhook: {}",
        cfg.integrations
            .community_webhook_url
            .clone()
            .unwrap_or_else(unset)
    );
    println!(
        "  CRM endpoint:      {}",
        cfg.integrations.crm_endpoint.clone().unwrap_or_else(unset)
    );
    println!(
        "  CRM API key:       {}",
        cfg.integrations
            .crm_api_key
            .as_deref()
            .map(mask)
            .unwrap_or_else(unset)
    );
    println!(
        "  Request timeout:   {}s",
        cfg.integrations.request_timeout_seconds
    );

    Ok(())
}

/// Copy records from a JSON document into a SQLite database
async fn migrate_store(from: PathBuf, to: PathBuf) -> Result<()> {
    if !from.exists() {
        anyhow::bail!("Source store not found: {}", from.display());
    }

    let source = FileStore::open(&from)
        .await
        .with_context(|| format!("Failed to open source store: {}", from.display()))?;
    let target = SqliteStore::open(&to)
        .with_context(|| format!("Failed to open target database: {}", to.display()))?;

    let report = migrate(&source, &target).await?;

    println!(
        "Migrated {} pipeline(s), skipped {} already present",
        report.inserted.len(),
        report.skipped.len()
    );
    Ok(())
}
