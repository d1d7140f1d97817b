//! memforge - bounded autonomous memory compaction
//!
//! The `memforge` command runs refinement sessions over owners' memories and
//! inspects what they did.
//!
//! ## Commands
//!
//! - `run`: run every eligible owner once
//! - `run-owner`: run one owner now
//! - `daemon`: run passes on an interval until Ctrl-C
//! - `ledger`: show an owner's memories
//! - `audit`: show audit entries for a session or owner
//! - `import`: load memories from a JSON file
//! - `settings`: show or change per-owner overrides

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use memforge_core::config::valid_threshold;
use memforge_core::{
    AnthropicClient, EngineConfig, PassReport, Scheduler, SessionController, SessionReport,
};
use memforge_state::{
    AuditEntry, AuditLog, Memory, MemoryKind, MemoryStore, OwnerSettings, Store,
    SurrealMemoryStore, MAX_CONTENT_CHARS,
};
use serde::Deserialize;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "memforge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bounded autonomous memory compaction", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session for every eligible owner
    Run {
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Run a session for one owner, eligible or not
    RunOwner {
        owner: String,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Run scheduler passes periodically until Ctrl-C
    Daemon {
        /// Seconds between passes
        #[arg(long, env = "MEMFORGE_DAEMON_INTERVAL_SECS", default_value = "3600")]
        interval_secs: u64,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Print an owner's core and journal memories
    Ledger { owner: String },

    /// Print audit entries for a session or an owner
    Audit {
        /// Session id
        #[arg(long, conflicts_with = "owner", required_unless_present = "owner")]
        session: Option<String>,

        /// Owner id (most recent entries first)
        #[arg(long)]
        owner: Option<String>,

        /// Maximum number of entries for --owner
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Load memories for an owner from a JSON array
    Import { owner: String, file: PathBuf },

    /// Show or update an owner's overrides
    Settings {
        owner: String,

        /// Fraction of core mass a session must retain, in (0, 1]
        #[arg(long)]
        retention_threshold: Option<f64>,

        /// Style guidance for rewritten memories
        #[arg(long)]
        style: Option<String>,
    },
}

/// Overrides applied on top of `MEMFORGE_*` environment config.
#[derive(Args, Debug, Default)]
struct EngineArgs {
    /// LLM model id
    #[arg(long)]
    model: Option<String>,

    /// Core mass above which an owner is always eligible
    #[arg(long)]
    mass_budget: Option<u64>,

    /// Model turns per session
    #[arg(long)]
    max_turns: Option<u32>,

    /// Sessions for different owners running at once
    #[arg(long)]
    max_concurrent: Option<usize>,
}

impl EngineArgs {
    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(budget) = self.mass_budget {
            config.mass_budget = budget;
        }
        if let Some(turns) = self.max_turns {
            config.max_turns = turns;
        }
        if let Some(n) = self.max_concurrent {
            config.max_concurrent_sessions = n;
        }
        config
    }
}

/// One element of an import file.
#[derive(Debug, Deserialize)]
struct ImportRecord {
    #[serde(default)]
    id: Option<String>,
    content: String,
    #[serde(default, rename = "type")]
    kind: Option<MemoryKind>,
    #[serde(default)]
    protected: bool,
    #[serde(default)]
    mass: Option<u64>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    memforge_core::init_tracing(cli.json, level);

    let store: Arc<dyn Store> = Arc::new(
        SurrealMemoryStore::from_env()
            .await
            .context("Failed to connect to memforge database")?,
    );

    match cli.command {
        Commands::Run { engine } => cmd_run(scheduler(store, &engine)?).await,
        Commands::RunOwner { owner, engine } => {
            cmd_run_owner(scheduler(store, &engine)?, &owner).await
        }
        Commands::Daemon {
            interval_secs,
            engine,
        } => cmd_daemon(scheduler(store, &engine)?, interval_secs).await,
        Commands::Ledger { owner } => cmd_ledger(store.as_ref(), &owner).await,
        Commands::Audit {
            session,
            owner,
            limit,
        } => cmd_audit(store.as_ref(), session.as_deref(), owner.as_deref(), limit).await,
        Commands::Import { owner, file } => cmd_import(store.as_ref(), &owner, &file).await,
        Commands::Settings {
            owner,
            retention_threshold,
            style,
        } => cmd_settings(store.as_ref(), &owner, retention_threshold, style).await,
    }
}

fn scheduler(store: Arc<dyn Store>, args: &EngineArgs) -> Result<Scheduler> {
    let config = args.apply(EngineConfig::from_env().context("Invalid MEMFORGE_* configuration")?);
    config.validate().context("Invalid engine configuration")?;

    let llm = AnthropicClient::from_env()
        .context("Failed to set up the LLM client")?
        .with_model(config.model.clone())
        .with_timeout(config.llm_timeout_secs)
        .context("Failed to set up the LLM client")?;

    let controller = SessionController::new(store, Arc::new(llm), config);
    Ok(Scheduler::new(Arc::new(controller)))
}

fn print_report(report: &SessionReport) {
    println!(
        "{:<20} {:<12} mass {} -> {}  mutations {}  turns {}  session {}",
        report.owner_id,
        report.state.as_str(),
        report.pre_mass,
        report.post_mass,
        report.mutations,
        report.turns,
        report.session_id
    );
    if let Some(rollback) = &report.rollback {
        println!(
            "{:<20} reverted {} change(s); attempted mass {} ({:+.1}%)",
            "", rollback.reversed, rollback.attempted_post_mass, rollback.percent_change
        );
    }
}

fn print_pass(pass: &PassReport) {
    for report in &pass.sessions {
        print_report(report);
    }
    for owner in &pass.skipped {
        println!("{owner:<20} skipped (session already running)");
    }
    for (owner, error) in &pass.failed {
        println!("{owner:<20} FAILED: {error}");
    }
}

/// Run every eligible owner once
async fn cmd_run(scheduler: Scheduler) -> Result<()> {
    let pass = scheduler.run_all_eligible().await?;
    if pass.sessions.is_empty() && pass.failed.is_empty() && pass.skipped.is_empty() {
        println!("No owners are due for refinement.");
        return Ok(());
    }
    print_pass(&pass);
    if !pass.failed.is_empty() {
        bail!("{} session(s) failed", pass.failed.len());
    }
    Ok(())
}

async fn cmd_run_owner(scheduler: Scheduler, owner: &str) -> Result<()> {
    let report = scheduler
        .run_owner(owner)
        .await
        .with_context(|| format!("Session for owner '{owner}' failed"))?;
    print_report(&report);
    Ok(())
}

async fn cmd_daemon(scheduler: Scheduler, interval_secs: u64) -> Result<()> {
    if interval_secs == 0 {
        bail!("--interval-secs must be greater than zero");
    }
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    scheduler
        .daemon(Duration::from_secs(interval_secs), shutdown)
        .await?;
    Ok(())
}

/// Print an owner's memories
async fn cmd_ledger(store: &dyn Store, owner: &str) -> Result<()> {
    let memories = store.list_memories(owner, None).await?;
    if memories.is_empty() {
        println!("No memories for '{owner}'");
        return Ok(());
    }

    for kind in [MemoryKind::Core, MemoryKind::Journal] {
        let of_kind: Vec<&Memory> = memories.iter().filter(|m| m.kind == kind).collect();
        let mass: u64 = of_kind.iter().map(|m| m.mass).sum();
        println!("{} ({} memories, mass {})", kind.as_str(), of_kind.len(), mass);
        for m in of_kind {
            let flag = if m.protected { "*" } else { " " };
            println!(
                "  {}{} {:>5}  {}  {}",
                flag,
                m.short_id(),
                m.mass,
                m.created_at.format("%Y-%m-%d %H:%M"),
                m.content.replace('\n', " ")
            );
        }
        println!();
    }

    if let Some(settings) = store.owner_settings(owner).await? {
        print_settings(&settings);
    }
    Ok(())
}

fn print_entry(entry: &AuditEntry) {
    println!(
        "{} #{:<3} {:<18} {:<8} {}",
        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
        entry.seq,
        entry.operation.as_str(),
        format!("{:?}", entry.outcome).to_lowercase(),
        entry.memory_id.as_deref().unwrap_or("-")
    );
    if let Some(before) = &entry.before_content {
        println!("      - {before}");
    }
    if let Some(after) = &entry.after_content {
        println!("      + {after}");
    }
    if !entry.detail.is_null() {
        println!("      {}", entry.detail);
    }
}

async fn cmd_audit(
    store: &dyn Store,
    session: Option<&str>,
    owner: Option<&str>,
    limit: usize,
) -> Result<()> {
    let entries = match (session, owner) {
        (Some(session), _) => store.session_entries(session).await?,
        (None, Some(owner)) => store.owner_entries(owner, limit).await?,
        (None, None) => bail!("either --session or --owner is required"),
    };
    if entries.is_empty() {
        println!("No audit entries found");
        return Ok(());
    }
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

fn parse_import(owner: &str, raw: &str) -> Result<Vec<Memory>> {
    let records: Vec<ImportRecord> =
        serde_json::from_str(raw).context("Import file must be a JSON array of memories")?;

    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let content = record.content.trim();
            if content.is_empty() {
                bail!("record {i}: content is empty");
            }
            if content.chars().count() > MAX_CONTENT_CHARS {
                bail!("record {i}: content exceeds {MAX_CONTENT_CHARS} characters");
            }
            let mut memory = Memory::new(owner, content, record.kind.unwrap_or(MemoryKind::Core))
                .with_protected(record.protected);
            if let Some(id) = record.id {
                memory = memory.with_id(id);
            }
            if let Some(mass) = record.mass {
                memory = memory.with_mass(mass);
            }
            if let Some(created_at) = record.created_at {
                memory = memory.with_created_at(created_at);
            }
            Ok(memory)
        })
        .collect()
}

/// Load memories from a JSON file
async fn cmd_import(store: &dyn Store, owner: &str, file: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let memories = parse_import(owner, &raw)?;

    let count = memories.len();
    for memory in memories {
        let id = memory.id.clone();
        store
            .insert_memory(memory)
            .await
            .with_context(|| format!("Failed to import memory {id}"))?;
    }
    info!(owner_id = %owner, count, "imported memories");
    println!("Imported {count} memories for '{owner}'");
    Ok(())
}

fn print_settings(settings: &OwnerSettings) {
    println!("Settings for '{}':", settings.owner_id);
    match settings.retention_threshold {
        Some(t) => println!("  retention_threshold: {t}"),
        None => println!("  retention_threshold: (default)"),
    }
    match settings.effective_style() {
        Some(style) => println!("  style: {style}"),
        None => println!("  style: (default)"),
    }
}

async fn cmd_settings(
    store: &dyn Store,
    owner: &str,
    retention_threshold: Option<f64>,
    style: Option<String>,
) -> Result<()> {
    let current = store.owner_settings(owner).await?;
    if retention_threshold.is_none() && style.is_none() {
        match current {
            Some(settings) => print_settings(&settings),
            None => println!("No overrides for '{owner}'"),
        }
        return Ok(());
    }

    let mut settings = current.unwrap_or_else(|| OwnerSettings::new(owner));
    if let Some(t) = retention_threshold {
        if !valid_threshold(t) {
            bail!("retention threshold must be in (0, 1], got {t}");
        }
        settings = settings.with_retention_threshold(t);
    }
    if let Some(style) = style {
        settings = settings.with_style_prompt(style);
    }
    store.put_owner_settings(settings.clone()).await?;
    print_settings(&settings);
    Ok(())
}
