//! # Evermail — Campaign Scheduling & Throttled Delivery Engine
//!
//! Usage:
//!   evermail run                         # Start the scheduler loop
//!   evermail tick                        # One scheduling pass, then exit
//!   evermail seed --file seed.json       # Load campaigns/recipients/variants
//!   evermail pause --campaign camp-1     # Pause a campaign
//!   evermail event --job <id> --kind bounced
//!   evermail status                      # Show schedules and job counts

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use evermail_channels::build_transport;
use evermail_core::config::EvermailConfig;
use evermail_core::traits::JobStore;
use evermail_core::types::{Campaign, CampaignStatus, EventKind, MessageVariant, Recipient, Schedule};
use evermail_engine::{record_event, SchedulerEngine, SqliteJobStore};

#[derive(Parser)]
#[command(
    name = "evermail",
    version,
    about = "📬 Evermail — campaign scheduling and throttled delivery"
)]
struct Cli {
    /// Config file (default: ~/.evermail/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Database path (overrides the config)
    #[arg(long)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler loop
    Run,
    /// Run one scheduling pass and exit
    Tick,
    /// Load campaigns, schedules, recipients, and variants from JSON
    Seed {
        #[arg(long)]
        file: String,
    },
    /// Pause a campaign or a single schedule
    Pause {
        #[arg(long)]
        campaign: Option<String>,
        #[arg(long)]
        schedule: Option<String>,
    },
    /// Resume a paused campaign or schedule
    Resume {
        #[arg(long)]
        campaign: Option<String>,
        #[arg(long)]
        schedule: Option<String>,
    },
    /// Record an engagement event against a job
    Event {
        #[arg(long)]
        job: String,
        /// delivered, opened, clicked, bounced, complaint, or unsubscribed
        #[arg(long)]
        kind: String,
        /// Optional JSON metadata
        #[arg(long)]
        meta: Option<String>,
    },
    /// Show schedules and their job counts
    Status,
}

/// Seed file shape: groups and templates are maps keyed by id.
#[derive(serde::Deserialize)]
struct SeedFile {
    #[serde(default)]
    campaigns: Vec<Campaign>,
    #[serde(default)]
    schedules: Vec<Schedule>,
    #[serde(default)]
    groups: HashMap<String, Vec<Recipient>>,
    #[serde(default)]
    templates: HashMap<String, Vec<MessageVariant>>,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "evermail=debug,evermail_engine=debug,evermail_channels=debug"
    } else {
        "evermail=info,evermail_engine=info,evermail_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => EvermailConfig::load_from(Path::new(&expand_path(path)))?,
        None => EvermailConfig::load()?,
    };

    let db_path = expand_path(cli.db.as_deref().unwrap_or(&config.engine.db_path));
    if let Some(parent) = Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteJobStore::open(Path::new(&db_path))?);

    match cli.command {
        Command::Run => {
            let transport = build_transport(&config.transport)?;
            tracing::info!("📬 Evermail starting ({} transport)", transport.name());
            let engine = Arc::new(SchedulerEngine::new(store, transport, config));
            tokio::select! {
                _ = engine.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("👋 Shutting down");
                }
            }
        }
        Command::Tick => {
            let transport = build_transport(&config.transport)?;
            let engine = Arc::new(SchedulerEngine::new(store, transport, config));
            let report = engine.clone().tick(Utc::now()).await?;
            let totals = engine.drain().await;
            println!(
                "Tick: {} schedules, {} jobs created, {} sent, {} requeued, {} failed, {} suppressed",
                report.schedules_seen,
                report.jobs_created,
                totals.sent,
                totals.requeued,
                totals.failed,
                totals.suppressed
            );
        }
        Command::Seed { file } => seed(&store, &expand_path(&file))?,
        Command::Pause { campaign, schedule } => {
            set_status(&store, campaign, schedule, CampaignStatus::Paused)?
        }
        Command::Resume { campaign, schedule } => {
            set_status(&store, campaign, schedule, CampaignStatus::Scheduled)?
        }
        Command::Event { job, kind, meta } => {
            let kind = EventKind::parse(&kind)?;
            let meta = match meta {
                Some(raw) => serde_json::from_str(&raw).context("parse --meta JSON")?,
                None => serde_json::json!({}),
            };
            let store: Arc<dyn JobStore> = store;
            let outcome = record_event(&store, &job, kind, Utc::now(), meta)?;
            println!("{outcome:?}");
        }
        Command::Status => status(&store)?,
    }
    Ok(())
}

fn seed(store: &SqliteJobStore, path: &str) -> Result<()> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
    let seed: SeedFile = serde_json::from_str(&raw).with_context(|| format!("parse {path}"))?;

    for campaign in &seed.campaigns {
        store.save_campaign(campaign)?;
    }
    for schedule in &seed.schedules {
        store.save_schedule(schedule)?;
    }
    let mut recipients = 0usize;
    for (group_id, members) in &seed.groups {
        for recipient in members {
            store.save_recipient(group_id, recipient)?;
            recipients += 1;
        }
    }
    let mut variants = 0usize;
    for (template_id, list) in &seed.templates {
        for variant in list {
            store.save_variant(template_id, variant)?;
            variants += 1;
        }
    }
    println!(
        "✅ Seeded {} campaigns, {} schedules, {} recipients, {} variants",
        seed.campaigns.len(),
        seed.schedules.len(),
        recipients,
        variants
    );
    Ok(())
}

fn set_status(
    store: &SqliteJobStore,
    campaign: Option<String>,
    schedule: Option<String>,
    status: CampaignStatus,
) -> Result<()> {
    match (campaign, schedule) {
        (Some(id), _) => {
            store.set_campaign_status(&id, status)?;
            println!("Campaign {id} → {}", status.as_str());
        }
        (None, Some(id)) => {
            store.set_schedule_status(&id, status)?;
            println!("Schedule {id} → {}", status.as_str());
        }
        (None, None) => anyhow::bail!("pass --campaign <id> or --schedule <id>"),
    }
    Ok(())
}

fn status(store: &SqliteJobStore) -> Result<()> {
    let schedules = store.list_schedules()?;
    if schedules.is_empty() {
        println!("No schedules.");
        return Ok(());
    }
    for schedule in schedules {
        let jobs = store.jobs_for_schedule(&schedule.id)?;
        let sent = jobs.iter().filter(|j| j.status.is_terminal()).count();
        println!(
            "{} [{}] campaign={} step={} next_run={} jobs={} terminal={}",
            schedule.id,
            schedule.status.as_str(),
            schedule.campaign_id,
            schedule.step_order,
            schedule
                .next_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
            jobs.len(),
            sent
        );
    }
    Ok(())
}
