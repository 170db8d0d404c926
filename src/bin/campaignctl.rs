use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use tg_campaign::clock::SystemClock;
use tg_campaign::config;
use tg_campaign::controller::{CampaignController, Launched};
use tg_campaign::db;
use tg_campaign::dispatch::{DispatchSettings, LoopOutcome};
use tg_campaign::handlers::format_snapshot;
use tg_campaign::model::{DeliveryStatus, NewCampaign};
use tg_campaign::paraphrase::VariationService;
use tg_campaign::sender::TelegramSender;

#[derive(Debug, Parser)]
#[command(author, version, about = "Create and control outbound campaigns")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print JSON instead of a human-readable summary
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Create a campaign from a YAML file
    Create { file: PathBuf },
    /// Schedule a draft campaign (RFC 3339 time), or clear the schedule with --clear
    Schedule {
        id: String,
        at: Option<DateTime<Utc>>,
        #[arg(long)]
        clear: bool,
    },
    /// Start sending and stay attached until the loop stops
    Start { id: String },
    Pause { id: String },
    /// Resume a paused campaign and stay attached until the loop stops
    Resume { id: String },
    Cancel { id: String },
    Status { id: String },
    /// Show the delivery log, optionally filtered by status
    Log {
        id: String,
        #[arg(long)]
        status: Option<String>,
    },
    List {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    Delete { id: String },
    /// Create a campaign from a YAML file and send it right away
    Run { file: PathBuf },
}

fn read_campaign(file: &Path) -> Result<NewCampaign> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("failed to parse {}", file.display()))
}

/// Wait for a loop started by this process. Exiting earlier would kill it.
async fn attach(controller: &CampaignController, launched: Launched, json: bool) -> Result<()> {
    let id = launched.snapshot.id.clone();
    info!(campaign_id = %id, "attached to dispatch loop");
    let outcome = launched.handle.await.context("dispatch loop panicked")?;
    let snapshot = controller.status(&id).await?;
    print(json, &snapshot, || format_snapshot(&snapshot))?;
    if let LoopOutcome::Failed(reason) = outcome {
        anyhow::bail!("dispatch loop failed: {}", reason);
    }
    Ok(())
}

fn print<T: serde::Serialize>(
    json: bool,
    value: &T,
    human: impl FnOnce() -> String,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = Arc::new(db::SqliteStore::new(pool));

    let sender = Arc::new(TelegramSender::new(&cfg.telegram.bot_token, cfg.send_timeout()));
    let variations = Arc::new(VariationService::from_config(&cfg.variations)?);
    let controller = CampaignController::new(
        store.clone(),
        store.clone(),
        sender,
        Arc::new(SystemClock),
        DispatchSettings::from_config(&cfg),
    )
    .with_variations(variations, cfg.variations.count)
    .with_defaults(cfg.dispatch.campaign.clone());

    let json = args.json;
    match args.command {
        Cmd::Create { file } => {
            let snapshot = controller.create(read_campaign(&file)?).await?;
            print(json, &snapshot, || format!("Created {}", format_snapshot(&snapshot)))?;
        }
        Cmd::Schedule { id, at, clear } => {
            let snapshot = match (clear, at) {
                (true, _) => controller.unschedule(&id).await?,
                (false, Some(at)) => controller.schedule(&id, at).await?,
                (false, None) => anyhow::bail!("either a time or --clear is required"),
            };
            print(json, &snapshot, || format_snapshot(&snapshot))?;
        }
        Cmd::Start { id } => {
            let launched = controller.start(&id).await?;
            attach(&controller, launched, json).await?;
        }
        Cmd::Pause { id } => {
            let snapshot = controller.pause(&id).await?;
            print(json, &snapshot, || format_snapshot(&snapshot))?;
        }
        Cmd::Resume { id } => {
            let launched = controller.resume(&id).await?;
            attach(&controller, launched, json).await?;
        }
        Cmd::Cancel { id } => {
            let snapshot = controller.cancel(&id).await?;
            print(json, &snapshot, || format_snapshot(&snapshot))?;
        }
        Cmd::Status { id } => {
            let snapshot = controller.status(&id).await?;
            print(json, &snapshot, || format_snapshot(&snapshot))?;
        }
        Cmd::Log { id, status } => {
            let filter = match status.as_deref() {
                Some(s) => Some(
                    DeliveryStatus::parse_state(s)
                        .with_context(|| format!("unknown delivery status '{}'", s))?,
                ),
                None => None,
            };
            let entries = controller.delivery_log(&id, filter).await?;
            print(json, &entries, || {
                entries
                    .iter()
                    .map(|e| {
                        format!(
                            "{:>5} {:<20} {:<8} attempts={} {}",
                            e.position,
                            e.number,
                            e.status,
                            e.attempts,
                            e.error_message.as_deref().unwrap_or("")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Cmd::List { limit } => {
            let campaigns = controller.list(limit).await?;
            print(json, &campaigns, || {
                campaigns
                    .iter()
                    .map(format_snapshot)
                    .collect::<Vec<_>>()
                    .join("\n\n")
            })?;
        }
        Cmd::Delete { id } => {
            controller.delete(&id).await?;
            info!(campaign_id = %id, "deleted");
        }
        Cmd::Run { file } => {
            let created = controller.create(read_campaign(&file)?).await?;
            if created.timestamps.scheduled_for.is_some() {
                warn!(
                    campaign_id = %created.id,
                    "campaign file carries a schedule; starting now anyway"
                );
            }
            let launched = controller.start(&created.id).await?;
            attach(&controller, launched, json).await?;
        }
    }

    Ok(())
}
