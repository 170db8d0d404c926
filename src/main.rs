use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tracing::{error, info};

use tg_campaign::clock::{Clock, SystemClock};
use tg_campaign::config;
use tg_campaign::controller::CampaignController;
use tg_campaign::db;
use tg_campaign::dispatch::DispatchSettings;
use tg_campaign::handlers;
use tg_campaign::paraphrase::VariationService;
use tg_campaign::scheduler;
use tg_campaign::sender::TelegramSender;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sender = Arc::new(TelegramSender::new(&cfg.telegram.bot_token, cfg.send_timeout()));
    let variations = Arc::new(VariationService::from_config(&cfg.variations)?);
    let controller = CampaignController::new(
        store.clone(),
        store.clone(),
        sender,
        clock.clone(),
        DispatchSettings::from_config(&cfg),
    )
    .with_variations(variations, cfg.variations.count)
    .with_defaults(cfg.dispatch.campaign.clone());

    // Start scheduled campaigns once their time has come.
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    {
        let store = store.clone();
        let controller = controller.clone();
        let clock = clock.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) =
                    scheduler::process_due_campaigns(store.as_ref(), &controller, clock.now()).await
                {
                    error!(?err, "scheduler error");
                }
                tokio::time::sleep(poll_sleep).await;
            }
        });
    }

    // Purge control flags of finished campaigns.
    let retention = Duration::from_secs(cfg.app.signal_retention_seconds);
    {
        let store = store.clone();
        let clock = clock.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = scheduler::purge_signals(store.as_ref(), clock.now(), retention).await
                {
                    error!(?err, "signal janitor error");
                }
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
    }

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let allowed_users = Arc::new(cfg.telegram.allowed_users.clone());

    info!("starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let controller = controller.clone();
        let allowed_users = allowed_users.clone();
        async move {
            if let Err(err) =
                handlers::handle_update(&bot, &controller, &allowed_users, &msg).await
            {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    Ok(())
}
