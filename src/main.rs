use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod config;
mod db;
mod mteam;
mod notify;
mod status;
mod wager;

use config::Config;
use db::Database;
use mteam::{DryRunGateway, MTeamClient};
use notify::{spawn_delivery, Notifier, WebhookSink};
use status::AppState;
use wager::gateway::BoardLookup;
use wager::risk::{day_start_utc, today};
use wager::{
    DeadlineScheduler, DecisionEngine, DecisionParams, OddsCache, RiskLedger, RiskLimits,
    WagerEngine, WagerExecutor, WagerGateway,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    if config.dry_run {
        info!(
            "🟡 DRY RUN mode – wagers are simulated (initial balance: {:.2})",
            config.initial_balance
        );
    } else {
        info!("🔴 LIVE mode – wagers WILL be submitted to M-Team");
    }

    // Open database
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    // Rebuild today's risk counters from the ledger
    let risk = RiskLedger::restore_from(
        &db,
        RiskLimits {
            max_daily_bet_fraction: config.max_daily_bet_fraction,
            stop_loss_fraction: config.stop_loss_fraction,
        },
        today(),
    )?;

    let odds = OddsCache::with_file(&config.odds_path);
    let n = odds.load_file().await?;
    info!("Loaded reference odds for {} match(es) from {}", n, config.odds_path);

    let timeout = Duration::from_secs(config.request_timeout_secs);
    let notifier = if config.notify {
        let (notifier, rx) = Notifier::new(256);
        let webhook = match config.notify_webhook_url.as_deref() {
            Some(url) => Some(WebhookSink::new(url, timeout)?),
            None => None,
        };
        spawn_delivery(rx, webhook);
        notifier
    } else {
        Notifier::disabled()
    };

    let client = Arc::new(MTeamClient::new(
        config.api_key.as_deref().unwrap_or_default(),
        config.uid.as_deref().unwrap_or_default(),
        &config.primary_url,
        &config.backup_url,
        config.feed_utc_offset_hours,
        timeout,
    )?);
    let board: Arc<dyn BoardLookup> = client.clone();
    let gateway: Arc<dyn WagerGateway> = if config.dry_run {
        Arc::new(DryRunGateway::new(config.initial_balance))
    } else {
        client.clone()
    };

    let executor = WagerExecutor::new(gateway.clone(), db.clone(), risk.clone(), notifier.clone());
    let scheduler = DeadlineScheduler::new(config.lead_seconds, Arc::new(executor), notifier.clone());
    let decision = DecisionEngine::new(DecisionParams::from(&config));
    info!("Decision parameters: {:?}", decision.params());
    let engine = Arc::new(WagerEngine::new(
        client,
        gateway,
        odds.clone(),
        risk.clone(),
        decision,
        scheduler.clone(),
        notifier,
    ));

    // Poll loop
    let poll_odds = odds.clone();
    let poll_interval = Duration::from_secs(config.poll_interval_secs);
    let poller = tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            // The odds file may have been edited by hand
            if let Err(e) = poll_odds.load_file().await {
                warn!("Keeping cached reference odds: {:#}", e);
            }
            engine.run_cycle().await;
        }
    });

    // Eager rollover at UTC midnight
    let rollover_risk = risk.clone();
    let rollover = tokio::spawn(async move {
        loop {
            let next = day_start_utc(today().succ_opt().unwrap_or_else(today));
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::from_secs(1));
            tokio::time::sleep(wait).await;
            if rollover_risk.rollover(today()) {
                info!("Started accounting day {}", today());
            }
        }
    });

    // Status API (blocks until Ctrl-C)
    let app = status::router(AppState {
        db: db.clone(),
        risk,
        scheduler: scheduler.clone(),
        odds,
        board,
        dry_run: config.dry_run,
        match_type: config.match_type.clone(),
        strategy: config.strategy.clone(),
        lead_seconds: config.lead_seconds,
    });
    let addr: SocketAddr = config
        .status_addr
        .parse()
        .with_context(|| format!("Invalid status address {}", config.status_addr))?;
    info!("Status API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    poller.abort();
    rollover.abort();
    scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
