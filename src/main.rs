//! POTLINE — Provably-fair pooled-wager round engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the open round from storage (or opens a fresh one), and runs
//! the main loop: gateway event polling, pending-deposit reconciliation
//! sweeps, and graceful shutdown.

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use potline::config::{self, AppConfig};
use potline::engine::deposits::{DepositConfig, DepositCoordinator};
use potline::engine::payout::PayoutCoordinator;
use potline::engine::round::{RoundEngine, RoundEngineConfig};
use potline::events::EventBus;
use potline::fairness::TaxPolicy;
use potline::gateway::bot::BotGateway;
use potline::gateway::SettlementGateway;
use potline::pricing::PriceBook;
use potline::storage::Store;

const BANNER: &str = r#"
 ____   ___ _____ _     ___ _   _ _____
|  _ \ / _ \_   _| |   |_ _| \ | | ____|
| |_) | | | || | | |    | ||  \| |  _|
|  __/| |_| || | | |___ | || |\  | |___
|_|    \___/ |_| |_____|___|_| \_|_____|

  Provably-fair pooled-wager round engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = config::AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    // Print startup banner
    println!("{BANNER}");
    info!(
        round_duration_secs = cfg.engine.round_duration_secs,
        ticket_ratio = %cfg.engine.ticket_ratio,
        tax_threshold = %cfg.tax.threshold,
        database_url = %cfg.storage.database_url,
        "POTLINE starting up"
    );

    // -- Initialise components -------------------------------------------

    let store = Store::connect(&cfg.storage.database_url).await?;
    let events = EventBus::new(cfg.events.buffer);

    // Price cache starts empty; lookups fall back to the configured floor
    // until the external refresh job feeds it.
    let pricing = Arc::new(PriceBook::new(cfg.pricing.floor_price));
    if pricing.is_empty() {
        warn!("Price cache empty at startup; deposits will price at the floor until refreshed");
    }

    let api_key = match AppConfig::resolve_env(&cfg.gateway.api_key_env) {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "No gateway API key configured; the trade bot will reject requests");
            String::new()
        }
    };
    let bot = Arc::new(BotGateway::new(cfg.gateway.base_url.clone(), api_key)?);
    let gateway: Arc<dyn SettlementGateway> = bot.clone();

    let payout = Arc::new(PayoutCoordinator::new(
        gateway.clone(),
        store.clone(),
        events.clone(),
    ));

    let engine = RoundEngine::new(
        RoundEngineConfig {
            round_duration: ChronoDuration::seconds(cfg.engine.round_duration_secs as i64),
            cooldown: Duration::from_secs(cfg.engine.cooldown_secs),
            create_retry: Duration::from_secs(cfg.engine.create_retry_secs),
            ticket_ratio: cfg.engine.ticket_ratio,
            max_items_per_pot: cfg.engine.max_items_per_pot,
            max_participants: cfg.engine.max_participants,
            tax: TaxPolicy {
                threshold: cfg.tax.threshold,
                min_pct: cfg.tax.min_pct,
                max_pct: cfg.tax.max_pct,
            },
        },
        store.clone(),
        events.clone(),
        payout.clone(),
    );

    let deposits = DepositCoordinator::new(
        DepositConfig {
            max_items_per_deposit: cfg.engine.max_items_per_deposit,
            max_items_per_pot: cfg.engine.max_items_per_pot,
            max_participants: cfg.engine.max_participants,
            offer_ttl: ChronoDuration::seconds(cfg.gateway.offer_ttl_secs as i64),
        },
        engine.clone(),
        gateway,
        pricing,
        store.clone(),
        events.clone(),
    );

    // -- Restore or create the round --------------------------------------

    engine.resume().await?;
    if let Some(round) = engine.snapshot().await {
        info!(round_id = round.id, status = %round.status, "Round ready");
    }

    // -- Main loop ---------------------------------------------------------

    let mut poll = tokio::time::interval(Duration::from_secs(cfg.gateway.poll_interval_secs));
    let mut sweep = tokio::time::interval(Duration::from_secs(cfg.engine.sweep_interval_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        poll_secs = cfg.gateway.poll_interval_secs,
        sweep_secs = cfg.engine.sweep_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = poll.tick() => {
                match bot.poll_events().await {
                    Ok(batch) => {
                        for event in batch {
                            dispatch_event(&deposits, &payout, &event).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Gateway event poll failed");
                    }
                }
            }
            _ = sweep.tick() => {
                deposits.sweep().await;
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    // The countdown is persisted; a restart resumes the same clock.
    engine.cancel_timer();
    if let Some(round) = engine.snapshot().await {
        info!(round_id = round.id, status = %round.status, "POTLINE shut down cleanly.");
    }

    Ok(())
}

/// Route one gateway status event through the single dispatcher: deposits
/// first, then payouts; unknown offers are logged and dropped.
async fn dispatch_event(
    deposits: &DepositCoordinator,
    payout: &PayoutCoordinator,
    event: &potline::gateway::GatewayEvent,
) {
    match deposits.handle_event(event).await {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            error!(offer_id = %event.offer_id, error = %e, "Deposit event handling failed");
            return;
        }
    }
    match payout.handle_event(event).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                offer_id = %event.offer_id,
                status = %event.status,
                "Gateway event for unknown offer"
            );
        }
        Err(e) => {
            error!(offer_id = %event.offer_id, error = %e, "Payout event handling failed");
        }
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("potline=info"));

    let json_logging = std::env::var("POTLINE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
