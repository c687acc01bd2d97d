//! Raffle Backend
//!
//! Runs the raffle service with four concurrent subsystems:
//!
//! - **Keeper**: polls the upkeep predicate and starts settlement.
//! - **Fulfiller**: consumes randomness requests and delivers random words.
//! - **Event monitor**: logs every raffle notification.
//! - **HTTP server**: entry, upkeep, inspection and health endpoints.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signer;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use raffle_backend::api::{self, AppState};
use raffle_backend::clock::{Clock, SystemClock};
use raffle_backend::config::{AppConfig, PayoutMode};
use raffle_backend::coordinator::LocalCoordinator;
use raffle_backend::events::log_events;
use raffle_backend::metrics::Metrics;
use raffle_backend::payout::{LedgerPayout, PayoutChannel, RpcPayout};
use raffle_backend::raffle::Raffle;
use raffle_backend::service::RaffleService;
use raffle_backend::{fulfiller, keeper};

/// Capacity of the coordinator -> fulfiller queue.
const REQUEST_QUEUE_CAPACITY: usize = 256;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,solana_client=warn,solana_rpc_client=warn,hyper=warn,reqwest=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let treasury = config
        .treasury_keypair
        .as_ref()
        .map(|k| k.pubkey())
        .unwrap_or_default();
    info!(
        entrance_fee = config.entrance_fee,
        interval_secs = config.interval_secs,
        payout = ?config.payout_mode,
        treasury = %treasury,
        "Starting raffle backend"
    );

    let metrics = Arc::new(Metrics::new());
    let pending_count = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);

    let coordinator = Arc::new(LocalCoordinator::new(
        config.oracle_fee_per_word,
        config.max_num_words,
        tx,
    ));
    let subscription_id = coordinator.create_subscription(Pubkey::default())?;
    coordinator.fund_subscription(subscription_id, config.subscription_fund)?;

    let payout: Arc<dyn PayoutChannel> = match config.payout_mode {
        PayoutMode::Ledger => Arc::new(LedgerPayout::new()),
        PayoutMode::Rpc => Arc::new(RpcPayout::new(&config)?),
    };
    if config.payout_mode == PayoutMode::Rpc {
        info!(rpc = %config.rpc_url, cluster = %config.cluster, "Payouts over RPC");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let raffle = Raffle::new(config.entrance_fee, config.interval_secs, clock.unix_timestamp())?;

    let service = Arc::new(
        RaffleService::new(
            raffle,
            coordinator,
            payout,
            config.oracle_params(subscription_id),
            clock,
        )
        .with_metrics(metrics.clone())
        .with_stale_recovery(config.request_timeout_secs, config.admin_token.clone()),
    );

    // Background: log every raffle notification.
    tokio::spawn(log_events(service.events().subscribe()));

    // Background: consume requests and deliver random words.
    let fulfiller_config = config.clone();
    let fulfiller_service = service.clone();
    let fulfiller_pending = pending_count.clone();
    let fulfiller_metrics = metrics.clone();
    tokio::spawn(async move {
        fulfiller::run_fulfiller(
            fulfiller_config,
            fulfiller_service,
            rx,
            fulfiller_pending,
            fulfiller_metrics,
        )
        .await;
    });

    // Background: trigger upkeep when it is due.
    let keeper_service = service.clone();
    let poll = Duration::from_millis(config.keeper_poll_ms.max(1));
    tokio::spawn(async move {
        keeper::run_keeper(keeper_service, poll).await;
    });

    let state = web::Data::new(AppState {
        service,
        pending_count,
        metrics,
    });

    let addr = ("0.0.0.0", config.http_port);
    info!(addr = %format!("{}:{}", addr.0, addr.1), "Starting HTTP server");

    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::configure))
        .bind(addr)?
        .run()
        .await?;

    Ok(())
}
