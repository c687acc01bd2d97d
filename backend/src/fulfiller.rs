//! Fulfillment engine: consumes queued randomness requests, produces the
//! random words and delivers them back to the raffle.
//!
//! For each request:
//! 1. Wait `request_confirmations * confirmation_delay_ms`.
//! 2. Compute the HMAC base output and expand it into `num_words` words.
//! 3. Deliver through [`RaffleService::fulfill_random_words`], retrying
//!    deliveries whose payout failed with exponential backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, instrument, warn};

use crate::config::AppConfig;
use crate::coordinator::PendingRequest;
use crate::errors::RaffleError;
use crate::metrics::Metrics;
use crate::service::{RaffleService, RoundResult};
use crate::vrf::{compute_randomness, expand_words};

/// Main fulfiller loop.
pub async fn run_fulfiller(
    config: AppConfig,
    service: Arc<RaffleService>,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending_count: Arc<AtomicU64>,
    metrics: Arc<Metrics>,
) {
    let semaphore = Arc::new(Semaphore::new(config.fulfillment_concurrency.max(1)));

    while let Some(request) = rx.recv().await {
        metrics.record_request();
        pending_count.fetch_add(1, Ordering::Relaxed);

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!("Semaphore closed, stopping fulfiller");
                break;
            }
        };
        let cfg = config.clone();
        let svc = service.clone();
        let pending = pending_count.clone();
        let met = metrics.clone();

        tokio::spawn(async move {
            let _permit = permit;

            info!(
                request_id = request.request_id,
                subscription_id = request.subscription_id,
                num_words = request.num_words,
                confirmations = request.request_confirmations,
                "Fulfilling randomness request"
            );

            match fulfill_request(&svc, &cfg, &request).await {
                Ok(result) => {
                    let latency_ms = request.requested_at.elapsed().as_millis() as u64;
                    met.record_fulfillment(latency_ms);
                    info!(
                        request_id = request.request_id,
                        winner = %result.winner,
                        prize = result.prize,
                        latency_ms,
                        "Fulfilled successfully"
                    );
                }
                Err(e) => handle_fulfillment_error(request.request_id, e, &met),
            }

            pending.fetch_sub(1, Ordering::Relaxed);
        });
    }

    info!("Fulfiller channel closed, shutting down");
}

fn handle_fulfillment_error(request_id: u64, error: RaffleError, metrics: &Metrics) {
    if let RaffleError::PayoutUnconfirmed(_) = error {
        metrics.record_failure();
        error!(
            request_id,
            error = %error,
            "Payout outcome unknown; POST /admin/retry-payout once the transfer status is known"
        );
    } else if !error.is_retryable() {
        warn!(
            request_id,
            reason = %error,
            "Skipping request (non-retryable)"
        );
    } else {
        metrics.record_failure();
        error!(
            request_id,
            error = %error,
            "Failed to fulfill"
        );
    }
}

/// Produce the words for `request` and deliver them.
#[instrument(skip_all, fields(request_id = request.request_id))]
async fn fulfill_request(
    service: &RaffleService,
    config: &AppConfig,
    request: &PendingRequest,
) -> Result<RoundResult, RaffleError> {
    let confirmation_wait = Duration::from_millis(config.confirmation_delay_ms)
        .saturating_mul(u32::from(request.request_confirmations));
    if !confirmation_wait.is_zero() {
        tokio::time::sleep(confirmation_wait).await;
    }

    let base = compute_randomness(
        &config.oracle_secret,
        &request.key_hash,
        request.subscription_id,
        request.request_id,
    );
    let words = expand_words(&base, request.num_words);

    deliver_with_retries(service, config, request.request_id, &words).await
}

/// Deliver words with exponential backoff on retryable failures.
async fn deliver_with_retries(
    service: &RaffleService,
    config: &AppConfig,
    request_id: u64,
    words: &[[u8; 32]],
) -> Result<RoundResult, RaffleError> {
    let mut retry_delay = Duration::from_millis(config.initial_retry_delay_ms);
    let mut attempt = 1;

    loop {
        match service.fulfill_random_words(request_id, words).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                warn!(
                    attempt,
                    delay = ?retry_delay,
                    error = %e,
                    "Delivery failed, retrying"
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay = retry_delay.saturating_mul(2).min(Duration::from_secs(60));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
