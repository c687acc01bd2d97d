//! The raffle service: the [`Raffle`] behind a lock, plus its collaborators.
//!
//! Every mutating call holds the lock for its whole duration, including the
//! coordinator request and the payout transfer, so transitions never
//! interleave. Each committed transition is published to a `watch` view and
//! reads are served from that view, so a slow payout never stalls them.

use std::sync::Arc;

use solana_sdk::pubkey::Pubkey;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::coordinator::{OracleParams, RandomnessCoordinator};
use crate::errors::{PayoutError, RaffleError};
use crate::events::{EventBus, RaffleEvent};
use crate::metrics::Metrics;
use crate::payout::PayoutChannel;
use crate::raffle::{Raffle, UpkeepCheck};
use crate::vrf::word_to_u64;

/// Default seconds before a pending request counts as stale.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Outcome of a settled round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundResult {
    pub request_id: u64,
    pub winner: Pubkey,
    pub winner_index: usize,
    pub prize: u64,
}

/// A pending request that has been outstanding for at least the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleRequest {
    pub request_id: u64,
    pub elapsed: u64,
}

pub struct RaffleService {
    raffle: Mutex<Raffle>,
    /// Last committed state.
    view: watch::Sender<Raffle>,
    coordinator: Arc<dyn RandomnessCoordinator>,
    payout: Arc<dyn PayoutChannel>,
    params: OracleParams,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Arc<Metrics>,
    request_timeout_secs: u64,
    admin_token: Option<String>,
}

impl RaffleService {
    pub fn new(
        raffle: Raffle,
        coordinator: Arc<dyn RandomnessCoordinator>,
        payout: Arc<dyn PayoutChannel>,
        params: OracleParams,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            view: watch::Sender::new(raffle.clone()),
            raffle: Mutex::new(raffle),
            coordinator,
            payout,
            params,
            clock,
            events: EventBus::new(),
            metrics: Arc::new(Metrics::new()),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            admin_token: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Enable the admin recovery calls guarded by `admin_token`.
    pub fn with_stale_recovery(mut self, timeout_secs: u64, admin_token: Option<String>) -> Self {
        self.request_timeout_secs = timeout_secs;
        self.admin_token = admin_token;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn params(&self) -> &OracleParams {
        &self.params
    }

    fn publish(&self, raffle: &Raffle) {
        self.view.send_replace(raffle.clone());
    }

    fn authorize(&self, admin_token: Option<&str>) -> Result<(), RaffleError> {
        match (self.admin_token.as_deref(), admin_token) {
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(RaffleError::Unauthorized),
        }
    }

    /// Add an entry for `participant` paying `amount`.
    pub async fn enter(&self, participant: Pubkey, amount: u64) -> Result<(), RaffleError> {
        let mut raffle = self.raffle.lock().await;
        let result = raffle.enter(participant, amount);
        self.metrics.record_entry(result.is_ok());

        match result {
            Ok(()) => {
                self.publish(&raffle);
                debug!(player = %participant, amount, players = raffle.number_of_players(), "Entry accepted");
                self.events.publish(RaffleEvent::Entered {
                    player: participant,
                    amount,
                });
                Ok(())
            }
            Err(e) => {
                debug!(player = %participant, amount, error = %e, "Entry rejected");
                Err(e)
            }
        }
    }

    pub fn check_upkeep(&self) -> UpkeepCheck {
        let now = self.clock.unix_timestamp();
        self.view.borrow().check_upkeep(now)
    }

    /// Begin settlement if the upkeep predicate holds. `check_data` is opaque.
    pub async fn perform_upkeep(&self, check_data: &[u8]) -> Result<u64, RaffleError> {
        debug!(check_data_len = check_data.len(), "perform_upkeep called");

        let mut raffle = self.raffle.lock().await;
        let now = self.clock.unix_timestamp();
        let result = raffle.perform_upkeep(now, self.coordinator.as_ref(), &self.params);
        self.metrics.record_upkeep(result.is_ok());

        let request_id = result?;
        self.publish(&raffle);
        info!(
            request_id,
            players = raffle.number_of_players(),
            pool_balance = raffle.pool_balance(),
            "Settlement requested"
        );
        self.events
            .publish(RaffleEvent::SettlementRequested { request_id });
        Ok(request_id)
    }

    /// Consume the randomness for `request_id`: pick, reset and pay.
    ///
    /// A rejected payout rolls the round back to `Calculating` with the same
    /// pending request, so the same delivery can be retried. A payout with an
    /// unknown outcome rolls back too, but the delivery is parked for
    /// [`RaffleService::retry_payout`] and re-requests are refused until it
    /// resolves.
    #[instrument(skip_all, fields(request_id = request_id))]
    pub async fn on_randomness_delivered(
        &self,
        request_id: u64,
        random_value: u64,
    ) -> Result<RoundResult, RaffleError> {
        let mut raffle = self.raffle.lock().await;
        let now = self.clock.unix_timestamp();

        let settlement = match raffle.settle(request_id, random_value, now) {
            Ok(settlement) => settlement,
            Err(e) => {
                self.metrics.record_rejected_delivery();
                warn!(error = %e, "Delivery rejected");
                return Err(e);
            }
        };
        let (winner, prize) = (settlement.winner, settlement.prize);

        match self.payout.transfer(request_id, winner, prize).await {
            Ok(()) => {}
            Err(PayoutError::Rejected(reason)) => {
                warn!(
                    winner = %winner,
                    prize,
                    reason = %reason,
                    "Payout failed, round restored"
                );
                raffle.restore(settlement);
                self.publish(&raffle);
                self.metrics.record_payout_failure();
                return Err(RaffleError::PayoutFailed(reason));
            }
            Err(PayoutError::Unconfirmed(reason)) => {
                error!(
                    winner = %winner,
                    prize,
                    reason = %reason,
                    "Payout outcome unknown, round held until the payout is retried"
                );
                raffle.restore_unresolved(settlement);
                self.publish(&raffle);
                self.metrics.record_payout_unconfirmed();
                return Err(RaffleError::PayoutUnconfirmed(reason));
            }
        }
        self.publish(&raffle);

        let result = RoundResult {
            request_id,
            winner,
            winner_index: settlement.winner_index,
            prize,
        };
        self.metrics.record_settlement(result.prize);
        info!(
            winner = %result.winner,
            winner_index = result.winner_index,
            prize = result.prize,
            "Winner picked"
        );
        self.events.publish(RaffleEvent::WinnerPicked {
            winner: result.winner,
            prize: result.prize,
            request_id,
        });
        Ok(result)
    }

    /// Oracle-facing delivery: the first 8 bytes of `words[0]`, little-endian,
    /// are the random value.
    pub async fn fulfill_random_words(
        &self,
        request_id: u64,
        words: &[[u8; 32]],
    ) -> Result<RoundResult, RaffleError> {
        let Some(first) = words.first() else {
            self.metrics.record_rejected_delivery();
            return Err(RaffleError::EmptyRandomness);
        };
        self.on_randomness_delivered(request_id, word_to_u64(first))
            .await
    }

    /// Replace a stale pending request with a fresh one.
    pub async fn rerequest_randomness(&self, admin_token: Option<&str>) -> Result<u64, RaffleError> {
        self.authorize(admin_token)?;

        let mut raffle = self.raffle.lock().await;
        let now = self.clock.unix_timestamp();
        let replaced = raffle.pending_request_id();
        let request_id = raffle.rerequest(
            now,
            self.request_timeout_secs,
            self.coordinator.as_ref(),
            &self.params,
        )?;
        self.publish(&raffle);

        warn!(
            replaced = ?replaced,
            request_id,
            "Stale randomness request replaced"
        );
        self.events
            .publish(RaffleEvent::SettlementRequested { request_id });
        Ok(request_id)
    }

    /// Replay the delivery whose payout outcome is unknown. The payout
    /// channel pays each request at most once, so the replay either confirms
    /// the earlier transfer or sends it again.
    pub async fn retry_payout(&self, admin_token: Option<&str>) -> Result<RoundResult, RaffleError> {
        self.authorize(admin_token)?;

        let unresolved = self
            .view
            .borrow()
            .unresolved_payout()
            .ok_or(RaffleError::NoUnresolvedPayout)?;
        warn!(
            request_id = unresolved.request_id,
            "Retrying unresolved payout"
        );
        self.on_randomness_delivered(unresolved.request_id, unresolved.random_value)
            .await
    }

    /// The pending request, if it has been outstanding for at least the timeout.
    pub fn stale_request(&self) -> Option<StaleRequest> {
        let raffle = self.view.borrow();
        let request_id = raffle.pending_request_id()?;
        let requested_at = raffle.requested_at()?;
        let elapsed = self
            .clock
            .unix_timestamp()
            .saturating_sub(requested_at)
            .max(0) as u64;
        (elapsed >= self.request_timeout_secs).then_some(StaleRequest {
            request_id,
            elapsed,
        })
    }

    /// A copy of the last committed raffle state.
    pub fn snapshot(&self) -> Raffle {
        self.view.borrow().clone()
    }

    /// The raffle snapshot JSON plus the oracle parameters used for requests.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let mut json = self.view.borrow().to_json();
        json["request_confirmations"] = self.params.request_confirmations.into();
        json["num_words"] = self.params.num_words.into();
        json
    }

    pub fn player(&self, index: usize) -> Option<Pubkey> {
        self.view.borrow().player(index)
    }
}
