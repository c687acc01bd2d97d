//! The raffle state machine.
//!
//! ```text
//!            enter*            perform_upkeep
//!   ┌──────┐ ─────► ┌──────┐ ─────────────────► ┌─────────────┐
//!   │ OPEN │        │ OPEN │                    │ CALCULATING │
//!   └──────┘ ◄───── └──────┘ ◄───────────────── └─────────────┘
//!                             settle (matching id, payout ok)
//! ```
//!
//! [`Raffle`] is plain data plus transitions. It never blocks, never talks to
//! the payout channel and never emits events; [`crate::service::RaffleService`]
//! wraps it in a mutex and wires those collaborators in.

use solana_sdk::pubkey::Pubkey;

use crate::coordinator::{OracleParams, RandomnessCoordinator};
use crate::errors::RaffleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaffleState {
    /// Accepting entries; upkeep may be triggered.
    Open,
    /// Locked while waiting for randomness.
    Calculating,
}

impl RaffleState {
    /// Numeric code used in diagnostics: 0 = open, 1 = calculating.
    pub fn code(self) -> u8 {
        match self {
            RaffleState::Open => 0,
            RaffleState::Calculating => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RaffleState::Open => "OPEN",
            RaffleState::Calculating => "CALCULATING",
        }
    }
}

/// The four values the upkeep predicate is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpkeepDiagnostics {
    pub state: RaffleState,
    /// Seconds since the last settlement.
    pub elapsed: i64,
    pub player_count: u64,
    pub pool_balance: u64,
}

/// Result of [`Raffle::check_upkeep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpkeepCheck {
    pub needed: bool,
    pub diagnostics: UpkeepDiagnostics,
}

impl UpkeepCheck {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "upkeep_needed": self.needed,
            "state": self.diagnostics.state.as_str(),
            "elapsed_secs": self.diagnostics.elapsed,
            "players": self.diagnostics.player_count,
            "pool_balance": self.diagnostics.pool_balance,
        })
    }
}

/// Round fields captured right before a reset.
#[derive(Debug, Clone)]
struct RoundSnapshot {
    players: Vec<Pubkey>,
    pool_balance: u64,
    last_timestamp: i64,
    recent_winner: Option<Pubkey>,
    pending_request_id: Option<u64>,
    requested_at: Option<i64>,
    unresolved_payout: Option<UnresolvedPayout>,
}

/// A delivery whose payout may or may not have landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnresolvedPayout {
    pub request_id: u64,
    pub random_value: u64,
}

/// A round closed by [`Raffle::settle`] whose prize has not been paid yet.
///
/// Hand it back to [`Raffle::restore`] if the payout fails.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub request_id: u64,
    pub winner: Pubkey,
    pub winner_index: usize,
    /// Pool balance captured before the reset.
    pub prize: u64,
    pub random_value: u64,
    snapshot: RoundSnapshot,
}

/// Raffle state. One instance per service.
#[derive(Debug, Clone)]
pub struct Raffle {
    entrance_fee: u64,
    interval: u64,
    state: RaffleState,
    last_timestamp: i64,
    players: Vec<Pubkey>,
    pool_balance: u64,
    recent_winner: Option<Pubkey>,
    /// `Some` exactly while `state == Calculating`.
    pending_request_id: Option<u64>,
    requested_at: Option<i64>,
    /// Set while a payout for the pending request has an unknown outcome.
    unresolved_payout: Option<UnresolvedPayout>,
}

impl Raffle {
    /// Create an open raffle with no players.
    pub fn new(entrance_fee: u64, interval: u64, now: i64) -> Result<Self, RaffleError> {
        if entrance_fee == 0 {
            return Err(RaffleError::InvalidConfig("entrance fee must be positive"));
        }
        if interval == 0 {
            return Err(RaffleError::InvalidConfig("interval must be positive"));
        }
        Ok(Self {
            entrance_fee,
            interval,
            state: RaffleState::Open,
            last_timestamp: now,
            players: Vec::new(),
            pool_balance: 0,
            recent_winner: None,
            pending_request_id: None,
            requested_at: None,
            unresolved_payout: None,
        })
    }

    /// Add an entry for `player`. The same player may enter any number of times.
    pub fn enter(&mut self, player: Pubkey, amount: u64) -> Result<(), RaffleError> {
        if amount < self.entrance_fee {
            return Err(RaffleError::NotEnoughFunds {
                paid: amount,
                required: self.entrance_fee,
            });
        }
        if self.state != RaffleState::Open {
            return Err(RaffleError::RaffleNotOpen);
        }
        let pool_balance = self
            .pool_balance
            .checked_add(amount)
            .ok_or(RaffleError::BalanceOverflow)?;

        self.players.push(player);
        self.pool_balance = pool_balance;
        Ok(())
    }

    /// Whether settlement should begin at `now`.
    pub fn check_upkeep(&self, now: i64) -> UpkeepCheck {
        let elapsed = now.saturating_sub(self.last_timestamp);

        let is_open = self.state == RaffleState::Open;
        let time_passed = u64::try_from(elapsed).is_ok_and(|e| e >= self.interval);
        let has_players = !self.players.is_empty();
        let has_balance = self.pool_balance > 0;

        UpkeepCheck {
            needed: is_open && time_passed && has_players && has_balance,
            diagnostics: UpkeepDiagnostics {
                state: self.state,
                elapsed,
                player_count: self.players.len() as u64,
                pool_balance: self.pool_balance,
            },
        }
    }

    /// Lock the pool and request randomness.
    ///
    /// The predicate is re-derived here regardless of what the caller saw.
    /// The state only moves to `Calculating` once the coordinator accepted the
    /// request.
    pub fn perform_upkeep(
        &mut self,
        now: i64,
        coordinator: &dyn RandomnessCoordinator,
        params: &OracleParams,
    ) -> Result<u64, RaffleError> {
        let check = self.check_upkeep(now);
        if !check.needed {
            return Err(RaffleError::UpkeepNotNeeded {
                balance: check.diagnostics.pool_balance,
                players: check.diagnostics.player_count,
                state: check.diagnostics.state.code(),
            });
        }

        let request_id = coordinator.request_random_words(params)?;

        self.state = RaffleState::Calculating;
        self.pending_request_id = Some(request_id);
        self.requested_at = Some(now);
        Ok(request_id)
    }

    /// Replace a pending request that has been outstanding for at least
    /// `timeout` seconds with a fresh one. The raffle stays `Calculating`.
    pub fn rerequest(
        &mut self,
        now: i64,
        timeout: u64,
        coordinator: &dyn RandomnessCoordinator,
        params: &OracleParams,
    ) -> Result<u64, RaffleError> {
        let (Some(_), Some(requested_at)) = (self.pending_request_id, self.requested_at) else {
            return Err(RaffleError::NoPendingRequest);
        };
        // A fresh request could pick another winner while the first payout lands.
        if let Some(unresolved) = self.unresolved_payout {
            return Err(RaffleError::PayoutUnresolved(unresolved.request_id));
        }
        let elapsed = now.saturating_sub(requested_at).max(0) as u64;
        if elapsed < timeout {
            return Err(RaffleError::RequestNotStale { elapsed, timeout });
        }

        let request_id = coordinator.request_random_words(params)?;

        self.pending_request_id = Some(request_id);
        self.requested_at = Some(now);
        Ok(request_id)
    }

    /// Consume the randomness for the outstanding request: pick the winner,
    /// reset the round and reopen.
    ///
    /// The prize is not paid here. The caller pays `settlement.prize` to
    /// `settlement.winner` and calls [`Raffle::restore`] if that fails.
    pub fn settle(
        &mut self,
        request_id: u64,
        random_value: u64,
        now: i64,
    ) -> Result<Settlement, RaffleError> {
        if self.pending_request_id != Some(request_id) || self.players.is_empty() {
            return Err(RaffleError::UnknownRequest(request_id));
        }

        let winner_index = (random_value % self.players.len() as u64) as usize;
        let winner = self.players[winner_index];

        let snapshot = RoundSnapshot {
            players: std::mem::take(&mut self.players),
            pool_balance: self.pool_balance,
            last_timestamp: self.last_timestamp,
            recent_winner: self.recent_winner,
            pending_request_id: self.pending_request_id,
            requested_at: self.requested_at,
            unresolved_payout: self.unresolved_payout,
        };

        self.recent_winner = Some(winner);
        self.pool_balance = 0;
        self.last_timestamp = now;
        self.state = RaffleState::Open;
        self.pending_request_id = None;
        self.requested_at = None;
        self.unresolved_payout = None;

        Ok(Settlement {
            request_id,
            winner,
            winner_index,
            prize: snapshot.pool_balance,
            random_value,
            snapshot,
        })
    }

    /// Undo a [`Settlement`] whose payout failed. The raffle returns to
    /// `Calculating` with the same pending request.
    pub fn restore(&mut self, settlement: Settlement) {
        let snapshot = settlement.snapshot;
        self.players = snapshot.players;
        self.pool_balance = snapshot.pool_balance;
        self.last_timestamp = snapshot.last_timestamp;
        self.recent_winner = snapshot.recent_winner;
        self.pending_request_id = snapshot.pending_request_id;
        self.requested_at = snapshot.requested_at;
        self.unresolved_payout = snapshot.unresolved_payout;
        self.state = RaffleState::Calculating;
    }

    /// Undo a [`Settlement`] whose payout outcome is unknown and remember the
    /// delivery so it can be replayed once the transfer status is known.
    /// Re-requests are refused until then.
    pub fn restore_unresolved(&mut self, settlement: Settlement) {
        let unresolved = UnresolvedPayout {
            request_id: settlement.request_id,
            random_value: settlement.random_value,
        };
        self.restore(settlement);
        self.unresolved_payout = Some(unresolved);
    }

    pub fn entrance_fee(&self) -> u64 {
        self.entrance_fee
    }

    /// Minimum seconds between settlements.
    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn state(&self) -> RaffleState {
        self.state
    }

    pub fn last_timestamp(&self) -> i64 {
        self.last_timestamp
    }

    pub fn players(&self) -> &[Pubkey] {
        &self.players
    }

    pub fn player(&self, index: usize) -> Option<Pubkey> {
        self.players.get(index).copied()
    }

    pub fn number_of_players(&self) -> usize {
        self.players.len()
    }

    pub fn pool_balance(&self) -> u64 {
        self.pool_balance
    }

    pub fn recent_winner(&self) -> Option<Pubkey> {
        self.recent_winner
    }

    pub fn pending_request_id(&self) -> Option<u64> {
        self.pending_request_id
    }

    pub fn requested_at(&self) -> Option<i64> {
        self.requested_at
    }

    pub fn unresolved_payout(&self) -> Option<UnresolvedPayout> {
        self.unresolved_payout
    }

    /// Every accessor in one JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state.as_str(),
            "entrance_fee": self.entrance_fee,
            "interval_secs": self.interval,
            "last_timestamp": self.last_timestamp,
            "number_of_players": self.players.len(),
            "players": self.players.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            "pool_balance": self.pool_balance,
            "recent_winner": self.recent_winner.map(|w| w.to_string()),
            "pending_request_id": self.pending_request_id,
            "requested_at": self.requested_at,
            "unresolved_payout_request_id": self.unresolved_payout.map(|u| u.request_id),
        })
    }
}
