//! Raffle notifications and the in-process bus that carries them.
//!
//! Events are fire-and-forget: the core publishes them and never reads them
//! back. External monitors subscribe through [`EventBus::subscribe`].

use solana_sdk::pubkey::Pubkey;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Capacity of the broadcast ring buffer. Slow subscribers skip events.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Notifications emitted by the raffle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaffleEvent {
    /// Emitted when a participant's entry is accepted.
    Entered { player: Pubkey, amount: u64 },
    /// Emitted when settlement begins and a randomness request was accepted.
    SettlementRequested { request_id: u64 },
    /// Emitted when a winner has been picked and paid.
    WinnerPicked {
        winner: Pubkey,
        prize: u64,
        request_id: u64,
    },
}

impl RaffleEvent {
    /// Event name as exposed to monitors.
    pub fn name(&self) -> &'static str {
        match self {
            RaffleEvent::Entered { .. } => "Entered",
            RaffleEvent::SettlementRequested { .. } => "SettlementRequested",
            RaffleEvent::WinnerPicked { .. } => "WinnerPicked",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RaffleEvent::Entered { player, amount } => serde_json::json!({
                "event": self.name(),
                "player": player.to_string(),
                "amount": amount,
            }),
            RaffleEvent::SettlementRequested { request_id } => serde_json::json!({
                "event": self.name(),
                "request_id": request_id,
            }),
            RaffleEvent::WinnerPicked {
                winner,
                prize,
                request_id,
            } => serde_json::json!({
                "event": self.name(),
                "winner": winner.to_string(),
                "prize": prize,
                "request_id": request_id,
            }),
        }
    }
}

/// Broadcast bus for [`RaffleEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RaffleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: RaffleEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RaffleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Log every event seen on the bus until it is closed.
pub async fn log_events(mut rx: broadcast::Receiver<RaffleEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match &event {
                RaffleEvent::Entered { player, amount } => {
                    info!(player = %player, amount, "Entered");
                }
                RaffleEvent::SettlementRequested { request_id } => {
                    info!(request_id, "SettlementRequested");
                }
                RaffleEvent::WinnerPicked {
                    winner,
                    prize,
                    request_id,
                } => {
                    info!(winner = %winner, prize, request_id, "WinnerPicked");
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event monitor lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("Event bus closed, stopping monitor");
                return;
            }
        }
    }
}
