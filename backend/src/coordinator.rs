//! Randomness coordinator: the request side of the oracle.
//!
//! The raffle talks to the oracle through [`RandomnessCoordinator`]. Submission
//! is synchronous (accepted or rejected on the spot); fulfillment happens later
//! when the fulfiller delivers words back through the raffle service.
//!
//! [`LocalCoordinator`] keeps the coordinator bookkeeping in-process:
//!
//! - subscriptions hold a prepaid balance charged `fee_per_word * num_words`
//!   per request;
//! - request ids come from a monotonically increasing counter starting at 1;
//! - accepted requests are queued on an `mpsc` channel for the fulfiller.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use solana_sdk::pubkey::Pubkey;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::CoordinatorError;

/// Routing and budget information attached to every randomness request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleParams {
    /// Opaque key hash ("gas lane") selecting the oracle key.
    pub key_hash: [u8; 32],
    /// Subscription charged for the request.
    pub subscription_id: u64,
    /// Confirmations the oracle waits before fulfilling.
    pub request_confirmations: u16,
    /// Resource budget for the delivery callback.
    pub callback_gas_limit: u32,
    /// Number of random words requested.
    pub num_words: u32,
}

/// Request side of a randomness oracle.
pub trait RandomnessCoordinator: Send + Sync {
    /// Submit a request and return its correlation id.
    fn request_random_words(&self, params: &OracleParams) -> Result<u64, CoordinatorError>;
}

/// A request accepted by the coordinator, waiting for fulfillment.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: u64,
    pub subscription_id: u64,
    pub key_hash: [u8; 32],
    pub request_confirmations: u16,
    pub num_words: u32,
    pub requested_at: Instant,
}

/// A prepaid coordinator account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    pub owner: Pubkey,
    /// Balance available for request fees.
    pub balance: u64,
    /// Requests charged so far.
    pub req_count: u64,
}

struct CoordinatorState {
    /// Next request id to hand out.
    request_counter: u64,
    /// Next subscription id to hand out.
    subscription_counter: u64,
    subscriptions: HashMap<u64, Subscription>,
}

/// In-process coordinator feeding a fulfiller task.
pub struct LocalCoordinator {
    state: Mutex<CoordinatorState>,
    tx: mpsc::Sender<PendingRequest>,
    fee_per_word: u64,
    max_num_words: u32,
}

impl LocalCoordinator {
    pub fn new(fee_per_word: u64, max_num_words: u32, tx: mpsc::Sender<PendingRequest>) -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                request_counter: 1,
                subscription_counter: 1,
                subscriptions: HashMap::new(),
            }),
            tx,
            fee_per_word,
            max_num_words,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an empty subscription owned by `owner`.
    pub fn create_subscription(&self, owner: Pubkey) -> Result<u64, CoordinatorError> {
        let mut state = self.lock();
        let id = state.subscription_counter;
        state.subscription_counter = id
            .checked_add(1)
            .ok_or(CoordinatorError::CounterOverflow)?;
        state.subscriptions.insert(
            id,
            Subscription {
                id,
                owner,
                balance: 0,
                req_count: 0,
            },
        );
        info!(subscription_id = id, owner = %owner, "Subscription created");
        Ok(id)
    }

    /// Add `amount` to a subscription's balance and return the new balance.
    pub fn fund_subscription(&self, id: u64, amount: u64) -> Result<u64, CoordinatorError> {
        let mut state = self.lock();
        let subscription = state
            .subscriptions
            .get_mut(&id)
            .ok_or(CoordinatorError::UnknownSubscription(id))?;
        let old_balance = subscription.balance;
        subscription.balance = old_balance
            .checked_add(amount)
            .ok_or(CoordinatorError::CounterOverflow)?;
        info!(
            subscription_id = id,
            old_balance,
            new_balance = subscription.balance,
            "Subscription funded"
        );
        Ok(subscription.balance)
    }

    pub fn subscription(&self, id: u64) -> Option<Subscription> {
        self.lock().subscriptions.get(&id).cloned()
    }

    pub fn fee_per_word(&self) -> u64 {
        self.fee_per_word
    }
}

impl RandomnessCoordinator for LocalCoordinator {
    fn request_random_words(&self, params: &OracleParams) -> Result<u64, CoordinatorError> {
        if params.num_words == 0 || params.num_words > self.max_num_words {
            return Err(CoordinatorError::NumWordsOutOfRange {
                requested: params.num_words,
                max: self.max_num_words,
            });
        }

        let total_fee = self
            .fee_per_word
            .checked_mul(params.num_words as u64)
            .ok_or(CoordinatorError::CounterOverflow)?;

        let mut state = self.lock();
        let request_id = state.request_counter;
        let next_counter = request_id
            .checked_add(1)
            .ok_or(CoordinatorError::CounterOverflow)?;

        let subscription = state
            .subscriptions
            .get_mut(&params.subscription_id)
            .ok_or(CoordinatorError::UnknownSubscription(params.subscription_id))?;
        if subscription.balance < total_fee {
            return Err(CoordinatorError::InsufficientBalance {
                balance: subscription.balance,
                required: total_fee,
            });
        }

        // Queue first so a rejected send leaves the subscription untouched.
        self.tx
            .try_send(PendingRequest {
                request_id,
                subscription_id: params.subscription_id,
                key_hash: params.key_hash,
                request_confirmations: params.request_confirmations,
                num_words: params.num_words,
                requested_at: Instant::now(),
            })
            .map_err(|_| CoordinatorError::QueueUnavailable)?;

        subscription.balance -= total_fee;
        subscription.req_count += 1;
        state.request_counter = next_counter;

        debug!(
            request_id,
            subscription_id = params.subscription_id,
            num_words = params.num_words,
            fee = total_fee,
            "Randomness request queued"
        );
        Ok(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(subscription_id: u64) -> OracleParams {
        OracleParams {
            key_hash: [9u8; 32],
            subscription_id,
            request_confirmations: 3,
            callback_gas_limit: 500_000,
            num_words: 1,
        }
    }

    fn funded(fee_per_word: u64, fund: u64) -> (LocalCoordinator, u64, mpsc::Receiver<PendingRequest>) {
        let (tx, rx) = mpsc::channel(8);
        let coordinator = LocalCoordinator::new(fee_per_word, 10, tx);
        let sub = coordinator
            .create_subscription(Pubkey::new_from_array([1u8; 32]))
            .unwrap();
        coordinator.fund_subscription(sub, fund).unwrap();
        (coordinator, sub, rx)
    }

    #[test]
    fn request_ids_start_at_one_and_increase() {
        let (coordinator, sub, mut rx) = funded(0, 0);

        assert_eq!(coordinator.request_random_words(&params(sub)).unwrap(), 1);
        assert_eq!(coordinator.request_random_words(&params(sub)).unwrap(), 2);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.request_id, 1);
        assert_eq!(first.key_hash, [9u8; 32]);
        assert_eq!(rx.try_recv().unwrap().request_id, 2);
    }

    #[test]
    fn queued_request_carries_fulfillment_parameters() {
        let (coordinator, sub, mut rx) = funded(0, 0);
        let mut p = params(sub);
        p.num_words = 2;

        coordinator.request_random_words(&p).unwrap();

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.subscription_id, sub);
        assert_eq!(queued.request_confirmations, 3);
        assert_eq!(queued.num_words, 2);
    }

    #[test]
    fn fee_is_deducted_per_word() {
        let (coordinator, sub, _rx) = funded(10, 100);
        let mut p = params(sub);
        p.num_words = 3;

        coordinator.request_random_words(&p).unwrap();

        let subscription = coordinator.subscription(sub).unwrap();
        assert_eq!(subscription.balance, 70);
        assert_eq!(subscription.req_count, 1);
    }

    #[test]
    fn rejects_underfunded_subscription_without_consuming_an_id() {
        let (coordinator, sub, mut rx) = funded(50, 40);

        let err = coordinator.request_random_words(&params(sub)).unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::InsufficientBalance {
                balance: 40,
                required: 50
            }
        );
        assert!(rx.try_recv().is_err());

        coordinator.fund_subscription(sub, 10).unwrap();
        assert_eq!(coordinator.request_random_words(&params(sub)).unwrap(), 1);
    }

    #[test]
    fn rejects_unknown_subscription() {
        let (coordinator, _sub, _rx) = funded(0, 0);
        assert_eq!(
            coordinator.request_random_words(&params(42)).unwrap_err(),
            CoordinatorError::UnknownSubscription(42)
        );
        assert_eq!(
            coordinator.fund_subscription(42, 1).unwrap_err(),
            CoordinatorError::UnknownSubscription(42)
        );
    }

    #[test]
    fn rejects_num_words_out_of_range() {
        let (coordinator, sub, _rx) = funded(0, 0);
        let mut p = params(sub);
        p.num_words = 0;
        assert!(matches!(
            coordinator.request_random_words(&p),
            Err(CoordinatorError::NumWordsOutOfRange { requested: 0, .. })
        ));
        p.num_words = 11;
        assert!(matches!(
            coordinator.request_random_words(&p),
            Err(CoordinatorError::NumWordsOutOfRange { requested: 11, max: 10 })
        ));
    }

    #[test]
    fn closed_queue_rejects_and_keeps_balance() {
        let (coordinator, sub, rx) = funded(5, 5);
        drop(rx);

        assert_eq!(
            coordinator.request_random_words(&params(sub)).unwrap_err(),
            CoordinatorError::QueueUnavailable
        );
        assert_eq!(coordinator.subscription(sub).unwrap().balance, 5);
    }
}
