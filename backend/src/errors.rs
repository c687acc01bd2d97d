use thiserror::Error;

/// Errors returned by the raffle state machine and the service around it.
///
/// Every variant is surfaced to the immediate caller. None of them leave the
/// raffle in a partially mutated state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaffleError {
    /// The amount attached to an entry is below the entrance fee.
    #[error("not enough funds: paid {paid}, entrance fee is {required}")]
    NotEnoughFunds { paid: u64, required: u64 },
    /// Entry attempted while a round is being settled.
    #[error("raffle is not open")]
    RaffleNotOpen,
    /// `perform_upkeep` was called while the upkeep predicate is false.
    #[error("upkeep not needed (balance={balance}, players={players}, state={state})")]
    UpkeepNotNeeded { balance: u64, players: u64, state: u8 },
    /// Randomness delivered for a request that is not the outstanding one.
    #[error("unknown randomness request {0}")]
    UnknownRequest(u64),
    /// The winner could not be paid; the round was restored.
    #[error("payout to winner failed: {0}")]
    PayoutFailed(String),
    /// The transfer may have landed; the round was restored and the delivery
    /// must be replayed through [`crate::service::RaffleService::retry_payout`].
    #[error("payout outcome unknown: {0}")]
    PayoutUnconfirmed(String),
    /// A payout for this request has an unknown outcome.
    #[error("payout for request {0} is unresolved")]
    PayoutUnresolved(u64),
    /// A payout retry was requested while no payout is unresolved.
    #[error("no unresolved payout")]
    NoUnresolvedPayout,
    /// The coordinator refused the randomness request.
    #[error("randomness request rejected: {0}")]
    RandomnessRequestFailed(String),
    /// A delivery carried no random words.
    #[error("randomness delivery contained no words")]
    EmptyRandomness,
    /// The pool balance would overflow u64.
    #[error("pool balance overflow")]
    BalanceOverflow,
    /// Creation parameters are invalid.
    #[error("invalid raffle configuration: {0}")]
    InvalidConfig(&'static str),
    /// A re-request was attempted while no request is outstanding.
    #[error("no randomness request is pending")]
    NoPendingRequest,
    /// A re-request was attempted before the outstanding one timed out.
    #[error("pending request is not stale yet ({elapsed}s elapsed, timeout {timeout}s)")]
    RequestNotStale { elapsed: u64, timeout: u64 },
    /// Missing or wrong administrative token.
    #[error("unauthorized")]
    Unauthorized,
}

impl RaffleError {
    /// Whether a randomness delivery that failed with this error may succeed
    /// if delivered again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RaffleError::PayoutFailed(_))
    }
}

/// Errors returned by a randomness coordinator when a request is submitted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// No subscription with the given id exists.
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
    /// The subscription cannot cover the request fee.
    #[error("insufficient subscription balance: have {balance}, need {required}")]
    InsufficientBalance { balance: u64, required: u64 },
    /// `num_words` is zero or above the coordinator limit.
    #[error("num_words {requested} out of range (max {max})")]
    NumWordsOutOfRange { requested: u32, max: u32 },
    /// The fulfillment queue is full or its consumer has stopped.
    #[error("fulfillment queue unavailable")]
    QueueUnavailable,
    /// A counter would overflow u64 (practically unreachable).
    #[error("counter overflow")]
    CounterOverflow,
}

/// Errors returned by a payout channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayoutError {
    /// The transfer is known not to have landed.
    #[error("transfer rejected: {0}")]
    Rejected(String),
    /// The transfer was submitted but its outcome is unknown.
    #[error("transfer unconfirmed: {0}")]
    Unconfirmed(String),
}

impl From<PayoutError> for RaffleError {
    fn from(e: PayoutError) -> Self {
        match e {
            PayoutError::Rejected(reason) => RaffleError::PayoutFailed(reason),
            PayoutError::Unconfirmed(reason) => RaffleError::PayoutUnconfirmed(reason),
        }
    }
}

impl From<CoordinatorError> for RaffleError {
    fn from(e: CoordinatorError) -> Self {
        RaffleError::RandomnessRequestFailed(e.to_string())
    }
}
