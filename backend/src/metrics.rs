//! Prometheus-style metrics for the raffle backend.
//!
//! All counters are backed by atomics for lock-free concurrent access.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated metrics for the raffle backend.
///
/// Thread-safe via atomics; shared via `Arc<Metrics>`.
pub struct Metrics {
    /// Entries accepted into a round.
    pub entries_accepted: AtomicU64,
    /// Entries rejected (fee too low, raffle locked, overflow).
    pub entries_rejected: AtomicU64,
    /// Upkeeps that locked a round and issued a randomness request.
    pub upkeeps_performed: AtomicU64,
    /// Upkeep attempts rejected by the predicate or the coordinator.
    pub upkeeps_rejected: AtomicU64,

    // Fulfiller
    /// Randomness requests picked up by the fulfiller.
    pub requests_received: AtomicU64,
    /// Requests whose delivery settled a round.
    pub requests_fulfilled: AtomicU64,
    /// Requests whose delivery failed after all retries.
    pub requests_failed: AtomicU64,
    /// Sum of fulfillment latencies in milliseconds (for computing average).
    pub fulfillment_latency_sum_ms: AtomicU64,
    /// Number of fulfilled requests contributing to latency sum.
    pub fulfillment_count: AtomicU64,

    // Settlement
    /// Rounds closed with a paid winner.
    pub rounds_settled: AtomicU64,
    /// Payout attempts that failed and rolled the round back.
    pub payout_failures: AtomicU64,
    /// Payouts whose outcome was unknown; each needs an operator retry.
    pub payouts_unconfirmed: AtomicU64,
    /// Deliveries rejected as unknown or empty.
    pub deliveries_rejected: AtomicU64,
    /// Lamports paid to winners.
    pub total_paid_out: AtomicU64,
}

impl Metrics {
    /// Create a new zeroed metrics instance.
    pub fn new() -> Self {
        Self {
            entries_accepted: AtomicU64::new(0),
            entries_rejected: AtomicU64::new(0),
            upkeeps_performed: AtomicU64::new(0),
            upkeeps_rejected: AtomicU64::new(0),
            requests_received: AtomicU64::new(0),
            requests_fulfilled: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            fulfillment_latency_sum_ms: AtomicU64::new(0),
            fulfillment_count: AtomicU64::new(0),
            rounds_settled: AtomicU64::new(0),
            payout_failures: AtomicU64::new(0),
            payouts_unconfirmed: AtomicU64::new(0),
            deliveries_rejected: AtomicU64::new(0),
            total_paid_out: AtomicU64::new(0),
        }
    }

    pub fn record_entry(&self, accepted: bool) {
        let counter = if accepted {
            &self.entries_accepted
        } else {
            &self.entries_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upkeep(&self, performed: bool) {
        let counter = if performed {
            &self.upkeeps_performed
        } else {
            &self.upkeeps_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new request received by the fulfiller.
    pub fn record_request(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful fulfillment with its latency.
    pub fn record_fulfillment(&self, latency_ms: u64) {
        self.requests_fulfilled.fetch_add(1, Ordering::Relaxed);
        self.fulfillment_latency_sum_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        self.fulfillment_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed fulfillment.
    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a settled round and the prize paid.
    pub fn record_settlement(&self, prize: u64) {
        self.rounds_settled.fetch_add(1, Ordering::Relaxed);
        self.total_paid_out.fetch_add(prize, Ordering::Relaxed);
    }

    pub fn record_payout_failure(&self) {
        self.payout_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_payout_unconfirmed(&self) {
        self.payouts_unconfirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_delivery(&self) {
        self.deliveries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Compute average fulfillment latency in milliseconds, or 0 if none.
    pub fn avg_latency_ms(&self) -> u64 {
        let count = self.fulfillment_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.fulfillment_latency_sum_ms.load(Ordering::Relaxed) / count
    }

    /// Serialize metrics as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "entries_accepted": self.entries_accepted.load(Ordering::Relaxed),
            "entries_rejected": self.entries_rejected.load(Ordering::Relaxed),
            "upkeeps_performed": self.upkeeps_performed.load(Ordering::Relaxed),
            "upkeeps_rejected": self.upkeeps_rejected.load(Ordering::Relaxed),
            "requests_received": self.requests_received.load(Ordering::Relaxed),
            "requests_fulfilled": self.requests_fulfilled.load(Ordering::Relaxed),
            "requests_failed": self.requests_failed.load(Ordering::Relaxed),
            "avg_fulfillment_latency_ms": self.avg_latency_ms(),
            "total_fulfillment_latency_ms": self.fulfillment_latency_sum_ms.load(Ordering::Relaxed),
            "fulfillment_count": self.fulfillment_count.load(Ordering::Relaxed),
            "rounds_settled": self.rounds_settled.load(Ordering::Relaxed),
            "payout_failures": self.payout_failures.load(Ordering::Relaxed),
            "payouts_unconfirmed": self.payouts_unconfirmed.load(Ordering::Relaxed),
            "deliveries_rejected": self.deliveries_rejected.load(Ordering::Relaxed),
            "total_paid_out": self.total_paid_out.load(Ordering::Relaxed),
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_latency_ms(), 0);

        metrics.record_fulfillment(100);
        metrics.record_fulfillment(300);
        assert_eq!(metrics.avg_latency_ms(), 200);
        assert_eq!(metrics.requests_fulfilled.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn json_reflects_counters() {
        let metrics = Metrics::new();
        metrics.record_entry(true);
        metrics.record_entry(true);
        metrics.record_entry(false);
        metrics.record_upkeep(true);
        metrics.record_settlement(3);
        metrics.record_settlement(4);

        let json = metrics.to_json();
        assert_eq!(json["entries_accepted"], 2);
        assert_eq!(json["entries_rejected"], 1);
        assert_eq!(json["upkeeps_performed"], 1);
        assert_eq!(json["rounds_settled"], 2);
        assert_eq!(json["total_paid_out"], 7);
    }
}
