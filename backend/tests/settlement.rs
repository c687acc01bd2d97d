//! End-to-end settlement through the local coordinator, the fulfiller and the
//! in-memory ledger.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use solana_sdk::pubkey::Pubkey;
use tokio::sync::mpsc;

use raffle_backend::clock::ManualClock;
use raffle_backend::config::AppConfig;
use raffle_backend::coordinator::LocalCoordinator;
use raffle_backend::events::RaffleEvent;
use raffle_backend::fulfiller::run_fulfiller;
use raffle_backend::keeper;
use raffle_backend::metrics::Metrics;
use raffle_backend::payout::LedgerPayout;
use raffle_backend::raffle::{Raffle, RaffleState};
use raffle_backend::service::RaffleService;
use raffle_backend::vrf::{compute_randomness, expand_words, word_to_u64};

const START: i64 = 1_700_000_000;

fn config() -> AppConfig {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("ORACLE_SECRET", "integration-secret"),
        ("ENTRANCE_FEE", "1"),
        ("INTERVAL_SECS", "60"),
        ("CONFIRMATION_DELAY_MS", "1"),
        ("INITIAL_RETRY_DELAY_MS", "1"),
        ("ORACLE_FEE_PER_WORD", "10"),
        ("SUBSCRIPTION_FUND", "100"),
    ]);
    AppConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
}

#[tokio::test]
async fn round_settles_through_fulfiller() {
    let config = config();
    let clock = Arc::new(ManualClock::new(START));
    let ledger = Arc::new(LedgerPayout::new());
    let metrics = Arc::new(Metrics::new());
    let (tx, rx) = mpsc::channel(16);

    let coordinator = Arc::new(LocalCoordinator::new(
        config.oracle_fee_per_word,
        config.max_num_words,
        tx,
    ));
    let subscription_id = coordinator
        .create_subscription(Pubkey::new_from_array([9u8; 32]))
        .unwrap();
    coordinator
        .fund_subscription(subscription_id, config.subscription_fund)
        .unwrap();

    let service = Arc::new(
        RaffleService::new(
            Raffle::new(config.entrance_fee, config.interval_secs, START).unwrap(),
            coordinator.clone(),
            ledger.clone(),
            config.oracle_params(subscription_id),
            clock.clone(),
        )
        .with_metrics(metrics.clone()),
    );
    let mut events = service.events().subscribe();

    tokio::spawn(run_fulfiller(
        config.clone(),
        service.clone(),
        rx,
        Arc::new(AtomicU64::new(0)),
        metrics.clone(),
    ));

    let players: Vec<Pubkey> = (1..=3u8).map(|n| Pubkey::new_from_array([n; 32])).collect();
    for player in &players {
        service.enter(*player, 1).await.unwrap();
    }

    assert_eq!(keeper::tick(&service).await, None);
    clock.advance(61);
    let request_id = keeper::tick(&service).await.unwrap();
    assert_eq!(request_id, 1);
    assert_eq!(coordinator.subscription(subscription_id).unwrap().balance, 90);

    let winner_event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event @ RaffleEvent::WinnerPicked { .. }) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event bus failed: {e}"),
            }
        }
    })
    .await
    .expect("winner was not picked in time");

    // The winner follows from the HMAC output for this request.
    let base = compute_randomness(
        &config.oracle_secret,
        &config.key_hash,
        subscription_id,
        request_id,
    );
    let words = expand_words(&base, config.num_words);
    let expected = players[(word_to_u64(&words[0]) % players.len() as u64) as usize];

    assert_eq!(
        winner_event,
        RaffleEvent::WinnerPicked {
            winner: expected,
            prize: 3,
            request_id,
        }
    );
    assert_eq!(ledger.balance_of(&expected), 3);

    let raffle = service.snapshot();
    assert_eq!(raffle.state(), RaffleState::Open);
    assert_eq!(raffle.number_of_players(), 0);
    assert_eq!(raffle.recent_winner(), Some(expected));
    assert_eq!(metrics.to_json()["rounds_settled"], 1);
}
