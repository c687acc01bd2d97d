//! HTTP surface of the raffle backend.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;

use crate::errors::RaffleError;
use crate::metrics::Metrics;
use crate::service::RaffleService;

/// Header carrying the administrative token.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Shared application state accessible from HTTP handlers.
pub struct AppState {
    pub service: Arc<RaffleService>,
    /// Number of fulfillments currently in-flight.
    pub pending_count: Arc<AtomicU64>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
struct EnterRequest {
    participant: String,
    amount: u64,
}

/// Register every route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/status", web::get().to(status))
        .route("/metrics", web::get().to(metrics))
        .route("/raffle", web::get().to(raffle))
        .route("/raffle/players/{index}", web::get().to(player))
        .route("/enter", web::post().to(enter))
        .route("/upkeep", web::get().to(check_upkeep))
        .route("/upkeep", web::post().to(perform_upkeep))
        .route("/admin/rerequest", web::post().to(rerequest))
        .route("/admin/retry-payout", web::post().to(retry_payout));
}

fn error_response(err: &RaffleError) -> HttpResponse {
    let status = match err {
        RaffleError::NotEnoughFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        RaffleError::RaffleNotOpen
        | RaffleError::UpkeepNotNeeded { .. }
        | RaffleError::RequestNotStale { .. }
        | RaffleError::NoPendingRequest
        | RaffleError::PayoutUnresolved(_)
        | RaffleError::NoUnresolvedPayout => StatusCode::CONFLICT,
        RaffleError::UnknownRequest(_) => StatusCode::NOT_FOUND,
        RaffleError::RandomnessRequestFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        RaffleError::PayoutFailed(_) => StatusCode::BAD_GATEWAY,
        RaffleError::PayoutUnconfirmed(_) => StatusCode::GATEWAY_TIMEOUT,
        RaffleError::Unauthorized => StatusCode::UNAUTHORIZED,
        RaffleError::EmptyRandomness | RaffleError::BalanceOverflow => StatusCode::BAD_REQUEST,
        RaffleError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let mut body = serde_json::json!({ "error": err.to_string() });
    if let RaffleError::UpkeepNotNeeded {
        balance,
        players,
        state,
    } = err
    {
        body["balance"] = (*balance).into();
        body["players"] = (*players).into();
        body["state"] = (*state).into();
    }
    HttpResponse::build(status).json(body)
}

/// Liveness probe.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Readiness probe: raffle state and in-flight fulfillments.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    let pending = data.pending_count.load(Ordering::Relaxed);
    let raffle = data.service.snapshot();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "raffle_state": raffle.state().as_str(),
        "pending_fulfillments": pending
    }))
}

async fn metrics(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.metrics.to_json())
}

async fn raffle(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.service.snapshot_json())
}

async fn player(data: web::Data<AppState>, path: web::Path<usize>) -> HttpResponse {
    let index = path.into_inner();
    match data.service.player(index) {
        Some(player) => HttpResponse::Ok().json(serde_json::json!({
            "index": index,
            "player": player.to_string(),
        })),
        None => HttpResponse::NotFound().json(serde_json::json!({
            "error": format!("no player at index {index}"),
        })),
    }
}

async fn enter(data: web::Data<AppState>, body: web::Json<EnterRequest>) -> HttpResponse {
    let Ok(participant) = Pubkey::from_str(&body.participant) else {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": format!("invalid participant: {}", body.participant),
        }));
    };

    match data.service.enter(participant, body.amount).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "participant": participant.to_string(),
            "amount": body.amount,
        })),
        Err(e) => error_response(&e),
    }
}

async fn check_upkeep(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.service.check_upkeep().to_json())
}

async fn perform_upkeep(data: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    match data.service.perform_upkeep(&body).await {
        Ok(request_id) => HttpResponse::Ok().json(serde_json::json!({ "request_id": request_id })),
        Err(e) => error_response(&e),
    }
}

fn admin_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
}

async fn rerequest(data: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    match data.service.rerequest_randomness(admin_token(&req)).await {
        Ok(request_id) => HttpResponse::Ok().json(serde_json::json!({ "request_id": request_id })),
        Err(e) => error_response(&e),
    }
}

async fn retry_payout(data: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    match data.service.retry_payout(admin_token(&req)).await {
        Ok(result) => HttpResponse::Ok().json(serde_json::json!({
            "request_id": result.request_id,
            "winner": result.winner.to_string(),
            "prize": result.prize,
        })),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::coordinator::{OracleParams, RandomnessCoordinator};
    use crate::errors::CoordinatorError;
    use crate::payout::LedgerPayout;
    use crate::raffle::Raffle;
    use actix_web::{test, App};

    const START: i64 = 1_700_000_000;

    struct FixedCoordinator(u64);

    impl RandomnessCoordinator for FixedCoordinator {
        fn request_random_words(&self, _params: &OracleParams) -> Result<u64, CoordinatorError> {
            Ok(self.0)
        }
    }

    fn state(clock: Arc<ManualClock>) -> web::Data<AppState> {
        let metrics = Arc::new(Metrics::new());
        let service = RaffleService::new(
            Raffle::new(5, 60, START).unwrap(),
            Arc::new(FixedCoordinator(7)),
            Arc::new(LedgerPayout::new()),
            OracleParams {
                key_hash: [0u8; 32],
                subscription_id: 1,
                request_confirmations: 3,
                callback_gas_limit: 500_000,
                num_words: 1,
            },
            clock,
        )
        .with_metrics(metrics.clone())
        .with_stale_recovery(600, Some("letmein".into()));
        web::Data::new(AppState {
            service: Arc::new(service),
            pending_count: Arc::new(AtomicU64::new(0)),
            metrics,
        })
    }

    fn enter_body(n: u8, amount: u64) -> serde_json::Value {
        serde_json::json!({
            "participant": Pubkey::new_from_array([n; 32]).to_string(),
            "amount": amount,
        })
    }

    #[actix_web::test]
    async fn health_is_ok() {
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(ManualClock::new(START))))
                .configure(configure),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn enter_and_settle_over_http() {
        let clock = Arc::new(ManualClock::new(START));
        let app = test::init_service(App::new().app_data(state(clock.clone())).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/enter")
            .set_json(enter_body(1, 4))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);

        let req = test::TestRequest::post()
            .uri("/enter")
            .set_json(enter_body(1, 5))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::post().uri("/upkeep").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["players"], 1);
        assert_eq!(body["state"], 0);

        clock.advance(60);
        let req = test::TestRequest::get().uri("/upkeep").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["upkeep_needed"], true);

        let req = test::TestRequest::post().uri("/upkeep").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["request_id"], 7);

        let req = test::TestRequest::post()
            .uri("/enter")
            .set_json(enter_body(2, 5))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::get().uri("/raffle").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["state"], "CALCULATING");
        assert_eq!(body["pending_request_id"], 7);
        assert_eq!(body["pool_balance"], 5);
        assert_eq!(body["request_confirmations"], 3);
        assert_eq!(body["num_words"], 1);
    }

    #[actix_web::test]
    async fn player_lookup_and_bad_input() {
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(ManualClock::new(START))))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/enter")
            .set_json(enter_body(3, 5))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/raffle/players/0").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["player"], Pubkey::new_from_array([3u8; 32]).to_string());

        let req = test::TestRequest::get().uri("/raffle/players/1").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/enter")
            .set_json(serde_json::json!({"participant": "not-a-key", "amount": 5}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn rerequest_needs_token() {
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(ManualClock::new(START))))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post().uri("/admin/rerequest").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::post()
            .uri("/admin/rerequest")
            .insert_header((ADMIN_TOKEN_HEADER, "letmein"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn retry_payout_needs_token_and_unresolved_payout() {
        let app = test::init_service(
            App::new()
                .app_data(state(Arc::new(ManualClock::new(START))))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post().uri("/admin/retry-payout").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::post()
            .uri("/admin/retry-payout")
            .insert_header((ADMIN_TOKEN_HEADER, "letmein"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "no unresolved payout");
    }

    #[actix_web::test]
    async fn unknown_payout_outcomes_map_to_distinct_statuses() {
        assert_eq!(
            error_response(&RaffleError::PayoutUnconfirmed("timeout".into())).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            error_response(&RaffleError::PayoutUnresolved(7)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_response(&RaffleError::PayoutFailed("rejected".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
