use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::db::models::ReferenceOdds;
use crate::db::{Database, Stats};
use crate::wager::risk::{RiskLedger, RiskState};
use crate::wager::scheduler::DeadlineScheduler;
use crate::wager::settlement::record_settlement;
use crate::wager::gateway::BoardLookup;
use crate::wager::OddsCache;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub risk: RiskLedger,
    pub scheduler: DeadlineScheduler,
    pub odds: OddsCache,
    /// Live board lookups (bet details, result posts)
    pub board: Arc<dyn BoardLookup>,
    pub dry_run: bool,
    /// Informational labels from the config
    pub match_type: String,
    pub strategy: String,
    pub lead_seconds: u64,
}

/// Build the Axum router for the status API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/bets", get(bets_handler))
        .route("/api/bets/:match_id", get(match_bets_handler))
        .route("/api/skipped", get(skipped_handler))
        .route("/api/bet-details/:match_id", get(bet_details_handler))
        .route("/api/results", get(results_handler))
        .route("/api/results/:tid", get(result_detail_handler))
        .route("/api/schedule", get(schedule_handler))
        .route(
            "/api/odds/:match_id",
            get(get_odds_handler)
                .put(put_odds_handler)
                .delete(delete_odds_handler),
        )
        .route("/api/settlements", post(settlement_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Serialize)]
struct StatusView {
    dry_run: bool,
    match_type: String,
    strategy: String,
    lead_seconds: u64,
    max_daily_bet_fraction: f64,
    stop_loss_fraction: f64,
    risk: RiskState,
    pending_timers: usize,
    reference_matches: usize,
    stats: Stats,
}

type ApiError = (StatusCode, String);

fn internal(e: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

fn upstream(e: anyhow::Error) -> ApiError {
    warn!("M-Team lookup failed: {:#}", e);
    (StatusCode::BAD_GATEWAY, format!("{:#}", e))
}

/// GET /api/status
async fn status_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.db.get_stats().map_err(internal)?;
    let limits = state.risk.limits();
    Ok(Json(StatusView {
        dry_run: state.dry_run,
        match_type: state.match_type.clone(),
        strategy: state.strategy.clone(),
        lead_seconds: state.lead_seconds,
        max_daily_bet_fraction: limits.max_daily_bet_fraction,
        stop_loss_fraction: limits.stop_loss_fraction,
        risk: state.risk.snapshot(),
        pending_timers: state.scheduler.pending_count(),
        reference_matches: state.odds.len().await,
        stats,
    }))
}

#[derive(Debug, Deserialize)]
struct Page {
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /api/bets?limit=50&offset=0
async fn bets_handler(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Page>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = page.limit.unwrap_or(50).clamp(1, 500);
    let offset = page.offset.unwrap_or(0).max(0);
    state
        .db
        .list_bet_records(limit, offset)
        .map(Json)
        .map_err(internal)
}

/// GET /api/bets/:match_id
async fn match_bets_handler(
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .list_bets_for_match(&match_id)
        .map(Json)
        .map_err(internal)
}

/// GET /api/skipped?limit=50&offset=0
async fn skipped_handler(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Page>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = page.limit.unwrap_or(50).clamp(1, 500);
    let offset = page.offset.unwrap_or(0).max(0);
    state
        .db
        .list_skipped_wagers(limit, offset)
        .map(Json)
        .map_err(internal)
}

/// GET /api/bet-details/:match_id (every user's wagers, from the board)
async fn bet_details_handler(
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .board
        .fetch_bet_details(&match_id)
        .await
        .map(Json)
        .map_err(upstream)
}

#[derive(Debug, Deserialize)]
struct PostPage {
    page: Option<u32>,
    size: Option<u32>,
}

/// GET /api/results?page=1&size=20
async fn results_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PostPage>,
) -> Result<impl IntoResponse, ApiError> {
    let page = q.page.unwrap_or(1).max(1);
    let size = q.size.unwrap_or(20).clamp(1, 100);
    state
        .board
        .fetch_result_posts(page, size)
        .await
        .map(Json)
        .map_err(upstream)
}

/// GET /api/results/:tid
async fn result_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(tid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .board
        .fetch_post_detail(&tid)
        .await
        .map(Json)
        .map_err(upstream)
}

/// GET /api/schedule
async fn schedule_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scheduler.snapshot())
}

/// GET /api/odds/:match_id
async fn get_odds_handler(
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<String>,
) -> impl IntoResponse {
    Json(state.odds.fetch_reference_odds(&match_id).await)
}

#[derive(Serialize)]
struct OddsUpdated {
    match_id: String,
    kept: usize,
}

/// PUT /api/odds/:match_id with `{"<option text>": 1.85, ...}`
async fn put_odds_handler(
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<String>,
    Json(odds): Json<ReferenceOdds>,
) -> Result<impl IntoResponse, ApiError> {
    let kept = state.odds.upsert(&match_id, odds).await;
    state.odds.save_file().await.map_err(internal)?;
    info!("Reference odds for {} replaced ({} entries)", match_id, kept);
    Ok(Json(OddsUpdated { match_id, kept }))
}

/// DELETE /api/odds/:match_id
async fn delete_odds_handler(
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.odds.remove(&match_id).await {
        return Err((StatusCode::NOT_FOUND, format!("No reference odds for {}", match_id)));
    }
    state.odds.save_file().await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct SettlementRequest {
    match_id: String,
    option_id: String,
    payout: f64,
}

/// POST /api/settlements
async fn settlement_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SettlementRequest>,
) -> Result<impl IntoResponse, ApiError> {
    match record_settlement(&state.db, &state.risk, &req.match_id, &req.option_id, req.payout) {
        Ok(Some(s)) => Ok((StatusCode::CREATED, Json(s))),
        Ok(None) => Err((
            StatusCode::CONFLICT,
            format!("Wager {}/{} already settled", req.match_id, req.option_id),
        )),
        Err(e) => Err((StatusCode::BAD_REQUEST, format!("{:#}", e))),
    }
}
