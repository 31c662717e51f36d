//! REST API server for the finance companion core
//!
//! Exposes transaction creation, justification, progression, lessons,
//! happiness checks and badge evaluation via HTTP endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::badges::BadgeEngine;
use crate::error::{CompanionError, ErrorKind};
use crate::ledger::TransactionLedger;
use crate::models::{ExperienceEventType, Mood, NewTransaction};
use crate::progression::ProgressionLedger;
use crate::streak::StreakTracker;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct CreateTransactionRequest {
    pub user_id: Option<String>,
    pub merchant: String,
    pub amount: f64,
    pub category: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct JustificationRequest {
    pub justification: String,
}

#[derive(Debug, Deserialize)]
pub struct AwardXpRequest {
    pub event_type: String,
    pub amount: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct LessonReadRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HappinessRequest {
    pub mood: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub ledger: Arc<TransactionLedger>,
    pub progression: Arc<ProgressionLedger>,
    pub streak: Arc<StreakTracker>,
    pub badges: Arc<BadgeEngine>,
}

/// =============================
/// Helpers
/// =============================

/// HTTP status for a companion error.
pub fn status_for(error: &CompanionError) -> StatusCode {
    match error.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: CompanionError) -> (StatusCode, Json<ApiResponse>) {
    (status_for(&error), Json(ApiResponse::error(error.to_string())))
}

fn stable_uuid_from_string(input: &str) -> Uuid {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    Uuid::from_bytes(bytes)
}

/// Accept either a UUID or an arbitrary stable handle for a user.
fn parse_or_stable_uuid(value: Option<&str>, fallback_seed: &str) -> Uuid {
    match value {
        Some(v) if !v.trim().is_empty() => {
            Uuid::parse_str(v).unwrap_or_else(|_| stable_uuid_from_string(v))
        }
        _ => stable_uuid_from_string(fallback_seed),
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Transaction Endpoints
/// =============================

async fn create_transaction(
    State(state): State<ApiState>,
    Json(req): Json<CreateTransactionRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = parse_or_stable_uuid(req.user_id.as_deref(), "anonymous-user");

    info!(user_id = %user_id, merchant = %req.merchant, "Received transaction");

    let new = NewTransaction {
        user_id,
        merchant: req.merchant,
        amount: req.amount,
        category: req.category,
        description: req.description,
    };

    match state.ledger.create_transaction(new).await {
        Ok(receipt) => (StatusCode::CREATED, Json(ApiResponse::success(receipt))),
        Err(e) => failure(e),
    }
}

async fn submit_justification(
    State(state): State<ApiState>,
    Path(transaction_id): Path<Uuid>,
    Json(req): Json<JustificationRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    match state
        .ledger
        .submit_justification(transaction_id, &req.justification)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(ApiResponse::success(outcome))),
        Err(e) => failure(e),
    }
}

/// =============================
/// Progression Endpoints
/// =============================

async fn get_progression(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = parse_or_stable_uuid(Some(&user_id), "anonymous-user");

    match state.progression.get_progression(user_id).await {
        Ok(snapshot) => (StatusCode::OK, Json(ApiResponse::success(snapshot))),
        Err(e) => failure(e),
    }
}

async fn award_xp(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(req): Json<AwardXpRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = parse_or_stable_uuid(Some(&user_id), "anonymous-user");

    let event_type = match ExperienceEventType::from_str(&req.event_type) {
        Ok(event_type) => event_type,
        Err(e) => return failure(CompanionError::Validation(e)),
    };

    let metadata = req.metadata.unwrap_or_else(|| serde_json::json!({}));

    match state
        .progression
        .award_xp(user_id, event_type, req.amount, &req.description, metadata)
        .await
    {
        Ok(award) => (StatusCode::OK, Json(ApiResponse::success(award))),
        Err(e) => failure(e),
    }
}

async fn mark_lesson_read(
    State(state): State<ApiState>,
    Path((user_id, lesson_id)): Path<(String, String)>,
    Json(req): Json<LessonReadRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = parse_or_stable_uuid(Some(&user_id), "anonymous-user");
    let title = req.title.unwrap_or_else(|| lesson_id.clone());

    match state
        .progression
        .award_lesson_xp(user_id, &lesson_id, &title)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(ApiResponse::success(outcome))),
        Err(e) => failure(e),
    }
}

async fn update_happiness(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(req): Json<HappinessRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = parse_or_stable_uuid(Some(&user_id), "anonymous-user");

    let mood = match Mood::from_str(&req.mood) {
        Ok(mood) => mood,
        Err(e) => return failure(CompanionError::Validation(e)),
    };

    match state.streak.update_happiness_streak(user_id, mood).await {
        Ok(update) => (StatusCode::OK, Json(ApiResponse::success(update))),
        Err(e) => failure(e),
    }
}

async fn evaluate_badges(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = parse_or_stable_uuid(Some(&user_id), "anonymous-user");

    match state.badges.evaluate(user_id).await {
        Ok(statuses) => (StatusCode::OK, Json(ApiResponse::success(statuses))),
        Err(e) => failure(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/transactions", post(create_transaction))
        .route(
            "/api/transactions/:id/justification",
            post(submit_justification),
        )
        .route("/api/users/:user_id/progression", get(get_progression))
        .route("/api/users/:user_id/xp", post(award_xp))
        .route(
            "/api/users/:user_id/lessons/:lesson_id/read",
            post(mark_lesson_read),
        )
        .route("/api/users/:user_id/happiness", post(update_happiness))
        .route("/api/users/:user_id/badges", get(evaluate_badges))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&CompanionError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&CompanionError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CompanionError::Conflict("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CompanionError::Upstream("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&CompanionError::Persistence("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_stable_uuid_is_stable() {
        let a = parse_or_stable_uuid(Some("user-42"), "fallback");
        let b = parse_or_stable_uuid(Some("user-42"), "other-fallback");
        assert_eq!(a, b);

        let parsed = parse_or_stable_uuid(Some("f7b3a1e0-0000-0000-0000-000000000001"), "seed");
        assert_eq!(
            parsed.to_string(),
            "f7b3a1e0-0000-0000-0000-000000000001"
        );
    }
}
