use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use patrol_core::wire::{
    CheckInSubmission, IncidentReportSubmission, IngestReceipt, CHECK_IN_PATH, HEALTH_PATH,
    INCIDENT_REPORT_PATH,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::ingest::{
    AuditEvent, IngestPolicy, IngestStore, IngestTotals, Location, LocationRegistration,
    Operator, OperatorRegistration,
};

const DEFAULT_AUDIT_LIMIT: u32 = 50;
const MAX_AUDIT_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: IngestStore,
}

impl AppState {
    pub async fn from_config(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let store = IngestStore::open(&config.db_path, policy(&config)).await?;
        Ok(Self { config, store })
    }

    #[cfg(test)]
    pub async fn in_memory(config: Arc<AppConfig>) -> Self {
        let store = IngestStore::open_in_memory(policy(&config))
            .await
            .expect("in-memory ingest store");
        Self { config, store }
    }
}

const fn policy(config: &AppConfig) -> IngestPolicy {
    IngestPolicy {
        auto_provision: config.auto_provision,
        report_locate_window: config.report_locate_window,
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(healthz))
        .route(CHECK_IN_PATH, post(ingest_check_in))
        .route(INCIDENT_REPORT_PATH, post(ingest_incident_report))
        .route("/v1/audit", get(list_audit))
        .route("/v1/operators", post(register_operator))
        .route("/v1/locations", post(register_location))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    totals: IngestTotals,
}

async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    Ok(Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        totals: state.store.totals().await?,
    }))
}

async fn ingest_check_in(
    State(state): State<AppState>,
    Json(submission): Json<CheckInSubmission>,
) -> Result<Json<IngestReceipt>, AppError> {
    let receipt = state.store.ingest_check_in(&submission).await?;
    Ok(Json(receipt))
}

async fn ingest_incident_report(
    State(state): State<AppState>,
    Json(submission): Json<IncidentReportSubmission>,
) -> Result<Json<IngestReceipt>, AppError> {
    let receipt = state.store.ingest_incident_report(&submission).await?;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<u32>,
}

async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);
    Ok(Json(state.store.audit_events(limit).await?))
}

async fn register_operator(
    State(state): State<AppState>,
    Json(registration): Json<OperatorRegistration>,
) -> Result<Json<Operator>, AppError> {
    let operator = state.store.register_operator(&registration).await?;
    tracing::info!(operator_id = %operator.id, role = %operator.role_code, "Registered operator");
    Ok(Json(operator))
}

async fn register_location(
    State(state): State<AppState>,
    Json(registration): Json<LocationRegistration>,
) -> Result<Json<Location>, AppError> {
    let location = state.store.register_location(&registration).await?;
    tracing::info!(tag_id = %location.tag_id, location_id = location.id, "Registered location");
    Ok(Json(location))
}
