//! WebSocket transport and the read-only control plane (spec.md §4.7, §6.4):
//! one axum `Router` serving both, the same "single listener, many routes"
//! layout as the teacher's `/v1/ingest` + `/health` + `/ready` + `/metrics`.

pub mod audience;
pub mod performer;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::bus::EventKind;
use crate::session::Session;
use crate::types::{ParameterDefinition, SessionStatus};

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
}

pub fn router(session: Arc<Session>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/session", get(session_info))
        .route("/values", get(values))
        .route("/metrics", get(metrics))
        .route("/ws/audience", get(audience::handler))
        .route("/ws/performer", get(performer::handler))
        .with_state(AppState { session })
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
struct SessionInfo {
    #[serde(rename = "sessionId")]
    session_id: String,
    status: SessionStatus,
    parameters: Vec<ParameterDefinition>,
    #[serde(rename = "uptimeMs")]
    uptime_ms: u64,
    #[serde(rename = "totalParticipants")]
    total_participants: usize,
    #[serde(rename = "serverTimeMs")]
    server_time_ms: i64,
}

async fn session_info(State(state): State<AppState>) -> Json<SessionInfo> {
    Json(SessionInfo {
        session_id: state.session.id.clone(),
        status: state.session.status(),
        parameters: state.session.definitions.values().cloned().collect(),
        uptime_ms: state.session.uptime_ms(),
        total_participants: state.session.ingress.total_participants(),
        server_time_ms: chrono::Utc::now().timestamp_millis(),
    })
}

async fn values(State(state): State<AppState>) -> Json<HashMap<String, f64>> {
    Json(state.session.current_values())
}

#[derive(Serialize)]
struct MetricsResponse {
    #[serde(rename = "ingestedTotal")]
    ingested_total: u64,
    #[serde(rename = "totalParticipants")]
    total_participants: usize,
    #[serde(rename = "tickCount")]
    tick_count: u64,
    #[serde(rename = "tickOverrunCount")]
    tick_overrun_count: u64,
    #[serde(rename = "lastTickLatencyMs")]
    last_tick_latency_ms: f64,
    #[serde(rename = "consensusUpdatesPublished")]
    consensus_updates_published: u64,
    #[serde(rename = "consensusUpdatesDropped")]
    consensus_updates_dropped: u64,
    #[serde(rename = "activeAudienceSubscribers")]
    active_audience_subscribers: usize,
    #[serde(rename = "activePerformerSubscribers")]
    active_performer_subscribers: usize,
    #[serde(rename = "oscDegraded")]
    osc_degraded: Option<bool>,
    #[serde(rename = "oscSent")]
    osc_sent: Option<u64>,
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    let session = &state.session;
    let (osc_degraded, osc_sent) = match session.sink_status() {
        Some((degraded, sent)) => (Some(degraded), Some(sent)),
        None => (None, None),
    };
    Json(MetricsResponse {
        ingested_total: session.ingress.ingested_total(),
        total_participants: session.ingress.total_participants(),
        tick_count: session.telemetry.tick_count(),
        tick_overrun_count: session.telemetry.tick_overrun_count(),
        last_tick_latency_ms: session.telemetry.last_tick_latency_ms(),
        consensus_updates_published: session.bus.published_count(EventKind::ConsensusUpdate),
        consensus_updates_dropped: session.bus.dropped_count(EventKind::ConsensusUpdate),
        active_audience_subscribers: session.bus.active_subscribers(EventKind::ConsensusSnapshot),
        active_performer_subscribers: session.bus.active_subscribers(EventKind::PerformerOverrideClear),
        osc_degraded,
        osc_sent,
    })
}
