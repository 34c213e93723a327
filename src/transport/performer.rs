//! Performer WebSocket channel (spec.md §4.7): `connecting → awaiting_auth →
//! authenticated → disconnected`. The first frame must be `auth` within
//! `authTimeoutMs` or the connection is closed; every subsequent command is
//! permission-gated against the authenticated performer's session.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::bus::{BusEvent, EventKind};
use crate::error::{AuthFailureReason, WireError};
use crate::overrides::OverrideRequest;
use crate::transport::AppState;
use crate::types::{ParameterId, PerformerId, PerformerSession};
use crate::wire::{
    AuthFailedData, AuthSuccessData, OverrideClearedByOtherData, OverrideFailedData,
    OverrideSuccessData, PerformerClientMessage, PerformerServerMessage,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[instrument(skip(socket, state))]
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let auth_timeout = {
        let cfg = state.session.config.read().expect("config lock poisoned");
        Duration::from_millis(cfg.auth_timeout_ms)
    };

    let performer = match authenticate(&mut ws_tx, &mut ws_rx, &state, auth_timeout).await {
        Some(p) => p,
        None => return,
    };

    let mut snapshot_sub = state.session.bus.subscribe(EventKind::ConsensusSnapshot);
    let mut clear_sub = state.session.bus.subscribe(EventKind::PerformerOverrideClear);
    let (reliable_tx, mut reliable_rx) = mpsc::channel::<PerformerServerMessage>(1024);

    loop {
        tokio::select! {
            frame = tokio::time::timeout(IDLE_TIMEOUT, ws_rx.next()) => {
                match frame {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        handle_performer_text(&text, &performer, &state, &reliable_tx).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        debug!(error = %e, "performer_ws_recv_error");
                        break;
                    }
                    Err(_) => {
                        debug!(performer = %performer.performer_id, "performer_idle_timeout");
                        break;
                    }
                }
            }
            Some(event) = snapshot_sub.rx.recv() => {
                if let BusEvent::ConsensusSnapshot(snap) = event {
                    if send(&mut ws_tx, &PerformerServerMessage::Snapshot(snap)).await.is_err() {
                        break;
                    }
                }
            }
            Some(event) = clear_sub.rx.recv() => {
                if let BusEvent::PerformerOverrideClear(payload) = event {
                    if payload.cleared_by_other && payload.performer_id == performer.performer_id {
                        let msg = PerformerServerMessage::OverrideClearedByOther(OverrideClearedByOtherData {
                            parameter: payload.parameter.0.clone(),
                            performer_id: payload.performer_id.0.clone(),
                        });
                        if send(&mut ws_tx, &msg).await.is_err() { break; }
                    }
                }
            }
            Some(reliable) = reliable_rx.recv() => {
                if send(&mut ws_tx, &reliable).await.is_err() { break; }
            }
        }
    }

    state.session.bus.unsubscribe(EventKind::ConsensusSnapshot, snapshot_sub.id);
    state.session.bus.unsubscribe(EventKind::PerformerOverrideClear, clear_sub.id);
    state.session.disconnect_performer(&performer.performer_id);
}

async fn authenticate(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ws_rx: &mut SplitStream<WebSocket>,
    state: &AppState,
    timeout: Duration,
) -> Option<PerformerSession> {
    let frame = tokio::time::timeout(timeout, ws_rx.next()).await;
    let text = match frame {
        Ok(Some(Ok(Message::Text(text)))) => text,
        _ => {
            let _ = send(
                ws_tx,
                &PerformerServerMessage::AuthFailed(AuthFailedData { reason: AuthFailureReason::Timeout }),
            )
            .await;
            return None;
        }
    };

    match serde_json::from_str::<PerformerClientMessage>(&text) {
        Ok(PerformerClientMessage::Auth { secret, performer_id, display_name }) => {
            match state.session.authenticate_performer(&secret, PerformerId(performer_id), display_name) {
                Ok(perf) => {
                    let _ = send(
                        ws_tx,
                        &PerformerServerMessage::AuthSuccess(AuthSuccessData {
                            performer_id: perf.performer_id.0.clone(),
                        }),
                    )
                    .await;
                    Some(perf)
                }
                Err(reason) => {
                    let _ = send(ws_tx, &PerformerServerMessage::AuthFailed(AuthFailedData { reason })).await;
                    None
                }
            }
        }
        _ => {
            let _ = send(
                ws_tx,
                &PerformerServerMessage::AuthFailed(AuthFailedData { reason: AuthFailureReason::InvalidSecret }),
            )
            .await;
            None
        }
    }
}

async fn handle_performer_text(
    text: &str,
    performer: &PerformerSession,
    state: &AppState,
    reliable_tx: &mpsc::Sender<PerformerServerMessage>,
) {
    let now = state.session.clock.now_ms();
    match serde_json::from_str::<PerformerClientMessage>(text) {
        Ok(PerformerClientMessage::Override { parameter, value, mode, blend_factor, duration_ms, reason }) => {
            let req = OverrideRequest {
                performer_id: performer.performer_id.clone(),
                is_authenticated: performer.is_authenticated,
                permissions: performer.permissions.clone(),
                parameter: ParameterId(parameter),
                value,
                mode,
                blend_factor,
                duration_ms,
                reason,
            };
            let cfg = state.session.config.read().expect("config lock poisoned").clone();
            match state.session.overrides.request(req, &cfg, now) {
                Ok(ov) => {
                    let _ = reliable_tx
                        .send(PerformerServerMessage::OverrideSuccess(OverrideSuccessData { override_: ov }))
                        .await;
                }
                Err(reason) => {
                    let _ = reliable_tx
                        .send(PerformerServerMessage::OverrideFailed(OverrideFailedData { reason }))
                        .await;
                }
            }
        }
        Ok(PerformerClientMessage::OverrideClear { parameter }) => {
            state.session.overrides.clear(&performer.performer_id, &ParameterId(parameter));
        }
        Ok(PerformerClientMessage::SessionStart) => {
            state.session.start();
        }
        Ok(PerformerClientMessage::SessionPause) => {
            if performer.permissions.can_pause {
                state.session.pause();
            } else {
                let _ = reliable_tx
                    .send(PerformerServerMessage::Error(WireError::new("forbidden", "missing canPause permission")))
                    .await;
            }
        }
        Ok(PerformerClientMessage::SessionResume) => {
            state.session.resume();
        }
        Ok(PerformerClientMessage::SessionEnd) => {
            if performer.permissions.can_end {
                state.session.end();
            } else {
                let _ = reliable_tx
                    .send(PerformerServerMessage::Error(WireError::new("forbidden", "missing canEnd permission")))
                    .await;
            }
        }
        Ok(PerformerClientMessage::Auth { .. }) => {
            let _ = reliable_tx
                .send(PerformerServerMessage::AuthFailed(AuthFailedData {
                    reason: AuthFailureReason::AlreadyAuthenticated,
                }))
                .await;
        }
        Err(e) => {
            warn!(error = %e, "invalid_performer_message");
            let _ = reliable_tx
                .send(PerformerServerMessage::Error(WireError::new("invalid_message", e.to_string())))
                .await;
        }
    }
}

async fn send(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &PerformerServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).expect("performer server message is always valid JSON");
    ws_tx.send(Message::Text(text)).await
}
