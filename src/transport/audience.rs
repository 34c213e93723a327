//! Audience WebSocket channel (spec.md §4.7): `connecting → session_state_sent
//! → active → disconnected`. Broadcasts ride a per-connection subscription to
//! the parameter bus; client→server traffic is `input`/`location` only,
//! everything else gets a typed `error` frame without disconnecting (§4.8).

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventKind};
use crate::error::WireError;
use crate::ingress::RawInput;
use crate::transport::AppState;
use crate::types::{ClientId, Location};
use crate::wire::{
    AudienceClientMessage, AudienceServerMessage, InputRejectedData, SessionStateData,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[instrument(skip(socket, state))]
async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = ClientId(Uuid::new_v4().to_string());
    let (mut ws_tx, mut ws_rx) = socket.split();

    let session_state = AudienceServerMessage::SessionState(SessionStateData {
        session_id: state.session.id.clone(),
        status: state.session.status(),
        parameters: state.session.definitions.values().cloned().collect(),
        values: state.session.current_values(),
    });
    if send(&mut ws_tx, &session_state).await.is_err() {
        return;
    }

    let mut snapshot_sub = state.session.bus.subscribe(EventKind::ConsensusSnapshot);
    let mut start_sub = state.session.bus.subscribe(EventKind::SessionStart);
    let mut pause_sub = state.session.bus.subscribe(EventKind::SessionPause);
    let mut resume_sub = state.session.bus.subscribe(EventKind::SessionResume);
    let mut end_sub = state.session.bus.subscribe(EventKind::SessionEnd);
    let (reliable_tx, mut reliable_rx) = mpsc::channel::<AudienceServerMessage>(1024);

    loop {
        tokio::select! {
            frame = tokio::time::timeout(IDLE_TIMEOUT, ws_rx.next()) => {
                match frame {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        handle_client_text(&text, &client_id, &state, &reliable_tx).await;
                    }
                    Ok(Some(Ok(Message::Binary(_)))) => {
                        let _ = reliable_tx
                            .send(AudienceServerMessage::Error(WireError::new(
                                "invalid_frame",
                                "binary frames are not supported",
                            )))
                            .await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        debug!(error = %e, "audience_ws_recv_error");
                        break;
                    }
                    Err(_) => {
                        debug!(%client_id, "audience_idle_timeout");
                        break;
                    }
                }
            }
            Some(event) = snapshot_sub.rx.recv() => {
                if let BusEvent::ConsensusSnapshot(snap) = event {
                    let values: HashMap<String, f64> =
                        snap.results.iter().map(|(k, v)| (k.clone(), v.value)).collect();
                    if send(&mut ws_tx, &AudienceServerMessage::Values(values)).await.is_err() {
                        break;
                    }
                }
            }
            Some(_) = start_sub.rx.recv() => {
                if lifecycle(&mut ws_tx, &state).await.is_err() { break; }
            }
            Some(_) = pause_sub.rx.recv() => {
                if lifecycle(&mut ws_tx, &state).await.is_err() { break; }
            }
            Some(_) = resume_sub.rx.recv() => {
                if lifecycle(&mut ws_tx, &state).await.is_err() { break; }
            }
            Some(_) = end_sub.rx.recv() => {
                let _ = lifecycle(&mut ws_tx, &state).await;
                break;
            }
            Some(reliable) = reliable_rx.recv() => {
                if send(&mut ws_tx, &reliable).await.is_err() { break; }
            }
        }
    }

    state.session.bus.unsubscribe(EventKind::ConsensusSnapshot, snapshot_sub.id);
    state.session.bus.unsubscribe(EventKind::SessionStart, start_sub.id);
    state.session.bus.unsubscribe(EventKind::SessionPause, pause_sub.id);
    state.session.bus.unsubscribe(EventKind::SessionResume, resume_sub.id);
    state.session.bus.unsubscribe(EventKind::SessionEnd, end_sub.id);
    state.session.ingress.remove_client(&client_id);
}

async fn handle_client_text(
    text: &str,
    client_id: &ClientId,
    state: &AppState,
    reliable_tx: &mpsc::Sender<AudienceServerMessage>,
) {
    let now = state.session.clock.now_ms();
    match serde_json::from_str::<AudienceClientMessage>(text) {
        Ok(AudienceClientMessage::Input { parameter, value }) => {
            let raw = RawInput { parameter, value };
            if let Err(reason) =
                state.session.ingress.accept(client_id, &state.session.id, raw, None, now)
            {
                let _ = reliable_tx
                    .send(AudienceServerMessage::InputRejected(InputRejectedData { reason }))
                    .await;
            }
        }
        Ok(AudienceClientMessage::Location { x, y, zone }) => {
            state.session.ingress.update_location(client_id, Location { x, y, zone }, now);
        }
        Err(e) => {
            warn!(error = %e, "invalid_audience_message");
            let _ = reliable_tx
                .send(AudienceServerMessage::Error(WireError::new("invalid_message", e.to_string())))
                .await;
        }
    }
}

async fn lifecycle(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    state: &AppState,
) -> Result<(), axum::Error> {
    send(
        ws_tx,
        &AudienceServerMessage::SessionLifecycle { status: state.session.status() },
    )
    .await
}

async fn send(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &AudienceServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).expect("audience server message is always valid JSON");
    ws_tx.send(Message::Text(text)).await
}
