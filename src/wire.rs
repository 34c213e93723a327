//! Wire dialect for both WebSocket channels (spec.md §6.1): a closed tagged
//! union per direction, `{"type": "...", "data": {...}}` via serde's
//! internally-tagged enum support. This is the JSON analogue of the teacher's
//! hand-rolled protobuf schema — one message shape per event, nothing
//! freeform.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AuthFailureReason, InputRejectReason, OverrideFailureReason, WireError};
use crate::types::{
    OverrideMode, ParameterDefinition, PerformerOverride, SessionStatus, Snapshot,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AudienceClientMessage {
    Input { parameter: String, value: f64 },
    Location { x: f64, y: f64, zone: Option<String> },
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionStateData {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: SessionStatus,
    pub parameters: Vec<ParameterDefinition>,
    pub values: HashMap<String, f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct InputRejectedData {
    pub reason: InputRejectReason,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum AudienceServerMessage {
    #[serde(rename = "session:state")]
    SessionState(SessionStateData),
    #[serde(rename = "values")]
    Values(HashMap<String, f64>),
    #[serde(rename = "input:rejected")]
    InputRejected(InputRejectedData),
    #[serde(rename = "session:lifecycle")]
    SessionLifecycle { status: SessionStatus },
    #[serde(rename = "error")]
    Error(WireError),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PerformerClientMessage {
    #[serde(rename = "auth")]
    Auth {
        secret: String,
        #[serde(rename = "performerId")]
        performer_id: String,
        #[serde(rename = "displayName")]
        display_name: Option<String>,
    },
    #[serde(rename = "override")]
    Override {
        parameter: String,
        value: f64,
        mode: OverrideMode,
        #[serde(rename = "blendFactor")]
        blend_factor: Option<f64>,
        #[serde(rename = "durationMs")]
        duration_ms: Option<u64>,
        reason: Option<String>,
    },
    #[serde(rename = "override:clear")]
    OverrideClear { parameter: String },
    #[serde(rename = "session:start")]
    SessionStart,
    #[serde(rename = "session:pause")]
    SessionPause,
    #[serde(rename = "session:resume")]
    SessionResume,
    #[serde(rename = "session:end")]
    SessionEnd,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuthSuccessData {
    #[serde(rename = "performerId")]
    pub performer_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuthFailedData {
    pub reason: AuthFailureReason,
}

#[derive(Clone, Debug, Serialize)]
pub struct OverrideSuccessData {
    #[serde(rename = "override")]
    pub override_: PerformerOverride,
}

#[derive(Clone, Debug, Serialize)]
pub struct OverrideFailedData {
    pub reason: OverrideFailureReason,
}

#[derive(Clone, Debug, Serialize)]
pub struct OverrideClearedByOtherData {
    pub parameter: String,
    #[serde(rename = "performerId")]
    pub performer_id: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum PerformerServerMessage {
    #[serde(rename = "auth:success")]
    AuthSuccess(AuthSuccessData),
    #[serde(rename = "auth:failed")]
    AuthFailed(AuthFailedData),
    #[serde(rename = "override:success")]
    OverrideSuccess(OverrideSuccessData),
    #[serde(rename = "override:failed")]
    OverrideFailed(OverrideFailedData),
    #[serde(rename = "override:cleared-by-other")]
    OverrideClearedByOther(OverrideClearedByOtherData),
    #[serde(rename = "values")]
    Values(HashMap<String, f64>),
    #[serde(rename = "snapshot")]
    Snapshot(Snapshot),
    #[serde(rename = "session:lifecycle")]
    SessionLifecycle { status: SessionStatus },
    #[serde(rename = "error")]
    Error(WireError),
}
