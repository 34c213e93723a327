//! Core data model shared by every component of the pipeline.
//!
//! Defined once here and reused everywhere; no component owns a private copy
//! of these shapes.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Monotonic milliseconds since the process began. Distinct from wall clock,
/// which is only used for log timestamps.
pub type MonoMs = u64;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerformerId(pub String);

impl fmt::Display for PerformerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ParameterId(pub String);

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParameterId {
    fn from(s: &str) -> Self {
        ParameterId(s.to_string())
    }
}

/// A named location within the venue, attached to an audience input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub zone: Option<ZoneRef>,
}

/// Placeholder for a zone name carried with a location; resolved against
/// `VenueGeometry` at weighting time rather than stored redundantly.
pub type ZoneRef = String;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudienceInput {
    pub id: String,
    pub client_id: ClientId,
    pub session_id: String,
    pub timestamp: MonoMs,
    pub parameter: ParameterId,
    pub value: f64,
    pub location: Option<Location>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterCategory {
    Mood,
    Tempo,
    Intensity,
    Density,
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub id: ParameterId,
    pub category: ParameterCategory,
    pub default: f64,
    #[serde(default = "ParameterDefinition::default_min")]
    pub min: f64,
    #[serde(default = "ParameterDefinition::default_max")]
    pub max: f64,
    pub audience_controllable: bool,
    pub performer_controllable: bool,
    pub smoothing_enabled: bool,
    /// External sink address override, e.g. `/performance/mood`. `None` uses
    /// the default `/performance/<id>` pattern.
    #[serde(default)]
    pub sink_address: Option<String>,
}

impl ParameterDefinition {
    fn default_min() -> f64 {
        0.0
    }
    fn default_max() -> f64 {
        1.0
    }

    pub fn sink_address(&self) -> String {
        self.sink_address
            .clone()
            .unwrap_or_else(|| format!("/performance/{}", self.id.0))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub bounds: BoundingBox,
    pub base_multiplier: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VenueGeometry {
    pub width: f64,
    pub height: f64,
    pub stage_position: (f64, f64),
    pub zones: Vec<Zone>,
    pub max_capacity: u32,
}

impl VenueGeometry {
    pub fn diagonal(&self) -> f64 {
        (self.width * self.width + self.height * self.height).sqrt()
    }

    pub fn zone_multiplier(&self, zone: Option<&str>) -> f64 {
        match zone {
            Some(name) => self
                .zones
                .iter()
                .find(|z| z.name == name)
                .map(|z| z.base_multiplier)
                .unwrap_or(1.0),
            None => 1.0,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && x <= self.width && y >= 0.0 && y <= self.height
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WeightingConfig {
    pub spatial_alpha: f64,
    pub spatial_decay_rate: f64,
    pub temporal_beta: f64,
    pub temporal_window_ms: u64,
    pub temporal_decay_rate: f64,
    pub consensus_gamma: f64,
    pub cluster_threshold: f64,
    pub smoothing_factor: f64,
    pub outlier_threshold: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    /// No active override; the value is purely audience-derived.
    Consensus,
    Absolute,
    Blend,
    Lock,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub parameter: ParameterId,
    pub value: f64,
    pub confidence: f64,
    pub input_count: usize,
    pub timestamp: MonoMs,
    pub mode: ConsensusMode,
    pub raw_mean: f64,
    pub weighted_mean: f64,
    pub stddev: f64,
    pub participation_rate: f64,
    #[serde(default)]
    pub bimodal: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMode {
    Absolute,
    Blend,
    Lock,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerformerOverride {
    pub performer_id: PerformerId,
    pub parameter: ParameterId,
    pub value: f64,
    pub mode: OverrideMode,
    #[serde(default)]
    pub blend_factor: Option<f64>,
    #[serde(default)]
    pub expires_at: Option<MonoMs>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PerformerOverride {
    pub fn blend_factor_or_default(&self) -> f64 {
        self.blend_factor.unwrap_or(0.5)
    }

    pub fn is_expired(&self, now: MonoMs) -> bool {
        matches!(self.expires_at, Some(t) if now >= t)
    }
}

#[derive(Clone, Debug)]
pub struct ClientState {
    pub client_id: ClientId,
    pub last_input_time: MonoMs,
    pub input_count: u32,
    pub window_start: MonoMs,
    pub last_location: Option<Location>,
    pub blocked_until: Option<MonoMs>,
}

impl ClientState {
    pub fn is_blocked(&self, now: MonoMs) -> bool {
        matches!(self.blocked_until, Some(t) if now < t)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Paused,
    Ended,
}

#[derive(Clone, Debug, Default)]
pub struct PerformerPermissions {
    pub can_override: bool,
    pub can_pause: bool,
    pub can_end: bool,
    pub can_modify_config: bool,
    /// `None` means "all parameters allowed".
    pub allowed_parameters: Option<Vec<ParameterId>>,
}

impl PerformerPermissions {
    pub fn allows(&self, parameter: &ParameterId) -> bool {
        match &self.allowed_parameters {
            None => true,
            Some(list) => list.contains(parameter),
        }
    }

    pub fn all() -> Self {
        PerformerPermissions {
            can_override: true,
            can_pause: true,
            can_end: true,
            can_modify_config: true,
            allowed_parameters: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PerformerSession {
    pub performer_id: PerformerId,
    pub display_name: String,
    pub is_authenticated: bool,
    pub permissions: PerformerPermissions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub session_id: String,
    pub timestamp: MonoMs,
    pub results: HashMap<String, ConsensusResult>,
    pub total_participants: usize,
    pub active_participants: usize,
}
