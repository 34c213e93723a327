//! Session configuration: defaults, genre presets, and the env/file loader.
//!
//! Loader follows the teacher's `std::env::var(...).ok().and_then(...).unwrap_or(...)`
//! idiom (see `PORT` handling in the reference main), generalized to the full
//! option surface of spec.md §6.5.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{ParameterDefinition, VenueGeometry, WeightingConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenrePreset {
    ElectronicMusic,
    Ballet,
    Opera,
    Installation,
    Theatre,
}

impl GenrePreset {
    pub fn weights(self) -> (f64, f64, f64) {
        match self {
            GenrePreset::ElectronicMusic => (0.3, 0.5, 0.2),
            GenrePreset::Ballet => (0.5, 0.2, 0.3),
            GenrePreset::Opera => (0.2, 0.3, 0.5),
            GenrePreset::Installation => (0.7, 0.1, 0.2),
            GenrePreset::Theatre => (0.4, 0.3, 0.3),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "electronic_music" => Some(GenrePreset::ElectronicMusic),
            "ballet" => Some(GenrePreset::Ballet),
            "opera" => Some(GenrePreset::Opera),
            "installation" => Some(GenrePreset::Installation),
            "theatre" => Some(GenrePreset::Theatre),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OscConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for OscConfig {
    fn default() -> Self {
        OscConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 57120,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    pub session_name: String,
    pub max_participants: u32,
    pub allow_audience_input: bool,
    pub allow_performer_override: bool,
    pub input_rate_limit_ms: u64,
    pub max_inputs_per_client: u32,
    pub consensus_interval_ms: u64,
    pub batch_interval_ms: u64,
    pub weighting: WeightingConfig,
    pub osc: OscConfig,
    pub auth_timeout_ms: u64,
    pub performer_secret: Option<String>,
    pub venue: VenueGeometry,
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            session_name: "untitled".to_string(),
            max_participants: 1000,
            allow_audience_input: true,
            allow_performer_override: true,
            input_rate_limit_ms: 100,
            max_inputs_per_client: 600,
            consensus_interval_ms: 50,
            batch_interval_ms: 50,
            weighting: WeightingConfig {
                spatial_alpha: 0.3,
                spatial_decay_rate: 0.5,
                temporal_beta: 0.5,
                temporal_window_ms: 5000,
                temporal_decay_rate: 0.5,
                consensus_gamma: 0.2,
                cluster_threshold: 0.1,
                smoothing_factor: 0.3,
                outlier_threshold: 2.5,
            },
            osc: OscConfig::default(),
            auth_timeout_ms: 5000,
            performer_secret: None,
            venue: VenueGeometry {
                width: 100.0,
                height: 100.0,
                stage_position: (50.0, 0.0),
                zones: Vec::new(),
                max_capacity: 1000,
            },
            parameters: default_parameters(),
        }
    }
}

fn default_parameters() -> Vec<ParameterDefinition> {
    use crate::types::{ParameterCategory, ParameterId};
    vec![
        ParameterDefinition {
            id: ParameterId("mood".into()),
            category: ParameterCategory::Mood,
            default: 0.5,
            min: 0.0,
            max: 1.0,
            audience_controllable: true,
            performer_controllable: true,
            smoothing_enabled: true,
            sink_address: None,
        },
        ParameterDefinition {
            id: ParameterId("tempo".into()),
            category: ParameterCategory::Tempo,
            default: 0.5,
            min: 0.0,
            max: 1.0,
            audience_controllable: true,
            performer_controllable: true,
            smoothing_enabled: true,
            sink_address: None,
        },
        ParameterDefinition {
            id: ParameterId("intensity".into()),
            category: ParameterCategory::Intensity,
            default: 0.3,
            min: 0.0,
            max: 1.0,
            audience_controllable: true,
            performer_controllable: true,
            smoothing_enabled: true,
            sink_address: None,
        },
        ParameterDefinition {
            id: ParameterId("density".into()),
            category: ParameterCategory::Density,
            default: 0.4,
            min: 0.0,
            max: 1.0,
            audience_controllable: true,
            performer_controllable: true,
            smoothing_enabled: true,
            sink_address: None,
        },
    ]
}

impl SessionConfig {
    /// Loads configuration from `PERF_CONFIG_PATH` (if set, a JSON file merged
    /// as a base) then overlays `PERF_*` environment variables, then validates.
    pub fn load_from_env() -> Result<Self, EngineError> {
        let mut cfg = if let Ok(path) = env::var("PERF_CONFIG_PATH") {
            let text = fs::read_to_string(&path)
                .map_err(|e| EngineError::Config(format!("reading {path}: {e}")))?;
            serde_json::from_str(&text)
                .map_err(|e| EngineError::Config(format!("parsing {path}: {e}")))?
        } else {
            SessionConfig::default()
        };

        if let Ok(name) = env::var("PERF_SESSION_NAME") {
            cfg.session_name = name;
        }
        if let Some(v) = parse_env("PERF_MAX_PARTICIPANTS") {
            cfg.max_participants = v;
        }
        if let Some(v) = parse_env_bool("PERF_ALLOW_AUDIENCE_INPUT") {
            cfg.allow_audience_input = v;
        }
        if let Some(v) = parse_env_bool("PERF_ALLOW_PERFORMER_OVERRIDE") {
            cfg.allow_performer_override = v;
        }
        if let Some(v) = parse_env("PERF_INPUT_RATE_LIMIT_MS") {
            cfg.input_rate_limit_ms = v;
        }
        if let Some(v) = parse_env("PERF_MAX_INPUTS_PER_CLIENT") {
            cfg.max_inputs_per_client = v;
        }
        if let Some(v) = parse_env("PERF_CONSENSUS_INTERVAL_MS") {
            cfg.consensus_interval_ms = v;
        }
        if let Some(v) = parse_env("PERF_BATCH_INTERVAL_MS") {
            cfg.batch_interval_ms = v;
        }
        if let Some(v) = parse_env("PERF_TEMPORAL_WINDOW_MS") {
            cfg.weighting.temporal_window_ms = v;
        }
        if let Some(v) = parse_env("PERF_TEMPORAL_DECAY_RATE") {
            cfg.weighting.temporal_decay_rate = v;
        }
        if let Some(v) = parse_env("PERF_SPATIAL_ALPHA") {
            cfg.weighting.spatial_alpha = v;
        }
        if let Some(v) = parse_env("PERF_SPATIAL_DECAY_RATE") {
            cfg.weighting.spatial_decay_rate = v;
        }
        if let Some(v) = parse_env("PERF_TEMPORAL_BETA") {
            cfg.weighting.temporal_beta = v;
        }
        if let Some(v) = parse_env("PERF_CONSENSUS_GAMMA") {
            cfg.weighting.consensus_gamma = v;
        }
        if let Some(v) = parse_env("PERF_CLUSTER_THRESHOLD") {
            cfg.weighting.cluster_threshold = v;
        }
        if let Some(v) = parse_env("PERF_SMOOTHING_FACTOR") {
            cfg.weighting.smoothing_factor = v;
        }
        if let Some(v) = parse_env("PERF_OUTLIER_THRESHOLD") {
            cfg.weighting.outlier_threshold = v;
        }
        if let Some(v) = parse_env_bool("PERF_OSC_ENABLED") {
            cfg.osc.enabled = v;
        }
        if let Ok(v) = env::var("PERF_OSC_HOST") {
            cfg.osc.host = v;
        }
        if let Some(v) = parse_env("PERF_OSC_PORT") {
            cfg.osc.port = v;
        }
        if let Some(v) = parse_env("PERF_AUTH_TIMEOUT_MS") {
            cfg.auth_timeout_ms = v;
        }
        if let Ok(v) = env::var("PERF_PERFORMER_SECRET") {
            cfg.performer_secret = Some(v);
        }
        if let Ok(v) = env::var("PERF_GENRE") {
            let preset = GenrePreset::parse(&v)
                .ok_or_else(|| EngineError::Config(format!("unknown genre preset: {v}")))?;
            let (a, b, g) = preset.weights();
            cfg.weighting.spatial_alpha = a;
            cfg.weighting.temporal_beta = b;
            cfg.weighting.consensus_gamma = g;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let w = &self.weighting;
        for (name, v) in [
            ("spatialAlpha", w.spatial_alpha),
            ("temporalBeta", w.temporal_beta),
            ("consensusGamma", w.consensus_gamma),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(EngineError::Config(format!("{name} must be in [0,1], got {v}")));
            }
        }
        if w.smoothing_factor < 0.0 || w.smoothing_factor > 1.0 {
            return Err(EngineError::Config("smoothingFactor must be in [0,1]".into()));
        }
        if w.temporal_window_ms == 0 {
            return Err(EngineError::Config("temporalWindowMs must be > 0".into()));
        }
        if w.cluster_threshold <= 0.0 {
            return Err(EngineError::Config("clusterThreshold must be > 0".into()));
        }
        if self.consensus_interval_ms == 0 {
            return Err(EngineError::Config("consensusIntervalMs must be > 0".into()));
        }
        if self.allow_performer_override && self.performer_secret.is_none() {
            return Err(EngineError::Config(
                "performerSecret is required when allowPerformerOverride is true".into(),
            ));
        }
        let mut seen = HashMap::new();
        for p in &self.parameters {
            if seen.insert(p.id.clone(), ()).is_some() {
                return Err(EngineError::Config(format!("duplicate parameter id: {}", p.id)));
            }
            if p.id.0.is_empty() || p.id.0.len() > 50 || !p.id.0.is_ascii() {
                return Err(EngineError::Config(format!(
                    "parameter id must be 1-50 ASCII characters: {}",
                    p.id
                )));
            }
            if p.min >= p.max {
                return Err(EngineError::Config(format!("parameter {} has min >= max", p.id)));
            }
        }
        Ok(())
    }

    pub fn osc_addr(&self) -> Result<std::net::SocketAddr, EngineError> {
        let ip: IpAddr = self
            .osc
            .host
            .parse()
            .map_err(|e| EngineError::Config(format!("invalid oscHost: {e}")))?;
        Ok(std::net::SocketAddr::new(ip, self.osc.port))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|v| match v.as_str() {
        "1" | "true" | "TRUE" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "no" => Some(false),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut cfg = SessionConfig::default();
        cfg.performer_secret = Some("x".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_performer_secret_rejected() {
        let cfg = SessionConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn genre_preset_weights() {
        assert_eq!(GenrePreset::ElectronicMusic.weights(), (0.3, 0.5, 0.2));
        assert_eq!(GenrePreset::Installation.weights(), (0.7, 0.1, 0.2));
    }

    #[test]
    fn out_of_range_alpha_rejected() {
        let mut cfg = SessionConfig::default();
        cfg.performer_secret = Some("x".into());
        cfg.weighting.spatial_alpha = 1.5;
        assert!(cfg.validate().is_err());
    }
}
