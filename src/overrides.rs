//! Override registry (spec.md §4.3): at most one active performer override
//! per parameter, single-writer-per-parameter via `DashMap`'s per-shard
//! locking, lazily expired on resolve — the same TTL-by-touch discipline the
//! teacher uses for its dedup and rate-limit maps.

use std::sync::Arc;

use dashmap::DashMap;

use crate::bus::{BusEvent, OverrideClearPayload, ParameterBus};
use crate::config::SessionConfig;
use crate::error::OverrideFailureReason;
use crate::types::{
    ConsensusMode, MonoMs, OverrideMode, ParameterId, PerformerId, PerformerOverride,
    PerformerPermissions,
};

pub struct OverrideRequest {
    pub performer_id: PerformerId,
    pub is_authenticated: bool,
    pub permissions: PerformerPermissions,
    pub parameter: ParameterId,
    pub value: f64,
    pub mode: OverrideMode,
    pub blend_factor: Option<f64>,
    pub duration_ms: Option<u64>,
    pub reason: Option<String>,
}

pub struct OverrideRegistry {
    active: DashMap<ParameterId, PerformerOverride>,
    bus: Arc<ParameterBus>,
}

impl OverrideRegistry {
    pub fn new(bus: Arc<ParameterBus>) -> Self {
        OverrideRegistry {
            active: DashMap::new(),
            bus,
        }
    }

    pub fn request(
        &self,
        req: OverrideRequest,
        cfg: &SessionConfig,
        now: MonoMs,
    ) -> Result<PerformerOverride, OverrideFailureReason> {
        if !req.is_authenticated {
            return Err(OverrideFailureReason::NotAuthenticated);
        }
        if !req.permissions.can_override {
            return Err(OverrideFailureReason::NoOverridePermission);
        }
        if !req.permissions.allows(&req.parameter) {
            return Err(OverrideFailureReason::ParameterNotAllowed);
        }
        let Some(def) = cfg.parameters.iter().find(|p| p.id == req.parameter) else {
            return Err(OverrideFailureReason::ParameterNotAllowed);
        };
        if !def.performer_controllable {
            return Err(OverrideFailureReason::ParameterNotPerformerControllable);
        }
        if !req.value.is_finite() || req.value < def.min || req.value > def.max {
            return Err(OverrideFailureReason::InvalidValue);
        }
        if let Some(bf) = req.blend_factor {
            if !bf.is_finite() || !(0.0..=1.0).contains(&bf) {
                return Err(OverrideFailureReason::InvalidValue);
            }
        }
        if req.mode == OverrideMode::Blend && req.blend_factor.is_none() {
            // blend_factor defaults to 0.5 per spec; absence is not an error.
        }

        let expires_at = req.duration_ms.map(|d| now + d);
        let ov = PerformerOverride {
            performer_id: req.performer_id.clone(),
            parameter: req.parameter.clone(),
            value: req.value,
            mode: req.mode,
            blend_factor: req.blend_factor,
            expires_at,
            reason: req.reason,
        };

        if let Some(prev) = self.active.get(&req.parameter) {
            if prev.performer_id != req.performer_id {
                self.bus.publish(BusEvent::PerformerOverrideClear(OverrideClearPayload {
                    performer_id: prev.performer_id.clone(),
                    parameter: req.parameter.clone(),
                    cleared_by_other: true,
                }));
            }
        }

        self.active.insert(req.parameter.clone(), ov.clone());
        self.bus.publish(BusEvent::PerformerOverride(ov.clone()));
        Ok(ov)
    }

    pub fn clear(&self, performer_id: &PerformerId, parameter: &ParameterId) -> bool {
        let owns = self
            .active
            .get(parameter)
            .map(|o| &o.performer_id == performer_id)
            .unwrap_or(false);
        if !owns {
            return false;
        }
        self.active.remove(parameter);
        self.bus.publish(BusEvent::PerformerOverrideClear(OverrideClearPayload {
            performer_id: performer_id.clone(),
            parameter: parameter.clone(),
            cleared_by_other: false,
        }));
        true
    }

    /// Removes an expired override for `parameter` if present, without
    /// publishing a clear event attributable to any performer action.
    fn expire_if_needed(&self, parameter: &ParameterId, now: MonoMs) {
        let expired = self
            .active
            .get(parameter)
            .map(|o| o.is_expired(now))
            .unwrap_or(false);
        if expired {
            self.active.remove(parameter);
        }
    }

    /// Resolves the final output value for `parameter` given the raw
    /// consensus value, applying the active override's mode if one exists.
    pub fn resolve(&self, parameter: &ParameterId, consensus_value: f64, now: MonoMs) -> (f64, ConsensusMode) {
        self.expire_if_needed(parameter, now);
        match self.active.get(parameter) {
            None => (consensus_value, ConsensusMode::Consensus),
            Some(ov) => {
                let value = match ov.mode {
                    OverrideMode::Absolute => ov.value,
                    OverrideMode::Blend => {
                        let f = ov.blend_factor_or_default();
                        ov.value * f + consensus_value * (1.0 - f)
                    }
                    OverrideMode::Lock => ov.value,
                };
                let mode = match ov.mode {
                    OverrideMode::Absolute => ConsensusMode::Absolute,
                    OverrideMode::Blend => ConsensusMode::Blend,
                    OverrideMode::Lock => ConsensusMode::Lock,
                };
                (value.clamp(0.0, 1.0), mode)
            }
        }
    }

    pub fn active_override(&self, parameter: &ParameterId) -> Option<PerformerOverride> {
        self.active.get(parameter).map(|o| o.clone())
    }

    pub fn active_overrides_for(&self, performer_id: &PerformerId) -> Vec<PerformerOverride> {
        self.active
            .iter()
            .filter(|e| &e.performer_id == performer_id)
            .map(|e| e.value().clone())
            .collect()
    }
}
