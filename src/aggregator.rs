//! Aggregator (spec.md §4.2): per-parameter sliding window, consensus
//! computation, and bounded history. Mutated only from the tick task; the
//! window itself is a `VecDeque`, which is already array-backed with a
//! head/tail index pair — pruning is a pointer move, never a node
//! deletion, matching the "ring buffer with indices" design note.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::overrides::OverrideRegistry;
use crate::types::{
    AudienceInput, ClientId, ConsensusMode, ConsensusResult, MonoMs, ParameterDefinition,
    ParameterId, VenueGeometry, WeightingConfig,
};
use crate::weighting;

const MAX_HISTORY_LENGTH: usize = 100;

struct ParamState {
    window: VecDeque<AudienceInput>,
    last_value: Option<f64>,
    history: VecDeque<ConsensusResult>,
    inbox_rx: mpsc::UnboundedReceiver<AudienceInput>,
}

pub struct Aggregator {
    definitions: HashMap<ParameterId, ParameterDefinition>,
    states: HashMap<ParameterId, ParamState>,
    overrides: Arc<OverrideRegistry>,
    weighting: WeightingConfig,
    venue: VenueGeometry,
}

impl Aggregator {
    /// Builds the aggregator and returns the per-parameter inbound channels
    /// ingress should use to offer accepted inputs — the only path onto the
    /// aggregator's hot path, per spec.md §5.
    pub fn new(
        cfg: &SessionConfig,
        overrides: Arc<OverrideRegistry>,
    ) -> (Self, HashMap<ParameterId, mpsc::UnboundedSender<AudienceInput>>) {
        let mut definitions = HashMap::new();
        let mut states = HashMap::new();
        let mut senders = HashMap::new();
        for def in &cfg.parameters {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(def.id.clone(), tx);
            states.insert(
                def.id.clone(),
                ParamState {
                    window: VecDeque::new(),
                    // The session's "current value" before any tick has run is the
                    // parameter's default (see S1: `GET /values` on an empty session
                    // reports the defaults) — this doubles as the smoothing anchor
                    // for the very first tick.
                    last_value: Some(def.default),
                    history: VecDeque::new(),
                    inbox_rx: rx,
                },
            );
            definitions.insert(def.id.clone(), def.clone());
        }
        (
            Aggregator {
                definitions,
                states,
                overrides,
                weighting: cfg.weighting,
                venue: cfg.venue.clone(),
            },
            senders,
        )
    }

    pub fn update_config(&mut self, weighting: WeightingConfig) {
        self.weighting = weighting;
    }

    pub fn set_stage_position(&mut self, x: f64, y: f64) {
        self.venue.stage_position = (x, y);
    }

    /// Drains every parameter's inbound queue and appends valid inputs to its
    /// window, then prunes inputs older than `temporalWindowMs`. Must be
    /// called once per tick before `compute_all`.
    pub fn drain_and_prune(&mut self, now: MonoMs) {
        for (id, state) in self.states.iter_mut() {
            let Some(def) = self.definitions.get(id) else { continue };
            while let Ok(input) = state.inbox_rx.try_recv() {
                if !def.audience_controllable {
                    continue;
                }
                if !input.value.is_finite() {
                    continue;
                }
                state.window.push_back(input);
            }
            let window_ms = self.weighting.temporal_window_ms;
            while let Some(front) = state.window.front() {
                if now.saturating_sub(front.timestamp) > window_ms {
                    state.window.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    pub fn compute_parameter(
        &mut self,
        parameter: &ParameterId,
        now: MonoMs,
        active_client_count: usize,
    ) -> Option<ConsensusResult> {
        let def = self.definitions.get(parameter)?.clone();
        let state = self.states.get_mut(parameter)?;

        let raw_values: Vec<f64> = state.window.iter().map(|i| i.value).collect();
        let input_count = raw_values.len();

        let (raw_mean, weighted_mean, stddev, bimodal) = if raw_values.is_empty() {
            let v = state.last_value.unwrap_or(def.default);
            (v, v, 0.0, false)
        } else {
            let mean = raw_values.iter().sum::<f64>() / raw_values.len() as f64;
            let stddev = weighting::standard_deviation(&raw_values);
            let survivors = weighting::outlier_filter_indices(&raw_values, self.weighting.outlier_threshold);

            let raw_weights: Vec<f64> = survivors
                .iter()
                .map(|&idx| {
                    let input = &state.window[idx];
                    let rw = weighting::RawWeight {
                        spatial: weighting::spatial_weight(
                            input.location.as_ref(),
                            &self.venue,
                            self.weighting.spatial_decay_rate,
                        ),
                        temporal: weighting::temporal_weight(
                            input.timestamp,
                            now,
                            self.weighting.temporal_window_ms,
                            self.weighting.temporal_decay_rate,
                        ),
                        consensus: weighting::consensus_weight(
                            input.value,
                            &raw_values,
                            self.weighting.cluster_threshold,
                        ),
                    };
                    rw.composite(&self.weighting)
                })
                .collect();
            let normalized = weighting::normalize_weights(&raw_weights);
            let pairs: Vec<(f64, f64)> = survivors
                .iter()
                .zip(normalized.iter())
                .map(|(&idx, &w)| (raw_values[idx], w))
                .collect();
            let weighted_mean = weighting::weighted_mean(&pairs);

            let analysis = weighting::cluster_analysis(
                &raw_values,
                self.weighting.cluster_threshold,
                state.last_value,
            );

            (mean, weighted_mean, stddev, analysis.bimodal)
        };

        let confidence = if input_count == 0 { 0.0 } else { 1.0 / (1.0 + stddev) };

        let (resolved, mode) = self.overrides.resolve(parameter, weighted_mean, now);
        let final_value = match mode {
            ConsensusMode::Lock => resolved,
            _ if def.smoothing_enabled => {
                weighting::exponential_smoothing(state.last_value, resolved, self.weighting.smoothing_factor)
            }
            _ => resolved,
        };
        let final_value = final_value.clamp(0.0, 1.0);

        let participation_rate = if active_client_count == 0 {
            0.0
        } else {
            input_count as f64 / active_client_count as f64
        };

        let result = ConsensusResult {
            parameter: parameter.clone(),
            value: final_value,
            confidence,
            input_count,
            timestamp: now,
            mode,
            raw_mean,
            weighted_mean,
            stddev,
            participation_rate,
            bimodal,
        };

        state.last_value = Some(final_value);
        state.history.push_back(result.clone());
        while state.history.len() > MAX_HISTORY_LENGTH {
            state.history.pop_front();
        }

        Some(result)
    }

    pub fn compute_all(&mut self, now: MonoMs, active_client_count: usize) -> HashMap<ParameterId, ConsensusResult> {
        let ids: Vec<ParameterId> = self.definitions.keys().cloned().collect();
        let mut out = HashMap::new();
        for id in ids {
            if let Some(r) = self.compute_parameter(&id, now, active_client_count) {
                out.insert(id, r);
            }
        }
        out
    }

    /// Distinct client ids with an input still inside any parameter's window.
    pub fn active_client_ids(&self) -> HashSet<ClientId> {
        let mut set = HashSet::new();
        for state in self.states.values() {
            for input in &state.window {
                set.insert(input.client_id.clone());
            }
        }
        set
    }

    pub fn history(&self, parameter: &ParameterId) -> Vec<ConsensusResult> {
        self.states
            .get(parameter)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn window_len(&self, parameter: &ParameterId) -> usize {
        self.states.get(parameter).map(|s| s.window.len()).unwrap_or(0)
    }

    pub fn parameter_ids(&self) -> Vec<ParameterId> {
        self.definitions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ParameterBus;
    use crate::types::ClientId;

    fn make_aggregator() -> (
        Aggregator,
        HashMap<ParameterId, mpsc::UnboundedSender<AudienceInput>>,
        SessionConfig,
    ) {
        let mut cfg = SessionConfig::default();
        cfg.performer_secret = Some("x".into());
        let bus = Arc::new(ParameterBus::new());
        let overrides = Arc::new(OverrideRegistry::new(bus));
        let (agg, senders) = Aggregator::new(&cfg, overrides);
        (agg, senders, cfg)
    }

    fn send_input(tx: &mpsc::UnboundedSender<AudienceInput>, parameter: &str, client: &str, value: f64, ts: MonoMs) {
        tx.send(AudienceInput {
            id: format!("{client}-{ts}"),
            client_id: ClientId(client.into()),
            session_id: "s1".into(),
            timestamp: ts,
            parameter: ParameterId(parameter.into()),
            value,
            location: None,
        })
        .unwrap();
    }

    #[test]
    fn empty_session_returns_defaults() {
        let (mut agg, _senders, _cfg) = make_aggregator();
        agg.drain_and_prune(0);
        let all = agg.compute_all(0, 0);
        assert_eq!(all[&ParameterId("mood".into())].value, 0.5);
        assert_eq!(all[&ParameterId("intensity".into())].value, 0.3);
        assert_eq!(all[&ParameterId("density".into())].value, 0.4);
        assert_eq!(all[&ParameterId("mood".into())].confidence, 0.0);
        assert_eq!(all[&ParameterId("mood".into())].input_count, 0);
    }

    #[test]
    fn unanimous_input_converges_per_smoothing_law() {
        let (mut agg, senders, _cfg) = make_aggregator();
        let tx = &senders[&ParameterId("mood".into())];
        for i in 0..10 {
            send_input(tx, "mood", &format!("c{i}"), 0.8, 0);
        }
        agg.drain_and_prune(0);
        let mut value = 0.5;
        for tick in 1..=5 {
            let now = tick * 50;
            agg.drain_and_prune(now);
            let r = agg.compute_parameter(&ParameterId("mood".into()), now, 10).unwrap();
            value = r.value;
        }
        let expected = 0.8 * (1.0 - 0.7f64.powi(5)) + 0.5 * 0.7f64.powi(5);
        assert!((value - expected).abs() < 0.02, "value={value} expected={expected}");
    }

    #[test]
    fn prunes_inputs_older_than_window() {
        let (mut agg, senders, _cfg) = make_aggregator();
        let tx = &senders[&ParameterId("mood".into())];
        send_input(tx, "mood", "c1", 0.9, 0);
        agg.drain_and_prune(0);
        assert_eq!(agg.window_len(&ParameterId("mood".into())), 1);
        agg.drain_and_prune(10_000);
        assert_eq!(agg.window_len(&ParameterId("mood".into())), 0);
    }

    #[test]
    fn bimodal_input_reported() {
        let (mut agg, senders, _cfg) = make_aggregator();
        let tx = &senders[&ParameterId("mood".into())];
        for i in 0..6 {
            send_input(tx, "mood", &format!("lo{i}"), 0.1, 0);
        }
        for i in 0..6 {
            send_input(tx, "mood", &format!("hi{i}"), 0.9, 0);
        }
        agg.drain_and_prune(0);
        let r = agg.compute_parameter(&ParameterId("mood".into()), 0, 12).unwrap();
        assert!(r.bimodal);
    }
}
