//! Fixed-cadence tick loop (spec.md §4.6). Owns the aggregator outright —
//! the aggregator is mutated only here, never shared — and drives one
//! compute/override/broadcast/sink cycle per interval. Ticks never overlap:
//! `MissedTickBehavior::Skip` means an overrunning tick's next slot is
//! dropped rather than queued, and the drop is counted in telemetry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{instrument, warn};

use crate::aggregator::Aggregator;
use crate::bus::{BusEvent, ParameterBus};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::ingress::Ingress;
use crate::sink::OscSink;
use crate::telemetry::Telemetry;
use crate::types::{ParameterDefinition, ParameterId, Snapshot, WeightingConfig};

pub struct TickLoop {
    aggregator: Aggregator,
    bus: Arc<ParameterBus>,
    ingress: Arc<Ingress>,
    sink: Option<Arc<OscSink>>,
    telemetry: Arc<Telemetry>,
    clock: Clock,
    session_id: String,
    interval_ms: u64,
    definitions: HashMap<ParameterId, ParameterDefinition>,
    paused: Arc<AtomicBool>,
}

impl TickLoop {
    /// Built without a sink — the OSC socket is bound asynchronously, so
    /// callers attach it with [`TickLoop::attach_sink`] once it exists.
    pub fn new(
        aggregator: Aggregator,
        cfg: &SessionConfig,
        bus: Arc<ParameterBus>,
        ingress: Arc<Ingress>,
        telemetry: Arc<Telemetry>,
        clock: Clock,
        paused: Arc<AtomicBool>,
    ) -> Self {
        let definitions = cfg.parameters.iter().map(|p| (p.id.clone(), p.clone())).collect();
        TickLoop {
            aggregator,
            bus,
            ingress,
            sink: None,
            telemetry,
            clock,
            session_id: cfg.session_name.clone(),
            interval_ms: cfg.consensus_interval_ms,
            definitions,
            paused,
        }
    }

    pub fn attach_sink(&mut self, sink: Arc<OscSink>) {
        self.sink = Some(sink);
    }

    pub fn update_weighting(&mut self, weighting: WeightingConfig) {
        self.aggregator.update_config(weighting);
    }

    pub fn set_stage_position(&mut self, x: f64, y: f64) {
        self.aggregator.set_stage_position(x, y);
    }

    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if self.paused.load(Ordering::Relaxed) {
                continue;
            }

            self.run_one_tick().await;
        }
    }

    #[instrument(skip(self))]
    async fn run_one_tick(&mut self) {
        let tick_start = Instant::now();
        let now = self.clock.now_ms();

        self.aggregator.drain_and_prune(now);
        let active_ids = self.aggregator.active_client_ids();
        let active_count = active_ids.len();
        let results = self.aggregator.compute_all(now, active_count);

        for result in results.values() {
            self.bus.publish(BusEvent::ConsensusUpdate(result.clone()));
        }

        let snapshot = Snapshot {
            session_id: self.session_id.clone(),
            timestamp: now,
            results: results.iter().map(|(k, v)| (k.0.clone(), v.clone())).collect(),
            total_participants: self.ingress.total_participants(),
            active_participants: active_count,
        };
        self.bus.publish(BusEvent::ConsensusSnapshot(snapshot));

        if let Some(sink) = &self.sink {
            sink.emit_tick(&results, &self.definitions).await;
        }

        let elapsed_ms = tick_start.elapsed().as_secs_f64() * 1000.0;
        self.telemetry.record_tick(elapsed_ms);
        if elapsed_ms > self.interval_ms as f64 {
            self.telemetry.record_tick_overrun();
            warn!(elapsed_ms, interval_ms = self.interval_ms, "tick_overrun");
            self.bus.publish(BusEvent::Warning("tick_overrun".to_string()));
        }
    }
}
