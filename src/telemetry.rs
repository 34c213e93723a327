//! Telemetry collector (spec.md §4.5 stats, §2 item 8): throughput, fan-out
//! latency, active participants, reported once per second as a `stats` bus
//! event and available via the `/metrics` control-plane route — the same
//! shape of periodic JSON counters the teacher exposes at `/metrics`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::bus::{BusEvent, BusStats, EventKind, ParameterBus, ALL_KINDS};
use crate::ingress::Ingress;

pub struct Telemetry {
    bus: Arc<ParameterBus>,
    last_tick_latency_bits: AtomicU64,
    tick_count: AtomicU64,
    tick_overrun_count: AtomicU64,
}

impl Telemetry {
    pub fn new(bus: Arc<ParameterBus>) -> Self {
        Telemetry {
            bus,
            last_tick_latency_bits: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            tick_overrun_count: AtomicU64::new(0),
        }
    }

    pub fn record_tick(&self, latency_ms: f64) {
        self.last_tick_latency_bits
            .store(latency_ms.to_bits(), Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tick_overrun(&self) {
        self.tick_overrun_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_tick_latency_ms(&self) -> f64 {
        f64::from_bits(self.last_tick_latency_bits.load(Ordering::Relaxed))
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Relaxed)
    }

    pub fn tick_overrun_count(&self) -> u64 {
        self.tick_overrun_count.load(Ordering::Relaxed)
    }

    /// Runs forever, publishing a `stats` event every `interval_ms`.
    pub async fn run(self: Arc<Self>, ingress: Arc<Ingress>, interval_ms: u64) {
        let mut last_inputs = ingress.ingested_total();
        let mut last_consensus = self.bus.published_count(EventKind::ConsensusUpdate);
        let mut iv = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            iv.tick().await;
            let inputs_now = ingress.ingested_total();
            let consensus_now = self.bus.published_count(EventKind::ConsensusUpdate);
            let seconds = interval_ms as f64 / 1000.0;

            let mut active_subscribers = HashMap::new();
            for kind in ALL_KINDS {
                active_subscribers.insert(
                    format!("{kind:?}"),
                    self.bus.active_subscribers(*kind),
                );
            }

            let stats = BusStats {
                inputs_per_sec: (inputs_now.saturating_sub(last_inputs)) as f64 / seconds,
                consensus_updates_per_sec: (consensus_now.saturating_sub(last_consensus)) as f64 / seconds,
                active_subscribers,
                last_tick_latency_ms: self.last_tick_latency_ms(),
            };
            info!(
                inputs_per_sec = stats.inputs_per_sec,
                consensus_updates_per_sec = stats.consensus_updates_per_sec,
                last_tick_latency_ms = stats.last_tick_latency_ms,
                ticks = self.tick_count(),
                overruns = self.tick_overrun_count(),
                "telemetry_tick"
            );
            self.bus.publish(BusEvent::Stats(stats));

            last_inputs = inputs_now;
            last_consensus = consensus_now;
        }
    }
}
