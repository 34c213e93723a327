//! Audience input ingress (spec.md §4.4): validate, rate-limit,
//! flood-protect, batch, publish. Per-client state is sharded by `DashMap`
//! (keyed on client id hash) so concurrent connections never contend on a
//! single global lock, mirroring the teacher's `rl_key`/`rl_geo` maps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::{BusEvent, ParameterBus};
use crate::config::SessionConfig;
use crate::error::InputRejectReason;
use crate::types::{AudienceInput, ClientId, ClientState, Location, MonoMs, ParameterDefinition, ParameterId, VenueGeometry};

/// The client-facing `input` event payload before server-side enrichment.
#[derive(Clone, Debug)]
pub struct RawInput {
    pub parameter: String,
    pub value: f64,
}

const IDLE_EVICTION_MS: u64 = 60_000;
const FLOOD_BLOCK_MS: u64 = 60_000;
/// Window over which `maxInputsPerClient` is counted before a rolling reset;
/// chosen to equal the flood block duration so "rolling" and "block" share
/// one notion of a minute-scale window.
const COUNTER_WINDOW_MS: u64 = 60_000;

pub struct Ingress {
    definitions: HashMap<ParameterId, ParameterDefinition>,
    venue: VenueGeometry,
    clients: DashMap<ClientId, ClientState>,
    batch_buffer: Mutex<Vec<AudienceInput>>,
    aggregator_senders: HashMap<ParameterId, mpsc::UnboundedSender<AudienceInput>>,
    bus: Arc<ParameterBus>,
    rate_limit_ms: u64,
    max_inputs_per_client: u32,
    session_id: String,
    ingested_total: AtomicU64,
}

impl Ingress {
    pub fn new(
        cfg: &SessionConfig,
        bus: Arc<ParameterBus>,
        aggregator_senders: HashMap<ParameterId, mpsc::UnboundedSender<AudienceInput>>,
    ) -> Self {
        let definitions = cfg
            .parameters
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();
        Ingress {
            definitions,
            venue: cfg.venue.clone(),
            clients: DashMap::new(),
            batch_buffer: Mutex::new(Vec::new()),
            aggregator_senders,
            bus,
            rate_limit_ms: cfg.input_rate_limit_ms,
            max_inputs_per_client: cfg.max_inputs_per_client,
            session_id: cfg.session_name.clone(),
            ingested_total: AtomicU64::new(0),
        }
    }

    pub fn update_location(&self, client_id: &ClientId, location: Location, now: MonoMs) {
        let mut entry = self
            .clients
            .entry(client_id.clone())
            .or_insert_with(|| new_client_state(client_id, now));
        entry.last_location = Some(location);
    }

    pub fn accept(
        &self,
        client_id: &ClientId,
        session_id: &str,
        raw: RawInput,
        location: Option<Location>,
        now: MonoMs,
    ) -> Result<AudienceInput, InputRejectReason> {
        let mut entry = self
            .clients
            .entry(client_id.clone())
            .or_insert_with(|| new_client_state(client_id, now));

        if entry.is_blocked(now) {
            return Err(InputRejectReason::ClientBlocked);
        }

        let parameter = ParameterId(raw.parameter.clone());
        let def = match self.definitions.get(&parameter) {
            Some(d) if d.audience_controllable => d,
            _ => return Err(InputRejectReason::InvalidParameter),
        };

        if !raw.value.is_finite() || raw.value < 0.0 || raw.value > 1.0 {
            return Err(InputRejectReason::InvalidValue);
        }
        let loc = location.or(entry.last_location.clone());
        if let Some(l) = &loc {
            if !self.venue.contains(l.x, l.y) {
                return Err(InputRejectReason::InvalidValue);
            }
        }

        if now.saturating_sub(entry.last_input_time) < self.rate_limit_ms && entry.input_count > 0 {
            return Err(InputRejectReason::RateLimited);
        }

        if now.saturating_sub(entry.window_start) > COUNTER_WINDOW_MS {
            entry.window_start = now;
            entry.input_count = 0;
        }
        entry.input_count += 1;
        if entry.input_count > self.max_inputs_per_client {
            entry.blocked_until = Some(now + FLOOD_BLOCK_MS);
            return Err(InputRejectReason::FloodBlocked);
        }

        entry.last_input_time = now;
        if loc.is_some() {
            entry.last_location = loc.clone();
        }

        let input = AudienceInput {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.clone(),
            session_id: session_id.to_string(),
            timestamp: now,
            parameter: parameter.clone(),
            value: raw.value,
            location: loc,
        };

        self.ingested_total.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(BusEvent::AudienceInput(input.clone()));
        {
            let mut buf = self.batch_buffer.lock().expect("batch buffer poisoned");
            buf.push(input.clone());
        }
        if let Some(tx) = self.aggregator_senders.get(&def.id) {
            let _ = tx.send(input.clone());
        }

        Ok(input)
    }

    /// Drains the batch buffer and publishes it as a single event, if
    /// non-empty. Called by a fixed-interval background task.
    pub fn flush_batch(&self) {
        let batch = {
            let mut buf = self.batch_buffer.lock().expect("batch buffer poisoned");
            if buf.is_empty() {
                return;
            }
            std::mem::take(&mut *buf)
        };
        self.bus.publish(BusEvent::AudienceInputBatch(batch));
    }

    /// Evicts clients idle for more than 60s, and resets rolling counters
    /// past their window — the periodic sweep mirrored on the teacher's
    /// `eviction` task.
    pub fn sweep(&self, now: MonoMs) {
        self.clients.retain(|_, state| {
            now.saturating_sub(state.last_input_time) < IDLE_EVICTION_MS
                || state.is_blocked(now)
        });
        for mut entry in self.clients.iter_mut() {
            if now.saturating_sub(entry.window_start) > COUNTER_WINDOW_MS {
                entry.window_start = now;
                entry.input_count = 0;
            }
        }
    }

    pub fn active_client_count(&self, now: MonoMs) -> usize {
        self.clients
            .iter()
            .filter(|e| now.saturating_sub(e.last_input_time) < IDLE_EVICTION_MS)
            .count()
    }

    pub fn total_participants(&self) -> usize {
        self.clients.len()
    }

    pub fn client_state(&self, client_id: &ClientId) -> Option<ClientState> {
        self.clients.get(client_id).map(|e| e.clone())
    }

    /// Explicit removal on connection teardown, rather than waiting for the
    /// idle sweep, per spec.md §5 "cancellation deterministically releases
    /// all per-connection resources".
    pub fn remove_client(&self, client_id: &ClientId) {
        self.clients.remove(client_id);
    }

    pub fn ingested_total(&self) -> u64 {
        self.ingested_total.load(Ordering::Relaxed)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

fn new_client_state(client_id: &ClientId, now: MonoMs) -> ClientState {
    ClientState {
        client_id: client_id.clone(),
        last_input_time: 0,
        input_count: 0,
        window_start: now,
        last_location: None,
        blocked_until: None,
    }
}
