//! The session: the single process-wide mutable object tying every component
//! together. Construction and teardown are explicit lifecycle operations —
//! no ambient singletons (spec.md §9, "Session-wide mutable state").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::info;

use crate::aggregator::Aggregator;
use crate::bus::{BusEvent, ParameterBus, SessionLifecycleKind, SessionLifecyclePayload};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::error::AuthFailureReason;
use crate::ingress::Ingress;
use crate::overrides::OverrideRegistry;
use crate::sink::OscSink;
use crate::store::SessionStore;
use crate::telemetry::Telemetry;
use crate::tick::TickLoop;
use crate::types::{
    ParameterDefinition, ParameterId, PerformerId, PerformerPermissions, PerformerSession,
    Snapshot, SessionStatus,
};

pub struct Session {
    pub id: String,
    pub config: RwLock<SessionConfig>,
    pub bus: Arc<ParameterBus>,
    pub ingress: Arc<Ingress>,
    pub overrides: Arc<OverrideRegistry>,
    pub store: Arc<dyn SessionStore>,
    pub telemetry: Arc<Telemetry>,
    pub clock: Clock,
    pub definitions: HashMap<ParameterId, ParameterDefinition>,
    status: RwLock<SessionStatus>,
    paused: Arc<AtomicBool>,
    performers: DashMap<PerformerId, PerformerSession>,
    latest_snapshot: RwLock<Snapshot>,
    shutdown_tx: watch::Sender<bool>,
    sink: RwLock<Option<Arc<OscSink>>>,
}

impl Session {
    /// Builds the session and the tick loop that drives it. The caller is
    /// responsible for spawning `TickLoop::run` — kept separate so
    /// construction never implicitly starts background work.
    pub fn new(cfg: SessionConfig, store: Arc<dyn SessionStore>) -> (Arc<Session>, TickLoop) {
        let bus = Arc::new(ParameterBus::new());
        let overrides = Arc::new(OverrideRegistry::new(bus.clone()));
        let (aggregator, agg_senders) = Aggregator::new(&cfg, overrides.clone());
        let ingress = Arc::new(Ingress::new(&cfg, bus.clone(), agg_senders));
        let telemetry = Arc::new(Telemetry::new(bus.clone()));
        let clock = Clock::new();
        let paused = Arc::new(AtomicBool::new(false));
        let definitions: HashMap<ParameterId, ParameterDefinition> =
            cfg.parameters.iter().map(|p| (p.id.clone(), p.clone())).collect();

        let initial_snapshot = Snapshot {
            session_id: cfg.session_name.clone(),
            timestamp: 0,
            results: HashMap::new(),
            total_participants: 0,
            active_participants: 0,
        };

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let session = Arc::new(Session {
            id: cfg.session_name.clone(),
            config: RwLock::new(cfg.clone()),
            bus: bus.clone(),
            ingress: ingress.clone(),
            overrides: overrides.clone(),
            store,
            telemetry: telemetry.clone(),
            clock: clock.clone(),
            definitions,
            status: RwLock::new(SessionStatus::Pending),
            paused: paused.clone(),
            performers: DashMap::new(),
            latest_snapshot: RwLock::new(initial_snapshot),
            shutdown_tx,
            sink: RwLock::new(None),
        });

        // The OSC socket is bound asynchronously by the caller and attached
        // to the returned `TickLoop` via `attach_sink` before it is spawned.
        let tick_loop = TickLoop::new(
            aggregator,
            &session.config.read().expect("config lock poisoned").clone(),
            bus,
            ingress,
            telemetry,
            clock,
            paused,
        );

        (session, tick_loop)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read().expect("status lock poisoned")
    }

    pub fn set_latest_snapshot(&self, snapshot: Snapshot) {
        *self.latest_snapshot.write().expect("snapshot lock poisoned") = snapshot;
    }

    pub fn latest_snapshot(&self) -> Snapshot {
        self.latest_snapshot.read().expect("snapshot lock poisoned").clone()
    }

    pub fn current_values(&self) -> HashMap<String, f64> {
        self.latest_snapshot()
            .results
            .into_iter()
            .map(|(k, v)| (k, v.value))
            .collect()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn authenticate_performer(
        &self,
        secret: &str,
        performer_id: PerformerId,
        display_name: Option<String>,
    ) -> Result<PerformerSession, AuthFailureReason> {
        let cfg = self.config.read().expect("config lock poisoned");
        let expected = cfg.performer_secret.as_deref().unwrap_or("");
        if expected.is_empty() || secret != expected {
            return Err(AuthFailureReason::InvalidSecret);
        }
        let perf = PerformerSession {
            performer_id: performer_id.clone(),
            display_name: display_name.unwrap_or_else(|| performer_id.0.clone()),
            is_authenticated: true,
            permissions: PerformerPermissions::all(),
        };
        self.performers.insert(performer_id, perf.clone());
        Ok(perf)
    }

    pub fn performer(&self, id: &PerformerId) -> Option<PerformerSession> {
        self.performers.get(id).map(|e| e.clone())
    }

    pub fn disconnect_performer(&self, id: &PerformerId) {
        self.performers.remove(id);
    }

    pub fn start(&self) {
        *self.status.write().expect("status lock poisoned") = SessionStatus::Active;
        self.bus.publish(BusEvent::SessionLifecycle(SessionLifecyclePayload {
            kind: SessionLifecycleKind::Start,
            session_id: self.id.clone(),
        }));
        info!(session = %self.id, "session_started");
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        *self.status.write().expect("status lock poisoned") = SessionStatus::Paused;
        self.bus.publish(BusEvent::SessionLifecycle(SessionLifecyclePayload {
            kind: SessionLifecycleKind::Pause,
            session_id: self.id.clone(),
        }));
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        *self.status.write().expect("status lock poisoned") = SessionStatus::Active;
        self.bus.publish(BusEvent::SessionLifecycle(SessionLifecyclePayload {
            kind: SessionLifecycleKind::Resume,
            session_id: self.id.clone(),
        }));
    }

    pub fn end(&self) {
        *self.status.write().expect("status lock poisoned") = SessionStatus::Ended;
        self.bus.publish(BusEvent::SessionLifecycle(SessionLifecyclePayload {
            kind: SessionLifecycleKind::End,
            session_id: self.id.clone(),
        }));
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn attach_sink(&self, sink: Arc<OscSink>) {
        *self.sink.write().expect("sink lock poisoned") = Some(sink);
    }

    /// `(degraded, sent_count)`, if an OSC sink has been attached.
    pub fn sink_status(&self) -> Option<(bool, u64)> {
        self.sink
            .read()
            .expect("sink lock poisoned")
            .as_ref()
            .map(|s| (s.is_degraded(), s.sent_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::ingress::RawInput;
    use crate::overrides::OverrideRequest;
    use crate::store::InMemoryStore;
    use crate::types::OverrideMode;

    fn test_config() -> SessionConfig {
        let mut cfg = SessionConfig::default();
        cfg.performer_secret = Some("s3cret".into());
        cfg.consensus_interval_ms = 20;
        cfg.weighting.temporal_window_ms = 5000;
        cfg
    }

    fn build() -> (Arc<Session>, TickLoop) {
        Session::new(test_config(), Arc::new(InMemoryStore::new()))
    }

    /// Spawns the tick loop and a relay task copying each published snapshot
    /// onto the session, mirroring what `main.rs` wires up at startup.
    fn spawn_pipeline(session: Arc<Session>, tick_loop: TickLoop) {
        let shutdown_rx = session.shutdown_receiver();
        tokio::spawn(tick_loop.run(shutdown_rx));

        let mut sub = session.bus.subscribe(EventKind::ConsensusSnapshot);
        let relay_session = session.clone();
        tokio::spawn(async move {
            while let Some(event) = sub.rx.recv().await {
                if let BusEvent::ConsensusSnapshot(snap) = event {
                    relay_session.set_latest_snapshot(snap);
                }
            }
        });
    }

    #[tokio::test]
    async fn fresh_session_reports_parameter_defaults() {
        let (session, _tick_loop) = build();
        let values = session.current_values();
        assert!(values.is_empty(), "no tick has run yet, snapshot is still empty");
        assert_eq!(session.status(), SessionStatus::Pending);
        let defaults: HashMap<_, _> = session
            .definitions
            .values()
            .map(|d| (d.id.0.clone(), d.default))
            .collect();
        assert_eq!(defaults.get("mood"), Some(&0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn audience_input_converges_toward_consensus_over_ticks() {
        let (session, tick_loop) = build();
        session.start();
        spawn_pipeline(session.clone(), tick_loop);

        let now = session.clock.now_ms();
        for i in 0..8 {
            session
                .ingress
                .accept(
                    &crate::types::ClientId(format!("c{i}")),
                    &session.id,
                    RawInput { parameter: "mood".into(), value: 0.9 },
                    None,
                    now,
                )
                .expect("input accepted");
        }

        for _ in 0..20 {
            tokio::time::advance(std::time::Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
        }

        let values = session.current_values();
        let mood = *values.get("mood").expect("mood present after first tick");
        assert!(mood > 0.5, "mood should have moved toward 0.9, got {mood}");
    }

    #[tokio::test]
    async fn performer_auth_succeeds_with_correct_secret_and_fails_otherwise() {
        let (session, _tick_loop) = build();
        let ok = session.authenticate_performer("s3cret", PerformerId("p1".into()), None);
        assert!(ok.is_ok());
        assert!(session.performer(&PerformerId("p1".into())).is_some());

        let bad = session.authenticate_performer("wrong", PerformerId("p2".into()), None);
        assert!(matches!(bad, Err(AuthFailureReason::InvalidSecret)));
    }

    #[tokio::test]
    async fn disconnect_removes_performer_session() {
        let (session, _tick_loop) = build();
        session.authenticate_performer("s3cret", PerformerId("p1".into()), None).unwrap();
        session.disconnect_performer(&PerformerId("p1".into()));
        assert!(session.performer(&PerformerId("p1".into())).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_override_pins_value_despite_opposing_consensus() {
        let (session, tick_loop) = build();
        session.start();
        spawn_pipeline(session.clone(), tick_loop);

        let perf = session
            .authenticate_performer("s3cret", PerformerId("p1".into()), None)
            .unwrap();

        let now = session.clock.now_ms();
        for i in 0..5 {
            session
                .ingress
                .accept(
                    &crate::types::ClientId(format!("c{i}")),
                    &session.id,
                    RawInput { parameter: "mood".into(), value: 0.1 },
                    None,
                    now,
                )
                .unwrap();
        }

        let cfg = session.config.read().unwrap().clone();
        session
            .overrides
            .request(
                OverrideRequest {
                    performer_id: perf.performer_id.clone(),
                    is_authenticated: perf.is_authenticated,
                    permissions: perf.permissions.clone(),
                    parameter: ParameterId("mood".into()),
                    value: 0.95,
                    mode: OverrideMode::Lock,
                    blend_factor: None,
                    duration_ms: None,
                    reason: Some("cue hit".into()),
                },
                &cfg,
                now,
            )
            .expect("performer has override permission");

        for _ in 0..10 {
            tokio::time::advance(std::time::Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
        }

        let mood = *session.current_values().get("mood").unwrap();
        assert_eq!(mood, 0.95, "lock override must win over opposing audience input");
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_the_tick_loop() {
        let (session, tick_loop) = build();
        session.start();
        spawn_pipeline(session.clone(), tick_loop);

        for _ in 0..5 {
            tokio::time::advance(std::time::Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
        }
        let before = session.current_values();

        session.pause();
        assert_eq!(session.status(), SessionStatus::Paused);
        let now = session.clock.now_ms();
        session
            .ingress
            .accept(
                &crate::types::ClientId("c1".into()),
                &session.id,
                RawInput { parameter: "mood".into(), value: 0.99 },
                None,
                now,
            )
            .unwrap();
        for _ in 0..10 {
            tokio::time::advance(std::time::Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
        }
        let after = session.current_values();
        assert_eq!(before.get("mood"), after.get("mood"), "paused session must not advance consensus");

        session.resume();
        assert_eq!(session.status(), SessionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn end_signals_shutdown_and_stops_the_tick_loop() {
        let (session, tick_loop) = build();
        session.start();
        let shutdown_rx = session.shutdown_receiver();
        let handle = tokio::spawn(tick_loop.run(shutdown_rx));

        tokio::time::advance(std::time::Duration::from_millis(20)).await;
        tokio::task::yield_now().await;

        session.end();
        assert_eq!(session.status(), SessionStatus::Ended);

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("tick loop must exit promptly after end()")
            .expect("tick loop task must not panic");
    }
}
