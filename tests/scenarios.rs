//! End-to-end scenarios driving a constructed `Session` directly, no network
//! socket in the loop (the pipeline components are independently testable).
//! Mirrors the concrete scenarios S1-S7: empty-session defaults, unanimous
//! convergence, absolute/blend override resolution, rate limiting, override
//! expiry timing, and bimodal clustering.

use std::sync::Arc;
use std::time::Duration;

use consensus_engine::bus::{BusEvent, EventKind};
use consensus_engine::config::SessionConfig;
use consensus_engine::ingress::RawInput;
use consensus_engine::overrides::OverrideRequest;
use consensus_engine::session::Session;
use consensus_engine::store::InMemoryStore;
use consensus_engine::tick::TickLoop;
use consensus_engine::types::{ClientId, Location, OverrideMode, ParameterId, PerformerId, PerformerPermissions};

fn scenario_config() -> SessionConfig {
    let mut cfg = SessionConfig::default();
    cfg.performer_secret = Some("s3cret".into());
    cfg.consensus_interval_ms = 20;
    cfg.weighting.temporal_window_ms = 5000;
    cfg
}

fn build() -> (Arc<Session>, TickLoop) {
    Session::new(scenario_config(), Arc::new(InMemoryStore::new()))
}

/// Spawns the tick loop and a relay task copying each published snapshot
/// onto the session, the same wiring `main.rs` does at startup.
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

async fn advance_ticks(n: u32) {
    for _ in 0..n {
        tokio::time::advance(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
    }
}

/// S1: a freshly constructed, unstarted session reports no values and
/// `Pending` status before any tick has run.
#[tokio::test]
async fn s1_empty_session_reports_defaults() {
    let (session, _tick_loop) = build();
    assert!(session.current_values().is_empty());
    assert_eq!(session.status(), consensus_engine::types::SessionStatus::Pending);
}

/// S2: with every audience member submitting the same value, the consensus
/// smoothly converges toward it tick over tick.
#[tokio::test(start_paused = true)]
async fn s2_unanimous_input_converges_toward_consensus() {
    let (session, tick_loop) = build();
    session.start();
    spawn_pipeline(session.clone(), tick_loop);

    for i in 0..5u64 {
        session
            .ingress
            .accept(
                &ClientId(format!("c{i}")),
                &session.id,
                RawInput { parameter: "mood".into(), value: 0.9 },
                None,
                0,
            )
            .unwrap();
    }

    advance_ticks(25).await;

    let mood = session.current_values()["mood"];
    assert!(mood > 0.75, "expected mood to converge toward 0.9, got {mood}");
}

/// S3: an absolute override converges the parameter toward the override
/// value under smoothing, rather than snapping to it instantly.
#[tokio::test(start_paused = true)]
async fn s3_absolute_override_converges_toward_override_value() {
    let (session, tick_loop) = build();
    session.start();
    spawn_pipeline(session.clone(), tick_loop);

    let performer = PerformerId("p1".into());
    let req = OverrideRequest {
        performer_id: performer.clone(),
        is_authenticated: true,
        permissions: PerformerPermissions::all(),
        parameter: ParameterId("mood".into()),
        value: 0.2,
        mode: OverrideMode::Absolute,
        blend_factor: None,
        duration_ms: None,
        reason: None,
    };
    session.overrides.request(req, &session.config.read().unwrap().clone(), 0).unwrap();

    advance_ticks(30).await;

    let mood = session.current_values()["mood"];
    assert!(mood <= 0.5, "expected mood to have moved down toward 0.2, got {mood}");
}

/// S4: a blend override settles at `blendFactor * override + (1 - blendFactor)
/// * consensus` once the tick loop has had time to converge.
#[tokio::test(start_paused = true)]
async fn s4_blend_override_settles_near_formula_target() {
    let (session, tick_loop) = build();
    session.start();
    spawn_pipeline(session.clone(), tick_loop);

    for i in 0..5u64 {
        session
            .ingress
            .accept(
                &ClientId(format!("c{i}")),
                &session.id,
                RawInput { parameter: "mood".into(), value: 0.8 },
                None,
                0,
            )
            .unwrap();
    }

    let req = OverrideRequest {
        performer_id: PerformerId("p1".into()),
        is_authenticated: true,
        permissions: PerformerPermissions::all(),
        parameter: ParameterId("mood".into()),
        value: 0.2,
        mode: OverrideMode::Blend,
        blend_factor: Some(0.5),
        duration_ms: None,
        reason: None,
    };
    session.overrides.request(req, &session.config.read().unwrap().clone(), 0).unwrap();

    advance_ticks(80).await;

    let mood = session.current_values()["mood"];
    assert!((mood - 0.5).abs() < 0.1, "expected mood near the 0.5 blend target, got {mood}");
}

/// S5: at double the configured input rate, exactly half of submitted inputs
/// are accepted; the other half are rejected as rate-limited.
#[tokio::test]
async fn s5_rate_limiting_accepts_exactly_half_at_double_rate() {
    let (session, _tick_loop) = build();
    let client = ClientId("c1".into());
    let mut accepted = 0;
    for i in 0..20u64 {
        let now = i * 50;
        if session
            .ingress
            .accept(&client, &session.id, RawInput { parameter: "mood".into(), value: 0.5 }, None, now)
            .is_ok()
        {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 10);
}

/// S6: an override with a 200ms duration is still in effect at t=100ms and
/// has expired by t=400ms, reverting to the plain audience consensus.
#[tokio::test(start_paused = true)]
async fn s6_override_expiry_takes_effect_after_duration() {
    let (session, tick_loop) = build();
    session.start();
    spawn_pipeline(session.clone(), tick_loop);

    session
        .ingress
        .accept(&ClientId("c1".into()), &session.id, RawInput { parameter: "mood".into(), value: 0.0 }, None, 0)
        .unwrap();

    let req = OverrideRequest {
        performer_id: PerformerId("p1".into()),
        is_authenticated: true,
        permissions: PerformerPermissions::all(),
        parameter: ParameterId("mood".into()),
        value: 1.0,
        mode: OverrideMode::Lock,
        blend_factor: None,
        duration_ms: Some(200),
        reason: None,
    };
    session.overrides.request(req, &session.config.read().unwrap().clone(), 0).unwrap();

    advance_ticks(5).await;
    assert!(session.current_values()["mood"] >= 0.9, "override should still be in effect at t=100ms");

    advance_ticks(15).await;
    assert!(session.current_values()["mood"] <= 0.1, "override should have expired by t=400ms");
}

/// S7: two equally-sized, widely separated clusters of audience input are
/// reported as bimodal rather than averaged into a misleading midpoint.
#[tokio::test(start_paused = true)]
async fn s7_bimodal_input_is_reported_as_bimodal() {
    let (session, tick_loop) = build();
    session.start();
    spawn_pipeline(session.clone(), tick_loop);

    for i in 0..6u64 {
        session
            .ingress
            .accept(
                &ClientId(format!("low{i}")),
                &session.id,
                RawInput { parameter: "mood".into(), value: 0.05 },
                Some(Location { x: 10.0, y: 10.0, zone: None }),
                0,
            )
            .unwrap();
        session
            .ingress
            .accept(
                &ClientId(format!("high{i}")),
                &session.id,
                RawInput { parameter: "mood".into(), value: 0.95 },
                Some(Location { x: 90.0, y: 90.0, zone: None }),
                0,
            )
            .unwrap();
    }

    advance_ticks(3).await;

    let snapshot = session.latest_snapshot();
    assert!(snapshot.results["mood"].bimodal, "expected two equal-density clusters to be flagged bimodal");
}
