//! Consensus performance engine entrypoint: wires configuration, session,
//! tick loop, telemetry, OSC sink, and the axum transport/control router
//! together, then runs until shutdown.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use consensus_engine::bus::{BusEvent, EventKind};
use consensus_engine::config::SessionConfig;
use consensus_engine::session::Session;
use consensus_engine::sink::OscSink;
use consensus_engine::store::InMemoryStore;
use consensus_engine::transport;

/// Command-line flags for the consensus engine binary.
#[derive(Parser, Debug)]
#[command(name = "consensus-engine", version)]
struct Cli {
    /// HTTP/WebSocket listen port; overrides PERF_LISTEN_PORT if set.
    #[arg(long)]
    port: Option<u16>,

    /// Path to a JSON session config file; overrides PERF_CONFIG_PATH if set.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "consensus_engine=info,tower_http=info".into()))
        .json()
        .init();

    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        env::set_var("PERF_CONFIG_PATH", path);
    }

    let cfg = match SessionConfig::load_from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "config_invalid");
            std::process::exit(1);
        }
    };
    info!(session = %cfg.session_name, genre_weights = ?cfg.weighting, "config_loaded");

    let store = Arc::new(InMemoryStore::new());
    let (session, mut tick_loop) = Session::new(cfg.clone(), store);

    match OscSink::new(
        cfg.osc_addr().unwrap_or_else(|e| {
            error!(error = %e, "invalid_osc_address");
            std::process::exit(1);
        }),
        cfg.osc.enabled,
    )
    .await
    {
        Ok(sink) => {
            let sink = Arc::new(sink);
            tick_loop.attach_sink(sink.clone());
            session.attach_sink(sink.clone());
            tokio::spawn(sink.run_reconnect_probe());
        }
        Err(e) => {
            error!(error = %e, "osc_socket_bind_failed");
        }
    }

    session.start();

    let shutdown_rx = session.shutdown_receiver();
    tokio::spawn(tick_loop.run(shutdown_rx));

    {
        let session = session.clone();
        let mut snapshot_sub = session.bus.subscribe(EventKind::ConsensusSnapshot);
        tokio::spawn(async move {
            while let Some(event) = snapshot_sub.rx.recv().await {
                if let BusEvent::ConsensusSnapshot(snap) = event {
                    session.set_latest_snapshot(snap);
                }
            }
        });
    }

    {
        let telemetry = session.telemetry.clone();
        let ingress = session.ingress.clone();
        tokio::spawn(telemetry.run(ingress, 1000));
    }

    {
        let ingress = session.ingress.clone();
        let batch_interval_ms = cfg.batch_interval_ms.max(1);
        tokio::spawn(async move {
            let mut iv = tokio::time::interval(std::time::Duration::from_millis(batch_interval_ms));
            loop {
                iv.tick().await;
                ingress.flush_batch();
            }
        });
    }

    {
        let ingress = session.ingress.clone();
        let clock = session.clock.clone();
        tokio::spawn(async move {
            let mut iv = tokio::time::interval(std::time::Duration::from_secs(10));
            loop {
                iv.tick().await;
                ingress.sweep(clock.now_ms());
            }
        });
    }

    let port = cli
        .port
        .or_else(|| env::var("PERF_LISTEN_PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8787);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = transport::router(session.clone());

    info!(%addr, "listening");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "listen_failed");
            std::process::exit(1);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown_signal_received");
            session.end();
        })
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "server_error");
            std::process::exit(1);
        });
}
