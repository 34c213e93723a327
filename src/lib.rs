//! Consensus performance engine library: the full pipeline (ingress,
//! aggregation, overrides, session lifecycle, transport) as a reusable
//! crate, so integration tests can drive a constructed `Session` directly
//! without a network socket in the loop.

pub mod aggregator;
pub mod bus;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingress;
pub mod overrides;
pub mod session;
pub mod sink;
pub mod store;
pub mod telemetry;
pub mod tick;
pub mod transport;
pub mod types;
pub mod weighting;
pub mod wire;
