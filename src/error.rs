//! Closed error taxonomy. Internal errors never leak their `Display` text to a
//! client; wire-facing rejection/failure reasons are separate closed enums
//! below, mirroring spec.md's closed-set failure reasons exactly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("configuration invalid: {0}")]
    Config(String),

    #[error("aggregator consistency error: {0}")]
    AggregatorConsistency(String),

    #[error("session store unavailable")]
    StoreUnavailable,

    #[error("sink error: {0}")]
    Sink(String),
}

/// Reasons an audience input can be rejected at ingress (spec.md §6.1,
/// `input:rejected`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRejectReason {
    InvalidParameter,
    InvalidValue,
    RateLimited,
    ClientBlocked,
    FloodBlocked,
}

/// Reasons a performer override request can fail (spec.md §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideFailureReason {
    NotAuthenticated,
    NoOverridePermission,
    ParameterNotAllowed,
    InvalidValue,
    ParameterNotPerformerControllable,
}

/// Reasons a performer authentication attempt can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailureReason {
    InvalidSecret,
    Timeout,
    AlreadyAuthenticated,
}

/// Generic `{code, message}` wire error, used for anything not covered by a
/// more specific closed reason enum.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl WireError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        WireError {
            code: code.into(),
            message: message.into(),
        }
    }
}
