//! External synthesis sink (spec.md §6.2): one OSC 1.0 UDP datagram per
//! parameter per tick, address `/performance/<parameter>`, a single `f32`
//! argument. Hand-rolled encoding in the same spirit as the teacher's own
//! hand-rolled protobuf helpers (`encode_ack`, `hex_encode`) — the wire
//! format is three small pure functions, not worth a dependency.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::types::{ConsensusResult, ParameterDefinition, ParameterId};

const MIN_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Pads an OSC string: null-terminated, then padded with further nulls to a
/// 4-byte boundary.
fn osc_string(s: &str) -> Vec<u8> {
    let mut buf = s.as_bytes().to_vec();
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
    buf
}

/// Encodes one OSC message: address pattern, `",f"` type tag, one big-endian
/// f32 argument.
pub fn encode_osc_f32(address: &str, value: f32) -> Vec<u8> {
    let mut buf = osc_string(address);
    buf.extend(osc_string(",f"));
    buf.extend(value.to_be_bytes());
    buf
}

pub struct OscSink {
    socket: UdpSocket,
    target: SocketAddr,
    enabled: bool,
    degraded: AtomicBool,
    backoff_ms: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl OscSink {
    pub async fn new(target: SocketAddr, enabled: bool) -> std::io::Result<Self> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(OscSink {
            socket,
            target,
            enabled,
            degraded: AtomicBool::new(false),
            backoff_ms: AtomicU64::new(MIN_BACKOFF_MS),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Emits one datagram per parameter. Failures mark the sink degraded but
    /// never block or fail the tick — values are not queued, per spec.md §4.8.
    pub async fn emit_tick(
        &self,
        results: &HashMap<ParameterId, ConsensusResult>,
        definitions: &HashMap<ParameterId, ParameterDefinition>,
    ) {
        if !self.enabled {
            return;
        }
        for (id, result) in results {
            let address = definitions
                .get(id)
                .map(|d| d.sink_address())
                .unwrap_or_else(|| format!("/performance/{}", id.0));
            let datagram = encode_osc_f32(&address, result.value as f32);
            match self.socket.send_to(&datagram, self.target).await {
                Ok(_) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    if self.degraded.swap(false, Ordering::Relaxed) {
                        debug!(%address, "osc_sink_recovered");
                    }
                    self.backoff_ms.store(MIN_BACKOFF_MS, Ordering::Relaxed);
                }
                Err(e) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    if !self.degraded.swap(true, Ordering::Relaxed) {
                        warn!(error=%e, %address, "osc_sink_degraded");
                    }
                }
            }
        }
    }

    /// Background reconnection probe: while degraded, retries at a capped
    /// exponential interval. A UDP "reconnect" is just a zero-length probe
    /// send; its success clears the degraded flag on the next `emit_tick`.
    pub async fn run_reconnect_probe(self: Arc<Self>) {
        loop {
            let wait = self.backoff_ms.load(Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(wait)).await;
            if !self.is_degraded() {
                continue;
            }
            if self.socket.send_to(&[], self.target).await.is_err() {
                let next = (wait * 2).min(MAX_BACKOFF_MS);
                self.backoff_ms.store(next, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn osc_string_padding() {
        assert_eq!(osc_string("a").len() % 4, 0);
        assert_eq!(osc_string("abcd").len() % 4, 0);
        assert_eq!(osc_string("").len(), 4);
    }

    #[test]
    fn encode_contains_address_and_type_tag() {
        let msg = encode_osc_f32("/performance/mood", 0.5);
        let addr_bytes = osc_string("/performance/mood");
        assert_eq!(&msg[..addr_bytes.len()], &addr_bytes[..]);
        let tag_bytes = osc_string(",f");
        assert_eq!(&msg[addr_bytes.len()..addr_bytes.len() + tag_bytes.len()], &tag_bytes[..]);
        assert_eq!(msg.len(), addr_bytes.len() + tag_bytes.len() + 4);
    }

    #[tokio::test]
    async fn emit_tick_sends_one_datagram_per_parameter() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let sink = OscSink::new(addr, true).await.unwrap();

        let mut results = HashMap::new();
        let mut defs = HashMap::new();
        for name in ["mood", "tempo"] {
            let id = ParameterId(name.into());
            results.insert(
                id.clone(),
                ConsensusResult {
                    parameter: id.clone(),
                    value: 0.5,
                    confidence: 1.0,
                    input_count: 1,
                    timestamp: 0,
                    mode: crate::types::ConsensusMode::Consensus,
                    raw_mean: 0.5,
                    weighted_mean: 0.5,
                    stddev: 0.0,
                    participation_rate: 1.0,
                    bimodal: false,
                },
            );
        }
        sink.emit_tick(&results, &defs).await;
        defs.clear();

        let mut buf = [0u8; 64];
        let mut received = 0;
        for _ in 0..2 {
            if tokio::time::timeout(Duration::from_millis(200), server.recv_from(&mut buf))
                .await
                .is_ok()
            {
                received += 1;
            }
        }
        assert_eq!(received, 2);
        assert_eq!(sink.sent_count(), 2);
    }
}
