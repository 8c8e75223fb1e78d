//! Telemetry counters and debug snapshots.
//!
//! Counters accumulate inside each component and are drained by
//! `collect_telemetry`; debug info is a point-in-time snapshot assembled on
//! demand.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::network::NetworkInfo;

/// At most this many samples are kept per latency series between collects.
pub const LATENCY_COLLECTION_LIMIT: usize = 5;

/// Cumulative counters, reset on read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KryptonTelemetry {
    pub successful_rekeys: u32,
    pub network_switches: u32,
    pub successful_network_switches: u32,
    pub network_switch_latencies: Vec<Duration>,
    pub oauth_latencies: Vec<Duration>,
    pub initial_data_latencies: Vec<Duration>,
    pub zinc_latencies: Vec<Duration>,
    pub egress_latencies: Vec<Duration>,
    pub token_unblind_failure_count: u32,
}

/// Appends the elapsed time since `start`, dropping the sample once the
/// series is full.
pub fn record_latency(start: Instant, sink: &mut Vec<Duration>, label: &str) {
    let elapsed = start.elapsed();
    if sink.len() < LATENCY_COLLECTION_LIMIT {
        sink.push(elapsed);
    } else {
        debug!(label, ?elapsed, "latency series full, dropping sample");
    }
}

/// Datapath section of the debug snapshot.
#[derive(Debug, Clone, Default)]
pub struct DatapathDebugInfo {
    pub state: String,
    pub status: String,
}

/// Auth section of the debug snapshot.
#[derive(Debug, Clone, Default)]
pub struct AuthDebugInfo {
    pub state: String,
    pub status: String,
    pub latencies: Vec<Duration>,
}

/// Egress section of the debug snapshot.
#[derive(Debug, Clone, Default)]
pub struct EgressDebugInfo {
    pub state: String,
    pub status: String,
    pub latencies: Vec<Duration>,
}

/// Session section of the debug snapshot.
#[derive(Debug, Clone, Default)]
pub struct SessionDebugInfo {
    pub state: String,
    pub status: String,
    pub active_network: Option<NetworkInfo>,
    pub successful_rekeys: u32,
    pub network_switches: u32,
    pub datapath: DatapathDebugInfo,
}

/// Complete debug snapshot handed to the embedder.
#[derive(Debug, Clone, Default)]
pub struct KryptonDebugInfo {
    pub session: SessionDebugInfo,
    pub auth: AuthDebugInfo,
    pub egress: EgressDebugInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_latency_caps_series() {
        let start = Instant::now();
        let mut sink = Vec::new();
        for _ in 0..(LATENCY_COLLECTION_LIMIT + 3) {
            record_latency(start, &mut sink, "test");
        }
        assert_eq!(sink.len(), LATENCY_COLLECTION_LIMIT);
    }

    #[test]
    fn test_telemetry_default_is_zeroed() {
        let telemetry = KryptonTelemetry::default();
        assert_eq!(telemetry.successful_rekeys, 0);
        assert_eq!(telemetry.network_switches, 0);
        assert!(telemetry.network_switch_latencies.is_empty());
    }
}
