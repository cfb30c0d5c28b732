use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters for one gateway engine
#[derive(Debug)]
pub struct GatewayMetrics {
    frames_received: AtomicU64,
    dispatches: AtomicU64,
    payloads_sent: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_acked: AtomicU64,
    reconnects: AtomicU64,
    malformed_payloads: AtomicU64,
    last_latency_ms: AtomicU64,
    start_time: Instant,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            payloads_sent: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            heartbeats_acked: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            malformed_payloads: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn increment_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_dispatches(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_payloads_sent(&self) {
        self.payloads_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_heartbeats_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_ack(&self, latency: Option<Duration>) {
        self.heartbeats_acked.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = latency {
            self.last_latency_ms
                .store(latency.as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn increment_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_malformed(&self) {
        self.malformed_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn get_dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    pub fn get_heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    pub fn get_reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn get_malformed(&self) -> u64 {
        self.malformed_payloads.load(Ordering::Relaxed)
    }

    pub fn get_uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn get_snapshot(&self) -> HashMap<String, serde_json::Value> {
        let mut snapshot = HashMap::new();

        snapshot.insert("frames_received".to_string(), serde_json::json!(self.get_frames_received()));
        snapshot.insert("dispatches".to_string(), serde_json::json!(self.get_dispatches()));
        snapshot.insert(
            "payloads_sent".to_string(),
            serde_json::json!(self.payloads_sent.load(Ordering::Relaxed)),
        );
        snapshot.insert("heartbeats_sent".to_string(), serde_json::json!(self.get_heartbeats_sent()));
        snapshot.insert(
            "heartbeats_acked".to_string(),
            serde_json::json!(self.heartbeats_acked.load(Ordering::Relaxed)),
        );
        snapshot.insert("reconnects".to_string(), serde_json::json!(self.get_reconnects()));
        snapshot.insert("malformed_payloads".to_string(), serde_json::json!(self.get_malformed()));
        snapshot.insert(
            "latency_ms".to_string(),
            serde_json::json!(self.last_latency_ms.load(Ordering::Relaxed)),
        );
        snapshot.insert("uptime_secs".to_string(), serde_json::json!(self.get_uptime_secs()));

        snapshot
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = GatewayMetrics::new();
        assert_eq!(metrics.get_frames_received(), 0);
        assert_eq!(metrics.get_reconnects(), 0);
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = GatewayMetrics::new();
        metrics.increment_frames_received();
        metrics.increment_frames_received();
        metrics.record_heartbeat_ack(Some(Duration::from_millis(87)));

        let snapshot = metrics.get_snapshot();
        assert_eq!(snapshot["frames_received"], serde_json::json!(2));
        assert_eq!(snapshot["heartbeats_acked"], serde_json::json!(1));
        assert_eq!(snapshot["latency_ms"], serde_json::json!(87));
    }
}
