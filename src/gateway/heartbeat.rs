use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Round trips kept for latency reporting
pub const LATENCY_SAMPLES: usize = 10;

/// Latency at or above which a warning is surfaced
pub const HIGH_LATENCY: Duration = Duration::from_secs(15);

#[derive(Debug)]
struct Beat {
    last_sent_at: Option<Instant>,
    acknowledged: bool,
    latency_samples: VecDeque<Duration>,
}

/// Heartbeat bookkeeping for one connection. A new connection gets a new state.
#[derive(Debug)]
pub struct HeartbeatState {
    interval: Duration,
    inner: Mutex<Beat>,
}

impl HeartbeatState {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Mutex::new(Beat {
                last_sent_at: None,
                acknowledged: true,
                latency_samples: VecDeque::with_capacity(LATENCY_SAMPLES),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Random share (0-50%) of one interval to wait before the first beat
    pub fn initial_jitter(&self) -> Duration {
        let fraction: f64 = rand::thread_rng().gen_range(0.0..=0.5);
        self.interval.mul_f64(fraction)
    }

    pub fn is_acknowledged(&self) -> bool {
        self.lock().acknowledged
    }

    /// Record a beat leaving; it stays unacknowledged until `acknowledge`.
    pub fn mark_sent(&self, at: Instant) {
        let mut beat = self.lock();
        beat.acknowledged = false;
        beat.last_sent_at = Some(at);
    }

    /// Record an ack and return the round trip when a beat was outstanding.
    pub fn acknowledge(&self, at: Instant) -> Option<Duration> {
        let mut beat = self.lock();
        beat.acknowledged = true;
        let latency = at.saturating_duration_since(beat.last_sent_at?);
        if beat.latency_samples.len() == LATENCY_SAMPLES {
            beat.latency_samples.pop_front();
        }
        beat.latency_samples.push_back(latency);
        Some(latency)
    }

    pub fn latency(&self) -> Option<Duration> {
        self.lock().latency_samples.back().copied()
    }

    pub fn average_latency(&self) -> Option<Duration> {
        let beat = self.lock();
        if beat.latency_samples.is_empty() {
            return None;
        }
        let total: Duration = beat.latency_samples.iter().sum();
        Some(total / beat.latency_samples.len() as u32)
    }

    pub fn sample_count(&self) -> usize {
        self.lock().latency_samples.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Beat> {
        // no code path panics while holding the guard
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
