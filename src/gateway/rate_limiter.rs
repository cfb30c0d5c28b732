use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};
use tracing::warn;

/// Outbound budget for one gateway connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendLimit {
    pub per_window: usize,
    pub window: Duration,
    /// Sends allowed to wait on the socket at the same time
    pub max_in_flight: usize,
}

impl SendLimit {
    pub fn new(per_window: usize, window: Duration) -> Self {
        Self {
            per_window,
            window,
            ..Self::default()
        }
    }
}

impl Default for SendLimit {
    fn default() -> Self {
        // the gateway allows 120 sends per minute; leave room for heartbeats
        Self {
            per_window: 110,
            window: Duration::from_secs(60),
            max_in_flight: 10,
        }
    }
}

/// Sliding window over the instants of recent sends.
pub struct SendLimiter {
    limit: SendLimit,
    in_flight: Arc<Semaphore>,
    sent: Mutex<VecDeque<Instant>>,
}

impl SendLimiter {
    pub fn new(limit: SendLimit) -> Self {
        Self {
            in_flight: Arc::new(Semaphore::new(limit.max_in_flight.max(1))),
            sent: Mutex::new(VecDeque::with_capacity(limit.per_window)),
            limit,
        }
    }

    pub fn limit(&self) -> SendLimit {
        self.limit
    }

    fn expire(&self, sent: &mut VecDeque<Instant>, now: Instant) {
        while sent
            .front()
            .is_some_and(|&at| now.saturating_duration_since(at) >= self.limit.window)
        {
            sent.pop_front();
        }
    }

    /// Reserve one send in the window, sleeping until the oldest reservation expires
    /// when the window is full. Hold the permit until the frame is written.
    pub async fn acquire(&self) -> SendPermit {
        // never closed
        let slot = self.in_flight.clone().acquire_owned().await.ok();

        loop {
            let wake_at = {
                let mut sent = self.sent.lock().await;
                let now = Instant::now();
                self.expire(&mut sent, now);
                if sent.len() < self.limit.per_window.max(1) {
                    sent.push_back(now);
                    return SendPermit { _slot: slot };
                }
                match sent.front() {
                    Some(&oldest) => oldest + self.limit.window,
                    None => continue,
                }
            };
            warn!(
                "outbound send limit of {} per {:?} reached, holding sends until {:?}",
                self.limit.per_window,
                self.limit.window,
                wake_at.saturating_duration_since(Instant::now())
            );
            time::sleep_until(wake_at).await;
        }
    }

    /// Sends still available in the current window
    pub async fn remaining(&self) -> usize {
        let mut sent = self.sent.lock().await;
        self.expire(&mut sent, Instant::now());
        self.limit.per_window.saturating_sub(sent.len())
    }
}

pub struct SendPermit {
    _slot: Option<OwnedSemaphorePermit>,
}
