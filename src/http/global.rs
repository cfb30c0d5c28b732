use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

struct ThrottleState {
    remaining: u32,
    window_reset_at: Instant,
    /// Set by a global 429; nobody passes before it
    locked_until: Option<Instant>,
}

/// Gate every outbound request passes through, independent of its bucket.
pub struct GlobalThrottle {
    budget: u32,
    window: Duration,
    state: Mutex<ThrottleState>,
}

impl GlobalThrottle {
    pub fn new(budget: u32, window: Duration) -> Self {
        let budget = budget.max(1);
        Self {
            budget,
            window,
            state: Mutex::new(ThrottleState {
                remaining: budget,
                window_reset_at: Instant::now() + window,
                locked_until: None,
            }),
        }
    }

    pub async fn wait(&self) {
        loop {
            let resume_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                match state.locked_until {
                    Some(until) if until > now => until,
                    _ => {
                        state.locked_until = None;
                        if now >= state.window_reset_at {
                            state.remaining = self.budget;
                            state.window_reset_at = now + self.window;
                        }
                        if state.remaining > 0 {
                            state.remaining -= 1;
                            return;
                        }
                        debug!("global request budget exhausted until window reset");
                        state.window_reset_at
                    }
                }
            };
            time::sleep_until(resume_at).await;
        }
    }

    /// Block every request for `duration`. An existing longer lock is kept.
    pub async fn lock_for(&self, duration: Duration) {
        let mut state = self.state.lock().await;
        let until = Instant::now() + duration;
        if state.locked_until.map_or(true, |current| current < until) {
            warn!("global rate limit hit, all requests paused for {:?}", duration);
            state.locked_until = Some(until);
        }
    }

    pub async fn is_locked(&self) -> bool {
        let state = self.state.lock().await;
        state.locked_until.is_some_and(|until| until > Instant::now())
    }

    pub async fn remaining(&self) -> u32 {
        let state = self.state.lock().await;
        if Instant::now() >= state.window_reset_at {
            self.budget
        } else {
            state.remaining
        }
    }
}
