use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Connection lifecycle notifications surfaced to the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Connected {
        session_id: String,
        shard: [u32; 2],
        timestamp: DateTime<Utc>,
    },
    Resumed {
        session_id: String,
        sequence: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    Reconnecting {
        resume: bool,
        reason: String,
    },
    Disconnected {
        code: Option<u16>,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    HighLatency {
        latency_ms: u64,
    },
}

impl LifecycleEvent {
    pub fn disconnected(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::Disconnected {
            code,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        match self.sender.send(event) {
            Ok(receivers) => {
                tracing::debug!("lifecycle event published to {} receivers", receivers);
            }
            Err(e) => {
                tracing::debug!("lifecycle event without subscribers: {:?}", e.0);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(LifecycleEvent::HighLatency { latency_ms: 15_000 });

        assert_eq!(first.recv().await.unwrap(), LifecycleEvent::HighLatency { latency_ms: 15_000 });
        assert_eq!(second.recv().await.unwrap(), LifecycleEvent::HighLatency { latency_ms: 15_000 });
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        bus.publish(LifecycleEvent::disconnected(Some(4000), "test"));
    }
}
