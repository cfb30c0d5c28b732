use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::error;

/// An inbound dispatch frame, handed to the application
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub name: String,
    pub sequence: Option<u64>,
    pub data: Value,
}

/// Application-side consumer of dispatch events
#[async_trait]
pub trait DispatchListener: Send + Sync {
    async fn on_dispatch(&self, event: &DispatchEvent) -> anyhow::Result<()>;
}

/// Forward every event into a channel
#[async_trait]
impl DispatchListener for mpsc::UnboundedSender<DispatchEvent> {
    async fn on_dispatch(&self, event: &DispatchEvent) -> anyhow::Result<()> {
        self.send(event.clone())
            .map_err(|_| anyhow::anyhow!("dispatch receiver dropped"))
    }
}

/// Ordered set of listeners. Each call is isolated: an error or a panic in one
/// listener is logged and the rest still run.
#[derive(Default)]
pub struct DispatchListeners {
    listeners: RwLock<Vec<Arc<dyn DispatchListener>>>,
}

impl DispatchListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn DispatchListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn DispatchListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Deliver `event` to every listener in registration order; returns how many failed.
    pub async fn dispatch(&self, event: &DispatchEvent) -> usize {
        let mut failures = 0;
        for listener in self.snapshot() {
            match AssertUnwindSafe(listener.on_dispatch(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!("dispatch listener failed on {}: {:#}", event.name, e);
                }
                Err(_) => {
                    failures += 1;
                    error!("dispatch listener panicked on {}", event.name);
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;

    #[async_trait]
    impl DispatchListener for Failing {
        async fn on_dispatch(&self, _event: &DispatchEvent) -> anyhow::Result<()> {
            anyhow::bail!("consumer exploded")
        }
    }

    struct Panicking;

    #[async_trait]
    impl DispatchListener for Panicking {
        async fn on_dispatch(&self, _event: &DispatchEvent) -> anyhow::Result<()> {
            panic!("consumer panicked")
        }
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl DispatchListener for Counting {
        async fn on_dispatch(&self, _event: &DispatchEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event() -> DispatchEvent {
        DispatchEvent {
            name: "MESSAGE_CREATE".into(),
            sequence: Some(1),
            data: serde_json::json!({"content": "hi"}),
        }
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let listeners = DispatchListeners::new();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        listeners.add(Arc::new(Failing));
        listeners.add(Arc::new(Panicking));
        listeners.add(counter.clone());

        assert_eq!(listeners.dispatch(&event()).await, 2);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_listener() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listeners = DispatchListeners::new();
        listeners.add(Arc::new(tx));

        assert_eq!(listeners.dispatch(&event()).await, 0);
        assert_eq!(rx.recv().await.unwrap(), event());
    }
}
