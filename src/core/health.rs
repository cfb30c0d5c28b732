use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Components whose failure makes the whole process unhealthy rather than degraded
const CRITICAL: &[&str] = &["gateway"];

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComponentState {
    pub healthy: bool,
    /// Seconds since the component last changed state
    pub changed_secs_ago: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    healthy: bool,
    changed_at: std::time::Instant,
}

/// Shared component health, served on `/health`
#[derive(Clone)]
pub struct HealthChecker {
    start_time: std::time::Instant,
    components: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
            components: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub async fn get_status(&self) -> HealthStatus {
        let components = self.components.read().await;

        let critical_down = CRITICAL
            .iter()
            .any(|name| !components.get(*name).is_some_and(|entry| entry.healthy));
        let any_down = components.values().any(|entry| !entry.healthy);
        let status = if critical_down {
            "unhealthy"
        } else if any_down {
            "degraded"
        } else {
            "healthy"
        };

        HealthStatus {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            components: components
                .iter()
                .map(|(name, entry)| {
                    (
                        name.clone(),
                        ComponentState {
                            healthy: entry.healthy,
                            changed_secs_ago: entry.changed_at.elapsed().as_secs(),
                        },
                    )
                })
                .collect(),
        }
    }

    pub async fn component(&self, name: &str) -> Option<bool> {
        self.components.read().await.get(name).map(|entry| entry.healthy)
    }

    pub async fn update_component(&self, component: &str, healthy: bool) {
        let mut components = self.components.write().await;
        match components.get_mut(component) {
            Some(entry) if entry.healthy == healthy => {}
            Some(entry) => {
                entry.healthy = healthy;
                entry.changed_at = std::time::Instant::now();
            }
            None => {
                components.insert(
                    component.to_string(),
                    Entry {
                        healthy,
                        changed_at: std::time::Instant::now(),
                    },
                );
            }
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unhealthy_until_gateway_reports() {
        let checker = HealthChecker::new();
        assert_eq!(checker.get_status().await.status, "unhealthy");

        checker.update_component("gateway", true).await;
        assert_eq!(checker.get_status().await.status, "healthy");
    }

    #[tokio::test]
    async fn test_non_critical_failure_degrades() {
        let checker = HealthChecker::new();
        checker.update_component("gateway", true).await;
        checker.update_component("http", false).await;

        let status = checker.get_status().await;
        assert_eq!(status.status, "degraded");
        assert!(!status.components["http"].healthy);
        assert_eq!(checker.component("http").await, Some(false));
        assert_eq!(checker.component("cache").await, None);
    }
}
