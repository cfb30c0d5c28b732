pub mod config;
pub mod event_bus;
pub mod health;
pub mod logging;

pub use config::Config;
pub use event_bus::{EventBus, LifecycleEvent};
pub use health::HealthChecker;
