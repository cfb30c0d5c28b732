//! Persistent gateway session client.
//!
//! [`gateway::GatewayEngine`] keeps one resumable websocket session alive: it runs
//! the hello/identify/resume handshake, heartbeats with jitter, detects zombied
//! connections and reconnects without racing in-flight sends.
//! [`supervisor::SessionSupervisor`] owns an engine's lifecycle and turns fatal
//! close codes into actionable errors. [`http::RequestDispatcher`] issues REST calls
//! through per-route rate-limit buckets and a global throttle.

pub mod core;
pub mod gateway;
pub mod http;
pub mod supervisor;

pub use crate::core::{Config, EventBus, HealthChecker, LifecycleEvent};
pub use gateway::{DispatchEvent, DispatchListener, GatewayEngine, GatewayError};
pub use http::{HttpError, RequestDispatcher, RequestOptions, Route};
pub use supervisor::{SessionSupervisor, SupervisorError};
