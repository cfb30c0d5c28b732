pub mod close_codes;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod inflater;
pub mod metrics;
pub mod protocol;
pub mod rate_limiter;
pub mod session;
pub mod transport;

pub use close_codes::{CloseAction, CloseCode};
pub use dispatch::{DispatchEvent, DispatchListener};
pub use engine::{ConnectionPhase, GatewayEngine};
pub use error::GatewayError;
pub use metrics::GatewayMetrics;
pub use protocol::{GatewayPayload, OpCode};
pub use session::{Session, ShardDescriptor};
pub use transport::{Connector, Frame, FrameSink, FrameStream, TungsteniteConnector};
