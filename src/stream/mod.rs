//! Push stream plumbing: sessions, the supervisor, and per-stream
//! metrics.

pub mod metrics;
pub mod session;
pub mod supervisor;

pub use metrics::{connection_health, StreamMetrics, StreamMetricsSnapshot};
pub use session::{RawStreamEvent, SessionConfig, SessionHandle, SessionState};
pub use supervisor::{RawCallback, StreamSupervisor, SupervisorStatus};
