//! Coordinator side of the runner relay.
//!
//! - `envelope`: request/response frames and work queue names
//! - `writer`: per-connection single-writer actor
//! - `session`: one runner's subscriptions and reply read loop
//! - `bridge`: all live sessions
//! - `ws`: axum WebSocket transport

pub mod bridge;
pub mod envelope;
pub mod session;
pub mod writer;
pub mod ws;

pub use bridge::QueueBridge;
pub use envelope::{ReplyEnvelope, WorkEnvelope, WorkKind};
pub use session::{DuplexSession, InboundFrame, SessionInfo};
pub use writer::FrameWriter;
