//! Duplex session: one connected runner, its two queue subscriptions and
//! the read loop that routes replies back onto the bus.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::envelope::{RUNNER_QUEUE_GROUP, ReplyEnvelope, WorkEnvelope, WorkKind};
use super::writer::FrameWriter;
use crate::bus::{Bus, BusMessage, MessageHandler, Subscription};
use crate::error::{BusError, RelayError};

/// A frame read off a runner connection, independent of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Bytes),
    /// Control frames (ping/pong) the transport answers on its own.
    Control,
    Close,
}

/// Counters for one session.
#[derive(Debug, Default)]
struct SessionStats {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    replies: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time view of a session, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub runner_id: String,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: usize,
    pub forwarded: u64,
    pub dropped: u64,
    pub replies: u64,
    pub malformed: u64,
}

/// State owned by one connected runner.
///
/// Created by [`DuplexSession::attach`]; torn down only when the read loop in
/// [`DuplexSession::run`] ends.
pub struct DuplexSession {
    session_id: Uuid,
    runner_id: String,
    connected_at: DateTime<Utc>,
    bus: Arc<dyn Bus>,
    writer: FrameWriter,
    subscriptions: Mutex<Vec<Subscription>>,
    stats: Arc<SessionStats>,
}

impl DuplexSession {
    /// Open one queue-group subscription per work kind, each forwarding
    /// onto `writer`.
    pub fn attach(
        bus: Arc<dyn Bus>,
        runner_id: impl Into<String>,
        writer: FrameWriter,
    ) -> Result<Arc<Self>, RelayError> {
        let runner_id = runner_id.into();
        let stats = Arc::new(SessionStats::default());

        let mut subscriptions = Vec::with_capacity(WorkKind::ALL.len());
        for kind in WorkKind::ALL {
            let handler = Arc::new(ForwardHandler {
                runner_id: runner_id.clone(),
                kind,
                writer: writer.clone(),
                stats: Arc::clone(&stats),
            });
            // On failure the subscriptions opened so far are dropped, which
            // cancels them.
            let subscription = bus.queue_subscribe(kind.subject(), RUNNER_QUEUE_GROUP, handler)?;
            subscriptions.push(subscription);
        }

        let session = Arc::new(Self {
            session_id: Uuid::new_v4(),
            runner_id,
            connected_at: Utc::now(),
            bus,
            writer,
            subscriptions: Mutex::new(subscriptions),
            stats,
        });

        info!(
            runner_id = %session.runner_id,
            session_id = %session.session_id,
            "Runner attached to work queues"
        );
        Ok(session)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .iter()
            .filter(|s| s.is_active())
            .count()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id,
            runner_id: self.runner_id.clone(),
            connected_at: self.connected_at,
            subscriptions: self.active_subscriptions(),
            forwarded: self.stats.forwarded.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            replies: self.stats.replies.load(Ordering::Relaxed),
            malformed: self.stats.malformed.load(Ordering::Relaxed),
        }
    }

    /// Cancel both work subscriptions. Returns how many were cancelled by
    /// this call; later calls return 0.
    pub fn detach(&self) -> usize {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let cancelled = subscriptions.iter().filter(|s| s.unsubscribe()).count();
        if cancelled > 0 {
            info!(
                runner_id = %self.runner_id,
                session_id = %self.session_id,
                cancelled,
                "Runner detached from work queues"
            );
        }
        cancelled
    }

    /// Read frames until the connection fails or closes, then tear the
    /// session down. A failed write on the connection ends the read loop
    /// too.
    pub async fn run<S, E>(self: Arc<Self>, mut frames: S)
    where
        S: Stream<Item = Result<InboundFrame, E>> + Unpin,
        E: Display,
    {
        loop {
            let frame = tokio::select! {
                frame = frames.next() => frame,
                _ = self.writer.closed() => {
                    warn!(runner_id = %self.runner_id, "Runner connection no longer writable");
                    break;
                }
            };

            match frame {
                Some(Ok(InboundFrame::Text(text))) => self.route_reply(text.as_bytes()),
                Some(Ok(InboundFrame::Binary(data))) => self.route_reply(&data),
                Some(Ok(InboundFrame::Control)) => {}
                Some(Ok(InboundFrame::Close)) => {
                    debug!(runner_id = %self.runner_id, "Runner sent close frame");
                    break;
                }
                Some(Err(e)) => {
                    warn!(runner_id = %self.runner_id, error = %e, "Runner connection read failed");
                    break;
                }
                None => break,
            }
        }

        self.detach();
        self.writer.close();
        info!(
            runner_id = %self.runner_id,
            session_id = %self.session_id,
            "Runner disconnected"
        );
    }

    fn route_reply(&self, frame: &[u8]) {
        trace!(runner_id = %self.runner_id, len = frame.len(), "Runner frame received");

        let envelope = match ReplyEnvelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(runner_id = %self.runner_id, error = %e, "Skipping malformed runner frame");
                return;
            }
        };

        match self.bus.publish(&envelope.reply, envelope.payload) {
            Ok(()) => {
                self.stats.replies.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(
                    runner_id = %self.runner_id,
                    reply = %envelope.reply,
                    error = %e,
                    "Failed to publish runner reply"
                );
            }
        }
    }
}

impl Drop for DuplexSession {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Forwards work from one queue onto the runner connection.
struct ForwardHandler {
    runner_id: String,
    kind: WorkKind,
    writer: FrameWriter,
    stats: Arc<SessionStats>,
}

#[async_trait]
impl MessageHandler for ForwardHandler {
    async fn handle(&self, message: BusMessage) -> Result<(), BusError> {
        let reply = message.reply.unwrap_or_default();
        if reply.is_empty() {
            debug!(runner_id = %self.runner_id, kind = %self.kind, "Work without reply subject");
        }

        let envelope = WorkEnvelope {
            reply,
            kind: self.kind,
            payload: message.payload,
        };
        let frame = serde_json::to_string(&envelope).map_err(|e| BusError::Handler {
            subject: message.subject.clone(),
            reason: e.to_string(),
        })?;

        // At most once: the bus already handed this message to us, so a
        // failed write loses it.
        if let Err(e) = self.writer.send(frame).await {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            error!(
                runner_id = %self.runner_id,
                kind = %self.kind,
                reply = %envelope.reply,
                error = %e,
                "Error writing work to runner connection"
            );
            return Err(BusError::Handler {
                subject: message.subject,
                reason: e.to_string(),
            });
        }

        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
