//! Coordinator queue bridge: the set of live duplex sessions.
//!
//! Every connected runner joins the same queue group on each work queue, so
//! the bus spreads work across whoever is connected. The bridge itself does
//! no balancing; it only owns session bookkeeping and shutdown.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;

use futures::{Sink, Stream, StreamExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::session::{DuplexSession, InboundFrame, SessionInfo};
use super::writer::FrameWriter;
use crate::bus::Bus;
use crate::error::RelayError;

/// Live sessions for all connected runners.
pub struct QueueBridge {
    bus: Arc<dyn Bus>,
    sessions: RwLock<HashMap<Uuid, Arc<DuplexSession>>>,
    shutdown: CancellationToken,
}

impl QueueBridge {
    pub fn new(bus: Arc<dyn Bus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            sessions: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Run one runner connection to completion.
    ///
    /// Attaches a session, reads frames until the connection ends or the
    /// bridge shuts down, and returns once the session has released its
    /// subscriptions and the writer has closed the sink.
    pub async fn serve_connection<Si, St, E>(
        &self,
        runner_id: &str,
        sink: Si,
        frames: St,
    ) -> Result<(), RelayError>
    where
        Si: Sink<String> + Unpin + Send + 'static,
        Si::Error: Display,
        St: Stream<Item = Result<InboundFrame, E>> + Send,
        E: Display,
    {
        let (writer, writer_task) = FrameWriter::spawn(runner_id, sink);

        let session = match DuplexSession::attach(Arc::clone(&self.bus), runner_id, writer.clone()) {
            Ok(session) => session,
            Err(e) => {
                writer.close();
                let _ = writer_task.await;
                return Err(e);
            }
        };

        let session_id = session.session_id();
        self.sessions
            .write()
            .insert(session_id, Arc::clone(&session));

        let frames = Box::pin(frames.take_until(self.shutdown.clone().cancelled_owned()));
        Arc::clone(&session).run(frames).await;

        self.sessions.write().remove(&session_id);
        if writer_task.await.is_err() {
            debug!(runner_id, "Writer task ended abnormally");
        }
        Ok(())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().values().map(|s| s.info()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn runner_session_count(&self, runner_id: &str) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|s| s.runner_id() == runner_id)
            .count()
    }

    /// End every session through its normal teardown path.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
