//! Single-writer actor for a runner connection.
//!
//! Both work-kind subscriptions of a session write to the same socket. All
//! of their frames go through one task that owns the sink, so frames are
//! written whole and one at a time.

use std::fmt::Display;
use std::sync::Arc;

use futures::{Sink, SinkExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RelayError;

/// Frames buffered ahead of the socket before senders wait.
const WRITE_QUEUE_CAPACITY: usize = 64;

struct WriteRequest {
    frame: String,
    done: oneshot::Sender<Result<(), String>>,
}

/// Cloneable handle to the writer task of one connection.
#[derive(Clone)]
pub struct FrameWriter {
    runner_id: Arc<str>,
    tx: mpsc::Sender<WriteRequest>,
    shutdown: CancellationToken,
}

impl FrameWriter {
    /// Spawn the writer task that owns `sink`.
    pub fn spawn<S>(runner_id: impl Into<Arc<str>>, mut sink: S) -> (Self, JoinHandle<()>)
    where
        S: Sink<String> + Unpin + Send + 'static,
        S::Error: Display,
    {
        let runner_id: Arc<str> = runner_id.into();
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(WRITE_QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();

        let task_shutdown = shutdown.clone();
        let task_runner = Arc::clone(&runner_id);
        let handle = tokio::spawn(async move {
            let mut abandoned = false;
            loop {
                let request = tokio::select! {
                    biased;
                    _ = task_shutdown.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };

                let outcome = tokio::select! {
                    biased;
                    result = sink.send(request.frame) => result.map_err(|e| e.to_string()),
                    _ = task_shutdown.cancelled() => {
                        debug!(runner_id = %task_runner, "Writer closed with a frame in flight");
                        abandoned = true;
                        Err("connection closed".to_string())
                    }
                };

                match outcome {
                    Ok(()) => {
                        let _ = request.done.send(Ok(()));
                    }
                    Err(reason) => {
                        // A failed write ends the connection; the session
                        // watches this token to tear itself down.
                        if !task_shutdown.is_cancelled() {
                            warn!(runner_id = %task_runner, error = %reason, "Connection write failed");
                            task_shutdown.cancel();
                        }
                        let _ = request.done.send(Err(reason));
                        break;
                    }
                }
            }

            // Refuse anything still queued, then close the sink. A sink stuck
            // mid-write would never finish closing, so it is just dropped.
            rx.close();
            while let Some(request) = rx.recv().await {
                let _ = request.done.send(Err("connection closed".to_string()));
            }
            if !abandoned {
                if let Err(e) = sink.close().await {
                    debug!(runner_id = %task_runner, error = %e, "Error closing connection sink");
                }
            }
            debug!(runner_id = %task_runner, "Writer stopped");
        });

        (
            Self {
                runner_id,
                tx,
                shutdown,
            },
            handle,
        )
    }

    /// Write one frame and wait until the socket accepted it.
    pub async fn send(&self, frame: String) -> Result<(), RelayError> {
        if self.shutdown.is_cancelled() {
            return Err(self.closed_error());
        }

        let (done, ack) = oneshot::channel();
        self.tx
            .send(WriteRequest { frame, done })
            .await
            .map_err(|_| self.closed_error())?;

        match ack.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(RelayError::WriteFailed {
                runner_id: self.runner_id.to_string(),
                reason,
            }),
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Stop the writer. Frames not yet written are refused and a frame
    /// mid-write is abandoned.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the writer is closed, either by [`close`](Self::close)
    /// or because a write failed.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }

    fn closed_error(&self) -> RelayError {
        RelayError::ConnectionClosed {
            runner_id: self.runner_id.to_string(),
        }
    }
}
