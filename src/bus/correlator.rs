//! Reply correlation for request/reply over the bus.
//!
//! Every outbound request gets a fresh inbox subject built from a random v4
//! UUID (122 random bits). For `n` concurrently pending requests the chance
//! of any two inboxes colliding is about n²/2¹²³, so even a million pending
//! requests sit below 10⁻²⁵. Inboxes need no coordination between
//! requesters and are never reused.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::{Bus, BusMessage, FnHandler};
use crate::error::RelayError;

/// Prefix for reply subjects.
pub const INBOX_PREFIX: &str = "_INBOX.";

/// Build a new single-use reply subject.
pub fn new_inbox() -> String {
    format!("{INBOX_PREFIX}{}", Uuid::new_v4().simple())
}

/// Performs request/reply round trips on top of a [`Bus`].
#[derive(Clone)]
pub struct ReplyCorrelator {
    bus: Arc<dyn Bus>,
}

impl ReplyCorrelator {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self { bus }
    }

    /// Publish `payload` on `subject` and wait for exactly one reply.
    ///
    /// The inbox subscription is registered before publishing so a fast
    /// responder cannot beat it, and it is released when this returns
    /// whether a reply arrived or not.
    pub async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, RelayError> {
        let inbox = new_inbox();
        let (tx, rx) = oneshot::channel::<Bytes>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let subscription = self.bus.subscribe(
            &inbox,
            Arc::new(FnHandler(move |msg: BusMessage| {
                let slot = Arc::clone(&slot);
                async move {
                    // Later messages on the same inbox are ignored.
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(msg.payload);
                    }
                    Ok::<(), crate::error::BusError>(())
                }
            })),
        )?;

        debug!(subject, inbox = %inbox, "Publishing request");
        self.bus.publish_request(subject, &inbox, payload)?;

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) | Err(_) => Err(RelayError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        };

        subscription.unsubscribe();
        result
    }
}
