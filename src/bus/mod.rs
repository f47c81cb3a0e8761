//! Message bus abstraction.
//!
//! The relay only needs three things from a bus: fire-and-forget publish,
//! plain subscriptions (used for reply inboxes) and queue-group
//! subscriptions where each message goes to exactly one member of the group.
//! Request/reply is a convention on top: the reply subject travels with the
//! message and the responder publishes to it.

pub mod correlator;
pub mod local;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BusError;

pub use correlator::{ReplyCorrelator, new_inbox};
pub use local::LocalBus;

/// A message as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    /// Subject the responder should publish its answer to, if any.
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Handler invoked for every message on a subscription.
///
/// Handlers are driven by the bus on its own tasks; a single subscription
/// never runs two invocations at once, but separate subscriptions do run
/// concurrently.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: BusMessage) -> Result<(), BusError>;
}

/// Publish/subscribe bus with queue-group delivery.
pub trait Bus: Send + Sync {
    /// Publish a message with no reply subject.
    fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Publish a message carrying a reply subject.
    fn publish_request(&self, subject: &str, reply: &str, payload: Bytes) -> Result<(), BusError>;

    /// Every subscriber of `subject` receives every message.
    fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError>;

    /// Each message on `subject` is delivered to exactly one member of `group`.
    fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError>;
}

/// Cancellation hook supplied by a bus implementation.
pub(crate) trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self);
}

/// Handle to an active subscription.
///
/// Dropping the handle cancels the subscription. `unsubscribe` is
/// idempotent: the underlying cancellation runs at most once.
pub struct Subscription {
    subject: String,
    done: AtomicBool,
    cancel: Box<dyn Unsubscribe>,
}

impl Subscription {
    pub(crate) fn new(subject: impl Into<String>, cancel: Box<dyn Unsubscribe>) -> Self {
        Self {
            subject: subject.into(),
            done: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Cancel the subscription. Returns `true` only for the call that
    /// actually performed the cancellation.
    pub fn unsubscribe(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.unsubscribe();
        true
    }

    pub fn is_active(&self) -> bool {
        !self.done.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(BusMessage) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), BusError>> + Send,
{
    async fn handle(&self, message: BusMessage) -> Result<(), BusError> {
        (self.0)(message).await
    }
}
