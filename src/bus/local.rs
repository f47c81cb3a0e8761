//! In-process bus with queue-group delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Bus, BusMessage, MessageHandler, Subscription, Unsubscribe};
use crate::error::BusError;

/// One registered subscriber.
struct Member {
    id: u64,
    group: Option<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct Inner {
    subjects: RwLock<HashMap<String, Vec<Member>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// In-memory bus used by the coordinator and by tests.
///
/// Each subscription owns an unbounded queue drained by its own dispatch
/// task, so handlers of different subscriptions run concurrently while one
/// subscription sees its messages in publish order. Messages published to a
/// subject with no subscribers are dropped.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<Inner>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `subject`, across all groups.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .subjects
            .read()
            .get(subject)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Close the bus: drop every subscription and reject further publishes.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.subjects.write().clear();
    }

    fn deliver(&self, message: BusMessage) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        validate_subject(&message.subject)?;

        let subjects = self.inner.subjects.read();
        let Some(members) = subjects.get(&message.subject) else {
            trace!(subject = %message.subject, "No subscribers, message dropped");
            return Ok(());
        };

        let mut groups: HashMap<&str, Vec<&Member>> = HashMap::new();
        for member in members {
            match &member.group {
                Some(group) => groups.entry(group.as_str()).or_default().push(member),
                None => {
                    let _ = member.tx.send(message.clone());
                }
            }
        }

        let mut rng = rand::thread_rng();
        for (group, candidates) in groups {
            let chosen = candidates[rng.gen_range(0..candidates.len())];
            trace!(subject = %message.subject, group, member = chosen.id, "Queue group delivery");
            if chosen.tx.send(message.clone()).is_err() {
                debug!(subject = %message.subject, group, "Queue member gone, message dropped");
            }
        }

        Ok(())
    }

    fn add_member(
        &self,
        subject: &str,
        group: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        validate_subject(subject)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();
        let stop = CancellationToken::new();

        let task_stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = task_stop.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let subject = message.subject.clone();
                if let Err(e) = handler.handle(message).await {
                    debug!(subject = %subject, error = %e, "Subscription handler failed");
                }
            }
        });

        self.inner
            .subjects
            .write()
            .entry(subject.to_string())
            .or_default()
            .push(Member {
                id,
                group: group.map(str::to_string),
                tx,
            });

        debug!(subject, group = group.unwrap_or(""), id, "Subscribed");

        Ok(Subscription::new(
            subject,
            Box::new(LocalUnsubscribe {
                bus: Arc::downgrade(&self.inner),
                subject: subject.to_string(),
                id,
                stop,
            }),
        ))
    }
}

impl Bus for LocalBus {
    fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.deliver(BusMessage {
            subject: subject.to_string(),
            reply: None,
            payload,
        })
    }

    fn publish_request(&self, subject: &str, reply: &str, payload: Bytes) -> Result<(), BusError> {
        validate_subject(reply)?;
        self.deliver(BusMessage {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            payload,
        })
    }

    fn subscribe(
        &self,
        subject: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        self.add_member(subject, None, handler)
    }

    fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        if group.is_empty() {
            return Err(BusError::InvalidSubject(group.to_string()));
        }
        self.add_member(subject, Some(group), handler)
    }
}

struct LocalUnsubscribe {
    bus: Weak<Inner>,
    subject: String,
    id: u64,
    stop: CancellationToken,
}

impl Unsubscribe for LocalUnsubscribe {
    fn unsubscribe(&self) {
        if let Some(inner) = self.bus.upgrade() {
            let mut subjects = inner.subjects.write();
            if let Some(members) = subjects.get_mut(&self.subject) {
                members.retain(|m| m.id != self.id);
                if members.is_empty() {
                    subjects.remove(&self.subject);
                }
            }
        }
        // Anything still queued for this member is lost, like any other
        // message the bus already handed to a consumer. A handler already
        // running is left to finish.
        self.stop.cancel();
        debug!(subject = %self.subject, id = self.id, "Unsubscribed");
    }
}

fn validate_subject(subject: &str) -> Result<(), BusError> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}
