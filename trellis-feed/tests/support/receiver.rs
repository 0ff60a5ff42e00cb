#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use trellis_core::{EventId, InstanceSpec, ReleaseId, SerialNumber};
use trellis_feed::{Member, MessageBody, NotifyOutcome, ReleaseReceiver};

/// Receiver that records every message it accepts.
#[derive(Default)]
pub struct CollectingReceiver {
    messages: Mutex<Vec<MessageBody>>,
    forced: Mutex<Option<NotifyOutcome>>,
    closed: Mutex<Option<String>>,
    gone: AtomicBool,
}

impl CollectingReceiver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every notification with `outcome` instead of accepting it.
    pub fn force(&self, outcome: Option<NotifyOutcome>) {
        *self.forced.lock().unwrap() = outcome;
    }

    pub fn messages(&self) -> Vec<MessageBody> {
        self.messages.lock().unwrap().clone()
    }

    /// Release ids of the `PublishRelease` messages received, in order.
    pub fn releases(&self) -> Vec<ReleaseId> {
        self.publishes().into_iter().map(|(release, _)| release).collect()
    }

    /// `(release_id, cursor_id)` of every `PublishRelease` received.
    pub fn publishes(&self) -> Vec<(ReleaseId, EventId)> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                MessageBody::PublishRelease(p) => Some((p.release_id, p.cursor_id)),
                _ => None,
            })
            .collect()
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.closed.lock().unwrap().clone()
    }

    /// Drop the connection without unsubscribing.
    pub fn disconnect(&self) {
        self.gone.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReleaseReceiver for CollectingReceiver {
    async fn notify(&self, body: MessageBody) -> NotifyOutcome {
        if let Some(outcome) = *self.forced.lock().unwrap() {
            return outcome;
        }
        self.messages.lock().unwrap().push(body);
        NotifyOutcome::Delivered
    }

    fn close(&self, reason: &str) {
        *self.closed.lock().unwrap() = Some(reason.to_string());
    }

    fn is_closed(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }
}

pub fn member(spec: InstanceSpec, receiver: &Arc<CollectingReceiver>, serial: SerialNumber) -> Member {
    Member::new(spec, receiver.clone(), serial)
}
