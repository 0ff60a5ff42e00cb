//! Subscribers of the notification scheduler.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use trellis_core::{InstanceSpec, SerialNumber};

use super::messages::MessageBody;

/// Result of handing one message to a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered,
    /// The receiver could not take the message now; try again later.
    RetryNeeded,
    /// The connection is gone.
    Closed,
}

impl NotifyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyOutcome::Delivered => "delivered",
            NotifyOutcome::RetryNeeded => "retry_needed",
            NotifyOutcome::Closed => "closed",
        }
    }
}

/// The outbound side of one watch connection.
#[async_trait]
pub trait ReleaseReceiver: Send + Sync {
    async fn notify(&self, body: MessageBody) -> NotifyOutcome;

    /// Force-close the connection.
    fn close(&self, reason: &str);

    /// The connection went away without unsubscribing.
    fn is_closed(&self) -> bool {
        false
    }
}

/// One subscribed watch connection.
#[derive(Clone)]
pub struct Member {
    pub spec: InstanceSpec,
    pub receiver: Arc<dyn ReleaseReceiver>,
    pub serial: SerialNumber,
}

impl Member {
    pub fn new(spec: InstanceSpec, receiver: Arc<dyn ReleaseReceiver>, serial: SerialNumber) -> Self {
        Self {
            spec,
            receiver,
            serial,
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("biz_id", &self.spec.biz_id)
            .field("app_id", &self.spec.app_id)
            .field("uid", &self.spec.uid)
            .field("serial", &self.serial)
            .finish()
    }
}
