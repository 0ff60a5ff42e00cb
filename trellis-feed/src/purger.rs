//! Cache purge callback run by the change observer.

use async_trait::async_trait;
use std::sync::Arc;
use trellis_core::{EventMeta, TrellisResult};
use trellis_events::CachePurger;
use trellis_storage::RemotePurger;

use crate::lcache::LocalCaches;

/// Purges the remote tier (when this process owns it) and then the local tier.
pub struct FeedPurger {
    local: Arc<LocalCaches>,
    remote: Option<RemotePurger>,
}

impl FeedPurger {
    pub fn new(local: Arc<LocalCaches>) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: RemotePurger) -> Self {
        self.remote = Some(remote);
        self
    }
}

#[async_trait]
impl CachePurger for FeedPurger {
    async fn purge(&self, events: &[EventMeta]) -> TrellisResult<()> {
        // the local tier refills from the remote one, so remote goes first
        if let Some(remote) = &self.remote {
            let keys = remote.purge(events).await?;
            tracing::debug!(keys, "Remote cache keys purged");
        }
        self.local.purge(events)?;
        Ok(())
    }
}
