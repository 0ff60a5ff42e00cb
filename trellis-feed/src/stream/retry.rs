//! Coalescing retry queue for failed member notifications.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use trellis_core::{AppId, BizId, EventId, RateLimit, SerialNumber, TrellisError, TrellisResult};
use trellis_storage::{direct_limiter, DirectRateLimiter};

use super::consumer::Member;

#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub member: Member,
    pub cursor: EventId,
}

/// Members waiting for a notification retry, one entry per serial number.
pub struct RetryQueue {
    entries: Mutex<HashMap<SerialNumber, RetryEntry>>,
    signal: Notify,
    limiter: DirectRateLimiter,
}

impl RetryQueue {
    pub fn new(rate: RateLimit) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            signal: Notify::new(),
            limiter: direct_limiter(rate),
        }
    }

    fn lock(&self) -> TrellisResult<std::sync::MutexGuard<'_, HashMap<SerialNumber, RetryEntry>>> {
        self.entries
            .lock()
            .map_err(|_| TrellisError::poisoned("retry-queue"))
    }

    /// Queue a retry. A member already queued keeps the larger cursor.
    pub fn add(&self, member: Member, cursor: EventId) -> TrellisResult<()> {
        {
            let mut entries = self.lock()?;
            entries
                .entry(member.serial)
                .and_modify(|entry| {
                    if cursor > entry.cursor {
                        entry.cursor = cursor;
                        entry.member = member.clone();
                    }
                })
                .or_insert(RetryEntry { member, cursor });
        }
        self.signal.notify_one();
        Ok(())
    }

    pub fn delete(&self, serial: SerialNumber) -> TrellisResult<Option<RetryEntry>> {
        Ok(self.lock()?.remove(&serial))
    }

    /// Drop every entry of an app. Returns how many went.
    pub fn delete_app(&self, biz_id: BizId, app_id: AppId) -> TrellisResult<usize> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, e| !(e.member.spec.biz_id == biz_id && e.member.spec.app_id == app_id));
        Ok(before - entries.len())
    }

    /// Take every queued entry, ordered by serial number.
    pub fn purge(&self) -> TrellisResult<Vec<RetryEntry>> {
        let mut taken: Vec<RetryEntry> = self.lock()?.drain().map(|(_, e)| e).collect();
        taken.sort_by_key(|e| e.member.serial);
        Ok(taken)
    }

    /// Copy of the queued entries, ordered by serial number.
    pub fn snapshot(&self) -> TrellisResult<Vec<RetryEntry>> {
        let mut entries: Vec<RetryEntry> = self.lock()?.values().cloned().collect();
        entries.sort_by_key(|e| e.member.serial);
        Ok(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake on every add, wait for a rate-limiter permit, then hand the whole
    /// queue to `handler`. Entries that fail again re-enter through `add`.
    pub async fn run_drain<F, Fut>(&self, shutdown: CancellationToken, mut handler: F)
    where
        F: FnMut(Vec<RetryEntry>) -> Fut,
        Fut: Future<Output = ()>,
    {
        tracing::info!("Retry drain loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.signal.notified() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.limiter.until_ready() => {}
            }

            match self.purge() {
                Ok(entries) if entries.is_empty() => {}
                Ok(entries) => {
                    tracing::debug!(entries = entries.len(), "Retrying member notifications");
                    handler(entries).await;
                }
                Err(e) => tracing::warn!(error = %e, "Retry queue unavailable"),
            }
        }
        tracing::info!("Retry drain loop shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::consumer::{NotifyOutcome, ReleaseReceiver};
    use crate::stream::messages::MessageBody;
    use async_trait::async_trait;
    use std::sync::Arc;
    use trellis_test_utils::fixtures::{instance_spec, labels};

    struct Silent;

    #[async_trait]
    impl ReleaseReceiver for Silent {
        async fn notify(&self, _body: MessageBody) -> NotifyOutcome {
            NotifyOutcome::Delivered
        }

        fn close(&self, _reason: &str) {}
    }

    fn member(serial: SerialNumber) -> Member {
        Member::new(instance_spec(&format!("uid-{}", serial), labels(&[])), Arc::new(Silent), serial)
    }

    #[test]
    fn test_add_coalesces_to_larger_cursor() {
        let queue = RetryQueue::new(RateLimit::new(100, 100));
        queue.add(member(1), 5).unwrap();
        queue.add(member(1), 3).unwrap();

        let entries = queue.snapshot().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cursor, 5);

        queue.add(member(1), 9).unwrap();
        assert_eq!(queue.snapshot().unwrap()[0].cursor, 9);
    }

    #[test]
    fn test_delete_app_and_purge() {
        let queue = RetryQueue::new(RateLimit::new(100, 100));
        queue.add(member(1), 1).unwrap();
        queue.add(member(2), 1).unwrap();
        let mut other = member(3);
        other.spec.app_id = 99;
        queue.add(other, 1).unwrap();

        assert_eq!(queue.delete_app(2, 7).unwrap(), 2);
        let taken = queue.purge().unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].member.serial, 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_hands_over_whole_queue() {
        let queue = Arc::new(RetryQueue::new(RateLimit::new(100, 100)));
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let drain = tokio::spawn({
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            async move {
                queue
                    .run_drain(shutdown, |entries| {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send(entries.len());
                        }
                    })
                    .await
            }
        });

        queue.add(member(1), 1).unwrap();
        queue.add(member(2), 1).unwrap();
        let mut drained = 0;
        while drained < 2 {
            drained += rx.recv().await.unwrap();
        }
        assert!(queue.is_empty());

        shutdown.cancel();
        drain.await.unwrap();
    }
}
