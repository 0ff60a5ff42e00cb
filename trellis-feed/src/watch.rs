//! Watch Hub
//!
//! Runs watch connections against the scheduler independently of the
//! transport. Each connection gets a bounded channel receiver registered as a
//! scheduler member, and every outbound message is stamped with the API
//! version and a per-stream message id.
//!
//! On shutdown every handler sends a final `Bounce` before deregistering,
//! and `shutdown` waits (bounded) until all of them have done so.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use trellis_core::constants::API_VERSION;
use trellis_core::{EventId, InstanceSpec, ReleaseId, TrellisError, TrellisResult};

use crate::stream::{FeedMessage, Member, MessageBody, NotifyOutcome, ReleaseReceiver, Scheduler};
use crate::telemetry::FeedMetrics;

/// Bounds of the reconnect delay suggested in a `Bounce`, in milliseconds.
const BOUNCE_DELAY_MS: std::ops::RangeInclusive<u64> = 500..=3000;

/// First frame a watch client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub spec: InstanceSpec,
    /// Release the client currently runs, 0 when it has none.
    #[serde(default)]
    pub current_release: ReleaseId,
    /// Last cursor the client has applied.
    #[serde(default)]
    pub current_cursor: EventId,
}

/// Transport half that carries messages to one client.
#[async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: FeedMessage) -> TrellisResult<()>;
}

/// Scheduler-facing side of a watch connection.
pub struct ChannelReceiver {
    tx: mpsc::Sender<MessageBody>,
    closed: CancellationToken,
}

#[async_trait]
impl ReleaseReceiver for ChannelReceiver {
    async fn notify(&self, body: MessageBody) -> NotifyOutcome {
        match self.tx.try_send(body) {
            Ok(()) => NotifyOutcome::Delivered,
            Err(TrySendError::Full(_)) => NotifyOutcome::RetryNeeded,
            Err(TrySendError::Closed(_)) => NotifyOutcome::Closed,
        }
    }

    fn close(&self, reason: &str) {
        tracing::debug!(reason, "Watch connection force-closed");
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.closed.is_cancelled()
    }
}

pub struct WatchHub {
    scheduler: Arc<Scheduler>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    metrics: FeedMetrics,
    capacity: usize,
}

impl WatchHub {
    pub fn new(scheduler: Arc<Scheduler>, metrics: FeedMetrics) -> Self {
        let capacity = scheduler.config().watch_channel_capacity;
        Self {
            scheduler,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            metrics,
            capacity,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Number of handlers still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run one watch connection until the client disconnects, the app is
    /// deleted, or the hub shuts down.
    ///
    /// `disconnected` resolves when the client goes away.
    pub async fn serve<S, D>(
        &self,
        request: SubscribeRequest,
        mut sink: S,
        disconnected: D,
    ) -> TrellisResult<()>
    where
        S: MessageSink,
        D: Future<Output = ()> + Send,
    {
        if self.shutdown.is_cancelled() {
            return Err(TrellisError::Unavailable("feed server is shutting down".into()));
        }
        let _token = self.tracker.token();
        self.metrics.watch_connections.inc();

        let serial = self.scheduler.next_serial();
        let (biz_id, app_id) = (request.spec.biz_id, request.spec.app_id);
        let (tx, mut rx) = mpsc::channel(self.capacity);
        let closed = CancellationToken::new();
        let member = Member::new(
            request.spec.clone(),
            Arc::new(ChannelReceiver {
                tx,
                closed: closed.clone(),
            }),
            serial,
        );

        tracing::info!(biz_id, app_id, serial, uid = %request.spec.uid, "Watch started");

        let mut message_id = 0u64;
        let mut stamp = |body: MessageBody| {
            message_id += 1;
            FeedMessage {
                api_version: API_VERSION.to_string(),
                message_id,
                body,
            }
        };

        let bounce = || MessageBody::Bounce {
            reason: "feed server shutting down".into(),
            reconnect_after_ms: rand::rng().random_range(BOUNCE_DELAY_MS),
        };

        tokio::pin!(disconnected);
        let result = async {
            // the catch-up wait can outlast a shutdown
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return sink.send(stamp(bounce())).await,
                _ = &mut disconnected => return Ok(()),
                subscribed = self
                    .scheduler
                    .subscribe(request.current_release, request.current_cursor, member) => subscribed?,
            }
            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return sink.send(stamp(bounce())).await,
                    _ = closed.cancelled() => return Ok(()),
                    _ = &mut disconnected => return Ok(()),
                    body = rx.recv() => match body {
                        Some(body) => sink.send(stamp(body)).await?,
                        None => return Ok(()),
                    },
                }
            }
        }
        .await;

        if let Err(e) = self.scheduler.unsubscribe(biz_id, app_id, serial) {
            tracing::warn!(biz_id, app_id, serial, error = %e, "Failed to unsubscribe");
        }
        self.metrics.watch_connections.dec();
        match &result {
            Ok(()) => tracing::info!(biz_id, app_id, serial, "Watch ended"),
            Err(e) => tracing::warn!(biz_id, app_id, serial, error = %e, "Watch failed"),
        }
        result
    }

    /// Tell every handler to bounce its client and wait for them to finish.
    pub async fn shutdown(&self, budget: Duration) -> TrellisResult<()> {
        self.shutdown.cancel();
        self.tracker.close();
        tracing::info!(handlers = self.tracker.len(), "Bouncing watch connections");

        tokio::time::timeout(budget, self.tracker.wait())
            .await
            .map_err(|_| {
                TrellisError::Timeout(format!(
                    "{} watch handlers still running after {:?}",
                    self.tracker.len(),
                    budget
                ))
            })
    }
}
