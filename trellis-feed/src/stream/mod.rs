//! Notification Scheduler
//!
//! Holds one `AppActor` per app with live watch connections and pushes
//! release changes to them. Events of one app are handled one at a time in
//! id order; different apps drain concurrently on a bounded worker pool.
//! Member notifications fan out under a shared semaphore, and anything that
//! cannot be delivered now lands on the coalescing retry queue.

mod actor;
mod consumer;
mod messages;
mod payload;
mod retry;

pub use actor::AppActor;
pub use consumer::{Member, NotifyOutcome, ReleaseReceiver};
pub use messages::{
    ConfigItemMeta, FeedMessage, KvMeta, MessageBody, ReleaseContent, ReleasePayload,
    RepositoryLocation,
};
pub use payload::PayloadBuilder;
pub use retry::{RetryEntry, RetryQueue};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use trellis_core::{
    AppId, BizId, EventId, EventMeta, ReleaseId, SerialNumber, TrellisError, TrellisResult,
};
use trellis_events::{ChangeObserver, EventBatch};

use crate::config::SchedulerConfig;
use crate::matcher::ReleaseMatcher;
use crate::telemetry::FeedMetrics;

// ============================================================================
// COMMITTED CURSOR
// ============================================================================

/// The cursor up to which caches have been purged and events broadcast.
pub trait CommittedCursor: Send + Sync {
    fn committed(&self) -> EventId;

    /// How often the cursor can move.
    fn poll_period(&self) -> Duration;
}

impl CommittedCursor for ChangeObserver {
    fn committed(&self) -> EventId {
        self.current_cursor()
    }

    fn poll_period(&self) -> Duration {
        self.config().period
    }
}

type AppKey = (BizId, AppId);

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct Scheduler {
    actors: Mutex<HashMap<AppKey, Arc<AppActor>>>,
    retry: Arc<RetryQueue>,
    matcher: Arc<ReleaseMatcher>,
    payloads: PayloadBuilder,
    cursor: Arc<dyn CommittedCursor>,
    notify_permits: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    config: SchedulerConfig,
    metrics: FeedMetrics,
    serials: AtomicU64,
}

impl Scheduler {
    pub fn new(
        matcher: Arc<ReleaseMatcher>,
        payloads: PayloadBuilder,
        cursor: Arc<dyn CommittedCursor>,
        config: SchedulerConfig,
        metrics: FeedMetrics,
    ) -> Self {
        Self {
            actors: Mutex::new(HashMap::new()),
            retry: Arc::new(RetryQueue::new(config.retry_rate)),
            matcher,
            payloads,
            cursor,
            notify_permits: Arc::new(Semaphore::new(config.notify_concurrency)),
            workers: Arc::new(Semaphore::new(config.actor_workers)),
            tracker: TaskTracker::new(),
            config,
            metrics,
            serials: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry
    }

    /// Serial number for a new watch connection.
    pub fn next_serial(&self) -> SerialNumber {
        self.serials.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn actors(&self) -> TrellisResult<MutexGuard<'_, HashMap<AppKey, Arc<AppActor>>>> {
        self.actors
            .lock()
            .map_err(|_| TrellisError::poisoned("scheduler-actors"))
    }

    pub fn actor_count(&self) -> usize {
        self.actors.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn consumer_count(&self) -> usize {
        self.actors
            .lock()
            .map(|a| a.values().map(|actor| actor.consumer_count()).sum())
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Register `member` and tell it about its release if it runs a stale one.
    ///
    /// Waits until the observer has reached `current_cursor`, so a client can
    /// never claim a state this server has not yet seen.
    pub async fn subscribe(
        self: &Arc<Self>,
        current_release: ReleaseId,
        current_cursor: EventId,
        member: Member,
    ) -> TrellisResult<()> {
        member.spec.validate()?;
        self.wait_catch_up(current_cursor).await?;
        self.register(&member)?;

        let committed = self.cursor.committed();
        tracing::debug!(
            biz_id = member.spec.biz_id,
            app_id = member.spec.app_id,
            serial = member.serial,
            current_release,
            cursor = committed,
            "Member subscribed"
        );

        let outcome = self
            .notify_member(&member, committed, Some(current_release))
            .await;
        if outcome == NotifyOutcome::RetryNeeded {
            self.queue_retry(member, committed);
        }
        Ok(())
    }

    async fn wait_catch_up(&self, target: EventId) -> TrellisResult<()> {
        let deadline = Instant::now() + self.config.subscribe_catch_up;
        let step = (self.cursor.poll_period() / 2).max(Duration::from_millis(1));
        loop {
            let committed = self.cursor.committed();
            if committed >= target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TrellisError::Timeout(format!(
                    "server cursor {} has not reached client cursor {} within {:?}",
                    committed, target, self.config.subscribe_catch_up
                )));
            }
            tokio::time::sleep(step).await;
        }
    }

    fn register(&self, member: &Member) -> TrellisResult<()> {
        let key = (member.spec.biz_id, member.spec.app_id);
        let mut actors = self.actors()?;
        let actor = match actors.get(&key) {
            Some(actor) => actor.clone(),
            None => {
                let actor = Arc::new(AppActor::new(key.0, key.1, self.cursor.committed()));
                actors.insert(key, actor.clone());
                self.metrics.active_actors.inc();
                actor
            }
        };
        actor.add_consumer(member.clone())?;
        self.metrics.consumers.inc();
        Ok(())
    }

    /// Remove a member. The app's actor goes with its last consumer.
    pub fn unsubscribe(
        &self,
        biz_id: BizId,
        app_id: AppId,
        serial: SerialNumber,
    ) -> TrellisResult<()> {
        let key = (biz_id, app_id);
        {
            let mut actors = self.actors()?;
            if let Some(actor) = actors.get(&key).cloned() {
                if actor.remove_consumer(serial)?.is_some() {
                    self.metrics.consumers.dec();
                }
                if actor.consumer_count() == 0 {
                    actors.remove(&key);
                    actor.close();
                    self.metrics.active_actors.dec();
                }
            }
        }
        self.retry.delete(serial)?;
        self.metrics.retry_queue_depth.set(self.retry.len() as i64);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------------

    /// Consume observer batches until `shutdown` fires or the observer goes away.
    pub async fn run(
        self: Arc<Self>,
        mut batches: mpsc::Receiver<EventBatch>,
        shutdown: CancellationToken,
    ) {
        tracing::info!("Scheduler dispatch loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = batches.recv() => match batch {
                    Some(batch) => self.dispatch(&batch),
                    None => {
                        tracing::warn!("Observer channel closed");
                        break;
                    }
                },
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Scheduler dispatch loop shutting down");
    }

    /// Queue events on their apps' actors and schedule drains.
    ///
    /// Only publishes and app deletions concern watchers. Apps without an
    /// actor have nobody to notify.
    pub fn dispatch(self: &Arc<Self>, events: &[EventMeta]) {
        let mut by_app: BTreeMap<AppKey, Vec<EventMeta>> = BTreeMap::new();
        for event in events
            .iter()
            .filter(|e| e.affects_matching() || e.is_app_delete())
        {
            by_app
                .entry((event.attachment.biz_id, event.attachment.app_id))
                .or_default()
                .push(event.clone());
        }

        for (key, events) in by_app {
            let actor = match self.actors() {
                Ok(actors) => actors.get(&key).cloned(),
                Err(e) => {
                    tracing::warn!(error = %e, "Actor registry unavailable");
                    return;
                }
            };
            let Some(actor) = actor else { continue };
            match actor.push(&events) {
                Ok(true) => self.spawn_drain(actor),
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    biz_id = key.0,
                    app_id = key.1,
                    error = %e,
                    "Failed to queue events"
                ),
            }
        }
    }

    fn spawn_drain(self: &Arc<Self>, actor: Arc<AppActor>) {
        let scheduler = Arc::clone(self);
        self.tracker.spawn(async move {
            let _worker = match scheduler.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    actor.abandon_drain();
                    return;
                }
            };
            scheduler.drain(&actor).await;
        });
    }

    async fn drain(self: &Arc<Self>, actor: &Arc<AppActor>) {
        loop {
            if actor.is_closed() {
                actor.abandon_drain();
                return;
            }
            let event = match actor.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(app_id = actor.app_id(), error = %e, "Actor queue unavailable");
                    actor.abandon_drain();
                    return;
                }
            };

            if event.is_app_delete() {
                self.close_app(actor, event.id);
                actor.abandon_drain();
                return;
            }
            self.notify_event(actor, event.id).await;
        }
    }

    /// Force-close every connection of a deleted app.
    ///
    /// The actor leaves the registry before its consumers are taken, so a
    /// concurrent subscribe builds a fresh actor instead of joining this one.
    fn close_app(&self, actor: &Arc<AppActor>, cursor: EventId) {
        let (biz_id, app_id) = (actor.biz_id(), actor.app_id());
        match self.actors() {
            Ok(mut actors) => {
                let same = actors
                    .get(&(biz_id, app_id))
                    .map_or(false, |current| Arc::ptr_eq(current, actor));
                if same {
                    actors.remove(&(biz_id, app_id));
                    self.metrics.active_actors.dec();
                }
                actor.close();
            }
            Err(e) => {
                tracing::warn!(biz_id, app_id, error = %e, "Actor registry unavailable");
                actor.close();
            }
        }

        match actor.take_consumers() {
            Ok(members) => {
                for member in &members {
                    member.receiver.close("application deleted");
                }
                self.metrics.consumers.sub(members.len() as i64);
                tracing::info!(
                    biz_id,
                    app_id,
                    cursor,
                    closed = members.len(),
                    "Application deleted, watchers closed"
                );
            }
            Err(e) => tracing::warn!(biz_id, app_id, error = %e, "Failed to close watchers"),
        }

        if let Err(e) = self.retry.delete_app(biz_id, app_id) {
            tracing::warn!(biz_id, app_id, error = %e, "Failed to drop retries");
        }
        self.metrics.retry_queue_depth.set(self.retry.len() as i64);
    }

    async fn acquire_notify_permit(&self) -> Option<OwnedSemaphorePermit> {
        match tokio::time::timeout(
            self.config.notify_acquire_timeout,
            self.notify_permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Some(permit),
            _ => None,
        }
    }

    /// Notify every consumer of `actor` about the event at `cursor`, and
    /// wait for all of them before the next event.
    pub async fn notify_event(self: &Arc<Self>, actor: &Arc<AppActor>, cursor: EventId) {
        let members = match actor.consumers_snapshot() {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(app_id = actor.app_id(), error = %e, "Consumer registry unavailable");
                return;
            }
        };
        self.fan_out(members.into_iter().map(|m| (m, cursor)).collect())
            .await;
    }

    async fn fan_out(self: &Arc<Self>, targets: Vec<(Member, EventId)>) {
        let mut tasks = JoinSet::new();
        for (member, cursor) in targets {
            let Some(permit) = self.acquire_notify_permit().await else {
                self.queue_retry(member, cursor);
                continue;
            };
            let scheduler = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = scheduler.notify_member(&member, cursor, None).await;
                if outcome == NotifyOutcome::RetryNeeded {
                    scheduler.queue_retry(member, cursor);
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Notify task failed");
            }
        }
    }

    /// Resolve the member's release and send it.
    ///
    /// With `known` set, nothing is sent when the resolved release equals it.
    /// Transient failures ask for a retry; final ones are reported to the
    /// member as a no-match.
    pub async fn notify_member(
        &self,
        member: &Member,
        cursor: EventId,
        known: Option<ReleaseId>,
    ) -> NotifyOutcome {
        let outcome = self.resolve_and_send(member, cursor, known).await;
        self.metrics.record_notify(outcome.as_str());
        outcome
    }

    async fn resolve_and_send(
        &self,
        member: &Member,
        cursor: EventId,
        known: Option<ReleaseId>,
    ) -> NotifyOutcome {
        let release_id = match self.matcher.match_release(&member.spec.instance_meta()).await {
            Ok(release_id) => release_id,
            Err(e) => return self.reject(member, e).await,
        };
        if known == Some(release_id) {
            return NotifyOutcome::Delivered;
        }

        match self.payloads.build(&member.spec, release_id, cursor).await {
            Ok(payload) => {
                member
                    .receiver
                    .notify(MessageBody::PublishRelease(payload))
                    .await
            }
            Err(e) => self.reject(member, e).await,
        }
    }

    async fn reject(&self, member: &Member, error: TrellisError) -> NotifyOutcome {
        if error.is_retryable() {
            tracing::debug!(serial = member.serial, error = %error, "Notification deferred");
            return NotifyOutcome::RetryNeeded;
        }
        member
            .receiver
            .notify(MessageBody::ReleaseNotMatched {
                code: error.code(),
                reason: error.to_string(),
            })
            .await
    }

    fn queue_retry(&self, member: Member, cursor: EventId) {
        let serial = member.serial;
        if let Err(e) = self.retry.add(member, cursor) {
            tracing::warn!(serial, error = %e, "Failed to queue retry");
        }
        self.metrics.retry_queue_depth.set(self.retry.len() as i64);
    }

    fn is_registered(&self, member: &Member) -> bool {
        self.actors
            .lock()
            .ok()
            .and_then(|actors| {
                actors
                    .get(&(member.spec.biz_id, member.spec.app_id))
                    .cloned()
            })
            .and_then(|actor| actor.consumers_snapshot().ok())
            .map_or(false, |members| members.iter().any(|m| m.serial == member.serial))
    }

    /// Re-attempt queued notifications of members that are still subscribed.
    pub async fn retry_entries(self: &Arc<Self>, entries: Vec<RetryEntry>) {
        let targets: Vec<(Member, EventId)> = entries
            .into_iter()
            .filter(|entry| self.is_registered(&entry.member))
            .map(|entry| (entry.member, entry.cursor))
            .collect();
        self.fan_out(targets).await;
        self.metrics.retry_queue_depth.set(self.retry.len() as i64);
    }

    /// Drain the retry queue until `shutdown` fires.
    pub async fn run_retry_drain(self: Arc<Self>, shutdown: CancellationToken) {
        let retry = self.retry.clone();
        retry
            .run_drain(shutdown, |entries| {
                let scheduler = Arc::clone(&self);
                async move { scheduler.retry_entries(entries).await }
            })
            .await;
    }

    // ------------------------------------------------------------------------
    // Idle actors
    // ------------------------------------------------------------------------

    /// Drop consumers whose connection went away without unsubscribing,
    /// then actors left with no consumers, no drain and no activity for
    /// `idle_actor_timeout`.
    pub fn reap_idle(&self) -> usize {
        let timeout = self.config.idle_actor_timeout;
        let mut departed = Vec::new();
        let reaped = {
            let Ok(mut actors) = self.actors() else {
                return 0;
            };
            for actor in actors.values() {
                match actor.prune_closed() {
                    Ok(gone) => departed.extend(gone),
                    Err(e) => tracing::warn!(app_id = actor.app_id(), error = %e, "Failed to prune consumers"),
                }
            }
            let before = actors.len();
            actors.retain(|_, actor| {
                let idle = actor.is_idle(timeout);
                if idle {
                    actor.close();
                }
                !idle
            });
            before - actors.len()
        };

        if !departed.is_empty() {
            self.metrics.consumers.sub(departed.len() as i64);
            for serial in &departed {
                if let Err(e) = self.retry.delete(*serial) {
                    tracing::warn!(serial, error = %e, "Failed to drop retries");
                }
            }
            self.metrics.retry_queue_depth.set(self.retry.len() as i64);
            tracing::info!(departed = departed.len(), "Departed consumers pruned");
        }
        if reaped > 0 {
            self.metrics.active_actors.sub(reaped as i64);
            tracing::info!(reaped, "Idle app actors reaped");
        }
        reaped
    }

    pub async fn run_reaper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.reap_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap_idle();
                }
            }
        }
        tracing::info!("Actor reaper shutting down");
    }
}
