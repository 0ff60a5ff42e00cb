//! Notification scheduler behaviour against both cache tiers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use trellis_core::{ErrorCode, TrellisError};
use trellis_feed::{
    LocalCacheConfig, MessageBody, NotifyOutcome, ReleaseContent, ReleaseReceiver, Scheduler,
};
use trellis_test_utils::fixtures::*;

#[path = "support/harness.rs"]
mod test_harness_support;
#[path = "support/receiver.rs"]
mod test_receiver_support;
use test_harness_support::{eventually, scheduler_config, Harness, REPOSITORY_ROOT};
use test_receiver_support::{member, CollectingReceiver};

fn spec(uid: &str) -> trellis_core::InstanceSpec {
    instance_spec(uid, labels(&[("env", "prod")]))
}

// ============================================================================
// SUBSCRIBE
// ============================================================================

#[tokio::test]
async fn test_subscribe_sends_release_to_stale_client() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();

    harness
        .scheduler
        .subscribe(0, 0, member(spec("uid-1"), &receiver, 1))
        .await
        .unwrap();

    let messages = receiver.messages();
    assert_eq!(messages.len(), 1);
    let MessageBody::PublishRelease(payload) = &messages[0] else {
        panic!("expected a release, got {:?}", messages[0]);
    };
    assert_eq!(payload.release_id, 10);
    assert_eq!(payload.cursor_id, 0);
    let ReleaseContent::File { repository, items, .. } = &payload.content else {
        panic!("expected file content");
    };
    assert_eq!(repository.root, REPOSITORY_ROOT.trim_end_matches('/'));
    assert_eq!(repository.release_path, format!("/{}/{}/10", BIZ, APP));
    assert_eq!(items.len(), 2);
    assert_eq!(harness.scheduler.actor_count(), 1);
    assert_eq!(harness.scheduler.consumer_count(), 1);
}

#[tokio::test]
async fn test_subscribe_is_silent_when_release_is_current() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();

    harness
        .scheduler
        .subscribe(10, 0, member(spec("uid-1"), &receiver, 1))
        .await
        .unwrap();

    assert!(receiver.messages().is_empty());
    assert_eq!(harness.scheduler.consumer_count(), 1);
}

#[tokio::test]
async fn test_subscribe_filters_items_by_match_patterns() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();
    let mut spec = spec("uid-1");
    spec.match_patterns = vec!["/etc/payment/certs/*".to_string()];

    harness
        .scheduler
        .subscribe(0, 0, member(spec, &receiver, 1))
        .await
        .unwrap();

    let MessageBody::PublishRelease(payload) = &receiver.messages()[0] else {
        panic!("expected a release");
    };
    let ReleaseContent::File { items, .. } = &payload.content else {
        panic!("expected file content");
    };
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "ca.pem");
}

#[tokio::test]
async fn test_subscribe_waits_for_server_cursor() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();

    let result = harness
        .scheduler
        .subscribe(0, 5, member(spec("uid-1"), &receiver, 1))
        .await;

    assert!(matches!(result, Err(TrellisError::Timeout(_))));
    assert_eq!(harness.scheduler.consumer_count(), 0);
    assert!(receiver.messages().is_empty());
}

#[tokio::test]
async fn test_subscribe_succeeds_once_cursor_catches_up() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();

    let cursor = harness.cursor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        cursor.set(5);
    });

    harness
        .scheduler
        .subscribe(0, 5, member(spec("uid-1"), &receiver, 1))
        .await
        .unwrap();
    assert_eq!(receiver.publishes(), vec![(10, 5)]);
}

#[tokio::test]
async fn test_invalid_spec_is_rejected() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();

    let result = harness
        .scheduler
        .subscribe(0, 0, member(spec(""), &receiver, 1))
        .await;

    assert!(matches!(result, Err(TrellisError::InvalidParameter(_))));
    assert_eq!(harness.scheduler.actor_count(), 0);
}

#[tokio::test]
async fn test_unmatched_instance_gets_not_matched() {
    let source = seeded_source();
    source
        .publish(BIZ, APP, vec![label_strategy(APP, 5, 20, "env", "staging")])
        .unwrap();
    let harness = Harness::new(source);
    let receiver = CollectingReceiver::new();

    harness
        .scheduler
        .subscribe(0, 0, member(spec("uid-1"), &receiver, 1))
        .await
        .unwrap();

    let messages = receiver.messages();
    assert!(matches!(
        messages.as_slice(),
        [MessageBody::ReleaseNotMatched { code: ErrorCode::NoReleaseMatched, .. }]
    ));
}

#[tokio::test]
async fn test_last_unsubscribe_removes_actor() {
    let harness = Harness::new(seeded_source());
    let (a, b) = (CollectingReceiver::new(), CollectingReceiver::new());
    harness.scheduler.subscribe(10, 0, member(spec("uid-a"), &a, 1)).await.unwrap();
    harness.scheduler.subscribe(10, 0, member(spec("uid-b"), &b, 2)).await.unwrap();
    assert_eq!(harness.scheduler.actor_count(), 1);

    harness.scheduler.unsubscribe(BIZ, APP, 1).unwrap();
    assert_eq!(harness.scheduler.actor_count(), 1);
    assert_eq!(harness.scheduler.consumer_count(), 1);

    harness.scheduler.unsubscribe(BIZ, APP, 2).unwrap();
    assert_eq!(harness.scheduler.actor_count(), 0);
}

// ============================================================================
// EVENTS
// ============================================================================

#[tokio::test]
async fn test_publishes_reach_members_in_order() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();
    harness
        .scheduler
        .subscribe(10, 0, member(spec("uid-1"), &receiver, 1))
        .await
        .unwrap();

    harness
        .source
        .publish(BIZ, APP, vec![default_strategy(APP, 2, 20)])
        .unwrap();
    harness.commit(&[publish_event(1, APP, 20)]).await;
    eventually("first publish", || receiver.publishes() == vec![(20, 1)]).await;

    harness
        .source
        .publish(BIZ, APP, vec![default_strategy(APP, 3, 10)])
        .unwrap();
    harness.commit(&[publish_event(2, APP, 10)]).await;
    eventually("second publish", || receiver.publishes().len() == 2).await;

    assert_eq!(receiver.publishes(), vec![(20, 1), (10, 2)]);
}

#[tokio::test]
async fn test_events_of_other_apps_are_ignored() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();
    harness
        .scheduler
        .subscribe(10, 0, member(spec("uid-1"), &receiver, 1))
        .await
        .unwrap();

    harness.commit(&[publish_event(1, APP + 1, 99)]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(receiver.messages().is_empty());
}

#[tokio::test]
async fn test_app_delete_closes_watchers_and_drops_retries() {
    let harness = Harness::new(seeded_source());
    let (a, b) = (CollectingReceiver::new(), CollectingReceiver::new());
    b.force(Some(NotifyOutcome::RetryNeeded));
    harness.scheduler.subscribe(10, 0, member(spec("uid-a"), &a, 1)).await.unwrap();
    harness.scheduler.subscribe(0, 0, member(spec("uid-b"), &b, 2)).await.unwrap();
    assert_eq!(harness.scheduler.retry_queue().len(), 1);

    harness.commit(&[app_delete_event(3, APP)]).await;
    eventually("watchers closed", || {
        a.closed_reason().is_some() && b.closed_reason().is_some()
    })
    .await;

    eventually("actor removed", || harness.scheduler.actor_count() == 0).await;
    assert!(harness.scheduler.retry_queue().is_empty());
    assert_eq!(harness.scheduler.consumer_count(), 0);
}

/// Records how many actors the scheduler holds when it is force-closed.
struct RegistryWatcher {
    scheduler: Arc<Scheduler>,
    actors_at_close: Mutex<Option<usize>>,
}

#[async_trait]
impl ReleaseReceiver for RegistryWatcher {
    async fn notify(&self, _body: MessageBody) -> NotifyOutcome {
        NotifyOutcome::Delivered
    }

    fn close(&self, _reason: &str) {
        *self.actors_at_close.lock().unwrap() = Some(self.scheduler.actor_count());
    }
}

#[tokio::test]
async fn test_app_delete_unregisters_actor_before_closing_watchers() {
    let harness = Harness::new(seeded_source());
    let watcher = Arc::new(RegistryWatcher {
        scheduler: harness.scheduler.clone(),
        actors_at_close: Mutex::new(None),
    });
    harness
        .scheduler
        .subscribe(10, 0, trellis_feed::Member::new(spec("uid-1"), watcher.clone(), 1))
        .await
        .unwrap();

    harness.commit(&[app_delete_event(1, APP)]).await;
    eventually("watcher closed", || watcher.actors_at_close.lock().unwrap().is_some()).await;
    assert_eq!(*watcher.actors_at_close.lock().unwrap(), Some(0));

    // a later subscriber gets a fresh actor
    let receiver = CollectingReceiver::new();
    harness.scheduler.subscribe(10, 1, member(spec("uid-2"), &receiver, 2)).await.unwrap();
    assert_eq!(harness.scheduler.actor_count(), 1);
    assert_eq!(harness.scheduler.consumer_count(), 1);
    assert_eq!(harness.metrics.active_actors.get(), 1);
}

// ============================================================================
// IDLE ACTORS
// ============================================================================

#[tokio::test]
async fn test_reaper_drops_actors_of_departed_connections() {
    let config = scheduler_config().with_idle_actor_timeout(Duration::ZERO);
    let harness = Harness::with_config(seeded_source(), LocalCacheConfig::default(), config);
    let (a, b) = (CollectingReceiver::new(), CollectingReceiver::new());
    harness.scheduler.subscribe(10, 0, member(spec("uid-a"), &a, 1)).await.unwrap();
    harness.scheduler.subscribe(10, 0, member(spec("uid-b"), &b, 2)).await.unwrap();

    assert_eq!(harness.scheduler.reap_idle(), 0);
    assert_eq!(harness.scheduler.actor_count(), 1);

    a.disconnect();
    assert_eq!(harness.scheduler.reap_idle(), 0);
    assert_eq!(harness.scheduler.consumer_count(), 1);
    assert_eq!(harness.metrics.consumers.get(), 1);

    b.disconnect();
    assert_eq!(harness.scheduler.reap_idle(), 1);
    assert_eq!(harness.scheduler.actor_count(), 0);
    assert_eq!(harness.metrics.active_actors.get(), 0);
    assert_eq!(harness.metrics.consumers.get(), 0);
}

#[tokio::test]
async fn test_reaper_keeps_recently_active_actors() {
    let config = scheduler_config().with_idle_actor_timeout(Duration::from_secs(60));
    let harness = Harness::with_config(seeded_source(), LocalCacheConfig::default(), config);
    let receiver = CollectingReceiver::new();
    harness.scheduler.subscribe(10, 0, member(spec("uid-1"), &receiver, 1)).await.unwrap();

    receiver.disconnect();
    assert_eq!(harness.scheduler.reap_idle(), 0);
    assert_eq!(harness.scheduler.consumer_count(), 0);
    assert_eq!(harness.scheduler.actor_count(), 1);
}

// ============================================================================
// RETRIES
// ============================================================================

#[tokio::test]
async fn test_busy_member_is_retried() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();
    receiver.force(Some(NotifyOutcome::RetryNeeded));

    harness
        .scheduler
        .subscribe(0, 0, member(spec("uid-1"), &receiver, 1))
        .await
        .unwrap();
    assert!(receiver.messages().is_empty());
    assert_eq!(harness.scheduler.retry_queue().len(), 1);

    receiver.force(None);
    let shutdown = CancellationToken::new();
    let drain = tokio::spawn(
        harness
            .scheduler
            .clone()
            .run_retry_drain(shutdown.clone()),
    );

    eventually("retried release", || receiver.releases() == vec![10]).await;
    assert!(harness.scheduler.retry_queue().is_empty());

    shutdown.cancel();
    drain.await.unwrap();
}

#[tokio::test]
async fn test_retries_of_departed_members_are_dropped() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();
    receiver.force(Some(NotifyOutcome::RetryNeeded));
    harness
        .scheduler
        .subscribe(0, 0, member(spec("uid-1"), &receiver, 1))
        .await
        .unwrap();
    assert_eq!(harness.scheduler.retry_queue().len(), 1);

    harness.scheduler.unsubscribe(BIZ, APP, 1).unwrap();
    assert!(harness.scheduler.retry_queue().is_empty());
}

#[tokio::test]
async fn test_retry_queue_coalesces_per_member() {
    let harness = Harness::new(seeded_source());
    let receiver = CollectingReceiver::new();
    harness
        .scheduler
        .subscribe(10, 0, member(spec("uid-1"), &receiver, 1))
        .await
        .unwrap();
    receiver.force(Some(NotifyOutcome::RetryNeeded));

    harness
        .source
        .publish(BIZ, APP, vec![default_strategy(APP, 2, 20)])
        .unwrap();
    harness.commit(&[publish_event(1, APP, 20)]).await;
    eventually("first retry", || harness.scheduler.retry_queue().len() == 1).await;

    harness.commit(&[publish_event(2, APP, 20)]).await;
    eventually("coalesced retry", || {
        harness
            .scheduler
            .retry_queue()
            .snapshot()
            .map(|entries| entries.len() == 1 && entries[0].cursor == 2)
            .unwrap_or(false)
    })
    .await;
}
