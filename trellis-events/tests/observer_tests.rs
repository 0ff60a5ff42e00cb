//! Change observer loop against the shared test doubles.

use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use trellis_core::{EventAttachment, EventSpec, OpType, ResourceType};
use trellis_events::{ChangeObserver, ObserverConfig, ObserverMetrics};
use trellis_test_utils::{FlakyEventLog, RecordingPurger};

const ATTACHMENT: EventAttachment = EventAttachment { biz_id: 2, app_id: 7 };

fn publish(release_id: u32) -> EventSpec {
    EventSpec {
        resource: ResourceType::Publish,
        resource_id: release_id,
        op: OpType::Insert,
    }
}

async fn until_ready(observer: &ChangeObserver) {
    while !observer.is_ready() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_purge_in_order_then_broadcast() {
    let log = Arc::new(FlakyEventLog::new());
    let purger = Arc::new(RecordingPurger::new());
    let observer = Arc::new(ChangeObserver::new(
        log.clone(),
        purger.clone(),
        ObserverConfig::default(),
        ObserverMetrics::new(&Registry::new()).unwrap(),
    ));
    purger.watch(observer.subscribe("scheduler").unwrap());

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(observer.clone().run(shutdown.clone()));
    until_ready(&observer).await;

    for release in [10, 11, 12] {
        log.append(publish(release), ATTACHMENT).unwrap();
    }
    while observer.current_cursor() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(purger.purged(), vec![1, 2, 3]);
    assert!(!purger.broadcast_before_purge());
    let batch = purger.take_watched().unwrap().try_recv().unwrap();
    assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_retries_at_same_cursor() {
    let log = Arc::new(FlakyEventLog::new());
    let purger = Arc::new(RecordingPurger::new());
    let metrics = ObserverMetrics::new(&Registry::new()).unwrap();
    let observer = Arc::new(ChangeObserver::new(
        log.clone(),
        purger.clone(),
        ObserverConfig::default(),
        metrics.clone(),
    ));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(observer.clone().run(shutdown.clone()));
    until_ready(&observer).await;

    for release in [10, 11, 12] {
        log.append(publish(release), ATTACHMENT).unwrap();
    }
    log.fail_next(2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(purger.purged(), vec![1, 2, 3]);
    assert_eq!(observer.current_cursor(), 3);
    assert_eq!(metrics.fetch_failures_total.get(), 2);
    assert_eq!(metrics.cursor.get(), 3);
    // every fetch before the successful one asked from cursor 0
    let cursors = log.fetch_cursors();
    let first_success = cursors.iter().position(|c| *c == 3).unwrap();
    assert!(cursors[..first_success].iter().all(|c| *c == 0));
}
