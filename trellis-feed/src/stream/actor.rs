//! Per-app subscriber registry and event queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use trellis_core::{AppId, BizId, EventId, EventMeta, SerialNumber, TrellisError, TrellisResult};

use super::consumer::Member;

#[derive(Default)]
struct EventQueue {
    pending: VecDeque<EventMeta>,
    /// A drain task owns this actor.
    draining: bool,
}

/// State of one app with active subscribers.
///
/// Actors own no task. Pushing events reports whether a drain must be
/// scheduled, and the drain pops events one at a time until the queue is
/// empty, so at most one drain runs per actor and events keep id order.
pub struct AppActor {
    biz_id: BizId,
    app_id: AppId,
    consumers: Mutex<HashMap<SerialNumber, Member>>,
    queue: Mutex<EventQueue>,
    /// Id of the last event accepted into the queue.
    cursor: AtomicU64,
    last_active: Mutex<Instant>,
    closed: AtomicBool,
}

impl AppActor {
    pub fn new(biz_id: BizId, app_id: AppId, cursor: EventId) -> Self {
        Self {
            biz_id,
            app_id,
            consumers: Mutex::new(HashMap::new()),
            queue: Mutex::new(EventQueue::default()),
            cursor: AtomicU64::new(cursor),
            last_active: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn biz_id(&self) -> BizId {
        self.biz_id
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    pub fn cursor(&self) -> EventId {
        self.cursor.load(Ordering::Acquire)
    }

    fn consumers(&self) -> TrellisResult<MutexGuard<'_, HashMap<SerialNumber, Member>>> {
        self.consumers
            .lock()
            .map_err(|_| TrellisError::poisoned("actor-consumers"))
    }

    fn queue(&self) -> TrellisResult<MutexGuard<'_, EventQueue>> {
        self.queue
            .lock()
            .map_err(|_| TrellisError::poisoned("actor-queue"))
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_active.lock() {
            *last = Instant::now();
        }
    }

    /// Queue events newer than the cursor. Returns true when the caller must
    /// schedule a drain.
    pub fn push(&self, events: &[EventMeta]) -> TrellisResult<bool> {
        let mut queue = self.queue()?;
        for event in events {
            if event.id > self.cursor() {
                self.cursor.store(event.id, Ordering::Release);
                queue.pending.push_back(event.clone());
            }
        }
        let schedule = !queue.draining && !queue.pending.is_empty();
        if schedule {
            queue.draining = true;
        }
        drop(queue);
        self.touch();
        Ok(schedule)
    }

    /// Next event for the running drain. Returning `None` ends the drain.
    pub fn next_event(&self) -> TrellisResult<Option<EventMeta>> {
        let mut queue = self.queue()?;
        let next = queue.pending.pop_front();
        if next.is_none() {
            queue.draining = false;
        }
        Ok(next)
    }

    /// Give up the drain slot after a failed drain, dropping pending events.
    pub fn abandon_drain(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.pending.clear();
            queue.draining = false;
        }
    }

    pub fn add_consumer(&self, member: Member) -> TrellisResult<()> {
        self.consumers()?.insert(member.serial, member);
        self.touch();
        Ok(())
    }

    pub fn remove_consumer(&self, serial: SerialNumber) -> TrellisResult<Option<Member>> {
        let removed = self.consumers()?.remove(&serial);
        self.touch();
        Ok(removed)
    }

    /// Remove and return every consumer.
    pub fn take_consumers(&self) -> TrellisResult<Vec<Member>> {
        Ok(self.consumers()?.drain().map(|(_, m)| m).collect())
    }

    /// Remove consumers whose connection is gone. Does not count as activity.
    pub fn prune_closed(&self) -> TrellisResult<Vec<SerialNumber>> {
        let mut consumers = self.consumers()?;
        let gone: Vec<SerialNumber> = consumers
            .values()
            .filter(|m| m.receiver.is_closed())
            .map(|m| m.serial)
            .collect();
        for serial in &gone {
            consumers.remove(serial);
        }
        Ok(gone)
    }

    /// Copy of the consumers, ordered by serial number.
    pub fn consumers_snapshot(&self) -> TrellisResult<Vec<Member>> {
        let mut members: Vec<Member> = self.consumers()?.values().cloned().collect();
        members.sort_by_key(|m| m.serial);
        Ok(members)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn is_draining(&self) -> bool {
        self.queue.lock().map(|q| q.draining).unwrap_or(true)
    }

    /// No consumers, no drain, and untouched for `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        let quiet = self
            .last_active
            .lock()
            .map(|last| last.elapsed() >= timeout)
            .unwrap_or(false);
        quiet && self.consumer_count() == 0 && !self.is_draining()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
