//! Trellis Events - Change Log and Change Observer
//!
//! The durable change log is an ordered sequence of [`EventMeta`] entries
//! with strictly increasing ids. The [`ChangeObserver`] polls it from a
//! cursor and, for every batch it reads:
//!
//! 1. hands the batch to a [`CachePurger`] and waits for it to finish,
//! 2. broadcasts the batch to every subscriber,
//! 3. commits the cursor to the last event id.
//!
//! ```text
//! EventLog ──poll──▶ ChangeObserver ──purge──▶ CachePurger
//!                          │
//!                          └──broadcast──▶ subscribers (scheduler)
//! ```
//!
//! A subscriber therefore never sees an event before the caches it would
//! read from have dropped the stale entries.

mod log;
mod observer;

pub use log::{EventLog, InMemoryEventLog, StoreEventLog};
pub use observer::{
    CachePurger, ChangeObserver, EventBatch, NoopPurger, ObserverConfig, ObserverMetrics,
};

pub use trellis_core::{EventAttachment, EventId, EventMeta, EventSpec};
