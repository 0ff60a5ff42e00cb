//! Trellis Core - Entity Types
//!
//! Data model, error taxonomy, label selectors and glob patterns shared by
//! every trellis crate. No I/O lives here.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

pub type BizId = u32;
pub type AppId = u32;
pub type ReleaseId = u32;
pub type StrategyId = u32;

/// Monotonically increasing id of an event in the durable change log.
pub type EventId = u64;

/// Per-process unique number assigned to each watch connection.
pub type SerialNumber = u64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Instance labels. Ordered so that serialized forms are stable.
pub type Labels = BTreeMap<String, String>;

pub mod config;
pub mod constants;
mod entities;
mod enums;
mod error;
pub mod glob;
pub mod selector;

pub use config::{RateLimit, TtlRange};
pub use entities::*;
pub use enums::*;
pub use error::*;
pub use glob::{Glob, GlobSet};
pub use selector::{Element, Operator, Selector};
