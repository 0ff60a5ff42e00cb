//! Enum types for trellis entities and events

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// CACHE RESOURCE KINDS
// ============================================================================

/// Resource kinds held by the remote cache tier.
///
/// Each kind owns its own TTL range, lock pool and key namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    AppMeta,
    AppId,
    ReleasedConfigItem,
    ReleasedKv,
    ReleasedHook,
    ReleasedGroup,
    Credential,
    CpsIds,
    Strategy,
    InstanceRelease,
    AsyncDownloadTask,
    ClientMetric,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 12] = [
        ResourceKind::AppMeta,
        ResourceKind::AppId,
        ResourceKind::ReleasedConfigItem,
        ResourceKind::ReleasedKv,
        ResourceKind::ReleasedHook,
        ResourceKind::ReleasedGroup,
        ResourceKind::Credential,
        ResourceKind::CpsIds,
        ResourceKind::Strategy,
        ResourceKind::InstanceRelease,
        ResourceKind::AsyncDownloadTask,
        ResourceKind::ClientMetric,
    ];

    /// Key namespace segment used when rendering cache keys.
    pub fn namespace(&self) -> &'static str {
        match self {
            ResourceKind::AppMeta => "app-meta",
            ResourceKind::AppId => "app-id",
            ResourceKind::ReleasedConfigItem => "released-ci",
            ResourceKind::ReleasedKv => "released-kv",
            ResourceKind::ReleasedHook => "released-hook",
            ResourceKind::ReleasedGroup => "released-group",
            ResourceKind::Credential => "credential",
            ResourceKind::CpsIds => "cps-id",
            ResourceKind::Strategy => "strategy",
            ResourceKind::InstanceRelease => "instance-release",
            ResourceKind::AsyncDownloadTask => "async-download",
            ResourceKind::ClientMetric => "client-metric",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.namespace() == s)
            .ok_or_else(|| format!("Invalid ResourceKind: {}", s))
    }
}

// ============================================================================
// EVENT ENUMS
// ============================================================================

/// The resource an event in the durable change log refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Application metadata changed or the app was deleted.
    Application,
    /// A release was published through a strategy.
    Publish,
    /// A credential or its scopes changed.
    Credential,
    /// An instance-level pinned release changed.
    InstancePublish,
}

/// Operation recorded by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ResourceType::Application => "application",
            ResourceType::Publish => "publish",
            ResourceType::Credential => "credential",
            ResourceType::InstancePublish => "instance_publish",
        };
        write!(f, "{}", value)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Delete => "delete",
        };
        write!(f, "{}", value)
    }
}

// ============================================================================
// APPLICATION ENUMS
// ============================================================================

/// How an app delivers its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigType {
    /// Files rendered onto disk by the sidecar.
    File,
    /// Key-value pairs fetched by the client SDK.
    Kv,
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigType::File => f.write_str("file"),
            ConfigType::Kv => f.write_str("kv"),
        }
    }
}

impl FromStr for ConfigType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(ConfigType::File),
            "kv" => Ok(ConfigType::Kv),
            _ => Err(format!("Invalid ConfigType: {}", s)),
        }
    }
}

/// Strategy evaluation mode of an app. An app's strategies all share one mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyMode {
    #[default]
    Normal,
    Namespace,
}

impl fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyMode::Normal => f.write_str("normal"),
            StrategyMode::Namespace => f.write_str("namespace"),
        }
    }
}

/// Hook stage relative to applying a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStage {
    Pre,
    Post,
}

/// Interpreter a hook script is run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Shell,
    Python,
}

/// Lifecycle of an async file download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadTaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl DownloadTaskStatus {
    /// Check if the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadTaskStatus::Success | DownloadTaskStatus::Failed)
    }
}
