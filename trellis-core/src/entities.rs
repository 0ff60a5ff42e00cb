//! Entity types served by the caches and consumed by the matcher

use crate::*;
use serde::{Deserialize, Serialize};

// ============================================================================
// APPLICATION
// ============================================================================

/// Application metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMeta {
    pub biz_id: BizId,
    pub app_id: AppId,
    pub name: String,
    pub config_type: ConfigType,
    #[serde(default)]
    pub mode: StrategyMode,
    #[serde(default)]
    pub memo: String,
}

// ============================================================================
// RELEASED CONTENT
// ============================================================================

/// File permission attributes applied by the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePermission {
    pub user: String,
    pub user_group: String,
    pub privilege: String,
}

impl Default for FilePermission {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            user_group: "root".to_string(),
            privilege: "644".to_string(),
        }
    }
}

/// Metadata of one config item frozen into a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedConfigItem {
    pub release_id: ReleaseId,
    pub config_item_id: u32,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub permission: FilePermission,
    /// SHA-256 of the content, hex encoded.
    pub signature: String,
    pub byte_size: u64,
}

impl ReleasedConfigItem {
    /// Absolute path of the item as rendered on disk, e.g. `/etc/app/db.yaml`.
    pub fn full_path(&self) -> String {
        let dir = self.path.trim_end_matches('/');
        format!("{}/{}", dir, self.name)
    }
}

/// One key-value pair frozen into a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedKv {
    pub release_id: ReleaseId,
    pub key: String,
    pub kv_type: String,
    pub value: String,
    pub signature: String,
}

impl ReleasedKv {
    pub fn byte_size(&self) -> usize {
        self.value.len()
    }
}

/// A script hook attached to a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    pub hook_id: u32,
    pub revision_id: u32,
    pub revision_name: String,
    pub kind: HookKind,
    pub content: String,
}

/// The pre- and post-hooks of a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedHooks {
    pub release_id: ReleaseId,
    #[serde(default)]
    pub pre: Option<HookSpec>,
    #[serde(default)]
    pub post: Option<HookSpec>,
}

/// A group that currently receives a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasedGroup {
    pub group_id: u32,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub release_name: String,
    pub strategy_id: StrategyId,
    #[serde(default)]
    pub selector: Option<Selector>,
    #[serde(default)]
    pub uid: String,
    pub updated_at: Timestamp,
}

// ============================================================================
// CREDENTIALS, TASKS, CLIENT METRICS
// ============================================================================

/// A bearer credential and the app scopes it grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: u32,
    pub biz_id: BizId,
    pub name: String,
    pub token: String,
    pub enabled: bool,
    /// Glob patterns over app names, e.g. `payment-*`.
    pub scopes: Vec<String>,
}

/// An async file download task tracked for a sidecar fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncDownloadTask {
    pub biz_id: BizId,
    pub app_id: AppId,
    pub task_id: String,
    pub file_name: String,
    pub file_signature: String,
    pub targets: Vec<String>,
    pub status: DownloadTaskStatus,
    pub updated_at: Timestamp,
}

/// Latest runtime report of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMetric {
    pub biz_id: BizId,
    pub app_id: AppId,
    pub uid: String,
    pub release_id: ReleaseId,
    pub cursor: EventId,
    pub reported_at: Timestamp,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ============================================================================
// STRATEGIES
// ============================================================================

/// A narrower selector within a strategy that overrides its release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubStrategy {
    pub release_id: ReleaseId,
    pub selector: Selector,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyScope {
    #[serde(default)]
    pub selector: Option<Selector>,
    #[serde(default)]
    pub sub_strategy: Option<SubStrategy>,
}

/// A strategy currently published for an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedStrategy {
    pub strategy_id: StrategyId,
    pub app_id: AppId,
    pub release_id: ReleaseId,
    pub as_default: bool,
    #[serde(default)]
    pub mode: StrategyMode,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub scope: StrategyScope,
}

impl PublishedStrategy {
    /// Release selected by this strategy for `labels`: the sub-strategy's
    /// release when its selector matches, otherwise the strategy's own.
    pub fn release_for(&self, labels: &Labels) -> ReleaseId {
        match &self.scope.sub_strategy {
            Some(sub) if sub.selector.matches(labels) => sub.release_id,
            _ => self.release_id,
        }
    }
}

/// An instance-level release override for one uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRelease {
    pub biz_id: BizId,
    pub app_id: AppId,
    pub uid: String,
    pub release_id: ReleaseId,
}

// ============================================================================
// INSTANCES
// ============================================================================

/// The matching key of the release matcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppInstanceMeta {
    pub biz_id: BizId,
    pub app_id: AppId,
    pub app: String,
    #[serde(default)]
    pub namespace: String,
    pub uid: String,
    #[serde(default)]
    pub labels: Labels,
}

/// Identity a watch connection declares when it subscribes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub biz_id: BizId,
    pub app_id: AppId,
    pub app: String,
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
    pub config_type: ConfigType,
    /// Glob patterns restricting which items or keys are delivered.
    #[serde(default)]
    pub match_patterns: Vec<String>,
}

impl InstanceSpec {
    pub fn validate(&self) -> TrellisResult<()> {
        if self.biz_id == 0 {
            return Err(TrellisError::InvalidParameter("biz_id is required".into()));
        }
        if self.app_id == 0 {
            return Err(TrellisError::InvalidParameter("app_id is required".into()));
        }
        if self.app.trim().is_empty() {
            return Err(TrellisError::InvalidParameter("app name is required".into()));
        }
        if self.uid.trim().is_empty() || self.uid.len() > constants::MAX_UID_LEN {
            return Err(TrellisError::InvalidParameter(format!(
                "uid must be 1..={} characters",
                constants::MAX_UID_LEN
            )));
        }
        if self.labels.len() > constants::MAX_LABELS {
            return Err(TrellisError::InvalidParameter(format!(
                "at most {} labels are allowed",
                constants::MAX_LABELS
            )));
        }
        if self.labels.keys().any(|k| k.trim().is_empty()) {
            return Err(TrellisError::InvalidParameter("label key is empty".into()));
        }
        GlobSet::new(&self.match_patterns)?;
        Ok(())
    }

    pub fn instance_meta(&self) -> AppInstanceMeta {
        AppInstanceMeta {
            biz_id: self.biz_id,
            app_id: self.app_id,
            app: self.app.clone(),
            namespace: self.namespace.clone(),
            uid: self.uid.clone(),
            labels: self.labels.clone(),
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventSpec {
    pub resource: ResourceType,
    pub resource_id: u32,
    pub op: OpType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventAttachment {
    pub biz_id: BizId,
    pub app_id: AppId,
}

/// One immutable entry of the durable change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub id: EventId,
    pub spec: EventSpec,
    pub attachment: EventAttachment,
    pub created_at: Timestamp,
}

impl EventMeta {
    pub fn is_app_delete(&self) -> bool {
        self.spec.resource == ResourceType::Application && self.spec.op == OpType::Delete
    }

    pub fn is_publish(&self) -> bool {
        self.spec.resource == ResourceType::Publish
    }

    /// Whether the event changes which release some instance should receive.
    pub fn affects_matching(&self) -> bool {
        matches!(
            self.spec.resource,
            ResourceType::Publish | ResourceType::InstancePublish
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> InstanceSpec {
        InstanceSpec {
            biz_id: 2,
            app_id: 7,
            app: "payment".into(),
            uid: "host-1".into(),
            namespace: String::new(),
            labels: [("env".to_string(), "prod".to_string())].into_iter().collect(),
            config_type: ConfigType::File,
            match_patterns: vec!["/etc/**".into()],
        }
    }

    #[test]
    fn test_instance_spec_validation() {
        assert!(spec().validate().is_ok());

        let mut missing_app = spec();
        missing_app.app_id = 0;
        assert_eq!(missing_app.validate().unwrap_err().code(), ErrorCode::InvalidParameter);

        let mut bad_pattern = spec();
        bad_pattern.match_patterns = vec![String::new()];
        assert!(bad_pattern.validate().is_err());

        let mut long_uid = spec();
        long_uid.uid = "x".repeat(constants::MAX_UID_LEN + 1);
        assert!(long_uid.validate().is_err());
    }

    #[test]
    fn test_sub_strategy_overrides_release() {
        let strategy = PublishedStrategy {
            strategy_id: 3,
            app_id: 7,
            release_id: 20,
            as_default: false,
            mode: StrategyMode::Normal,
            namespace: String::new(),
            scope: StrategyScope {
                selector: Some(Selector::match_all()),
                sub_strategy: Some(SubStrategy {
                    release_id: 21,
                    selector: Selector::all_of(vec![Element::equals("canary", "true")]),
                }),
            },
        };
        let canary: Labels = [("canary".to_string(), "true".to_string())].into_iter().collect();
        assert_eq!(strategy.release_for(&canary), 21);
        assert_eq!(strategy.release_for(&Labels::new()), 20);
    }

    #[test]
    fn test_full_path_joins_segments() {
        let item = ReleasedConfigItem {
            release_id: 1,
            config_item_id: 1,
            name: "db.yaml".into(),
            path: "/etc/app/".into(),
            permission: FilePermission::default(),
            signature: "abc".into(),
            byte_size: 3,
        };
        assert_eq!(item.full_path(), "/etc/app/db.yaml");
    }
}
