//! Messages pushed to watch connections.

use serde::{Deserialize, Serialize};
use trellis_core::{
    AppId, BizId, ErrorCode, EventId, FilePermission, HookSpec, ReleaseId, ReleasedConfigItem,
    ReleasedKv,
};

/// Envelope of every streamed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMessage {
    pub api_version: String,
    /// Monotonically increasing per stream, starting at 1.
    pub message_id: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Reconnect to another feed server.
    Bounce {
        reason: String,
        reconnect_after_ms: u64,
    },
    PublishRelease(ReleasePayload),
    /// No release could be resolved; the client keeps its last known good state.
    ReleaseNotMatched { code: ErrorCode, reason: String },
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Bounce { .. } => "bounce",
            MessageBody::PublishRelease(_) => "publish_release",
            MessageBody::ReleaseNotMatched { .. } => "release_not_matched",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasePayload {
    pub biz_id: BizId,
    pub app_id: AppId,
    pub app: String,
    pub release_id: ReleaseId,
    pub cursor_id: EventId,
    pub content: ReleaseContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "config_type", rename_all = "snake_case")]
pub enum ReleaseContent {
    File {
        repository: RepositoryLocation,
        items: Vec<ConfigItemMeta>,
        pre_hook: Option<HookSpec>,
        post_hook: Option<HookSpec>,
    },
    Kv {
        keys: Vec<KvMeta>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryLocation {
    pub root: String,
    pub release_path: String,
}

impl RepositoryLocation {
    pub fn new(root: &str, biz_id: BizId, app_id: AppId, release_id: ReleaseId) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
            release_path: format!("/{}/{}/{}", biz_id, app_id, release_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigItemMeta {
    pub config_item_id: u32,
    pub name: String,
    pub path: String,
    pub permission: FilePermission,
    pub signature: String,
    pub byte_size: u64,
}

impl From<&ReleasedConfigItem> for ConfigItemMeta {
    fn from(item: &ReleasedConfigItem) -> Self {
        Self {
            config_item_id: item.config_item_id,
            name: item.name.clone(),
            path: item.path.clone(),
            permission: item.permission.clone(),
            signature: item.signature.clone(),
            byte_size: item.byte_size,
        }
    }
}

/// Key metadata; values are fetched separately by the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvMeta {
    pub key: String,
    pub kv_type: String,
    pub signature: String,
}

impl From<&ReleasedKv> for KvMeta {
    fn from(kv: &ReleasedKv) -> Self {
        Self {
            key: kv.key.clone(),
            kv_type: kv.kv_type.clone(),
            signature: kv.signature.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounce_wire_shape() {
        let message = FeedMessage {
            api_version: "v1.4".into(),
            message_id: 3,
            body: MessageBody::Bounce {
                reason: "shutting down".into(),
                reconnect_after_ms: 1500,
            },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "bounce");
        assert_eq!(json["message_id"], 3);
        assert_eq!(json["reconnect_after_ms"], 1500);
    }

    #[test]
    fn test_not_matched_carries_code() {
        let body = MessageBody::ReleaseNotMatched {
            code: ErrorCode::NoReleaseMatched,
            reason: "no default".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "release_not_matched");
        assert_eq!(json["code"], "NO_RELEASE_MATCHED");
    }

    #[test]
    fn test_repository_location() {
        let location = RepositoryLocation::new("/data/repo/", 2, 7, 10);
        assert_eq!(location.root, "/data/repo");
        assert_eq!(location.release_path, "/2/7/10");
    }
}
