//! Credential authorization with cached decisions.

use std::sync::Arc;
use std::time::Duration;
use trellis_core::{BizId, Credential, GlobSet, TrellisResult};

use super::resource::ResourceCache;
use super::store::LocalStore;
use super::LocalKind;
use crate::config::LocalCacheConfig;
use crate::telemetry::FeedMetrics;

/// Decides whether a bearer token may watch an app.
pub struct CredentialAuthorizer {
    credentials: Arc<ResourceCache<Credential>>,
}

impl CredentialAuthorizer {
    pub fn new(credentials: Arc<ResourceCache<Credential>>) -> Self {
        Self { credentials }
    }

    /// An unknown token is a deny, not an error. A credential grants an app
    /// only when enabled and one of its scopes matches the app name.
    pub async fn check(&self, biz_id: BizId, token: &str, app: &str) -> TrellisResult<bool> {
        let credential = match self.credentials.get(&(biz_id, token.to_string())).await {
            Ok(credential) => credential,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        if !credential.enabled || credential.scopes.is_empty() {
            return Ok(false);
        }
        Ok(GlobSet::new(&credential.scopes)?.is_match(app))
    }
}

type DecisionKey = (BizId, String, String);

/// Authorization decisions keyed by `(biz, token, app)`.
///
/// Grants live for the resource's configured TTL, denials for the shorter
/// negative window.
pub struct AuthCache {
    authorizer: CredentialAuthorizer,
    decisions: LocalStore<DecisionKey, bool>,
    negative_ttl: Duration,
}

impl AuthCache {
    pub fn new(
        credentials: Arc<ResourceCache<Credential>>,
        config: &LocalCacheConfig,
        metrics: FeedMetrics,
    ) -> Self {
        Self {
            authorizer: CredentialAuthorizer::new(credentials),
            decisions: LocalStore::new(
                LocalKind::Authorization,
                config.resource(LocalKind::Authorization),
                metrics,
            ),
            negative_ttl: config.negative_auth_ttl,
        }
    }

    pub async fn authorize(&self, biz_id: BizId, token: &str, app: &str) -> TrellisResult<bool> {
        let key = (biz_id, token.to_string(), app.to_string());
        if let Some(allowed) = self.decisions.lookup(&key)? {
            return Ok(allowed);
        }

        let allowed = self.authorizer.check(biz_id, token, app).await?;
        if allowed {
            self.decisions.insert(key, true)?;
        } else {
            tracing::debug!(biz_id, app, "Authorization denied");
            self.decisions.insert_with_ttl(key, false, self.negative_ttl)?;
        }
        Ok(allowed)
    }

    /// Forget every decision of a business.
    pub fn forget_biz(&self, biz_id: BizId) -> TrellisResult<usize> {
        self.decisions.remove_where(|(biz, _, _), _| *biz == biz_id)
    }

    pub fn hit_ratio(&self) -> f64 {
        self.decisions.hit_ratio()
    }
}
