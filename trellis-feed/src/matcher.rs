//! Release Matcher
//!
//! Resolves which release an instance should run. A pinned instance release
//! wins outright; otherwise the app's currently published strategies are
//! evaluated in the app's strategy mode. Every call re-reads the strategies,
//! so a match is never reused across publishes.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use trellis_core::{
    AppInstanceMeta, InstanceRelease, PublishedStrategy, ReleaseId, ResourceKind, StrategyId,
    StrategyMode, TrellisError, TrellisResult,
};
use trellis_storage::{direct_limiter, wait_permit, CacheService, DirectRateLimiter};

use crate::config::MatcherConfig;
use crate::lcache::LocalCaches;
use crate::telemetry::FeedMetrics;

pub struct ReleaseMatcher {
    caches: Arc<LocalCaches>,
    remote: Arc<dyn CacheService>,
    limiter: DirectRateLimiter,
    wait: Duration,
    metrics: FeedMetrics,
}

impl ReleaseMatcher {
    pub fn new(
        caches: Arc<LocalCaches>,
        remote: Arc<dyn CacheService>,
        config: &MatcherConfig,
        metrics: FeedMetrics,
    ) -> Self {
        Self {
            caches,
            remote,
            limiter: direct_limiter(config.rate),
            wait: config.wait,
            metrics,
        }
    }

    /// Resolve the release `meta` should run right now.
    pub async fn match_release(&self, meta: &AppInstanceMeta) -> TrellisResult<ReleaseId> {
        let timer = self.metrics.matcher_duration_seconds.start_timer();
        let result = self.resolve(meta).await;
        timer.observe_duration();

        if let Err(e) = &result {
            self.metrics
                .matcher_failures_total
                .with_label_values(&[e.code().as_str()])
                .inc();
            match e {
                TrellisError::Aborted(_) => tracing::error!(
                    biz_id = meta.biz_id,
                    app_id = meta.app_id,
                    uid = %meta.uid,
                    error = %e,
                    "Published strategies violate matching invariants"
                ),
                _ => tracing::debug!(
                    biz_id = meta.biz_id,
                    app_id = meta.app_id,
                    uid = %meta.uid,
                    error = %e,
                    "Release match failed"
                ),
            }
        }
        result
    }

    async fn resolve(&self, meta: &AppInstanceMeta) -> TrellisResult<ReleaseId> {
        wait_permit(&self.limiter, self.wait, "release matcher").await?;

        if let Some(release_id) = self.pinned_release(meta).await? {
            return Ok(release_id);
        }

        let app = self.caches.app_meta.get(&(meta.biz_id, meta.app_id)).await?;
        let namespace = match app.mode {
            StrategyMode::Normal => "",
            StrategyMode::Namespace => {
                if meta.namespace.is_empty() {
                    return Err(TrellisError::InvalidParameter(format!(
                        "app {} matches by namespace but the instance has none",
                        meta.app_id
                    )));
                }
                meta.namespace.as_str()
            }
        };

        let ids: Vec<StrategyId> = match self
            .remote
            .get_app_cps_ids(meta.biz_id, meta.app_id, namespace)
            .await
        {
            Ok(raw) => decode(ResourceKind::CpsIds, &raw)?,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        let raw = self
            .remote
            .get_published_strategies(meta.biz_id, meta.app_id, &ids)
            .await?;
        let strategies: Vec<PublishedStrategy> = decode(ResourceKind::Strategy, &raw)?;

        evaluate(app.mode, &strategies, meta)
    }

    async fn pinned_release(&self, meta: &AppInstanceMeta) -> TrellisResult<Option<ReleaseId>> {
        match self
            .remote
            .get_instance_release(meta.biz_id, meta.app_id, &meta.uid)
            .await
        {
            Ok(raw) => {
                let pin: InstanceRelease = decode(ResourceKind::InstanceRelease, &raw)?;
                Ok(Some(pin.release_id))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn decode<T: DeserializeOwned>(kind: ResourceKind, raw: &str) -> TrellisResult<T> {
    serde_json::from_str(raw).map_err(|e| TrellisError::codec(kind.namespace(), e))
}

// ============================================================================
// EVALUATION
// ============================================================================

/// Pick the release `meta` matches among `strategies`.
///
/// Pure: identical inputs always give the same answer.
pub fn evaluate(
    mode: StrategyMode,
    strategies: &[PublishedStrategy],
    meta: &AppInstanceMeta,
) -> TrellisResult<ReleaseId> {
    match mode {
        StrategyMode::Normal => evaluate_normal(strategies, meta),
        StrategyMode::Namespace => evaluate_namespace(strategies, meta),
    }
}

fn evaluate_normal(
    strategies: &[PublishedStrategy],
    meta: &AppInstanceMeta,
) -> TrellisResult<ReleaseId> {
    let mut candidates: Vec<&PublishedStrategy> =
        strategies.iter().filter(|s| !s.as_default).collect();
    candidates.sort_by_key(|s| s.strategy_id);

    // a non-default without a main selector never matches
    let matched = candidates.into_iter().find(|s| {
        s.scope
            .selector
            .as_ref()
            .map_or(false, |selector| selector.matches(&meta.labels))
    });
    if let Some(strategy) = matched {
        return Ok(strategy.release_for(&meta.labels));
    }

    match validated_default(strategies, meta)? {
        Some(default) => Ok(default.release_for(&meta.labels)),
        None => Err(TrellisError::NoReleaseMatched(format!(
            "no strategy of app {} matches uid {} and no default is published",
            meta.app_id, meta.uid
        ))),
    }
}

fn evaluate_namespace(
    strategies: &[PublishedStrategy],
    meta: &AppInstanceMeta,
) -> TrellisResult<ReleaseId> {
    if strategies.len() > 2 {
        return Err(TrellisError::Aborted(format!(
            "app {} has {} strategies for namespace {}, at most 2 are allowed",
            meta.app_id,
            strategies.len(),
            meta.namespace
        )));
    }

    let mut namespaced = None;
    for strategy in strategies.iter().filter(|s| !s.as_default) {
        if strategy.namespace != meta.namespace {
            return Err(TrellisError::Aborted(format!(
                "strategy {} has namespace {}, requested {}",
                strategy.strategy_id, strategy.namespace, meta.namespace
            )));
        }
        if namespaced.replace(strategy).is_some() {
            return Err(TrellisError::Aborted(format!(
                "app {} has more than one strategy for namespace {}",
                meta.app_id, meta.namespace
            )));
        }
    }
    let default = validated_default(strategies, meta)?;

    match namespaced.or(default) {
        Some(strategy) => Ok(strategy.release_for(&meta.labels)),
        None => Err(TrellisError::NoReleaseMatched(format!(
            "app {} has no strategy for namespace {}",
            meta.app_id, meta.namespace
        ))),
    }
}

/// The single default strategy, validated.
fn validated_default<'a>(
    strategies: &'a [PublishedStrategy],
    meta: &AppInstanceMeta,
) -> TrellisResult<Option<&'a PublishedStrategy>> {
    let mut defaults = strategies.iter().filter(|s| s.as_default);
    let Some(default) = defaults.next() else {
        return Ok(None);
    };
    if defaults.next().is_some() {
        return Err(TrellisError::Aborted(format!(
            "app {} publishes more than one default strategy",
            meta.app_id
        )));
    }
    if default.strategy_id == 0 || default.release_id == 0 {
        return Err(TrellisError::Aborted(format!(
            "default strategy of app {} is invalid: strategy {} release {}",
            meta.app_id, default.strategy_id, default.release_id
        )));
    }
    Ok(Some(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{Element, Selector, SubStrategy};
    use trellis_test_utils::fixtures::*;

    fn instance(pairs: &[(&str, &str)], namespace: &str) -> AppInstanceMeta {
        AppInstanceMeta {
            biz_id: BIZ,
            app_id: APP,
            app: "payment".into(),
            namespace: namespace.into(),
            uid: "uid-1".into(),
            labels: labels(pairs),
        }
    }

    #[test]
    fn test_first_matching_strategy_by_id_wins() {
        let strategies = vec![
            label_strategy(APP, 5, 50, "env", "prod"),
            label_strategy(APP, 3, 30, "env", "prod"),
            default_strategy(APP, 1, 10),
        ];
        let release = evaluate(StrategyMode::Normal, &strategies, &instance(&[("env", "prod")], ""));
        assert_eq!(release.unwrap(), 30);
    }

    #[test]
    fn test_sub_strategy_overrides_main_release() {
        let mut strategy = label_strategy(APP, 2, 20, "env", "prod");
        strategy.scope.sub_strategy = Some(SubStrategy {
            release_id: 21,
            selector: Selector::all_of(vec![Element::equals("zone", "sh")]),
        });
        let strategies = vec![strategy, default_strategy(APP, 1, 10)];

        let canary = instance(&[("env", "prod"), ("zone", "sh")], "");
        let regular = instance(&[("env", "prod"), ("zone", "gz")], "");
        assert_eq!(evaluate(StrategyMode::Normal, &strategies, &canary).unwrap(), 21);
        assert_eq!(evaluate(StrategyMode::Normal, &strategies, &regular).unwrap(), 20);
    }

    #[test]
    fn test_missing_default_is_no_match() {
        let strategies = vec![label_strategy(APP, 2, 20, "env", "prod")];
        let err = evaluate(StrategyMode::Normal, &strategies, &instance(&[], "")).unwrap_err();
        assert!(matches!(err, TrellisError::NoReleaseMatched(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_default_is_aborted() {
        let strategies = vec![default_strategy(APP, 1, 0)];
        let err = evaluate(StrategyMode::Normal, &strategies, &instance(&[], "")).unwrap_err();
        assert!(matches!(err, TrellisError::Aborted(_)));

        let two_defaults = vec![default_strategy(APP, 1, 10), default_strategy(APP, 2, 20)];
        let err = evaluate(StrategyMode::Normal, &two_defaults, &instance(&[], "")).unwrap_err();
        assert!(matches!(err, TrellisError::Aborted(_)));
    }

    #[test]
    fn test_namespace_strategy_ignores_its_selector() {
        let mut strategy = namespace_strategy(APP, 2, 20, "blue");
        strategy.scope.selector = Some(Selector::all_of(vec![Element::equals("env", "never")]));
        let strategies = vec![strategy, default_strategy(APP, 1, 10)];

        let release = evaluate(StrategyMode::Namespace, &strategies, &instance(&[], "blue"));
        assert_eq!(release.unwrap(), 20);
    }

    #[test]
    fn test_namespace_falls_back_to_default() {
        let strategies = vec![default_strategy(APP, 1, 10)];
        let release = evaluate(StrategyMode::Namespace, &strategies, &instance(&[], "green"));
        assert_eq!(release.unwrap(), 10);
    }

    #[test]
    fn test_namespace_mismatch_is_aborted() {
        let strategies = vec![namespace_strategy(APP, 2, 20, "blue"), default_strategy(APP, 1, 10)];
        let err = evaluate(StrategyMode::Namespace, &strategies, &instance(&[], "green"));
        assert!(matches!(err, Err(TrellisError::Aborted(_))));
    }

    #[test]
    fn test_more_than_two_namespace_strategies_is_aborted() {
        let strategies = vec![
            namespace_strategy(APP, 2, 20, "blue"),
            namespace_strategy(APP, 3, 30, "blue"),
            default_strategy(APP, 1, 10),
        ];
        let err = evaluate(StrategyMode::Namespace, &strategies, &instance(&[], "blue"));
        assert!(matches!(err, Err(TrellisError::Aborted(_))));
    }
}
