//! Async download tasks and client metric reports.

use std::sync::Arc;
use trellis_core::{AsyncDownloadTask, BizId, ClientMetric, TrellisResult};
use trellis_storage::CacheService;

use super::resource::ResourceCache;

/// Async download tasks through both tiers.
pub struct AsyncTaskCache {
    tasks: ResourceCache<AsyncDownloadTask>,
}

impl AsyncTaskCache {
    pub fn new(tasks: ResourceCache<AsyncDownloadTask>) -> Self {
        Self { tasks }
    }

    pub async fn get(&self, biz_id: BizId, task_id: &str) -> TrellisResult<AsyncDownloadTask> {
        self.tasks.get(&(biz_id, task_id.to_string())).await
    }

    /// Write through to the remote tier, then refresh the local entry.
    pub async fn set(&self, task: &AsyncDownloadTask) -> TrellisResult<()> {
        self.tasks.remote().set_async_download_task(task).await?;
        self.tasks
            .insert((task.biz_id, task.task_id.clone()), task.clone())
    }

    pub fn hit_ratio(&self) -> f64 {
        self.tasks.hit_ratio()
    }
}

/// Pass-through sink for client metric reports.
pub struct ClientMetricSink {
    remote: Arc<dyn CacheService>,
}

impl ClientMetricSink {
    pub fn new(remote: Arc<dyn CacheService>) -> Self {
        Self { remote }
    }

    pub async fn report(&self, metric: &ClientMetric) -> TrellisResult<()> {
        self.remote.set_client_metric(metric).await
    }
}
