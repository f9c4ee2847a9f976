pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod notifications;
pub mod queue;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::engine::{DeploymentOrchestrator, PipelineEngine};
use crate::queue::JobQueue;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub queue: JobQueue,
    pub deployments: Arc<DeploymentOrchestrator>,
    pub pipelines: Arc<PipelineEngine>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: DbPool,
        queue: JobQueue,
        deployments: Arc<DeploymentOrchestrator>,
        pipelines: Arc<PipelineEngine>,
    ) -> Self {
        Self {
            config,
            db,
            queue,
            deployments,
            pipelines,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
