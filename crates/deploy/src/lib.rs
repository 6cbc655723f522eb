//! Tern deploy: strategy executors over a cluster executor and a release-history store.
//!
//! Every strategy runs as one sequential pipeline. A strategy that creates a
//! release always leaves it persisted with a terminal status, whatever the
//! exit path.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use serde::Serialize;
use tern_core::{Color, ResourceId};
use tern_ops::{ClusterOps, PodInfo};
use tern_persist::HistoryStore;
use tracing::{error, info};

pub mod apply;
pub mod bluegreen;
pub mod condition;
pub mod config;
pub mod context;
pub mod delete;
pub mod error;
pub mod history;
mod pipeline;
pub mod prune;
pub mod rollback;
pub mod rolling;
pub mod steady;
pub mod traffic_split;

pub use apply::ApplyRequest;
pub use bluegreen::BlueGreenRequest;
pub use config::{EngineConfig, HistoryBackend};
pub use context::{DeployFlags, PipelineContext};
pub use delete::{DeleteRequest, DeleteTarget};
pub use error::{DeployError, DeployResult, Resolution, ServiceRole, ValidationError, WorkloadCount};
pub use rollback::RollbackRequest;
pub use rolling::RollingRequest;
pub use traffic_split::{Destination, TrafficSplitRequest};

/// Success payload. Fields not relevant to a strategy stay empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeployOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_number: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<PodInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pruned: Vec<ResourceId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<ResourceId>,
    /// Color serving production before the run; `None` on a first blue-green deploy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<Color>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_color: Option<Color>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back_to: Option<u32>,
    /// Set when the strategy deliberately did nothing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noop: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl DeployOutput {
    pub fn noop(reason: impl Into<String>) -> Self {
        Self { noop: Some(reason.into()), ..Self::default() }
    }
}

/// One variant per deployment strategy.
#[derive(Debug, Clone)]
pub enum Strategy {
    Apply(ApplyRequest),
    Delete(DeleteRequest),
    Rolling(RollingRequest),
    BlueGreen(BlueGreenRequest),
    Rollback(RollbackRequest),
    TrafficSplit(TrafficSplitRequest),
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Apply(_) => "apply",
            Strategy::Delete(_) => "delete",
            Strategy::Rolling(_) => "rolling",
            Strategy::BlueGreen(_) => "blue-green",
            Strategy::Rollback(_) => "rollback",
            Strategy::TrafficSplit(_) => "traffic-split",
        }
    }
}

pub struct Engine {
    pub ops: Arc<dyn ClusterOps>,
    pub store: Arc<dyn HistoryStore>,
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(ops: Arc<dyn ClusterOps>, store: Arc<dyn HistoryStore>, config: EngineConfig) -> Self {
        Self { ops, store, config }
    }

    pub async fn execute(&self, ctx: &PipelineContext, strategy: Strategy) -> DeployResult<DeployOutput> {
        let name = strategy.name();
        let t0 = Instant::now();
        counter!("deploy_attempts", 1u64);
        info!(run_id = %ctx.run_id, strategy = name, release = %ctx.release_name, ns = %ctx.namespace, "execution started");
        let res = match strategy {
            Strategy::Apply(req) => apply::run(self, ctx, req).await,
            Strategy::Delete(req) => delete::run(self, ctx, req).await,
            Strategy::Rolling(req) => rolling::run(self, ctx, req).await,
            Strategy::BlueGreen(req) => bluegreen::run(self, ctx, req).await,
            Strategy::Rollback(req) => rollback::run(self, ctx, req).await,
            Strategy::TrafficSplit(req) => traffic_split::run(self, ctx, req).await,
        };
        match &res {
            Ok(out) => {
                counter!("deploy_ok", 1u64);
                info!(run_id = %ctx.run_id, strategy = name, release = %ctx.release_name, number = ?out.release_number, noop = ?out.noop, took_ms = %t0.elapsed().as_millis(), "execution succeeded");
            }
            Err(e) => {
                counter!("deploy_failed", 1u64);
                error!(run_id = %ctx.run_id, strategy = name, release = %ctx.release_name, error = %e, took_ms = %t0.elapsed().as_millis(), "execution failed");
            }
        }
        res
    }

    pub(crate) fn poller(&self) -> steady::SteadyStatePoller {
        steady::SteadyStatePoller::new(self.ops.clone(), self.config.poll_interval)
    }
}
