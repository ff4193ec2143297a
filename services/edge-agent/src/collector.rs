//! Local fact collection for the node report.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use edge_shadow::{Desire, Report};
use serde_json::json;
use tracing::warn;

use crate::engine::{align_apps, app_list, AppInfo, Engine, KEY_APPS, KEY_APP_STATS};

/// Shadow key holding static node facts.
pub const KEY_NODE: &str = "node";

/// Produces the report patch published each cycle.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Gather current facts. `desire` is the last known desired state, used
    /// to order list-valued facts.
    async fn collect(&self, desire: &Desire) -> Result<Report>;
}

/// Collects host facts and application status from the engine.
pub struct NodeCollector {
    engine: Arc<dyn Engine>,
    namespace: String,
}

impl NodeCollector {
    pub fn new(engine: Arc<dyn Engine>, namespace: impl Into<String>) -> Self {
        Self {
            engine,
            namespace: namespace.into(),
        }
    }

    fn host_facts() -> serde_json::Value {
        let hostname = match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                warn!(error = %e, "Failed to read hostname");
                String::new()
            }
        };
        json!({
            "hostname": hostname,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "agentVersion": env!("CARGO_PKG_VERSION"),
        })
    }
}

#[async_trait]
impl Collector for NodeCollector {
    async fn collect(&self, desire: &Desire) -> Result<Report> {
        let mut report = Report::new();
        report.insert(KEY_NODE, Self::host_facts());

        let stats = match self.engine.stats_apps(&self.namespace).await {
            Ok(stats) => stats,
            Err(e) => {
                // An empty list here would read as "all apps gone".
                warn!(namespace = %self.namespace, error = %e, "Failed to collect app stats");
                return Ok(report);
            }
        };

        let desired = app_list(desire.as_map(), KEY_APPS)?.unwrap_or_default();
        let apps: Vec<AppInfo> = align_apps(stats.iter().map(|s| s.info()).collect(), &desired);
        report.insert(KEY_APPS, serde_json::to_value(apps)?);
        report.insert(KEY_APP_STATS, serde_json::to_value(stats)?);
        Ok(report)
    }
}

/// Collector returning a fixed report. Useful for tests and for nodes that
/// only relay device shadows.
#[derive(Default)]
pub struct StaticCollector {
    report: Mutex<Report>,
}

impl StaticCollector {
    pub fn new(report: Report) -> Self {
        Self {
            report: Mutex::new(report),
        }
    }

    /// Replace the report returned by later collections.
    pub fn set(&self, report: Report) {
        match self.report.lock() {
            Ok(mut current) => *current = report,
            Err(poisoned) => *poisoned.into_inner() = report,
        }
    }
}

#[async_trait]
impl Collector for StaticCollector {
    async fn collect(&self, _desire: &Desire) -> Result<Report> {
        let report = match self.report.lock() {
            Ok(report) => report.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Ok(report)
    }
}
