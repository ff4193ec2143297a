//! Orchestration backend interface and mock implementation.
//!
//! The agent does not run workloads itself. It hands each desired delta to
//! an [`Engine`], which owns application lifecycle on the node:
//! - applying an application (with its config and secret references)
//! - deleting an application
//! - reporting application status
//! - fetching application logs
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use edge_shadow::{Delta, Report};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Shadow key holding the application list.
pub const KEY_APPS: &str = "apps";
/// Shadow key holding per-application status.
pub const KEY_APP_STATS: &str = "appstats";

/// An application as named in the shadow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub version: String,

    /// Names of configurations mounted by the application.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<String>,

    /// Names of secrets mounted by the application.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
}

/// Lifecycle status of an application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Pending,
    Running,
    Failed,
    #[default]
    Unknown,
}

/// Runtime status of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStats {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default)]
    pub status: AppStatus,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cause: String,
}

impl AppStats {
    pub fn info(&self) -> AppInfo {
        AppInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            ..AppInfo::default()
        }
    }
}

/// Orchestration backend.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create or update an application.
    async fn apply_app(&self, namespace: &str, app: &AppInfo) -> Result<()>;

    /// Remove an application.
    async fn delete_app(&self, namespace: &str, name: &str) -> Result<()>;

    /// Status of every application in the namespace.
    async fn stats_apps(&self, namespace: &str) -> Result<Vec<AppStats>>;

    /// The last `tail` log lines of an application.
    async fn fetch_log(&self, namespace: &str, app: &str, tail: usize) -> Result<Vec<String>>;
}

/// Read a list of apps stored under `key`. Missing or `null` yields `None`.
pub fn app_list(doc: &serde_json::Map<String, Value>, key: &str) -> Result<Option<Vec<AppInfo>>> {
    match doc.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
    }
}

/// Order `reported` like `desired`, with unknown apps after in name order.
///
/// Keeps list comparison in diffs from flagging a pure reordering.
pub fn align_apps(reported: Vec<AppInfo>, desired: &[AppInfo]) -> Vec<AppInfo> {
    if reported.is_empty() || desired.is_empty() {
        return reported;
    }
    let mut by_name: HashMap<String, AppInfo> =
        reported.into_iter().map(|app| (app.name.clone(), app)).collect();

    let mut aligned: Vec<AppInfo> = desired
        .iter()
        .filter_map(|want| by_name.remove(&want.name))
        .collect();
    let mut rest: Vec<AppInfo> = by_name.into_values().collect();
    rest.sort_by(|a, b| a.name.cmp(&b.name));
    aligned.extend(rest);
    aligned
}

/// Work needed to move from `reported` to `desired`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Apps that are new or whose version changed.
    pub update: Vec<AppInfo>,

    /// Names of reported apps no longer desired.
    pub delete: Vec<String>,
}

impl Plan {
    pub fn new(desired: &[AppInfo], reported: &[AppInfo]) -> Self {
        let update = desired
            .iter()
            .filter(|want| {
                !reported
                    .iter()
                    .any(|have| have.name == want.name && have.version == want.version)
            })
            .cloned()
            .collect();
        let delete = reported
            .iter()
            .filter(|have| !desired.iter().any(|want| want.name == have.name))
            .map(|have| have.name.clone())
            .collect();
        Self { update, delete }
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_empty() && self.delete.is_empty()
    }
}

/// What an [`apply_delta`] call did.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub applied: Vec<String>,
    pub deleted: Vec<String>,

    /// Apps that failed, with the cause recorded.
    pub failed: Vec<AppStats>,
}

/// Drive the engine toward the application list in `delta`.
///
/// A delta without an `apps` entry, or with `apps: null`, leaves workloads
/// untouched. Updates run concurrently; individual failures are collected
/// rather than aborting the rest.
pub async fn apply_delta(
    engine: &dyn Engine,
    namespace: &str,
    delta: &Delta,
    report: &Report,
) -> Result<ApplyOutcome> {
    let Some(desired) = app_list(delta.as_map(), KEY_APPS)? else {
        debug!(namespace, "Delta carries no application changes");
        return Ok(ApplyOutcome::default());
    };
    let reported = app_list(report.as_map(), KEY_APPS)?.unwrap_or_default();
    let plan = Plan::new(&desired, &reported);
    if plan.is_empty() {
        return Ok(ApplyOutcome::default());
    }

    info!(
        namespace,
        update = plan.update.len(),
        delete = plan.delete.len(),
        "Applying application changes"
    );

    let mut outcome = ApplyOutcome::default();
    for name in &plan.delete {
        match engine.delete_app(namespace, name).await {
            Ok(()) => outcome.deleted.push(name.clone()),
            Err(e) => {
                error!(namespace, app = %name, error = %e, "Failed to delete application");
                outcome.failed.push(AppStats {
                    name: name.clone(),
                    status: AppStatus::Failed,
                    cause: e.to_string(),
                    ..AppStats::default()
                });
            }
        }
    }

    let results = join_all(plan.update.iter().map(|app| async move {
        (app, engine.apply_app(namespace, app).await)
    }))
    .await;
    for (app, result) in results {
        match result {
            Ok(()) => outcome.applied.push(app.name.clone()),
            Err(e) => {
                error!(namespace, app = %app.name, version = %app.version, error = %e, "Failed to apply application");
                outcome.failed.push(AppStats {
                    name: app.name.clone(),
                    version: app.version.clone(),
                    status: AppStatus::Failed,
                    cause: e.to_string(),
                });
            }
        }
    }

    Ok(outcome)
}

// =============================================================================
// Mock
// =============================================================================

/// A call recorded by [`MockEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Apply { namespace: String, app: AppInfo },
    Delete { namespace: String, name: String },
}

#[derive(Default)]
struct MockState {
    apps: HashMap<(String, String), AppInfo>,
    calls: Vec<EngineCall>,
}

/// In-memory engine for testing and development.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
    fail_apps: Vec<String>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that fails every apply of the named apps.
    pub fn failing(apps: &[&str]) -> Self {
        Self {
            fail_apps: apps.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn apply_app(&self, namespace: &str, app: &AppInfo) -> Result<()> {
        info!(namespace, app = %app.name, version = %app.version, "[MOCK] Applying application");

        let mut state = self.lock();
        state.calls.push(EngineCall::Apply {
            namespace: namespace.to_string(),
            app: app.clone(),
        });
        if self.fail_apps.contains(&app.name) {
            anyhow::bail!("mock engine configured to fail {}", app.name);
        }
        state
            .apps
            .insert((namespace.to_string(), app.name.clone()), app.clone());
        Ok(())
    }

    async fn delete_app(&self, namespace: &str, name: &str) -> Result<()> {
        info!(namespace, app = %name, "[MOCK] Deleting application");

        let mut state = self.lock();
        state.calls.push(EngineCall::Delete {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        if state
            .apps
            .remove(&(namespace.to_string(), name.to_string()))
            .is_none()
        {
            warn!(namespace, app = %name, "[MOCK] Application was not running");
        }
        Ok(())
    }

    async fn stats_apps(&self, namespace: &str) -> Result<Vec<AppStats>> {
        let state = self.lock();
        let mut stats: Vec<AppStats> = state
            .apps
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, app)| AppStats {
                name: app.name.clone(),
                version: app.version.clone(),
                status: AppStatus::Running,
                cause: String::new(),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }

    async fn fetch_log(&self, namespace: &str, app: &str, tail: usize) -> Result<Vec<String>> {
        debug!(namespace, app, tail, "[MOCK] Fetching logs");

        let state = self.lock();
        let Some(info) = state.apps.get(&(namespace.to_string(), app.to_string())) else {
            anyhow::bail!("application {app} not found in {namespace}");
        };
        let lines = (1..=3)
            .map(|i| format!("{} {} line {i}", info.name, info.version))
            .collect::<Vec<_>>();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn app(name: &str, version: &str) -> AppInfo {
        AppInfo {
            name: name.into(),
            version: version.into(),
            ..AppInfo::default()
        }
    }

    #[test]
    fn test_plan_updates_and_deletes() {
        let desired = vec![app("a", "2"), app("b", "1")];
        let reported = vec![app("a", "1"), app("b", "1"), app("c", "1")];

        let plan = Plan::new(&desired, &reported);
        assert_eq!(plan.update, vec![app("a", "2")]);
        assert_eq!(plan.delete, vec!["c".to_string()]);
    }

    #[test]
    fn test_align_apps_follows_desire_order() {
        let reported = vec![app("z", "1"), app("b", "1"), app("a", "1")];
        let desired = vec![app("a", "1"), app("b", "1")];

        let names: Vec<_> = align_apps(reported, &desired)
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "z"]);
    }

    #[tokio::test]
    async fn test_apply_delta_without_apps_is_noop() {
        let engine = MockEngine::new();
        let delta = Delta::from_value(json!({"apps": null, "other": 1})).unwrap();

        let outcome = apply_delta(&engine, "default", &delta, &Report::new())
            .await
            .unwrap();
        assert!(outcome.applied.is_empty());
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_apply_delta_applies_and_deletes() {
        let engine = MockEngine::new();
        engine.apply_app("default", &app("old", "1")).await.unwrap();

        let delta = Delta::from_value(json!({
            "apps": [{"name": "web", "version": "3", "configs": ["web-conf"]}]
        }))
        .unwrap();
        let report = Report::from_value(json!({
            "apps": [{"name": "old", "version": "1"}]
        }))
        .unwrap();

        let outcome = apply_delta(&engine, "default", &delta, &report).await.unwrap();
        assert_eq!(outcome.applied, vec!["web"]);
        assert_eq!(outcome.deleted, vec!["old"]);

        let stats = engine.stats_apps("default").await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "web");
        assert_eq!(stats[0].status, AppStatus::Running);
    }

    #[tokio::test]
    async fn test_apply_failure_is_collected() {
        let engine = MockEngine::failing(&["bad"]);
        let delta = Delta::from_value(json!({
            "apps": [{"name": "bad", "version": "1"}, {"name": "good", "version": "1"}]
        }))
        .unwrap();

        let outcome = apply_delta(&engine, "default", &delta, &Report::new())
            .await
            .unwrap();
        assert_eq!(outcome.applied, vec!["good"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].status, AppStatus::Failed);
        assert!(outcome.failed[0].cause.contains("bad"));
    }

    #[tokio::test]
    async fn test_fetch_log_tail() {
        let engine = MockEngine::new();
        engine.apply_app("default", &app("web", "1")).await.unwrap();

        let lines = engine.fetch_log("default", "web", 2).await.unwrap();
        assert_eq!(lines, vec!["web 1 line 2", "web 1 line 3"]);
        assert!(engine.fetch_log("default", "missing", 2).await.is_err());
    }
}
