//! Task supervision and shutdown signalling.
//!
//! Every long-running loop in the agent is spawned through a [`Supervisor`]
//! and watches a [`Shutdown`] handle. Stopping is cooperative first: the
//! signal is raised, tasks get a grace period to return, and whatever is
//! still running afterwards is aborted.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tracing::{error, info, warn};

// =============================================================================
// Shutdown
// =============================================================================

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Resolve once shutdown is signalled or the sender is gone.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Owns the agent's background tasks.
pub struct Supervisor {
    stop: watch::Sender<bool>,
    tasks: JoinSet<()>,
    names: HashMap<Id, String>,
    grace: Duration,
}

impl Supervisor {
    /// Create a supervisor that gives tasks `grace` to stop on their own.
    pub fn new(grace: Duration) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            tasks: JoinSet::new(),
            names: HashMap::new(),
            grace,
        }
    }

    /// A fresh shutdown handle tied to this supervisor.
    pub fn shutdown(&self) -> Shutdown {
        Shutdown::new(self.stop.subscribe())
    }

    /// Spawn a named task.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = self.tasks.spawn(task);
        info!(task = %name, "Spawned task");
        self.names.insert(handle.id(), name);
    }

    /// Raise the shutdown signal without waiting.
    pub fn trigger(&self) {
        self.stop.send_replace(true);
    }

    /// Wait until any task finishes. Returns its name, or `None` when nothing
    /// is running.
    pub async fn wait_any(&mut self) -> Option<String> {
        let joined = self.tasks.join_next_with_id().await?;
        Some(self.reap(joined))
    }

    /// Signal shutdown, wait out the grace period, then abort stragglers.
    pub async fn stop_all(&mut self) {
        info!(count = self.tasks.len(), "Stopping all tasks");
        self.trigger();

        let deadline = tokio::time::Instant::now() + self.grace;
        while !self.tasks.is_empty() {
            match tokio::time::timeout_at(deadline, self.tasks.join_next_with_id()).await {
                Ok(Some(joined)) => {
                    self.reap(joined);
                }
                Ok(None) => break,
                Err(_) => {
                    for name in self.names.values() {
                        warn!(task = %name, "Force aborting task");
                    }
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }
        self.names.clear();
    }

    pub fn running_count(&self) -> usize {
        self.tasks.len()
    }

    fn reap(&mut self, joined: Result<(Id, ()), tokio::task::JoinError>) -> String {
        match joined {
            Ok((id, ())) => {
                let name = self.names.remove(&id).unwrap_or_default();
                info!(task = %name, "Task finished");
                name
            }
            Err(e) => {
                let name = self.names.remove(&e.id()).unwrap_or_default();
                if e.is_panic() {
                    error!(task = %name, "Task panicked");
                } else {
                    warn!(task = %name, "Task cancelled");
                }
                name
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}
