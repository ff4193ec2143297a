//! Process-wide components, built once in `main` and passed by reference.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::collector::{Collector, NodeCollector};
use crate::config::{Config, ENV_SYNC_ADDR};
use crate::device::DeviceShadows;
use crate::engine::Engine;
use crate::link::{CloudLink, Link, LinkError};
use crate::node::NodeShadow;
use crate::state::StateStore;

/// Owns the agent's long-lived components.
pub struct Registry {
    config: Config,
    store: Arc<StateStore>,
    node: Arc<NodeShadow>,
    devices: DeviceShadows,
    engine: Arc<dyn Engine>,
    link: OnceCell<Arc<CloudLink>>,
}

impl Registry {
    /// Open local state and the node shadow. The cloud link is built lazily
    /// by [`Registry::link`].
    pub fn new(config: Config, store: Arc<StateStore>, engine: Arc<dyn Engine>) -> Result<Self> {
        let node = NodeShadow::open(Arc::clone(&store), &config.node.namespace, &config.node.name)
            .context("failed to open node shadow")?;
        let devices = DeviceShadows::new(Arc::clone(&store));

        Ok(Self {
            config,
            store,
            node: Arc::new(node),
            devices,
            engine,
            link: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn node(&self) -> &Arc<NodeShadow> {
        &self.node
    }

    pub fn devices(&self) -> &DeviceShadows {
        &self.devices
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Collector reporting this node's facts.
    pub fn collector(&self) -> Arc<dyn Collector> {
        Arc::new(NodeCollector::new(
            Arc::clone(&self.engine),
            self.config.node.namespace.clone(),
        ))
    }

    /// The cloud link, connected on first use. Concurrent callers share one
    /// construction; a failed construction is retried by the next caller.
    pub async fn link(&self) -> Result<Arc<CloudLink>, LinkError> {
        self.link
            .get_or_try_init(|| async {
                let fallback = std::env::var(ENV_SYNC_ADDR).ok();
                let link = CloudLink::connect(
                    &self.config.link,
                    &self.config.node,
                    fallback.as_deref(),
                )
                .await?;
                info!(kind = ?self.config.link.kind, state = %link.state().state, "Cloud link ready");
                Ok::<_, LinkError>(Arc::new(link))
            })
            .await
            .cloned()
    }

    /// Close the link if it was ever built.
    pub async fn close(&self) {
        if let Some(link) = self.link.get() {
            if let Err(e) = link.close().await {
                warn!(error = %e, "Error closing cloud link");
            }
        }
    }
}
