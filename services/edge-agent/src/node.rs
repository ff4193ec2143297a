//! Durable node shadow.
//!
//! One record per node identity, holding the reported and desired documents.
//! Every mutation is a read-merge-write inside a single store transaction and
//! returns the fresh delta of desire against report.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use edge_shadow::{Delta, Desire, MergeMode, Report, ShadowError, PROPS_KEY};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::state::{StateStore, StateStoreError};

/// Bucket holding node shadows.
pub const NODE_BUCKET: &str = "edge-node-shadow";

/// Errors from node shadow operations.
#[derive(Debug, Error)]
pub enum ShadowStoreError {
    #[error(transparent)]
    Store(#[from] StateStoreError),

    #[error("merge failed: {0}")]
    Merge(#[from] ShadowError),

    #[error("shadow not found: {0}")]
    NotFound(String),
}

/// The stored shadow of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shadow {
    pub name: String,
    pub namespace: String,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub report: Report,
    #[serde(default)]
    pub desire: Desire,
}

impl Shadow {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            creation_timestamp: Utc::now(),
            report: Report::new(),
            desire: Desire::new(),
        }
    }

    /// Delta of desire against report.
    pub fn delta(&self) -> Delta {
        self.desire.diff(&self.report)
    }
}

/// The node-properties view of a shadow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeProps {
    pub report: Map<String, Value>,
    pub desire: Map<String, Value>,
}

/// Handle to one node's shadow in the store.
pub struct NodeShadow {
    store: Arc<StateStore>,
    name: String,
    namespace: String,
    key: String,
}

impl NodeShadow {
    /// Open the shadow for `namespace/name`, creating it on first use.
    ///
    /// Opening an existing identity leaves the stored record untouched.
    pub fn open(store: Arc<StateStore>, namespace: &str, name: &str) -> Result<Self, ShadowStoreError> {
        let key = format!("{name}.{namespace}");

        let created = store.transaction(|tx| match tx.insert_json(NODE_BUCKET, &key, &Shadow::new(namespace, name)) {
            Ok(()) => Ok(true),
            Err(StateStoreError::KeyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        })?;

        if created {
            info!(node = %name, namespace = %namespace, "Created node shadow");
        } else {
            debug!(node = %name, namespace = %namespace, "Opened existing node shadow");
        }

        Ok(Self {
            store,
            name: name.to_string(),
            namespace: namespace.to_string(),
            key,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current stored record.
    pub fn get(&self) -> Result<Shadow, ShadowStoreError> {
        self.store
            .get_json(NODE_BUCKET, &self.key)?
            .ok_or_else(|| ShadowStoreError::NotFound(self.key.clone()))
    }

    /// Merge `patch` into the desired document and return the new delta.
    pub fn desire(&self, patch: &Desire, override_props: bool) -> Result<Delta, ShadowStoreError> {
        let mode = MergeMode::from_flag(override_props);
        self.update(|shadow| shadow.desire.merge(patch, mode))
    }

    /// Merge `patch` into the reported document and return the new delta.
    pub fn report(&self, patch: &Report, override_props: bool) -> Result<Delta, ShadowStoreError> {
        let mode = MergeMode::from_flag(override_props);
        self.update(|shadow| shadow.report.merge(patch, mode))
    }

    /// Reported and desired node properties.
    pub fn node_props(&self) -> Result<NodeProps, ShadowStoreError> {
        let shadow = self.get()?;
        Ok(NodeProps {
            report: props_of(&shadow.report),
            desire: props_of(&shadow.desire),
        })
    }

    /// Replace the reported node properties after applying `delta` to them.
    pub fn update_node_props(&self, delta: &Map<String, Value>) -> Result<Delta, ShadowStoreError> {
        self.update(|shadow| {
            let current = props_of(&shadow.report);
            let next = edge_shadow::merge::merge(&current, delta)?;

            let mut patch = Report::new();
            patch.insert(PROPS_KEY, Value::Object(next));
            shadow.report.merge(&patch, MergeMode::OverrideProps)
        })
    }

    fn update<F>(&self, f: F) -> Result<Delta, ShadowStoreError>
    where
        F: FnOnce(&mut Shadow) -> Result<(), ShadowError>,
    {
        self.store.transaction(|tx| {
            let mut shadow: Shadow = tx
                .get_json(NODE_BUCKET, &self.key)?
                .ok_or_else(|| ShadowStoreError::NotFound(self.key.clone()))?;

            f(&mut shadow)?;
            tx.upsert_json(NODE_BUCKET, &self.key, &shadow)?;

            Ok(shadow.delta())
        })
    }
}

fn props_of(doc: &Map<String, Value>) -> Map<String, Value> {
    doc.get(PROPS_KEY)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}
