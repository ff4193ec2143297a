//! Shadows of sub-devices attached to this node.
//!
//! Same report/desire/delta model as the node shadow, keyed by device name.
//! Each device carries a [`DeviceModel`] and only the properties it declares
//! (plus a small system allow-list) are ever merged.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use edge_shadow::merge::filter_keys;
use edge_shadow::{Delta, Desire, MergeMode, Report, ShadowError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::state::{StateStore, StateStoreError};

/// Bucket holding device shadows.
pub const DEVICE_BUCKET: &str = "edge-device-shadow";

/// Properties every device may report regardless of its model.
pub const SYSTEM_ALLOWED_PROPERTIES: &[&str] = &["status"];

/// Errors from device shadow operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Store(#[from] StateStoreError),

    #[error("merge failed: {0}")]
    Merge(#[from] ShadowError),

    #[error("device not found: {0}")]
    NotFound(String),
}

/// Access mode of a device property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyMode {
    #[default]
    Ro,
    Rw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub mode: PropertyMode,
}

/// Schema of a device: the property names it may carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModel {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<DeviceProperty>,
}

impl DeviceModel {
    /// Whether `key` is declared by the model or system-allowed.
    pub fn allows(&self, key: &str) -> bool {
        SYSTEM_ALLOWED_PROPERTIES.contains(&key) || self.properties.iter().any(|p| p.name == key)
    }
}

/// A stored device shadow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    pub version: String,
    pub device_model: DeviceModel,
    #[serde(default)]
    pub report: Report,
    #[serde(default)]
    pub desire: Desire,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub creation_timestamp: DateTime<Utc>,
}

/// Device shadow manager.
#[derive(Clone)]
pub struct DeviceShadows {
    store: Arc<StateStore>,
}

impl DeviceShadows {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Register a device, returning the existing record if already known.
    pub fn create(
        &self,
        name: &str,
        version: &str,
        model: DeviceModel,
        metadata: HashMap<String, String>,
    ) -> Result<Device, DeviceError> {
        let device = Device {
            name: name.to_string(),
            version: version.to_string(),
            device_model: model,
            report: Report::new(),
            desire: Desire::new(),
            metadata,
            creation_timestamp: Utc::now(),
        };

        self.store.transaction(|tx| {
            match tx.insert_json(DEVICE_BUCKET, name, &device) {
                Ok(()) => {
                    info!(device = %name, model = %device.device_model.name, "Registered device");
                    Ok(device)
                }
                Err(StateStoreError::KeyExists { .. }) => tx
                    .get_json(DEVICE_BUCKET, name)?
                    .ok_or_else(|| DeviceError::NotFound(name.to_string())),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get(&self, name: &str) -> Result<Device, DeviceError> {
        self.store
            .get_json(DEVICE_BUCKET, name)?
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Device>, DeviceError> {
        self.store.transaction(|tx| {
            let mut devices = Vec::new();
            for key in tx.keys(DEVICE_BUCKET)? {
                if let Some(device) = tx.get_json(DEVICE_BUCKET, &key)? {
                    devices.push(device);
                }
            }
            Ok(devices)
        })
    }

    /// Remove a device. Returns whether it existed.
    pub fn delete(&self, name: &str) -> Result<bool, DeviceError> {
        let existed = self.store.delete(DEVICE_BUCKET, name)?;
        if existed {
            info!(device = %name, "Removed device");
        }
        Ok(existed)
    }

    /// Merge the allowed keys of `patch` into the device's report.
    pub fn report(&self, name: &str, patch: &Report) -> Result<Delta, DeviceError> {
        self.update(name, |device| {
            let patch = Report::from(allowed(&device.device_model, name, patch));
            device.report.merge(&patch, MergeMode::Deep)
        })
    }

    /// Merge the allowed keys of `patch` into the device's desire.
    pub fn desire(&self, name: &str, patch: &Desire) -> Result<Delta, DeviceError> {
        self.update(name, |device| {
            let patch = Desire::from(allowed(&device.device_model, name, patch));
            device.desire.merge(&patch, MergeMode::Deep)
        })
    }

    fn update<F>(&self, name: &str, f: F) -> Result<Delta, DeviceError>
    where
        F: FnOnce(&mut Device) -> Result<(), ShadowError>,
    {
        self.store.transaction(|tx| {
            let mut device: Device = tx
                .get_json(DEVICE_BUCKET, name)?
                .ok_or_else(|| DeviceError::NotFound(name.to_string()))?;

            f(&mut device)?;
            tx.upsert_json(DEVICE_BUCKET, name, &device)?;

            Ok(device.desire.diff(&device.report))
        })
    }
}

fn allowed(
    model: &DeviceModel,
    device: &str,
    patch: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let (kept, dropped) = filter_keys(patch.clone(), |key| model.allows(key));
    if !dropped.is_empty() {
        warn!(device = %device, model = %model.name, dropped = ?dropped, "Dropped undeclared device properties");
    }
    kept
}
