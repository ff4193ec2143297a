//! Connection state of a cloud link.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Health of a link as seen by callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Unknown,
    NetworkError,
    NodeNotFound,
    Succeeded,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Unknown => write!(f, "unknown"),
            LinkState::NetworkError => write!(f, "network_error"),
            LinkState::NodeNotFound => write!(f, "node_not_found"),
            LinkState::Succeeded => write!(f, "succeeded"),
        }
    }
}

/// State plus the detail of its last change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub state: LinkState,
    pub detail: String,
    pub changed_at: DateTime<Utc>,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: LinkState::Unknown,
            detail: String::new(),
            changed_at: Utc::now(),
        }
    }
}

/// Lock-protected status written only by the owning link.
#[derive(Debug, Default)]
pub(crate) struct StatusCell(RwLock<LinkStatus>);

impl StatusCell {
    pub(crate) fn get(&self) -> LinkStatus {
        match self.0.read() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set(&self, state: LinkState, detail: impl Into<String>) {
        let detail = detail.into();
        let mut status = match self.0.write() {
            Ok(status) => status,
            Err(poisoned) => poisoned.into_inner(),
        };

        if status.state != state {
            match state {
                LinkState::Succeeded => info!(from = %status.state, detail = %detail, "Link state changed to succeeded"),
                other => warn!(from = %status.state, to = %other, detail = %detail, "Link state changed"),
            }
            status.changed_at = Utc::now();
        }
        status.state = state;
        status.detail = detail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&LinkState::NodeNotFound).unwrap(),
            "\"node_not_found\""
        );
        assert_eq!(LinkState::NetworkError.to_string(), "network_error");
    }

    #[test]
    fn test_changed_at_moves_only_on_transition() {
        let cell = StatusCell::default();
        cell.set(LinkState::Succeeded, "connected");
        let first = cell.get();

        cell.set(LinkState::Succeeded, "message received");
        let second = cell.get();
        assert_eq!(first.changed_at, second.changed_at);
        assert_eq!(second.detail, "message received");

        cell.set(LinkState::NetworkError, "dial failed");
        assert_eq!(cell.get().state, LinkState::NetworkError);
    }
}
