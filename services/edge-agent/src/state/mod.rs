//! Local state persistence for the edge agent.
//!
//! This module provides SQLite-based bucketed key-value storage for:
//! - The node shadow (report and desire)
//! - Device shadows
//!
//! The store survives agent restarts, so the last known report and desire
//! are available before the first cloud round-trip.

mod store;

pub use store::{StateStore, StateStoreError, Txn};
