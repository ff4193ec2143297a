//! Edge Agent Library
//!
//! The edge agent runs on each edge node and keeps its shadow (reported vs.
//! desired state) in sync with the cloud over an intermittent link. Desired
//! applications are handed to an orchestration engine.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//! ├── Syncer
//! │   ├── reporting loop   (collector → node shadow → link)
//! │   ├── desiring loop    (desire queue → node shadow → engine)
//! │   └── receiving loop   (link inbound → desire/device queues)
//! └── CloudLink
//!     ├── WsLink           (receive + reconnect loops, idle pings, SendKeeper)
//!     ├── MqttLink         (broker event loop, per-kind topics, SendKeeper)
//!     └── HttpLink         (request/response, endpoint failover)
//! ```
//!
//! ## Modules
//!
//! - `node`, `device`: Shadow records over the local state store
//! - `keeper`: Request/response correlation over an async link
//! - `link`: Cloud link transports
//! - `sync`: Reporting and desire loops
//! - `state`: Local SQLite state persistence

pub mod collector;
pub mod config;
pub mod device;
pub mod engine;
pub mod keeper;
pub mod link;
pub mod node;
pub mod registry;
pub mod state;
pub mod supervisor;
pub mod sync;

// Re-export commonly used types
pub use config::Config;
pub use engine::MockEngine;
pub use link::{CloudLink, Link, LinkError, LinkState};
pub use node::NodeShadow;
pub use registry::Registry;
pub use supervisor::{Shutdown, Supervisor};
pub use sync::Syncer;
