//! # edge-shadow
//!
//! Shadow documents shared by the edge agent and anything that speaks to it.
//!
//! A shadow is a pair of JSON object trees:
//!
//! - **Report**: what the device says it is running.
//! - **Desire**: what the cloud wants it to run.
//!
//! Both are only ever changed by merging a patch (see [`merge`]), and the
//! [`Delta`] between them is recomputed after every change.
//!
//! # Invariants
//!
//! - Merging the same patch twice gives the same result as merging it once
//! - A failed merge leaves the stored document unchanged
//! - Diffs compare structurally, never by serialized text

#[macro_use]
mod macros;

mod document;
mod error;
mod fingerprint;
pub mod merge;

pub use document::{Delta, Desire, MergeMode, Report, PROPS_KEY};
pub use error::ShadowError;
pub use fingerprint::Fingerprint;
pub use merge::MAX_DEPTH;
