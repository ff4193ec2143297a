//! Report, Desire and Delta documents.

use crate::error::ShadowError;
use crate::merge;

/// Key of the node-properties sub-tree that override mode replaces wholesale.
pub const PROPS_KEY: &str = "nodeprops";

crate::define_document!(Report, "State reported by the device side.");
crate::define_document!(Desire, "State desired by the cloud side.");
crate::define_document!(
    Delta,
    "Keys where a desire differs from a report. `null` marks a key only the report has."
);

/// How a patch is folded into a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Deep merge every key.
    #[default]
    Deep,
    /// Replace the [`PROPS_KEY`] sub-tree, deep merge the rest.
    OverrideProps,
}

impl MergeMode {
    /// Picks [`MergeMode::OverrideProps`] when `override_props` is set.
    pub fn from_flag(override_props: bool) -> Self {
        if override_props {
            Self::OverrideProps
        } else {
            Self::Deep
        }
    }
}

fn apply(
    base: &serde_json::Map<String, serde_json::Value>,
    patch: &serde_json::Map<String, serde_json::Value>,
    mode: MergeMode,
) -> Result<serde_json::Map<String, serde_json::Value>, ShadowError> {
    match mode {
        MergeMode::Deep => merge::merge(base, patch),
        MergeMode::OverrideProps => merge::merge_override(base, patch, PROPS_KEY),
    }
}

impl Report {
    /// Merge `patch` into this report. On error the report is unchanged.
    pub fn merge(&mut self, patch: &Report, mode: MergeMode) -> Result<(), ShadowError> {
        self.0 = apply(&self.0, &patch.0, mode)?;
        Ok(())
    }
}

impl Desire {
    /// Merge `patch` into this desire. On error the desire is unchanged.
    pub fn merge(&mut self, patch: &Desire, mode: MergeMode) -> Result<(), ShadowError> {
        self.0 = apply(&self.0, &patch.0, mode)?;
        Ok(())
    }

    /// Compute the delta of this desire against `report`.
    pub fn diff(&self, report: &Report) -> Delta {
        Delta(merge::diff(&self.0, &report.0))
    }
}

impl Delta {
    /// Returns the sub-tree under `key` when it is an object.
    pub fn section(&self, key: &str) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.0.get(key).and_then(|v| v.as_object())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_shadow_has_empty_delta() {
        let report = Report::new();
        let desire = Desire::new();
        assert!(desire.diff(&report).is_empty());
    }

    #[test]
    fn test_document_rejects_non_objects() {
        assert_eq!(
            Report::from_value(json!([1])).unwrap_err(),
            ShadowError::NotAnObject("an array")
        );
        assert!(Desire::from_value(json!(null)).unwrap().is_empty());
    }

    #[test]
    fn test_document_serializes_transparently() {
        let report = Report::from_value(json!({"cpu": 4})).unwrap();
        assert_eq!(serde_json::to_string(&report).unwrap(), r#"{"cpu":4}"#);

        let parsed: Desire = serde_json::from_str(r#"{"apps":{}}"#).unwrap();
        assert!(parsed.contains_key("apps"));
    }

    #[test]
    fn test_override_mode_replaces_props() {
        let mut desire = Desire::from_value(json!({"nodeprops": {"a": 1}})).unwrap();
        let patch = Desire::from_value(json!({"nodeprops": {"b": 2}})).unwrap();

        desire.merge(&patch, MergeMode::OverrideProps).unwrap();
        assert_eq!(desire.to_value(), json!({"nodeprops": {"b": 2}}));

        desire
            .merge(
                &Desire::from_value(json!({"nodeprops": {"c": 3}})).unwrap(),
                MergeMode::Deep,
            )
            .unwrap();
        assert_eq!(desire.to_value(), json!({"nodeprops": {"b": 2, "c": 3}}));
    }

    #[test]
    fn test_failed_merge_keeps_document() {
        let mut report = Report::from_value(json!({"core": {"os": "linux"}})).unwrap();
        let patch = Report::from_value(json!({"core": 1})).unwrap();

        assert!(report.merge(&patch, MergeMode::Deep).is_err());
        assert_eq!(report.to_value(), json!({"core": {"os": "linux"}}));
    }

    #[test]
    fn test_delta_section() {
        let delta = Delta::from_value(json!({"apps": {"web": {}}, "x": 1})).unwrap();
        assert!(delta.section("apps").is_some());
        assert!(delta.section("x").is_none());
    }
}
