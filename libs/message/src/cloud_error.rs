//! Errors reported by the cloud inside `error` messages.

use crate::envelope::{Message, MessageKind, KEY_ERROR_CODE, KEY_NAME};
use crate::error::MessageError;

/// Structured code the cloud uses for an unknown node.
pub const CODE_NODE_NOT_FOUND: &str = "NodeNotFound";

/// An error pushed by the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudError {
    /// Human readable text.
    pub text: String,
    /// Structured code from the `errorCode` metadata, when the cloud sends one.
    pub code: Option<String>,
    /// Node the cloud addressed the error to, from the `name` metadata.
    pub node: Option<String>,
}

impl CloudError {
    /// Decode an `error` message.
    pub fn from_message(msg: &Message) -> Result<Self, MessageError> {
        if msg.kind != MessageKind::Error {
            return Err(MessageError::InvalidContent {
                kind: msg.kind.to_string(),
                reason: "not an error message".to_string(),
            });
        }
        Ok(Self {
            text: msg.decode()?,
            code: msg.get_meta(KEY_ERROR_CODE).map(str::to_string),
            node: msg.get_meta(KEY_NAME).map(str::to_string),
        })
    }

    /// Whether the cloud says the node does not exist.
    ///
    /// The structured code wins. Without one, the text must end with
    /// `The (node) resource (<name>) is not found.`, where `<name>` is the
    /// node named in the error's metadata, or `local` when the cloud named none.
    pub fn is_node_not_found(&self, local: &str) -> bool {
        match &self.code {
            Some(code) => code == CODE_NODE_NOT_FOUND,
            None => {
                let name = self.node.as_deref().unwrap_or(local);
                !name.is_empty() && self.text.trim_end().ends_with(&not_found_text(name))
            }
        }
    }
}

impl std::fmt::Display for CloudError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({})", self.text, code),
            None => f.write_str(&self.text),
        }
    }
}

fn not_found_text(name: &str) -> String {
    format!("The (node) resource ({name}) is not found.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("failed to sync: The (node) resource (edge-01) is not found.", true)]
    #[case("The (node) resource (edge-01) is not found.  ", true)]
    #[case("The (node) resource (edge-02) is not found.", false)]
    #[case("The (node) resource () is not found.", false)]
    #[case("The (app) resource (edge-01) is not found.", false)]
    #[case("The (node) resource (edge-01) is not found. retry later", false)]
    #[case("internal error", false)]
    fn test_text_fallback(#[case] text: &str, #[case] expected: bool) {
        let err = CloudError::from_message(&Message::error(text)).unwrap();
        assert_eq!(err.is_node_not_found("edge-01"), expected);
    }

    #[test]
    fn test_text_fallback_prefers_named_node() {
        let msg = Message::error("The (node) resource (edge-02) is not found.").meta(KEY_NAME, "edge-02");
        let err = CloudError::from_message(&msg).unwrap();
        assert_eq!(err.node.as_deref(), Some("edge-02"));
        assert!(err.is_node_not_found("edge-01"));

        let msg = Message::error("The (node) resource (edge-01) is not found.").meta(KEY_NAME, "edge-02");
        assert!(!CloudError::from_message(&msg).unwrap().is_node_not_found("edge-01"));
    }

    #[test]
    fn test_structured_code_wins() {
        let msg = Message::error("gone").meta(KEY_ERROR_CODE, CODE_NODE_NOT_FOUND);
        assert!(CloudError::from_message(&msg).unwrap().is_node_not_found("n1"));

        let msg = Message::error("The (node) resource (n1) is not found.")
            .meta(KEY_ERROR_CODE, "Throttled");
        assert!(!CloudError::from_message(&msg).unwrap().is_node_not_found("n1"));
    }

    #[test]
    fn test_rejects_other_kinds() {
        let msg = Message::new(MessageKind::Report, serde_json::json!("x"));
        assert!(CloudError::from_message(&msg).is_err());
    }
}
