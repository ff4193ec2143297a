//! Inbound routing shared by the push-capable links.
//!
//! Every payload read off the wire is parsed, has its host placeholders
//! resolved, and then goes to exactly one place: the send-keeper for
//! synchronous replies, the error queue for cloud errors, the message queue
//! for everything else.

use edge_message::{CloudError, Message, MessageKind};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::status::StatusCell;
use super::{Inbound, LinkError, LinkState};
use crate::config::NodeConfig;
use crate::keeper::SendKeeper;

pub(crate) struct Router {
    pub(crate) node: NodeConfig,
    pub(crate) keeper: SendKeeper,
    pub(crate) status: StatusCell,
    msg_tx: mpsc::Sender<Message>,
    err_tx: mpsc::Sender<CloudError>,
}

impl Router {
    /// A router whose queues hold `capacity` entries each, plus the receiving
    /// ends handed out by `Link::receive`.
    pub(crate) fn new(node: &NodeConfig, capacity: usize) -> (Self, Inbound) {
        let (msg_tx, messages) = mpsc::channel(capacity);
        let (err_tx, errors) = mpsc::channel(capacity);
        let router = Self {
            node: node.clone(),
            keeper: SendKeeper::new(),
            status: StatusCell::default(),
            msg_tx,
            err_tx,
        };
        (router, Inbound { messages, errors })
    }

    /// Parse a wire payload and resolve `{{.NAME}}` placeholders from the
    /// process environment.
    pub(crate) fn decode(&self, payload: &[u8]) -> Option<Message> {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Inbound payload is not UTF-8");
                return None;
            }
        };
        let mut msg = match Message::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Failed to parse inbound message");
                return None;
            }
        };
        let expanded = msg.content.expand_env(|name| std::env::var(name).ok());
        if expanded > 0 {
            debug!(kind = %msg.kind, expanded, "Resolved environment placeholders");
        }
        Some(msg)
    }

    pub(crate) fn dispatch(&self, msg: Message) {
        if msg.is_sync() && msg.request_id().is_some() {
            if let Err(e) = self.keeper.receive_resp(msg) {
                debug!(error = %e, "Dropped unmatched response");
            }
            return;
        }

        if msg.kind == MessageKind::Error {
            let err = match CloudError::from_message(&msg) {
                Ok(err) => err,
                Err(e) => {
                    warn!(error = %e, "Undecodable error message from cloud");
                    return;
                }
            };
            if err.is_node_not_found(&self.node.name) {
                self.status.set(LinkState::NodeNotFound, err.text.clone());
            } else {
                self.status.set(LinkState::Succeeded, "cloud reported an error");
            }
            if self.err_tx.try_send(err).is_err() {
                error!("Inbound error queue full, dropping cloud error");
            }
            return;
        }

        let kind = msg.kind.clone();
        match self.msg_tx.try_send(msg) {
            Ok(()) => self.status.set(LinkState::Succeeded, "message received"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!(kind = %kind, "Inbound message queue full, dropping message")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(kind = %kind, "Inbound message receiver gone, dropping message")
            }
        }
    }

    /// Turn an `error` reply into `LinkError::Cloud`, noting a missing node.
    pub(crate) fn unwrap_reply(&self, response: Message) -> Result<Message, LinkError> {
        if response.kind != MessageKind::Error {
            return Ok(response);
        }
        let err = CloudError::from_message(&response)?;
        if err.is_node_not_found(&self.node.name) {
            self.status.set(LinkState::NodeNotFound, err.text.clone());
        }
        Err(LinkError::Cloud(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_message::{KEY_ERROR_CODE, KEY_NAME, KEY_SYNC};
    use serde_json::json;

    fn router(capacity: usize) -> (Router, Inbound) {
        let node = NodeConfig {
            name: "edge-1".into(),
            namespace: "default".into(),
        };
        Router::new(&node, capacity)
    }

    #[test]
    fn test_plain_message_is_queued() {
        let (router, mut inbound) = router(4);
        router.dispatch(Message::new(MessageKind::Desire, json!({"a": 1})));

        let msg = inbound.messages.try_recv().unwrap();
        assert_eq!(msg.kind, MessageKind::Desire);
        assert_eq!(router.status.get().state, LinkState::Succeeded);
    }

    #[test]
    fn test_full_queue_drops() {
        let (router, mut inbound) = router(1);
        router.dispatch(Message::new(MessageKind::Desire, json!({"n": 1})));
        router.dispatch(Message::new(MessageKind::Desire, json!({"n": 2})));

        assert_eq!(inbound.messages.try_recv().unwrap().content.value(), &json!({"n": 1}));
        assert!(inbound.messages.try_recv().is_err());
    }

    #[test]
    fn test_sync_reply_is_not_queued() {
        let (router, mut inbound) = router(4);
        router.dispatch(
            Message::new(MessageKind::Desire, json!({}))
                .meta(KEY_SYNC, "true")
                .meta("x-baetyl-request-id", "nobody-waits"),
        );
        assert!(inbound.messages.try_recv().is_err());
        assert_eq!(router.keeper.pending_count(), 0);
    }

    #[test]
    fn test_node_not_found_error_for_this_node() {
        let (router, mut inbound) = router(4);
        router.dispatch(
            Message::error("The (node) resource (edge-1) is not found.").meta(KEY_NAME, "edge-1"),
        );

        assert!(inbound.errors.try_recv().unwrap().is_node_not_found("edge-1"));
        assert_eq!(router.status.get().state, LinkState::NodeNotFound);

        router.dispatch(Message::error("quota exceeded").meta(KEY_ERROR_CODE, "Throttled"));
        assert_eq!(router.status.get().state, LinkState::Succeeded);
    }

    #[test]
    fn test_unwrap_reply() {
        let (router, _inbound) = router(4);
        let ok = Message::new(MessageKind::Desire, json!({"k": "v"}));
        assert_eq!(router.unwrap_reply(ok.clone()).unwrap(), ok);

        let gone = Message::error("gone").meta(KEY_ERROR_CODE, "NodeNotFound");
        assert!(matches!(router.unwrap_reply(gone), Err(LinkError::Cloud(_))));
        assert_eq!(router.status.get().state, LinkState::NodeNotFound);
    }

    #[test]
    fn test_decode_resolves_placeholders() {
        let (router, _inbound) = router(4);
        let home = std::env::var("HOME").unwrap_or_default();
        let payload = json!({
            "kind": "desire",
            "meta": {},
            "content": {"dir": "{{.HOME}}/apps", "keep": "{{.EDGE_TEST_SURELY_UNSET_VAR}}"}
        })
        .to_string();

        let msg = router.decode(payload.as_bytes()).unwrap();
        if !home.is_empty() {
            assert_eq!(msg.content.value()["dir"], json!(format!("{home}/apps")));
        }
        assert_eq!(msg.content.value()["keep"], json!("{{.EDGE_TEST_SURELY_UNSET_VAR}}"));
        assert!(router.decode(b"\xff\xfe").is_none());
        assert!(router.decode(b"{not json").is_none());
    }
}
