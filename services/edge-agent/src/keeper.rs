//! Synchronous requests over an asynchronous link.
//!
//! [`SendKeeper::send_sync`] stamps a fresh correlation ID onto the outgoing
//! message, parks a single-slot channel under that ID and waits for
//! [`SendKeeper::receive_resp`] to deliver the matching response.

use std::future::Future;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use edge_message::{Message, KEY_REQUEST_ID, KEY_SYNC};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Correlation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeeperError {
    #[error("message has no metadata")]
    MissingMetadata,

    #[error("message has no request id")]
    MissingRequestId,

    #[error("no pending request for id {0}")]
    UnknownRequest(String),

    #[error("request id {0} is already pending")]
    Collision(String),

    #[error("request {0} timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("request {0} was abandoned")]
    Abandoned(String),
}

/// Registry of in-flight synchronous requests.
#[derive(Debug, Default)]
pub struct SendKeeper {
    pending: DashMap<String, mpsc::Sender<Message>>,
}

/// Removes a pending slot when the waiting request ends, however it ends.
struct Pending<'a> {
    keeper: &'a SendKeeper,
    id: String,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.keeper.pending.remove(&self.id);
    }
}

impl SendKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `message` with `send` and wait up to `timeout` for its response.
    ///
    /// `send` failures are mapped into `E`, as are correlation failures.
    pub async fn send_sync<F, Fut, E>(
        &self,
        mut message: Message,
        timeout: Duration,
        send: F,
    ) -> Result<Message, E>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<KeeperError>,
    {
        let id = Uuid::new_v4().to_string();
        message.metadata.insert(KEY_REQUEST_ID.to_string(), id.clone());
        message.metadata.insert(KEY_SYNC.to_string(), "true".to_string());

        let (tx, mut rx) = mpsc::channel(1);
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(KeeperError::Collision(id).into()),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        let _pending = Pending {
            keeper: self,
            id: id.clone(),
        };

        send(message).await?;

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(KeeperError::Abandoned(id).into()),
            Err(_) => {
                debug!(request_id = %id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(KeeperError::Timeout(id, timeout).into())
            }
        }
    }

    /// Deliver a response to its waiting request.
    ///
    /// Never blocks. A slot that already holds a response keeps the first one.
    pub fn receive_resp(&self, message: Message) -> Result<(), KeeperError> {
        if message.metadata.is_empty() {
            return Err(KeeperError::MissingMetadata);
        }
        let id = message
            .request_id()
            .ok_or(KeeperError::MissingRequestId)?
            .to_string();

        let slot = self
            .pending
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KeeperError::UnknownRequest(id.clone()))?;

        if slot.try_send(message).is_err() {
            debug!(request_id = %id, "Dropped duplicate or late response");
        }
        Ok(())
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use edge_message::MessageKind;
    use serde_json::json;

    type Sent = Arc<Mutex<Vec<Message>>>;

    fn capture(sent: &Sent) -> impl FnOnce(Message) -> std::future::Ready<Result<(), KeeperError>> {
        let sent = Arc::clone(sent);
        move |msg| {
            sent.lock().unwrap().push(msg);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_slot() {
        let keeper = SendKeeper::new();
        let sent: Sent = Arc::default();

        let err = keeper
            .send_sync(
                Message::new(MessageKind::Report, json!({})),
                Duration::from_millis(20),
                capture(&sent),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KeeperError::Timeout(..)));
        assert_eq!(keeper.pending_count(), 0);

        let late = sent.lock().unwrap()[0].clone();
        assert!(late.is_sync());
        assert_eq!(
            keeper.receive_resp(late),
            Err(KeeperError::UnknownRequest(
                sent.lock().unwrap()[0].request_id().unwrap().to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_send_failure_deregisters() {
        let keeper = SendKeeper::new();
        let err = keeper
            .send_sync(
                Message::new(MessageKind::Report, json!({})),
                Duration::from_secs(1),
                |_| async { Err::<(), _>(KeeperError::Abandoned("link down".into())) },
            )
            .await
            .unwrap_err();
        assert_eq!(err, KeeperError::Abandoned("link down".into()));
        assert_eq!(keeper.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cloud_shaped_reply_is_correlated() {
        let keeper = Arc::new(SendKeeper::new());
        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<Message>();

        let cloud = {
            let keeper = Arc::clone(&keeper);
            tokio::spawn(async move {
                let request = wire_rx.recv().await.unwrap();
                let id = request.get_meta("x-baetyl-request-id").unwrap().to_string();
                let reply = Message::from_json(&format!(
                    r#"{{"kind":"desire","meta":{{"x-baetyl-request-id":"{id}","sync":"1"}},"content":{{"apps":[]}}}}"#
                ))
                .unwrap();
                keeper.receive_resp(reply).unwrap();
            })
        };

        let response = keeper
            .send_sync(
                Message::new(MessageKind::Desire, json!({})),
                Duration::from_secs(5),
                |msg| async move {
                    wire_tx
                        .send(msg)
                        .map_err(|_| KeeperError::Abandoned("wire closed".into()))
                },
            )
            .await
            .unwrap();

        assert_eq!(response.content.value(), &json!({"apps": []}));
        cloud.await.unwrap();
    }

    #[test]
    fn test_receive_resp_validation() {
        let keeper = SendKeeper::new();
        let bare = Message::new(MessageKind::Desire, json!({}));
        assert_eq!(keeper.receive_resp(bare.clone()), Err(KeeperError::MissingMetadata));
        assert_eq!(
            keeper.receive_resp(bare.meta(KEY_SYNC, "true")),
            Err(KeeperError::MissingRequestId)
        );
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_their_own_response() {
        let keeper = Arc::new(SendKeeper::new());
        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<Message>();

        // Echo responder
        let responder = {
            let keeper = Arc::clone(&keeper);
            tokio::spawn(async move {
                while let Some(msg) = wire_rx.recv().await {
                    keeper.receive_resp(msg).unwrap();
                }
            })
        };

        let mut handles = Vec::new();
        for i in 0..16 {
            let keeper = Arc::clone(&keeper);
            let wire_tx = wire_tx.clone();
            handles.push(tokio::spawn(async move {
                let request = Message::new(MessageKind::Report, json!({ "n": i }));
                let response = keeper
                    .send_sync(request, Duration::from_secs(5), |msg| async move {
                        wire_tx
                            .send(msg)
                            .map_err(|_| KeeperError::Abandoned("wire closed".into()))
                    })
                    .await
                    .unwrap();
                (i, response)
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            let (i, response) = handle.await.unwrap();
            assert_eq!(response.content.value(), &json!({ "n": i }));
            assert!(ids.insert(response.request_id().unwrap().to_string()));
        }

        assert_eq!(ids.len(), 16);
        assert_eq!(keeper.pending_count(), 0);
        drop(wire_tx);
        responder.await.unwrap();
    }
}
