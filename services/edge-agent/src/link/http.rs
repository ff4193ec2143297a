//! Request/response link over HTTP.
//!
//! Reports are POSTed to the report URL and the reply carries the desire.
//! Desire pulls go to the desire URL. The cloud cannot push, so
//! [`Link::receive`] always returns `None`.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use edge_message::{CloudError, Content, Message, MessageKind};
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use super::status::StatusCell;
use super::{Inbound, Link, LinkError, LinkState, LinkStatus, TlsMaterial};
use crate::config::{LinkConfig, NodeConfig};

/// Header carrying the node name.
pub const HEADER_NODE_NAME: &str = "x-node-name";
/// Header carrying the node namespace.
pub const HEADER_NODE_NAMESPACE: &str = "x-node-namespace";

/// HTTP link to the cloud.
pub struct HttpLink {
    client: Client,
    node: NodeConfig,
    report_urls: Vec<Url>,
    desire_urls: Vec<Url>,
    status: StatusCell,
    closed: AtomicBool,
}

/// Error body the cloud may return.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "error")]
    message: String,
}

enum Attempt {
    Done(Message),
    /// Try the next endpoint.
    Next(String),
    /// Give up without trying other endpoints.
    Fail(LinkError),
}

impl HttpLink {
    pub fn new(
        cfg: &LinkConfig,
        node: &NodeConfig,
        report_urls: Vec<Url>,
        desire_urls: Vec<Url>,
        tls: TlsMaterial,
    ) -> Result<Self, LinkError> {
        if report_urls.is_empty() || desire_urls.is_empty() {
            return Err(LinkError::NoEndpoints);
        }
        let builder = Client::builder()
            .connect_timeout(cfg.connect_timeout())
            .timeout(cfg.request_timeout());
        let client = tls
            .apply_http(builder)?
            .build()
            .map_err(|e| LinkError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            node: node.clone(),
            report_urls,
            desire_urls,
            status: StatusCell::default(),
            closed: AtomicBool::new(false),
        })
    }

    async fn post(&self, url: &Url, msg: &Message, reply_kind: &MessageKind) -> Attempt {
        let result = self
            .client
            .post(url.clone())
            .header(HEADER_NODE_NAME, &self.node.name)
            .header(HEADER_NODE_NAMESPACE, &self.node.namespace)
            .json(msg.content.value())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => return Attempt::Next(format!("{url}: {e}")),
        };

        let status = response.status();
        if status.is_success() {
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => return Attempt::Next(format!("{url}: {e}")),
            };
            let content = if body.is_empty() {
                serde_json::Value::Null
            } else {
                match serde_json::from_slice(&body) {
                    Ok(value) => value,
                    Err(e) => return Attempt::Fail(LinkError::Message(e.into())),
                }
            };
            return Attempt::Done(Message::new(reply_kind.clone(), Content::from(content)));
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Attempt::Next(format!("{url}: HTTP {status}"));
        }

        let err = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => CloudError {
                text: parsed.message,
                code: parsed.code,
                node: None,
            },
            Err(_) => CloudError {
                text: body.clone(),
                code: None,
                node: None,
            },
        };
        if err.is_node_not_found(&self.node.name) {
            self.status.set(LinkState::NodeNotFound, err.text.clone());
            return Attempt::Fail(LinkError::Cloud(err.to_string()));
        }

        Attempt::Fail(LinkError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Link for HttpLink {
    async fn send(&self, msg: Message) -> Result<(), LinkError> {
        self.request(msg).await.map(|_| ())
    }

    async fn request(&self, msg: Message) -> Result<Message, LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let urls = match msg.kind {
            MessageKind::Report => &self.report_urls,
            MessageKind::Desire => &self.desire_urls,
            ref other => return Err(LinkError::Unsupported(other.to_string())),
        };

        let mut failures = Vec::new();
        for url in urls {
            match self.post(url, &msg, &MessageKind::Desire).await {
                Attempt::Done(reply) => {
                    debug!(endpoint = %url, kind = %msg.kind, "Request succeeded");
                    self.status.set(LinkState::Succeeded, format!("{} sent to {url}", msg.kind));
                    return Ok(reply);
                }
                Attempt::Next(reason) => {
                    warn!(endpoint = %url, reason = %reason, "Endpoint failed, trying next");
                    failures.push(reason);
                }
                Attempt::Fail(e) => return Err(e),
            }
        }

        let reason = failures.join("; ");
        self.status.set(LinkState::NetworkError, reason.clone());
        Err(LinkError::Unreachable(reason))
    }

    fn receive(&self) -> Option<Inbound> {
        None
    }

    fn state(&self) -> LinkStatus {
        self.status.get()
    }

    fn is_async_supported(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
