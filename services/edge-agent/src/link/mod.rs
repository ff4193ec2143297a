//! Cloud links.
//!
//! A link is a duplex channel to the cloud. Three transports are provided:
//!
//! - [`WsLink`]: a persistent websocket that reconnects with backoff and
//!   pushes inbound messages to the agent.
//! - [`MqttLink`]: publish/subscribe through a broker, with per-kind topics.
//! - [`HttpLink`]: request/response over HTTPS. The cloud cannot push, so
//!   desired state arrives as the reply to each report.
//!
//! All are closed over by [`CloudLink`], picked from configuration.

mod backoff;
mod http;
mod mqtt;
mod router;
mod status;
mod tls;
mod ws;

use async_trait::async_trait;
use edge_message::{CloudError, Message, MessageError};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{LinkConfig, LinkKind, NodeConfig};
use crate::keeper::KeeperError;

pub use backoff::Backoff;
pub use http::HttpLink;
pub use mqtt::MqttLink;
pub use status::{LinkState, LinkStatus};
pub use tls::TlsMaterial;
pub use ws::WsLink;

/// Errors from link operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,

    #[error("link is closed")]
    Closed,

    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("invalid endpoint `{address}`: {reason}")]
    InvalidEndpoint { address: String, reason: String },

    #[error("TLS is required but no client certificate is configured")]
    TlsConfigMissing,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("all endpoints failed: {0}")]
    Unreachable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status} from {url}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("cloud error: {0}")]
    Cloud(String),

    #[error("{0} messages are not supported by this link")]
    Unsupported(String),

    #[error(transparent)]
    Keeper(#[from] KeeperError),

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Inbound streams of a push-capable link.
#[derive(Debug)]
pub struct Inbound {
    pub messages: mpsc::Receiver<Message>,
    pub errors: mpsc::Receiver<CloudError>,
}

/// Capabilities shared by every link transport.
#[async_trait]
pub trait Link: Send + Sync {
    /// Publish without waiting for a reply.
    async fn send(&self, msg: Message) -> Result<(), LinkError>;

    /// Publish and wait for the correlated reply.
    async fn request(&self, msg: Message) -> Result<Message, LinkError>;

    /// Take the inbound streams. Returns `None` after the first call, or
    /// always for links that cannot receive pushes.
    fn receive(&self) -> Option<Inbound>;

    fn state(&self) -> LinkStatus;

    /// Whether the cloud can push messages over this link.
    fn is_async_supported(&self) -> bool;

    /// Stop background work and release the connection. Safe to call twice.
    async fn close(&self) -> Result<(), LinkError>;
}

/// The configured link transport.
pub enum CloudLink {
    WebSocket(WsLink),
    Mqtt(MqttLink),
    Http(HttpLink),
}

impl CloudLink {
    /// Build the transport selected by `cfg.kind`.
    ///
    /// `fallback` holds extra comma-separated addresses tried after the
    /// configured ones.
    pub async fn connect(
        cfg: &LinkConfig,
        node: &NodeConfig,
        fallback: Option<&str>,
    ) -> Result<Self, LinkError> {
        let tls = TlsMaterial::load(&cfg.tls, cfg.require_tls)?;
        match cfg.kind {
            LinkKind::Ws => {
                let endpoints = parse_endpoints(&cfg.address, fallback, &cfg.sync_path)?;
                Ok(Self::WebSocket(WsLink::connect(cfg, node, endpoints, tls).await?))
            }
            LinkKind::Mqtt => {
                let endpoints = parse_endpoints(&cfg.address, fallback, "")?;
                Ok(Self::Mqtt(MqttLink::connect(cfg, node, endpoints, tls).await?))
            }
            LinkKind::Http => {
                let reports = parse_endpoints(&cfg.address, fallback, &cfg.report_path)?;
                let desires = parse_endpoints(&cfg.address, fallback, &cfg.desire_path)?;
                Ok(Self::Http(HttpLink::new(cfg, node, reports, desires, tls)?))
            }
        }
    }

    fn inner(&self) -> &dyn Link {
        match self {
            CloudLink::WebSocket(link) => link,
            CloudLink::Mqtt(link) => link,
            CloudLink::Http(link) => link,
        }
    }
}

#[async_trait]
impl Link for CloudLink {
    async fn send(&self, msg: Message) -> Result<(), LinkError> {
        self.inner().send(msg).await
    }

    async fn request(&self, msg: Message) -> Result<Message, LinkError> {
        self.inner().request(msg).await
    }

    fn receive(&self) -> Option<Inbound> {
        self.inner().receive()
    }

    fn state(&self) -> LinkStatus {
        self.inner().state()
    }

    fn is_async_supported(&self) -> bool {
        self.inner().is_async_supported()
    }

    async fn close(&self) -> Result<(), LinkError> {
        self.inner().close().await
    }
}

/// Split comma-separated `address` (then `fallback`) into endpoint URLs
/// with `suffix` appended. Order is kept and duplicates dropped.
pub fn parse_endpoints(
    address: &str,
    fallback: Option<&str>,
    suffix: &str,
) -> Result<Vec<Url>, LinkError> {
    let mut endpoints: Vec<Url> = Vec::new();
    let candidates = address
        .split(',')
        .chain(fallback.into_iter().flat_map(|f| f.split(',')))
        .map(str::trim)
        .filter(|a| !a.is_empty());

    for candidate in candidates {
        let joined = format!("{}{}", candidate.trim_end_matches('/'), suffix);
        let url = Url::parse(&joined).map_err(|e| LinkError::InvalidEndpoint {
            address: candidate.to_string(),
            reason: e.to_string(),
        })?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(LinkError::InvalidEndpoint {
                address: candidate.to_string(),
                reason: "missing host".to_string(),
            });
        }
        if !endpoints.contains(&url) {
            endpoints.push(url);
        }
    }

    if endpoints.is_empty() {
        return Err(LinkError::NoEndpoints);
    }
    Ok(endpoints)
}

/// Stamp node identity onto an outgoing message.
pub(crate) fn stamp_identity(mut msg: Message, node: &NodeConfig) -> Message {
    msg.metadata
        .entry(edge_message::KEY_NAME.to_string())
        .or_insert_with(|| node.name.clone());
    msg.metadata
        .entry(edge_message::KEY_NAMESPACE.to_string())
        .or_insert_with(|| node.namespace.clone());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints_with_fallback() {
        let endpoints = parse_endpoints(
            "wss://a.example.com/, wss://b.example.com",
            Some("ws://10.0.0.1:8080,wss://a.example.com"),
            "/v1/sync",
        )
        .unwrap();

        let urls: Vec<_> = endpoints.iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            vec![
                "wss://a.example.com/v1/sync",
                "wss://b.example.com/v1/sync",
                "ws://10.0.0.1:8080/v1/sync",
            ]
        );
    }

    #[test]
    fn test_parse_endpoints_rejects_garbage() {
        assert!(matches!(
            parse_endpoints("not a url", None, "/x"),
            Err(LinkError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            parse_endpoints(" , ", None, "/x"),
            Err(LinkError::NoEndpoints)
        ));
    }

    #[test]
    fn test_stamp_identity_keeps_existing() {
        let node = NodeConfig {
            name: "n1".into(),
            namespace: "ns".into(),
        };
        let msg = Message::new(edge_message::MessageKind::Report, serde_json::json!({}))
            .meta(edge_message::KEY_NAME, "other");
        let stamped = stamp_identity(msg, &node);
        assert_eq!(stamped.get_meta(edge_message::KEY_NAME), Some("other"));
        assert_eq!(stamped.get_meta(edge_message::KEY_NAMESPACE), Some("ns"));
    }
}
