//! MQTT link.
//!
//! Reports go to the report topic and desire requests to the desire topic.
//! The cloud answers on the desire-response topic and pushes deltas on the
//! delta topic, both subscribed on every (re)connect. One task drives the
//! client event loop; after a connection error it backs off and lets the
//! event loop redial the same broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use edge_message::{Message, MessageKind};
use reqwest::Url;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::router::Router;
use super::{stamp_identity, Backoff, Inbound, Link, LinkError, LinkState, LinkStatus, TlsMaterial};
use crate::config::{LinkConfig, MqttConfig, NodeConfig};
use crate::supervisor::Shutdown;

const PLACEHOLDER_NAMESPACE: &str = "{namespace}";
const PLACEHOLDER_NAME: &str = "{name}";

/// MQTT link to the cloud broker.
pub struct MqttLink {
    inner: Arc<Inner>,
    inbound: StdMutex<Option<Inbound>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
    closed: AtomicBool,
}

struct Inner {
    client: AsyncClient,
    topics: Topics,
    qos: QoS,
    request_timeout: Duration,
    connected: AtomicBool,
    router: Router,
}

/// Topics with the node identity filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Topics {
    report: String,
    desire: String,
    subscriptions: Vec<String>,
}

impl Topics {
    fn new(cfg: &MqttConfig, node: &NodeConfig) -> Self {
        let fill = |topic: &str| {
            topic
                .replace(PLACEHOLDER_NAMESPACE, &node.namespace)
                .replace(PLACEHOLDER_NAME, &node.name)
        };
        Self {
            report: fill(&cfg.report_topic),
            desire: fill(&cfg.desire_topic),
            subscriptions: vec![fill(&cfg.delta_topic), fill(&cfg.desire_response_topic)],
        }
    }

    fn for_kind(&self, kind: &MessageKind) -> Option<&str> {
        match kind {
            MessageKind::Report | MessageKind::DeviceReport => Some(&self.report),
            MessageKind::Desire | MessageKind::DeviceDesire => Some(&self.desire),
            _ => None,
        }
    }
}

fn qos(level: u8) -> Result<QoS, LinkError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(LinkError::Transport(format!("invalid MQTT QoS {other}"))),
    }
}

fn client_id(cfg: &MqttConfig, node: &NodeConfig) -> String {
    let id = cfg.client_id.trim();
    if id.is_empty() {
        format!("{}.{}", node.namespace, node.name)
    } else {
        id.to_string()
    }
}

fn is_secure(url: &Url) -> bool {
    matches!(url.scheme(), "mqtts" | "ssl" | "tls")
}

fn broker_options(
    url: &Url,
    cfg: &LinkConfig,
    node: &NodeConfig,
    tls: &TlsMaterial,
) -> Result<MqttOptions, LinkError> {
    let invalid = |reason: &str| LinkError::InvalidEndpoint {
        address: url.to_string(),
        reason: reason.to_string(),
    };
    if !matches!(url.scheme(), "mqtt" | "tcp" | "mqtts" | "ssl" | "tls") {
        return Err(invalid("scheme must be mqtt, tcp, mqtts, ssl or tls"));
    }
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let secure = is_secure(url);
    let port = url.port().unwrap_or(if secure { 8883 } else { 1883 });

    let mut options = MqttOptions::new(client_id(&cfg.mqtt, node), host, port);
    options.set_keep_alive(cfg.mqtt.keep_alive());
    options.set_clean_session(cfg.mqtt.clean_session);
    if let Some(username) = &cfg.mqtt.username {
        options.set_credentials(username.clone(), cfg.mqtt.password.clone().unwrap_or_default());
    }
    options.set_transport(tls.mqtt_transport(secure)?);
    Ok(options)
}

async fn wait_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

impl MqttLink {
    /// Connect to the first reachable broker and start the event loop task.
    ///
    /// When every broker is down the link is still returned, in state
    /// `NetworkError`, and keeps redialing the first one in the background.
    pub async fn connect(
        cfg: &LinkConfig,
        node: &NodeConfig,
        endpoints: Vec<Url>,
        tls: TlsMaterial,
    ) -> Result<Self, LinkError> {
        let Some(first) = endpoints.first() else {
            return Err(LinkError::NoEndpoints);
        };
        let qos = qos(cfg.mqtt.qos)?;
        let topics = Topics::new(&cfg.mqtt, node);

        let mut failures = Vec::with_capacity(endpoints.len());
        let mut established = None;
        for url in &endpoints {
            let options = broker_options(url, cfg, node, &tls)?;
            let (client, mut eventloop) = AsyncClient::new(options, cfg.queue_capacity);
            match tokio::time::timeout(cfg.connect_timeout(), wait_connack(&mut eventloop)).await {
                Ok(Ok(())) => {
                    debug!(endpoint = %url, "MQTT session established");
                    established = Some((url.clone(), client, eventloop));
                    break;
                }
                Ok(Err(e)) => {
                    debug!(endpoint = %url, error = %e, "Broker refused connection");
                    failures.push(format!("{url}: {e}"));
                }
                Err(_) => {
                    debug!(endpoint = %url, "Broker connect timed out");
                    failures.push(format!("{url}: timed out after {:?}", cfg.connect_timeout()));
                }
            }
        }

        let (router, inbound) = Router::new(node, cfg.queue_capacity);
        let (client, eventloop, connected) = match established {
            Some((url, client, eventloop)) => {
                router.status.set(LinkState::Succeeded, format!("connected to {url}"));
                (client, eventloop, true)
            }
            None => {
                let reason = LinkError::Unreachable(failures.join("; "));
                warn!(error = %reason, "Initial connect failed, retrying in background");
                router.status.set(LinkState::NetworkError, reason.to_string());
                let (client, eventloop) =
                    AsyncClient::new(broker_options(first, cfg, node, &tls)?, cfg.queue_capacity);
                (client, eventloop, false)
            }
        };

        let inner = Arc::new(Inner {
            client,
            topics,
            qos,
            request_timeout: cfg.request_timeout(),
            connected: AtomicBool::new(connected),
            router,
        });
        if connected {
            inner.subscribe();
        }

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(event_loop(
            Arc::clone(&inner),
            eventloop,
            Backoff::from_config(cfg),
            Shutdown::new(stop_rx),
        ));

        Ok(Self {
            inner,
            inbound: StdMutex::new(Some(inbound)),
            task: Mutex::new(Some(task)),
            stop,
            closed: AtomicBool::new(false),
        })
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.router.keeper.pending_count()
    }
}

impl Inner {
    /// Queue subscriptions for the inbound topics. The event loop sends them.
    fn subscribe(&self) {
        for topic in &self.topics.subscriptions {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), self.qos) {
                warn!(topic = %topic, error = %e, "Failed to queue subscription");
            }
        }
    }

    async fn publish(&self, msg: Message) -> Result<(), LinkError> {
        let Some(topic) = self.topics.for_kind(&msg.kind) else {
            return Err(LinkError::Unsupported(msg.kind.to_string()));
        };
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        let payload = stamp_identity(msg, &self.router.node).to_json()?;
        self.client
            .publish(topic, self.qos, false, payload.into_bytes())
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))
    }
}

async fn event_loop(
    inner: Arc<Inner>,
    mut eventloop: EventLoop,
    mut backoff: Backoff,
    mut shutdown: Shutdown,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.wait() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                inner.subscribe();
                inner.connected.store(true, Ordering::SeqCst);
                inner.router.status.set(LinkState::Succeeded, "reconnected to broker");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "Publish received");
                if let Some(msg) = inner.router.decode(&publish.payload) {
                    inner.router.dispatch(msg);
                }
            }
            Ok(_) => {}
            Err(e) => {
                inner.connected.store(false, Ordering::SeqCst);
                warn!(error = %e, attempt = backoff.attempt(), "MQTT connection lost");
                inner.router.status.set(LinkState::NetworkError, e.to_string());

                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait() => break,
                }
            }
        }
    }

    if inner.connected.swap(false, Ordering::SeqCst) {
        disconnect(&inner.client, &mut eventloop).await;
    }
}

/// Send DISCONNECT and give the event loop a moment to flush it.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if client.try_disconnect().is_err() {
        return;
    }
    let flushed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("Broker disconnect not flushed in time");
    }
}

#[async_trait]
impl Link for MqttLink {
    async fn send(&self, msg: Message) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.inner.publish(msg).await
    }

    async fn request(&self, msg: Message) -> Result<Message, LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let inner = &self.inner;
        let response = inner
            .router
            .keeper
            .send_sync(msg, inner.request_timeout, |m| inner.publish(m))
            .await?;
        inner.router.unwrap_reply(response)
    }

    fn receive(&self) -> Option<Inbound> {
        match self.inbound.lock() {
            Ok(mut inbound) => inbound.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn state(&self) -> LinkStatus {
        self.inner.router.status.get()
    }

    fn is_async_supported(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), LinkError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.stop.send(true);

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Link task ended abnormally");
            }
        }

        info!("MQTT link closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn node() -> NodeConfig {
        NodeConfig {
            name: "edge-1".into(),
            namespace: "default".into(),
        }
    }

    #[test]
    fn test_topics_are_filled_from_node_identity() {
        let topics = Topics::new(&MqttConfig::default(), &node());
        assert_eq!(topics.report, "$edge/default/edge-1/report");
        assert_eq!(topics.desire, "$edge/default/edge-1/desire");
        assert_eq!(
            topics.subscriptions,
            vec![
                "$edge/default/edge-1/delta".to_string(),
                "$edge/default/edge-1/desire/response".to_string(),
            ]
        );
    }

    #[rstest]
    #[case(MessageKind::Report, Some("$edge/default/edge-1/report"))]
    #[case(MessageKind::DeviceReport, Some("$edge/default/edge-1/report"))]
    #[case(MessageKind::Desire, Some("$edge/default/edge-1/desire"))]
    #[case(MessageKind::DeviceDesire, Some("$edge/default/edge-1/desire"))]
    #[case(MessageKind::NodeProps, None)]
    #[case(MessageKind::Error, None)]
    fn test_topic_for_kind(#[case] kind: MessageKind, #[case] expected: Option<&str>) {
        let topics = Topics::new(&MqttConfig::default(), &node());
        assert_eq!(topics.for_kind(&kind), expected);
    }

    #[test]
    fn test_client_id_defaults_to_identity() {
        let mut cfg = MqttConfig::default();
        assert_eq!(client_id(&cfg, &node()), "default.edge-1");
        cfg.client_id = " custom ".into();
        assert_eq!(client_id(&cfg, &node()), "custom");
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos(1).unwrap(), QoS::AtLeastOnce);
        assert!(qos(3).is_err());
    }

    #[rstest]
    #[case("mqtt://127.0.0.1", true)]
    #[case("tcp://broker.local:1884", true)]
    #[case("http://broker.local", false)]
    fn test_broker_scheme(#[case] address: &str, #[case] accepted: bool) {
        let url = Url::parse(address).unwrap();
        let result = broker_options(&url, &LinkConfig::default(), &node(), &TlsMaterial::default());
        assert_eq!(result.is_ok(), accepted);
    }

    #[test]
    fn test_broker_default_ports() {
        let cfg = LinkConfig::default();
        let plain = broker_options(
            &Url::parse("mqtt://broker.local").unwrap(),
            &cfg,
            &node(),
            &TlsMaterial::default(),
        )
        .unwrap();
        assert_eq!(plain.broker_address(), ("broker.local".to_string(), 1883));

        let custom = broker_options(
            &Url::parse("tcp://broker.local:1884").unwrap(),
            &cfg,
            &node(),
            &TlsMaterial::default(),
        )
        .unwrap();
        assert_eq!(custom.broker_address(), ("broker.local".to_string(), 1884));
    }
}
