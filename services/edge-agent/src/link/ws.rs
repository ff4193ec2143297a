//! Persistent websocket link.
//!
//! Two background tasks own the connection:
//!
//! ```text
//! receive loop ──(reconnect signal, deduplicated)──▶ reconnect loop
//!      ▲                                                   │
//!      └──────────────(new read half)──────────────────────┘
//! ```
//!
//! The write half sits behind a mutex so `send` and the reconnect swap never
//! interleave. Status lives in its own lock.
//!
//! With a read timeout configured, a connection silent for half of it gets a
//! Ping. Only a full timeout without any frame, Pong included, counts as lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use edge_message::Message;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::router::Router;
use super::{stamp_identity, Backoff, Inbound, Link, LinkError, LinkState, LinkStatus, TlsMaterial};
use crate::config::{LinkConfig, NodeConfig};
use crate::supervisor::Shutdown;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Websocket link to the cloud.
pub struct WsLink {
    inner: Arc<Inner>,
    inbound: StdMutex<Option<Inbound>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
    closed: AtomicBool,
}

struct Inner {
    endpoints: Vec<Url>,
    connector: Option<native_tls::TlsConnector>,
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    request_timeout: Duration,
    sink: Mutex<Option<WsSink>>,
    connected: AtomicBool,
    router: Router,
    reconnect_tx: mpsc::Sender<()>,
}

impl WsLink {
    /// Dial the first reachable endpoint and start the background loops.
    ///
    /// When every endpoint is down the link is still returned, in state
    /// `NetworkError`, and keeps retrying in the background.
    pub async fn connect(
        cfg: &LinkConfig,
        node: &NodeConfig,
        endpoints: Vec<Url>,
        tls: TlsMaterial,
    ) -> Result<Self, LinkError> {
        if endpoints.is_empty() {
            return Err(LinkError::NoEndpoints);
        }
        let connector = if tls.is_empty() {
            None
        } else {
            Some(tls.native_connector()?)
        };

        let (inner, inbound, reconnect_rx) = Inner::new(cfg, node, endpoints, connector);
        let inner = Arc::new(inner);
        let (reconnected_tx, reconnected_rx) = mpsc::channel(1);
        let (stop, stop_rx) = watch::channel(false);

        let source = match inner.dial().await {
            Ok((url, sink, source)) => {
                *inner.sink.lock().await = Some(sink);
                inner.connected.store(true, Ordering::SeqCst);
                inner.router.status.set(LinkState::Succeeded, format!("connected to {url}"));
                Some(source)
            }
            Err(e) => {
                warn!(error = %e, "Initial connect failed, retrying in background");
                inner.router.status.set(LinkState::NetworkError, e.to_string());
                None
            }
        };

        let receive = tokio::spawn(receive_loop(
            Arc::clone(&inner),
            source,
            reconnected_rx,
            Shutdown::new(stop_rx.clone()),
        ));
        let reconnect = tokio::spawn(reconnect_loop(
            Arc::clone(&inner),
            Backoff::from_config(cfg),
            reconnect_rx,
            reconnected_tx,
            Shutdown::new(stop_rx),
        ));

        Ok(Self {
            inner,
            inbound: StdMutex::new(Some(inbound)),
            tasks: Mutex::new(vec![receive, reconnect]),
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
    fn new(
        cfg: &LinkConfig,
        node: &NodeConfig,
        endpoints: Vec<Url>,
        connector: Option<native_tls::TlsConnector>,
    ) -> (Self, Inbound, mpsc::Receiver<()>) {
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (router, inbound) = Router::new(node, cfg.queue_capacity);
        let inner = Self {
            endpoints,
            connector,
            connect_timeout: cfg.connect_timeout(),
            read_timeout: cfg.read_timeout(),
            request_timeout: cfg.request_timeout(),
            sink: Mutex::new(None),
            connected: AtomicBool::new(false),
            router,
            reconnect_tx,
        };
        (inner, inbound, reconnect_rx)
    }

    /// How long the receive loop waits for a frame before sending a Ping.
    fn ping_interval(&self) -> Option<Duration> {
        self.read_timeout.map(|limit| limit / 2)
    }

    /// Try each endpoint in order.
    async fn dial(&self) -> Result<(Url, WsSink, WsSource), LinkError> {
        let mut failures = Vec::with_capacity(self.endpoints.len());

        for url in &self.endpoints {
            let connector = self.connector.clone().map(Connector::NativeTls);
            let attempt = tokio::time::timeout(
                self.connect_timeout,
                tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector),
            )
            .await;

            match attempt {
                Ok(Ok((stream, response))) => {
                    debug!(endpoint = %url, status = ?response.status(), "WebSocket handshake complete");
                    let (sink, source) = stream.split();
                    return Ok((url.clone(), sink, source));
                }
                Ok(Err(e)) => {
                    debug!(endpoint = %url, error = %e, "Endpoint refused connection");
                    failures.push(format!("{url}: {e}"));
                }
                Err(_) => {
                    debug!(endpoint = %url, "Endpoint connect timed out");
                    failures.push(format!("{url}: timed out after {:?}", self.connect_timeout));
                }
            }
        }

        Err(LinkError::Unreachable(failures.join("; ")))
    }

    /// Ask the reconnect loop for a new connection. Never blocks; a request
    /// already queued absorbs this one.
    fn request_reconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if self.reconnect_tx.try_send(()).is_ok() {
            debug!("Reconnect requested");
        }
    }

    async fn write(&self, msg: Message) -> Result<(), LinkError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        let text = stamp_identity(msg, &self.router.node).to_json()?;
        self.write_frame(WsMessage::text(text)).await
    }

    async fn ping(&self) -> Result<(), LinkError> {
        self.write_frame(WsMessage::Ping(Default::default())).await
    }

    async fn write_frame(&self, frame: WsMessage) -> Result<(), LinkError> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        if let Err(e) = sink.send(frame).await {
            drop(guard);
            warn!(error = %e, "WebSocket write failed");
            self.request_reconnect();
            return Err(LinkError::Transport(e.to_string()));
        }
        Ok(())
    }

    /// Close and drop the current write half.
    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Error closing stale connection");
            }
        }
    }

    fn handle_frame(&self, frame: WsMessage) {
        let msg = match &frame {
            WsMessage::Text(text) => self.router.decode(text.as_bytes()),
            WsMessage::Binary(data) => self.router.decode(data),
            _ => None,
        };
        if let Some(msg) = msg {
            self.router.dispatch(msg);
        }
    }
}

/// Outcome of waiting for one frame.
enum Read {
    Frame(WsMessage),
    /// Nothing arrived within the wait.
    Idle,
    Ended,
    Failed(String),
}

async fn receive_loop<S>(
    inner: Arc<Inner>,
    mut source: Option<S>,
    mut reconnected: mpsc::Receiver<S>,
    mut shutdown: Shutdown,
) where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    // Set once a Ping went out and nothing has arrived since.
    let mut awaiting_pong = false;

    loop {
        let stream = match source.as_mut() {
            Some(stream) => stream,
            None => {
                inner.request_reconnect();
                tokio::select! {
                    fresh = reconnected.recv() => match fresh {
                        Some(fresh) => source = Some(fresh),
                        None => return,
                    },
                    _ = shutdown.wait() => return,
                }
                awaiting_pong = false;
                continue;
            }
        };

        let next = tokio::select! {
            _ = shutdown.wait() => return,
            // A write failure can produce a new connection while this one
            // still looks alive.
            fresh = reconnected.recv() => match fresh {
                Some(fresh) => {
                    debug!("Switching to the new connection");
                    source = Some(fresh);
                    awaiting_pong = false;
                    continue;
                }
                None => return,
            },
            next = read_frame(stream, inner.ping_interval()) => next,
        };

        let lost = match next {
            Read::Frame(WsMessage::Close(frame)) => format!("closed by peer: {frame:?}"),
            Read::Frame(frame) => {
                awaiting_pong = false;
                inner.handle_frame(frame);
                continue;
            }
            Read::Idle if !awaiting_pong => {
                awaiting_pong = true;
                match inner.ping().await {
                    Ok(()) => continue,
                    Err(e) => format!("ping failed: {e}"),
                }
            }
            Read::Idle => format!("no frame within {:?}", inner.read_timeout.unwrap_or_default()),
            Read::Ended => "stream ended".to_string(),
            Read::Failed(reason) => reason,
        };

        info!(reason = %lost, "WebSocket connection lost");
        awaiting_pong = false;
        // A send failure may already have produced a fresh connection.
        source = reconnected.try_recv().ok();
    }
}

async fn read_frame<S>(stream: &mut S, wait: Option<Duration>) -> Read
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let next = match wait {
        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Read::Idle,
        },
        None => stream.next().await,
    };
    match next {
        Some(Ok(frame)) => Read::Frame(frame),
        Some(Err(e)) => Read::Failed(e.to_string()),
        None => Read::Ended,
    }
}

async fn reconnect_loop(
    inner: Arc<Inner>,
    mut backoff: Backoff,
    mut signals: mpsc::Receiver<()>,
    reconnected: mpsc::Sender<WsSource>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            signal = signals.recv() => if signal.is_none() { return },
            _ = shutdown.wait() => return,
        }

        inner.disconnect().await;

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, attempt = backoff.attempt(), "Waiting before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait() => return,
        }

        match inner.dial().await {
            Ok((url, sink, source)) => {
                backoff.reset();
                *inner.sink.lock().await = Some(sink);

                tokio::select! {
                    sent = reconnected.send(source) => if sent.is_err() { return },
                    _ = shutdown.wait() => return,
                }
                // Requests raised by the outage that just ended.
                while signals.try_recv().is_ok() {}
                inner.connected.store(true, Ordering::SeqCst);

                inner.router.status.set(LinkState::Succeeded, format!("reconnected to {url}"));
            }
            Err(e) => {
                warn!(error = %e, attempt = backoff.attempt(), "Reconnect failed");
                inner.router.status.set(LinkState::NetworkError, e.to_string());
                inner.request_reconnect();
            }
        }
    }
}

#[async_trait]
impl Link for WsLink {
    async fn send(&self, msg: Message) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.inner.write(msg).await
    }

    async fn request(&self, msg: Message) -> Result<Message, LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        let inner = &self.inner;
        let response = inner
            .router
            .keeper
            .send_sync(msg, inner.request_timeout, |m| inner.write(m))
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

        self.inner.connected.store(false, Ordering::SeqCst);
        let sink = self.inner.sink.lock().await.take();
        let result = match sink {
            Some(mut sink) => sink
                .close()
                .await
                .map_err(|e| LinkError::Transport(e.to_string())),
            None => Ok(()),
        };

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Link task ended abnormally");
            }
        }

        info!("WebSocket link closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;

    use edge_message::MessageKind;
    use futures_util::stream;
    use serde_json::json;

    type Frame = Result<WsMessage, WsError>;
    type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

    fn inner() -> (Arc<Inner>, Inbound) {
        let cfg = LinkConfig {
            read_timeout_secs: 0,
            ..LinkConfig::default()
        };
        let node = NodeConfig {
            name: "edge-1".into(),
            namespace: "default".into(),
        };
        let url = Url::parse("ws://127.0.0.1:9/v1/sync").unwrap();
        let (inner, inbound, _signals) = Inner::new(&cfg, &node, vec![url], None);
        (Arc::new(inner), inbound)
    }

    fn text_frame(content: serde_json::Value) -> WsMessage {
        WsMessage::text(Message::new(MessageKind::Desire, content).to_json().unwrap())
    }

    #[tokio::test]
    async fn test_new_connection_replaces_one_that_never_fails() {
        let (inner, mut inbound) = inner();
        let (reconnected_tx, reconnected_rx) = mpsc::channel::<FrameStream>(1);
        let (stop, stop_rx) = watch::channel(false);

        let stale: FrameStream = Box::pin(stream::pending::<Frame>());
        let task = tokio::spawn(receive_loop(
            Arc::clone(&inner),
            Some(stale),
            reconnected_rx,
            Shutdown::new(stop_rx),
        ));

        let fresh: FrameStream = Box::pin(
            stream::iter(vec![Ok::<_, WsError>(text_frame(json!({"from": "fresh"})))])
                .chain(stream::pending::<Frame>()),
        );
        reconnected_tx.send(fresh).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), inbound.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.content.value(), &json!({"from": "fresh"}));

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_frame_reports_idle_and_end() {
        let mut silent: FrameStream = Box::pin(stream::pending::<Frame>());
        assert!(matches!(
            read_frame(&mut silent, Some(Duration::from_millis(20))).await,
            Read::Idle
        ));

        let mut pong_then_end: FrameStream = Box::pin(stream::iter(vec![Ok::<_, WsError>(
            WsMessage::Pong(Default::default()),
        )]));
        assert!(matches!(
            read_frame(&mut pong_then_end, None).await,
            Read::Frame(WsMessage::Pong(_))
        ));
        assert!(matches!(read_frame(&mut pong_then_end, None).await, Read::Ended));
    }
}
