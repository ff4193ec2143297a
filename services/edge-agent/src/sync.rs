//! Sync orchestrator.
//!
//! Three loops keep the node shadow converged with the cloud:
//!
//! - **reporting**: collect local facts, merge them into the report and
//!   publish it when something changed (or always, for request-only links)
//! - **desiring**: merge queued desired state and hand the delta to the
//!   engine
//! - **receiving**: route messages pushed by the cloud
//!
//! Failures are logged and never end a loop; loops end on shutdown only.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use edge_message::{CloudError, Message, MessageError, MessageKind, KEY_DEVICE};
use edge_shadow::{Delta, Desire, Fingerprint, Report, ShadowError, PROPS_KEY};
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::collector::Collector;
use crate::config::SyncConfig;
use crate::device::{DeviceError, DeviceShadows};
use crate::engine::{apply_delta, Engine};
use crate::link::{Inbound, Link, LinkError};
use crate::node::{NodeShadow, ShadowStoreError};
use crate::supervisor::{Shutdown, Supervisor};

/// Errors from a single sync step.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] ShadowStoreError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Shadow(#[from] ShadowError),

    #[error("collecting facts failed: {0:#}")]
    Collect(anyhow::Error),

    #[error("engine failed: {0:#}")]
    Engine(anyhow::Error),

    #[error("unexpected {0} message")]
    UnexpectedKind(String),
}

/// Desired state merged into a device shadow, for device drivers.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDelta {
    pub device: String,
    pub delta: Delta,
}

/// Result of one reporting cycle.
#[derive(Debug, Default)]
pub struct ReportOutcome {
    /// Delta after merging the collected report.
    pub delta: Delta,

    /// Whether the report went out over the link.
    pub published: bool,
}

/// Drives the node shadow between collectors, the link and the engine.
pub struct Syncer {
    node: Arc<NodeShadow>,
    devices: DeviceShadows,
    link: Arc<dyn Link>,
    engine: Arc<dyn Engine>,
    collector: Arc<dyn Collector>,
    cfg: SyncConfig,
    desire_tx: mpsc::Sender<Message>,
    desire_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    device_tx: mpsc::Sender<DeviceDelta>,
    device_rx: Mutex<Option<mpsc::Receiver<DeviceDelta>>>,
    last_published: Mutex<Option<Fingerprint>>,
}

impl Syncer {
    pub fn new(
        cfg: SyncConfig,
        node: Arc<NodeShadow>,
        devices: DeviceShadows,
        link: Arc<dyn Link>,
        engine: Arc<dyn Engine>,
        collector: Arc<dyn Collector>,
    ) -> Self {
        let (desire_tx, desire_rx) = mpsc::channel(cfg.desire_queue.max(1));
        let (device_tx, device_rx) = mpsc::channel(cfg.device_queue.max(1));
        Self {
            node,
            devices,
            link,
            engine,
            collector,
            cfg,
            desire_tx,
            desire_rx: Mutex::new(Some(desire_rx)),
            device_tx,
            device_rx: Mutex::new(Some(device_rx)),
            last_published: Mutex::new(None),
        }
    }

    /// Take the stream of device deltas. Returns `None` after the first call.
    pub fn take_device_deltas(&self) -> Option<mpsc::Receiver<DeviceDelta>> {
        take(&self.device_rx)
    }

    /// Spawn the sync loops under `supervisor`.
    pub fn start(self: &Arc<Self>, supervisor: &mut Supervisor) {
        info!(
            node = %self.node.name(),
            namespace = %self.node.namespace(),
            interval_secs = self.cfg.report_interval_secs,
            async_link = self.link.is_async_supported(),
            "Starting sync"
        );

        let shutdown = supervisor.shutdown();
        supervisor.spawn("reporting", Arc::clone(self).reporting_loop(shutdown));

        match take(&self.desire_rx) {
            Some(rx) => {
                let shutdown = supervisor.shutdown();
                supervisor.spawn("desiring", Arc::clone(self).desiring_loop(rx, shutdown));
            }
            None => warn!("Desire queue already taken, desiring loop not started"),
        }

        if let Some(inbound) = self.link.receive() {
            let shutdown = supervisor.shutdown();
            supervisor.spawn("receiving", Arc::clone(self).receiving_loop(inbound, shutdown));
        }
    }

    /// Collect, merge and publish the node report once.
    pub async fn report_once(&self) -> Result<ReportOutcome, SyncError> {
        let shadow = self.node.get()?;
        let patch = self
            .collector
            .collect(&shadow.desire)
            .await
            .map_err(SyncError::Collect)?;
        let delta = self.node.report(&patch, false)?;

        let shadow = self.node.get()?;
        let full = shadow.report.to_value();
        let fingerprint = Fingerprint::of(&full);

        let changed = lock(&self.last_published).as_ref() != Some(&fingerprint);
        let request_only = !self.link.is_async_supported();
        if !has_pending(&delta) && !changed && !request_only {
            debug!(fingerprint = %fingerprint, "Report unchanged, not publishing");
            self.apply(&delta, &shadow.report).await?;
            return Ok(ReportOutcome {
                delta,
                published: false,
            });
        }

        let msg = Message::new(MessageKind::Report, full);
        if request_only {
            let reply = self.link.request(msg).await?;
            if !reply.content.is_null() {
                self.enqueue_desire(reply);
            }
        } else {
            self.link.send(msg).await?;
        }
        debug!(fingerprint = %fingerprint, delta_keys = delta.len(), "Published report");
        *lock(&self.last_published) = Some(fingerprint);

        self.apply(&delta, &shadow.report).await?;
        Ok(ReportOutcome {
            delta,
            published: true,
        })
    }

    /// Queue a desire-bearing message for the desiring loop. Returns false
    /// when the message was dropped.
    pub fn enqueue_desire(&self, msg: Message) -> bool {
        match self.desire_tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                error!(kind = %msg.kind, "Desire queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                debug!(kind = %msg.kind, "Desire queue closed, dropping message");
                false
            }
        }
    }

    /// Merge one desire-bearing message and apply the resulting delta.
    pub async fn desire_once(&self, msg: Message) -> Result<Delta, SyncError> {
        let delta = match msg.kind {
            MessageKind::Desire | MessageKind::Delta => {
                let patch = Desire::from_value(msg.content.into_value())?;
                self.node.desire(&patch, false)?
            }
            MessageKind::NodeProps => {
                let mut patch = Desire::new();
                patch.insert(PROPS_KEY, msg.content.into_value());
                self.node.desire(&patch, true)?
            }
            other => return Err(SyncError::UnexpectedKind(other.to_string())),
        };

        let shadow = self.node.get()?;
        self.apply(&delta, &shadow.report).await?;
        Ok(delta)
    }

    /// Route a message pushed by the cloud.
    pub async fn handle_inbound(&self, msg: Message) -> Result<(), SyncError> {
        match msg.kind {
            MessageKind::Desire | MessageKind::Delta | MessageKind::NodeProps => {
                self.enqueue_desire(msg);
                Ok(())
            }
            MessageKind::DeviceDesire | MessageKind::DeviceDelta => {
                let device = msg
                    .get_meta(KEY_DEVICE)
                    .ok_or(MessageError::MissingMetadata(KEY_DEVICE))?
                    .to_string();
                let patch = Desire::from_value(msg.content.into_value())?;
                let delta = self.devices.desire(&device, &patch)?;
                if delta.is_empty() {
                    return Ok(());
                }
                if self.device_tx.try_send(DeviceDelta { device: device.clone(), delta }).is_err() {
                    error!(device = %device, "Device delta queue full, dropping delta");
                }
                Ok(())
            }
            other => {
                warn!(kind = %other, "Ignoring unexpected message from cloud");
                Err(SyncError::UnexpectedKind(other.to_string()))
            }
        }
    }

    /// Merge a device report and publish it.
    ///
    /// Request-only links have no device channel, so the merge is kept
    /// locally and nothing is sent.
    pub async fn report_device(&self, name: &str, patch: &Report) -> Result<Delta, SyncError> {
        let delta = self.devices.report(name, patch)?;
        if !self.link.is_async_supported() {
            debug!(device = %name, "Link is request-only, device report kept locally");
            return Ok(delta);
        }

        let device = self.devices.get(name)?;
        let msg = Message::new(MessageKind::DeviceReport, device.report.to_value())
            .meta(KEY_DEVICE, name);
        self.link.send(msg).await?;
        Ok(delta)
    }

    async fn apply(&self, delta: &Delta, report: &Report) -> Result<(), SyncError> {
        let outcome = apply_delta(self.engine.as_ref(), self.node.namespace(), delta, report)
            .await
            .map_err(SyncError::Engine)?;
        if !outcome.applied.is_empty() || !outcome.deleted.is_empty() {
            info!(
                applied = ?outcome.applied,
                deleted = ?outcome.deleted,
                failed = outcome.failed.len(),
                "Applied desired applications"
            );
        }
        Ok(())
    }

    fn jitter(&self) -> Duration {
        let max = self.cfg.report_jitter_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }

    async fn reporting_loop(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut timer = tokio::time::interval(self.cfg.report_interval());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.wait() => break,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.jitter()) => {}
                _ = shutdown.wait() => break,
            }

            match self.report_once().await {
                Ok(outcome) => {
                    consecutive_failures = 0;
                    debug!(published = outcome.published, delta_keys = outcome.delta.len(), "Report cycle complete");
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures <= 3 {
                        warn!(error = %e, consecutive_failures, "Report failed");
                    } else {
                        error!(error = %e, consecutive_failures, "Report failed repeatedly");
                    }
                }
            }
        }

        info!("Reporting loop shutting down");
    }

    async fn desiring_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Message>, mut shutdown: Shutdown) {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = shutdown.wait() => break,
            };

            let kind = msg.kind.clone();
            match self.desire_once(msg).await {
                Ok(delta) => debug!(kind = %kind, delta_keys = delta.len(), "Desire merged"),
                Err(e) => error!(kind = %kind, error = %e, "Failed to apply desire"),
            }
        }

        info!("Desiring loop shutting down");
    }

    async fn receiving_loop(self: Arc<Self>, inbound: Inbound, mut shutdown: Shutdown) {
        let Inbound {
            mut messages,
            mut errors,
        } = inbound;

        loop {
            tokio::select! {
                msg = messages.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = self.handle_inbound(msg).await {
                            warn!(error = %e, "Failed to handle inbound message");
                        }
                    }
                    None => break,
                },
                err = errors.recv() => match err {
                    Some(err) => log_cloud_error(&err, self.node.name()),
                    None => break,
                },
                _ = shutdown.wait() => break,
            }
        }

        info!("Receiving loop shutting down");
    }
}

fn log_cloud_error(err: &CloudError, node: &str) {
    if err.is_node_not_found(node) {
        error!(error = %err, "Cloud does not know this node");
    } else {
        warn!(error = %err, "Cloud reported an error");
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    lock(slot).take()
}

/// Whether the delta still carries desired values. Keys present only in the
/// report show up as `null` and do not count.
fn has_pending(delta: &Delta) -> bool {
    delta.values().any(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::StaticCollector;
    use crate::engine::{EngineCall, MockEngine};
    use crate::link::{LinkState, LinkStatus};
    use crate::state::StateStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Link that records what it is asked to send.
    struct RecordingLink {
        async_supported: bool,
        sent: Mutex<Vec<Message>>,
        reply: Value,
    }

    impl RecordingLink {
        fn new(async_supported: bool, reply: Value) -> Self {
            Self {
                async_supported,
                sent: Mutex::new(Vec::new()),
                reply,
            }
        }

        fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Link for RecordingLink {
        async fn send(&self, msg: Message) -> Result<(), LinkError> {
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }

        async fn request(&self, msg: Message) -> Result<Message, LinkError> {
            self.sent.lock().unwrap().push(msg);
            Ok(Message::new(MessageKind::Desire, self.reply.clone()))
        }

        fn receive(&self) -> Option<Inbound> {
            None
        }

        fn state(&self) -> LinkStatus {
            LinkStatus {
                state: LinkState::Succeeded,
                ..LinkStatus::default()
            }
        }

        fn is_async_supported(&self) -> bool {
            self.async_supported
        }

        async fn close(&self) -> Result<(), LinkError> {
            Ok(())
        }
    }

    struct Fixture {
        syncer: Syncer,
        link: Arc<RecordingLink>,
        engine: Arc<MockEngine>,
        collector: Arc<StaticCollector>,
        devices: DeviceShadows,
    }

    fn fixture(async_supported: bool, reply: Value) -> Fixture {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let node = Arc::new(NodeShadow::open(Arc::clone(&store), "default", "edge-1").unwrap());
        let devices = DeviceShadows::new(Arc::clone(&store));
        let link = Arc::new(RecordingLink::new(async_supported, reply));
        let engine = Arc::new(MockEngine::new());
        let collector = Arc::new(StaticCollector::new(
            Report::from_value(json!({"node": {"hostname": "edge-1"}})).unwrap(),
        ));

        let syncer = Syncer::new(
            SyncConfig::default(),
            node,
            devices.clone(),
            link.clone(),
            engine.clone(),
            collector.clone(),
        );
        Fixture {
            syncer,
            link,
            engine,
            collector,
            devices,
        }
    }

    #[tokio::test]
    async fn test_unchanged_report_is_published_once_on_async_link() {
        let f = fixture(true, Value::Null);

        assert!(f.syncer.report_once().await.unwrap().published);
        assert!(!f.syncer.report_once().await.unwrap().published);
        assert_eq!(f.link.sent().len(), 1);

        f.collector
            .set(Report::from_value(json!({"node": {"hostname": "edge-2"}})).unwrap());
        assert!(f.syncer.report_once().await.unwrap().published);
        assert_eq!(f.link.sent().len(), 2);
        assert_eq!(f.link.sent()[1].kind, MessageKind::Report);
    }

    #[tokio::test]
    async fn test_request_only_link_always_reports_and_queues_reply() {
        let f = fixture(false, json!({"apps": [{"name": "web", "version": "1"}]}));
        let mut desires = take(&f.syncer.desire_rx).unwrap();

        f.syncer.report_once().await.unwrap();
        f.syncer.report_once().await.unwrap();
        assert_eq!(f.link.sent().len(), 2);

        let queued = desires.try_recv().unwrap();
        assert_eq!(queued.kind, MessageKind::Desire);
        let delta = f.syncer.desire_once(queued).await.unwrap();
        assert!(delta.contains_key("apps"));
        assert!(matches!(
            f.engine.calls().as_slice(),
            [EngineCall::Apply { app, .. }] if app.name == "web"
        ));
    }

    #[tokio::test]
    async fn test_node_props_use_override_mode() {
        let f = fixture(true, Value::Null);
        let first = Message::new(MessageKind::NodeProps, json!({"a": 1, "b": 2}));
        f.syncer.desire_once(first).await.unwrap();
        let second = Message::new(MessageKind::NodeProps, json!({"a": 3}));
        f.syncer.desire_once(second).await.unwrap();

        let props = f.syncer.node.node_props().unwrap();
        assert_eq!(Value::Object(props.desire), json!({"a": 3}));
    }

    #[tokio::test]
    async fn test_desire_queue_overflow_drops() {
        let f = fixture(true, Value::Null);
        let capacity = SyncConfig::default().desire_queue;
        for _ in 0..capacity {
            assert!(f.syncer.enqueue_desire(Message::new(MessageKind::Desire, json!({}))));
        }
        assert!(!f.syncer.enqueue_desire(Message::new(MessageKind::Desire, json!({}))));
    }

    #[tokio::test]
    async fn test_device_desire_is_filtered_and_forwarded() {
        let f = fixture(true, Value::Null);
        let model = crate::device::DeviceModel {
            name: "thermometer".into(),
            properties: vec![crate::device::DeviceProperty {
                name: "target".into(),
                kind: "float".into(),
                mode: crate::device::PropertyMode::Rw,
            }],
        };
        f.devices
            .create("t1", "v1", model, Default::default())
            .unwrap();
        let mut deltas = f.syncer.take_device_deltas().unwrap();

        let msg = Message::new(MessageKind::DeviceDesire, json!({"target": 21.5, "bogus": 1}))
            .meta(KEY_DEVICE, "t1");
        f.syncer.handle_inbound(msg).await.unwrap();

        let forwarded = deltas.try_recv().unwrap();
        assert_eq!(forwarded.device, "t1");
        assert_eq!(forwarded.delta.to_value(), json!({"target": 21.5}));
    }

    #[tokio::test]
    async fn test_device_message_without_device_fails() {
        let f = fixture(true, Value::Null);
        let msg = Message::new(MessageKind::DeviceDesire, json!({"target": 1}));
        assert!(matches!(
            f.syncer.handle_inbound(msg).await,
            Err(SyncError::Message(MessageError::MissingMetadata(_)))
        ));
    }

    #[tokio::test]
    async fn test_report_device_publishes_full_report() {
        let f = fixture(true, Value::Null);
        f.devices
            .create("t1", "v1", crate::device::DeviceModel::default(), Default::default())
            .unwrap();

        let patch = Report::from_value(json!({"status": "online"})).unwrap();
        f.syncer.report_device("t1", &patch).await.unwrap();

        let sent = f.link.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, MessageKind::DeviceReport);
        assert_eq!(sent[0].get_meta(KEY_DEVICE), Some("t1"));
        assert_eq!(sent[0].content.value(), &json!({"status": "online"}));
    }
}
