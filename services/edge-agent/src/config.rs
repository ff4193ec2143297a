//! Configuration for the edge agent.
//!
//! Values come from, in increasing precedence:
//! 1. built-in defaults
//! 2. an optional TOML file (`--config`)
//! 3. `EDGE_*` environment variables

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable holding extra comma-separated cloud addresses,
/// tried after the configured ones.
pub const ENV_SYNC_ADDR: &str = "EDGE_SYNC_ADDR";

/// Edge agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,

    /// Directory for local state, relative paths resolve against `--prefix`.
    pub data_dir: PathBuf,

    pub link: LinkConfig,

    pub sync: SyncConfig,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Identity of this node in the cloud.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub namespace: String,
}

/// Which transport to use for the cloud link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    #[default]
    Ws,
    Http,
    Mqtt,
}

impl std::str::FromStr for LinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ws" | "websocket" => Ok(Self::Ws),
            "http" | "https" => Ok(Self::Http),
            "mqtt" | "mqtts" => Ok(Self::Mqtt),
            other => bail!("unknown link kind: {other}"),
        }
    }
}

/// Cloud link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub kind: LinkKind,

    /// Comma-separated candidate base addresses, tried in order.
    pub address: String,

    /// Path appended to websocket endpoints.
    pub sync_path: String,

    /// Paths appended to HTTP endpoints.
    pub report_path: String,
    pub desire_path: String,

    pub connect_timeout_secs: u64,

    /// Reconnect when no frame arrives for this long. Zero disables it.
    pub read_timeout_secs: u64,

    pub request_timeout_secs: u64,

    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_factor: f64,

    /// Capacity of each inbound queue.
    pub queue_capacity: usize,

    /// Refuse to start without client certificate material.
    pub require_tls: bool,

    pub tls: TlsConfig,

    pub mqtt: MqttConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            kind: LinkKind::Ws,
            address: String::new(),
            sync_path: "/v1/sync".to_string(),
            report_path: "/v1/sync/report".to_string(),
            desire_path: "/v1/sync/desire".to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 120,
            request_timeout_secs: 10,
            backoff_min_ms: 500,
            backoff_max_ms: 60_000,
            backoff_factor: 2.0,
            queue_capacity: 64,
            require_tls: false,
            tls: TlsConfig::default(),
            mqtt: MqttConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_secs > 0).then(|| Duration::from_secs(self.read_timeout_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Broker settings for the MQTT link.
///
/// Topics may contain `{namespace}` and `{name}`, filled in from the node
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Empty means `<namespace>.<name>`.
    pub client_id: String,

    /// Reports and device reports are published here.
    pub report_topic: String,
    /// Desire requests and device desires are published here.
    pub desire_topic: String,

    /// Subscribed: deltas pushed by the cloud.
    pub delta_topic: String,
    /// Subscribed: replies to desire requests.
    pub desire_response_topic: String,

    pub qos: u8,
    pub keep_alive_secs: u64,
    pub clean_session: bool,

    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            report_topic: "$edge/{namespace}/{name}/report".to_string(),
            desire_topic: "$edge/{namespace}/{name}/desire".to_string(),
            delta_topic: "$edge/{namespace}/{name}/delta".to_string(),
            desire_response_topic: "$edge/{namespace}/{name}/desire/response".to_string(),
            qos: 0,
            keep_alive_secs: 30,
            clean_session: true,
            username: None,
            password: None,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }
}

/// PEM files for mutual TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

/// Sync orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub report_interval_secs: u64,

    /// Upper bound of the random delay added before each report.
    pub report_jitter_ms: u64,

    pub desire_queue: usize,

    pub device_queue: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 20,
            report_jitter_ms: 100,
            desire_queue: 16,
            device_queue: 64,
        }
    }
}

impl SyncConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self> {
        Self::load(None, None)
    }

    /// Load defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>, prefix: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::defaults(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        if let Some(prefix) = prefix {
            config.resolve_prefix(prefix);
        }
        config.validate()?;
        Ok(config)
    }

    fn defaults() -> Self {
        Self {
            node: NodeConfig {
                name: String::new(),
                namespace: "default".to_string(),
            },
            data_dir: PathBuf::from("/var/lib/edge"),
            log_level: "info".to_string(),
            ..Self::default()
        }
    }

    /// Parse a TOML file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let parsed: Self = toml::from_str(text)?;
        let defaults = Self::defaults();
        Ok(Self {
            node: NodeConfig {
                name: parsed.node.name,
                namespace: non_empty(parsed.node.namespace, defaults.node.namespace),
            },
            data_dir: if parsed.data_dir.as_os_str().is_empty() {
                defaults.data_dir
            } else {
                parsed.data_dir
            },
            log_level: non_empty(parsed.log_level, defaults.log_level),
            ..parsed
        })
    }

    /// Override fields from `EDGE_*` variables returned by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("EDGE_NODE_NAME") {
            self.node.name = v;
        }
        if let Some(v) = lookup("EDGE_NODE_NAMESPACE") {
            self.node.namespace = v;
        }
        if let Some(v) = lookup("EDGE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("EDGE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = lookup("EDGE_LINK_KIND") {
            self.link.kind = v.parse()?;
        }
        if let Some(v) = lookup("EDGE_LINK_ADDRESS") {
            self.link.address = v;
        }
        if let Some(v) = lookup("EDGE_REPORT_INTERVAL") {
            self.sync.report_interval_secs = v
                .parse()
                .with_context(|| format!("EDGE_REPORT_INTERVAL is not a number: {v}"))?;
        }
        Ok(())
    }

    fn resolve_prefix(&mut self, prefix: &Path) {
        if self.data_dir.is_relative() {
            self.data_dir = prefix.join(&self.data_dir);
        }
        for path in [&mut self.link.tls.ca, &mut self.link.tls.cert, &mut self.link.tls.key]
            .into_iter()
            .flatten()
        {
            if path.is_relative() {
                *path = prefix.join(&*path);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            bail!("node name is required (node.name or EDGE_NODE_NAME)");
        }
        if self.node.namespace.trim().is_empty() {
            bail!("node namespace must not be empty");
        }
        if self.link.backoff_factor < 1.0 {
            bail!("link.backoff_factor must be at least 1.0");
        }
        if self.link.backoff_min_ms > self.link.backoff_max_ms {
            bail!("link.backoff_min_ms must not exceed link.backoff_max_ms");
        }
        if self.link.mqtt.qos > 2 {
            bail!("link.mqtt.qos must be 0, 1 or 2");
        }
        if self.link.queue_capacity == 0 || self.sync.desire_queue == 0 || self.sync.device_queue == 0 {
            bail!("queue capacities must be positive");
        }
        Ok(())
    }

    /// Path of the SQLite state file.
    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }
}

fn non_empty(value: String, fallback: String) -> String {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [node]
            name = "edge-01"

            [link]
            kind = "http"
            address = "https://a.example.com,https://b.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.name, "edge-01");
        assert_eq!(config.node.namespace, "default");
        assert_eq!(config.link.kind, LinkKind::Http);
        assert_eq!(config.link.sync_path, "/v1/sync");
        assert_eq!(config.sync.report_interval_secs, 20);
        assert_eq!(config.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("EDGE_NODE_NAME", "n2"),
            ("EDGE_LINK_KIND", "ws"),
            ("EDGE_REPORT_INTERVAL", "5"),
        ]);
        let mut config = Config::from_toml("[node]\nname = \"n1\"\n[link]\nkind = \"http\"").unwrap();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.node.name, "n2");
        assert_eq!(config.link.kind, LinkKind::Ws);
        assert_eq!(config.sync.report_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let mut config = Config::defaults();
        let err = config
            .apply_env(|k| (k == "EDGE_LINK_KIND").then(|| "carrier-pigeon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_validate_requires_node_name() {
        assert!(Config::defaults().validate().is_err());
    }

    #[test]
    fn test_prefix_resolves_relative_paths() {
        let mut config = Config::from_toml(
            "data_dir = \"var/lib\"\n[node]\nname = \"n\"\n[link.tls]\ncert = \"certs/client.pem\"\nca = \"/etc/ca.pem\"",
        )
        .unwrap();
        config.resolve_prefix(Path::new("/opt/edge"));

        assert_eq!(config.data_dir, PathBuf::from("/opt/edge/var/lib"));
        assert_eq!(config.link.tls.cert, Some(PathBuf::from("/opt/edge/certs/client.pem")));
        assert_eq!(config.link.tls.ca, Some(PathBuf::from("/etc/ca.pem")));
        assert_eq!(config.state_path(), PathBuf::from("/opt/edge/var/lib/state.db"));
    }

    #[test]
    fn test_mqtt_section() {
        let config = Config::from_toml(
            r#"
            [node]
            name = "edge-01"

            [link]
            kind = "mqtt"
            address = "mqtts://broker.example.com:8883"

            [link.mqtt]
            qos = 1
            report_topic = "fleet/{name}/up"
            "#,
        )
        .unwrap();

        assert_eq!(config.link.kind, LinkKind::Mqtt);
        assert_eq!(config.link.mqtt.qos, 1);
        assert_eq!(config.link.mqtt.report_topic, "fleet/{name}/up");
        assert_eq!(config.link.mqtt.delta_topic, "$edge/{namespace}/{name}/delta");
        assert!(config.validate().is_ok());

        let mut bad = config;
        bad.link.mqtt.qos = 3;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_read_timeout_zero_disables() {
        let link = LinkConfig {
            read_timeout_secs: 0,
            ..LinkConfig::default()
        };
        assert_eq!(link.read_timeout(), None);
    }
}
