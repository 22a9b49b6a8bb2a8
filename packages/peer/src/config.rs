use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use peer_relay::ManagerConfig;
use peer_relay::history::DEFAULT_FETCH_BATCH;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [relay]
//                    presence_timeout_ms = 500
//
//   env var:         PEER_RELAY__PRESENCE_TIMEOUT_MS=500   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub queue: QueueFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Pub/sub session tunables (lives under `[relay]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    #[serde(default = "default_presence_timeout_ms")]
    pub presence_timeout_ms: u64,
    #[serde(default = "default_max_write_failures")]
    pub max_write_failures: u32,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            bus_capacity: default_bus_capacity(),
            presence_timeout_ms: default_presence_timeout_ms(),
            max_write_failures: default_max_write_failures(),
        }
    }
}

/// Polling chat queue tunables (lives under `[queue]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueFileConfig {
    #[serde(default = "default_queue_enabled")]
    pub enabled: bool,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_chat_capacity")]
    pub chat_capacity: usize,
    #[serde(default = "default_fetch_batch")]
    pub fetch_batch: usize,
}

impl Default for QueueFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_queue_enabled(),
            scan_interval_ms: default_scan_interval_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            chat_capacity: default_chat_capacity(),
            fetch_batch: default_fetch_batch(),
        }
    }
}

fn default_outbound_capacity() -> usize {
    100
}
fn default_bus_capacity() -> usize {
    256
}
fn default_presence_timeout_ms() -> u64 {
    2000
}
fn default_max_write_failures() -> u32 {
    8
}
fn default_queue_enabled() -> bool {
    true
}
fn default_scan_interval_ms() -> u64 {
    250
}
fn default_fetch_timeout_ms() -> u64 {
    1000
}
fn default_chat_capacity() -> usize {
    64
}
fn default_fetch_batch() -> usize {
    DEFAULT_FETCH_BATCH
}

/// Build a figment that layers: defaults → config.toml → PEER_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PEER_SERVER__PORT=9000`  →  `server.port = 9000`
///   `PEER_QUEUE__ENABLED=false`  →  `queue.enabled = false`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("PEER_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Server configuration for runtime behavior.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub relay: RelayConfig,
    pub queue: QueueConfig,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Capacity of each connection's outbound notification channel
    pub outbound_capacity: usize,
    /// Per-channel buffer of the in-process message bus
    pub bus_capacity: usize,
    /// Bound on presence store calls made while a peer connects
    pub presence_timeout: Duration,
    /// Consecutive socket write failures before the writer gives up
    pub max_write_failures: u32,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub enabled: bool,
    pub scan_interval: Duration,
    pub fetch_timeout: Duration,
    /// Capacity of chat send queues and peer outbound queues
    pub chat_capacity: usize,
    /// Maximum messages returned per history fetch
    pub fetch_batch: usize,
}

impl QueueConfig {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            scan_interval: self.scan_interval,
            fetch_timeout: self.fetch_timeout,
        }
    }
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            relay: RelayConfig {
                outbound_capacity: fc.relay.outbound_capacity.max(1),
                bus_capacity: fc.relay.bus_capacity.max(1),
                presence_timeout: Duration::from_millis(fc.relay.presence_timeout_ms.max(1)),
                max_write_failures: fc.relay.max_write_failures.max(1),
            },
            queue: QueueConfig {
                enabled: fc.queue.enabled,
                scan_interval: Duration::from_millis(fc.queue.scan_interval_ms.max(1)),
                fetch_timeout: Duration::from_millis(fc.queue.fetch_timeout_ms.max(1)),
                chat_capacity: fc.queue.chat_capacity.max(1),
                fetch_batch: fc.queue.fetch_batch.max(1),
            },
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl PeerConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::data_local_dir()
                .or_else(dirs::home_dir)
                .context("Could not find a data or home directory")?
                .join("peer"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("peer.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_relay_file_config_defaults() {
        let d = RelayFileConfig::default();
        assert_eq!(d.outbound_capacity, 100);
        assert_eq!(d.bus_capacity, 256);
        assert_eq!(d.presence_timeout_ms, 2000);
        assert_eq!(d.max_write_failures, 8);
    }

    #[test]
    fn test_queue_file_config_defaults() {
        let d = QueueFileConfig::default();
        assert!(d.enabled);
        assert_eq!(d.scan_interval_ms, 250);
        assert_eq!(d.fetch_timeout_ms, 1000);
        assert_eq!(d.chat_capacity, 64);
        assert_eq!(d.fetch_batch, 200);
    }

    // ── ServerConfig::from_file ─────────────────────────────────────────

    #[test]
    fn test_server_config_from_file_defaults() {
        let sc = ServerConfig::default();
        assert_eq!(sc.relay.presence_timeout, Duration::from_secs(2));
        assert_eq!(sc.queue.scan_interval, Duration::from_millis(250));
        let mc = sc.queue.manager_config();
        assert_eq!(mc.fetch_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_server_config_clamps_zero_capacities() {
        let fc = FileConfig {
            relay: RelayFileConfig {
                outbound_capacity: 0,
                max_write_failures: 0,
                presence_timeout_ms: 0,
                ..Default::default()
            },
            queue: QueueFileConfig {
                scan_interval_ms: 0,
                fetch_timeout_ms: 0,
                chat_capacity: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let sc = ServerConfig::from_file(&fc);
        assert_eq!(sc.relay.outbound_capacity, 1);
        assert_eq!(sc.relay.max_write_failures, 1);
        assert_eq!(sc.queue.chat_capacity, 1);
        // tokio::time::interval panics on a zero period
        assert!(!sc.queue.scan_interval.is_zero());
        assert!(!sc.relay.presence_timeout.is_zero());
        assert!(!sc.queue.fetch_timeout.is_zero());
    }

    // ── PeerConfig ──────────────────────────────────────────────────────

    #[test]
    fn test_peer_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("nested/data");
        let config = PeerConfig::new(Some(nested.clone())).unwrap();

        assert_eq!(config.data_dir, nested);
        assert_eq!(config.db_path, nested.join("peer.db"));
        assert!(nested.exists());
        assert_eq!(config.config_toml_path(), nested.join("config.toml"));
    }

    #[test]
    fn test_db_url() {
        let tmp = tempfile::tempdir().unwrap();
        let config = PeerConfig::new(Some(tmp.path().to_path_buf())).unwrap();
        let url = config.db_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.contains("peer.db"));
        assert!(url.ends_with("?mode=rwc"));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert!(fc.server.host.is_none());
        assert!(fc.server.port.is_none());
        assert!(fc.queue.enabled);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[server]\nhost = \"0.0.0.0\"\nport = 9100\n\n[relay]\npresence_timeout_ms = 500\n\n[queue]\nenabled = false\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(fc.server.port, Some(9100));
        assert_eq!(fc.relay.presence_timeout_ms, 500);
        // untouched keys keep their defaults
        assert_eq!(fc.relay.bus_capacity, 256);
        assert!(!fc.queue.enabled);
    }

    #[test]
    fn test_load_config_partial_section() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("config.toml"), "[queue]\nfetch_batch = 10\n").unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.queue.fetch_batch, 10);
        assert_eq!(fc.queue.scan_interval_ms, 250);
    }
}
