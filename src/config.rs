//! # Relay Configuration
//!
//! Plain scalar settings for broker and client, stored as TOML. Every field has a
//! default, so a partial file (or none at all) is a valid configuration.
//!
//! Default location: `~/.config/mqtt-relay/relay.toml`.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::registry::DuplicateClientPolicy;
use crate::client::queue::OverflowPolicy;
use crate::client::state::ReconnectPolicy;
use crate::protocol::{QoS, DEFAULT_MAX_FRAME_SIZE};

const CONFIG_DIR: &str = ".config/mqtt-relay";
const CONFIG_FILE: &str = "relay.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub client: ClientConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the broker listens on
    pub listen: String,
    pub duplicate_client_policy: DuplicateClientPolicy,
    /// Client ids the deny-list validator refuses
    pub blocked_client_ids: Vec<String>,
    /// Per-connection outbound queue length
    pub outbound_capacity: usize,
    pub max_frame_size: usize,
    /// Deadline for the CONNECT frame after the transport is accepted
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:707".to_string(),
            duplicate_client_policy: DuplicateClientPolicy::EvictExisting,
            blocked_client_ids: Vec::new(),
            outbound_capacity: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub clean_session: bool,
    pub reconnect_delay_secs: u64,
    /// Enables exponential backoff up to this delay
    pub max_reconnect_delay_secs: Option<u64>,
    /// Gives up after this many consecutive failed attempts
    pub max_reconnect_attempts: Option<u32>,
    pub connect_timeout_ms: u64,
    pub publish_period_ms: u64,
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    /// Bound for the pending-publish queue; unbounded when absent
    pub max_queue_len: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    /// Filters (re-)subscribed after every successful connect
    pub subscriptions: Vec<String>,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: "Test.ClientId".to_string(),
            host: "localhost".to_string(),
            port: 707,
            clean_session: true,
            reconnect_delay_secs: 60,
            max_reconnect_delay_secs: None,
            max_reconnect_attempts: None,
            connect_timeout_ms: 5000,
            publish_period_ms: 2000,
            topic: "Test.ClientId/topic/json".to_string(),
            qos: QoS::AtMostOnce,
            retain: false,
            max_queue_len: None,
            overflow_policy: OverflowPolicy::RejectNewest,
            subscriptions: Vec::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_secs(self.reconnect_delay_secs.max(1)),
            max_delay: self.max_reconnect_delay_secs.map(Duration::from_secs),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_period(&self) -> Duration {
        Duration::from_millis(self.publish_period_ms.max(1))
    }
}

impl RelayConfig {
    /// `~/.config/mqtt-relay/relay.toml`
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse relay config: {}", e))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| eyre!("Failed to serialize relay config: {}", e))
    }

    /// Loads the config from `path`, or from the default location
    ///
    /// A missing file yields the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            warn!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        tokio::fs::write(path, self.to_toml()?)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        info!("Config saved to {}", path.display());
        Ok(())
    }

    /// Writes the default config if nothing exists at `path` yet
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(());
        }
        info!("Creating default configuration at {}", path.display());
        Self::default().save(path).await
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
