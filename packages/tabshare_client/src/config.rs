use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

// Layered like the relay: defaults → client.toml → TABSHARE_* env vars
// (e.g. TABSHARE_RELAY__URL=ws://relay.example:3000/ws).

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub classifier: ClassifierFileConfig,
    #[serde(default)]
    pub store: StoreFileConfig,
}

/// Relay connection tunables (lives under `[relay]` in client.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_reconnect_cooldown_secs")]
    pub reconnect_cooldown_secs: u64,
    /// Liveness timeout the relay enforces; only used to sanity-check the
    /// heartbeat interval.
    #[serde(default = "default_relay_timeout_secs")]
    pub relay_timeout_secs: u64,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            reconnect_cooldown_secs: default_reconnect_cooldown_secs(),
            relay_timeout_secs: default_relay_timeout_secs(),
        }
    }
}

/// Classification service (lives under `[classifier]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassifierFileConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_classifier_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ClassifierFileConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_classifier_timeout_secs(),
        }
    }
}

/// Local durable state (lives under `[store]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreFileConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:3000/ws".to_string()
}
fn default_heartbeat_interval_secs() -> u64 {
    25
}
fn default_reconnect_backoff_secs() -> u64 {
    3
}
fn default_reconnect_cooldown_secs() -> u64 {
    2
}
fn default_relay_timeout_secs() -> u64 {
    300
}
fn default_classifier_timeout_secs() -> u64 {
    30
}

/// Default location of `client.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tabshare")
        .join("client.toml")
}

/// Default location of the local state document.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tabshare")
        .join("state.json")
}

pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("TABSHARE_").split("__"))
}

/// Relay client timings (runtime view).
#[derive(Clone, Debug)]
pub struct RelayClientConfig {
    pub url: String,
    pub heartbeat_interval: Duration,
    /// Delay before reconnecting after a close or error
    pub reconnect_backoff: Duration,
    /// Minimum spacing between connection attempts
    pub reconnect_cooldown: Duration,
}

impl RelayClientConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Self {
        let config = Self {
            url: fc.url.clone(),
            heartbeat_interval: Duration::from_secs(fc.heartbeat_interval_secs.max(1)),
            reconnect_backoff: Duration::from_secs(fc.reconnect_backoff_secs),
            reconnect_cooldown: Duration::from_secs(fc.reconnect_cooldown_secs),
        };
        if config.heartbeat_interval.as_secs() * 2 > fc.relay_timeout_secs {
            warn!(
                "heartbeat interval {:?} is not well below the relay liveness timeout ({}s)",
                config.heartbeat_interval, fc.relay_timeout_secs
            );
        }
        config
    }
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self::from_file(&RelayFileConfig::default())
    }
}

/// Classifier settings (runtime view).
#[derive(Clone, Debug)]
pub struct ClassifierConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl ClassifierConfig {
    pub fn from_file(fc: &ClassifierFileConfig) -> Self {
        Self {
            endpoint: fc.endpoint.clone(),
            api_key: fc.api_key.clone().filter(|k| !k.trim().is_empty()),
            timeout: Duration::from_secs(fc.timeout_secs.max(1)),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub relay: RelayClientConfig,
    pub classifier: ClassifierConfig,
    pub store_path: PathBuf,
}

impl ClientConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            relay: RelayClientConfig::from_file(&fc.relay),
            classifier: ClassifierConfig::from_file(&fc.classifier),
            store_path: fc.store.path.clone().unwrap_or_else(default_store_path),
        }
    }

    pub fn load(config_path: &Path) -> Result<Self> {
        let file: FileConfig = load_config(config_path)
            .extract()
            .context("failed to parse client configuration")?;
        Ok(Self::from_file(&file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_file(&FileConfig::default());
        assert_eq!(config.relay.url, "ws://127.0.0.1:3000/ws");
        assert_eq!(config.relay.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(config.relay.reconnect_backoff, Duration::from_secs(3));
        assert_eq!(config.relay.reconnect_cooldown, Duration::from_secs(2));
        assert_eq!(config.classifier.timeout, Duration::from_secs(30));
        assert!(config.classifier.endpoint.is_none());
    }

    #[test]
    fn test_blank_api_key_is_absent() {
        let fc = ClassifierFileConfig {
            api_key: Some("   ".into()),
            ..Default::default()
        };
        assert!(ClassifierConfig::from_file(&fc).api_key.is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(
            &path,
            "[relay]\nurl = \"ws://relay.test:9/ws\"\n\n[store]\npath = \"/tmp/tabs.json\"\n",
        )
        .unwrap();
        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.relay.url, "ws://relay.test:9/ws");
        assert_eq!(config.store_path, PathBuf::from("/tmp/tabs.json"));
    }
}
