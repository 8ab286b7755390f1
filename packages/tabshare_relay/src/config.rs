use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

// Layered: built-in defaults, then relay.toml, then TABSHARE_* env vars.
//
//   relay.toml:  [liveness]
//                connection_timeout_secs = 120
//   env var:     TABSHARE_LIVENESS__CONNECTION_TIMEOUT_SECS=120
//
// CLI flags (--host, --port) override all of these.

/// Everything `relay.toml` may set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub groups: GroupsFileConfig,
    #[serde(default)]
    pub liveness: LivenessFileConfig,
}

/// Listener knobs (lives under `[server]` in relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-connection outbound queue depth before sends are dropped.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// Group state limits (lives under `[groups]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupsFileConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for GroupsFileConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

/// Sweeper timings (lives under `[liveness]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LivenessFileConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_group_grace_secs")]
    pub group_grace_secs: u64,
}

impl Default for LivenessFileConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            connection_timeout_secs: default_connection_timeout_secs(),
            group_grace_secs: default_group_grace_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_outbound_queue() -> usize {
    256
}
fn default_history_capacity() -> usize {
    100
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_connection_timeout_secs() -> u64 {
    300
}
fn default_group_grace_secs() -> u64 {
    3600
}

/// Default location of `relay.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tabshare")
        .join("relay.toml")
}

/// Build a figment that layers: defaults → relay.toml → TABSHARE_* env vars.
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("TABSHARE_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the relay)
// =============================================================================

/// Liveness timings (runtime view).
#[derive(Clone, Debug)]
pub struct LivenessConfig {
    /// How often the sweeper runs
    pub sweep_interval: Duration,
    /// Silence after which a connection is presumed dead
    pub connection_timeout: Duration,
    /// Minimum age before an empty group is reclaimed
    pub group_grace: Duration,
}

impl LivenessConfig {
    pub fn from_file(fc: &LivenessFileConfig) -> Self {
        Self {
            sweep_interval: Duration::from_secs(fc.sweep_interval_secs),
            connection_timeout: Duration::from_secs(fc.connection_timeout_secs),
            group_grace: Duration::from_secs(fc.group_grace_secs),
        }
    }

    /// Log a warning for each timing relation that does not hold.
    ///
    /// The values stay tunable; a misordered set is reported, not rejected.
    pub fn check_ordering(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.sweep_interval >= self.connection_timeout {
            problems.push(format!(
                "sweep interval ({:?}) should be shorter than the connection timeout ({:?})",
                self.sweep_interval, self.connection_timeout
            ));
        }
        if self.connection_timeout >= self.group_grace {
            problems.push(format!(
                "connection timeout ({:?}) should be shorter than the group grace period ({:?})",
                self.connection_timeout, self.group_grace
            ));
        }
        for problem in &problems {
            warn!("{}", problem);
        }
        problems
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self::from_file(&LivenessFileConfig::default())
    }
}

/// Relay configuration (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    pub outbound_queue: usize,
    pub history_capacity: usize,
    pub liveness: LivenessConfig,
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let bind_addr: SocketAddr = format!("{}:{}", fc.server.host, fc.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid listen address {}:{}",
                    fc.server.host, fc.server.port
                )
            })?;
        Ok(Self {
            bind_addr,
            outbound_queue: fc.server.outbound_queue.max(1),
            history_capacity: fc.groups.history_capacity.max(1),
            liveness: LivenessConfig::from_file(&fc.liveness),
        })
    }

    /// Load from the layered figment and resolve.
    pub fn load(config_path: &Path) -> Result<Self> {
        let file: FileConfig = load_config(config_path)
            .extract()
            .context("failed to parse relay configuration")?;
        Self::from_file(&file)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([127, 0, 0, 1], default_port()).into(),
            outbound_queue: default_outbound_queue(),
            history_capacity: default_history_capacity(),
            liveness: LivenessConfig::default(),
        }
    }
}
