//! Configuration for stateplane components

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service management (orchestrator) settings
    #[serde(default)]
    pub manage: ManageConfig,

    /// Per-node agent settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manage: ManageConfig::default(),
            agent: AgentConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from `stateplane.toml` (optional) and `STATEPLANE__*` env vars
    pub fn load() -> crate::Result<Self> {
        Self::build(config::File::with_name("stateplane").required(false))
    }

    /// Load from an explicit file, still honouring env overrides
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        Self::build(config::File::from(path.as_ref()).required(true))
    }

    fn build<S>(file: S) -> crate::Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let cfg: Config = config::Config::builder()
            .add_source(file)
            .add_source(config::Environment::with_prefix("STATEPLANE").separator("__"))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.manage.max_retry_count == 0 {
            return Err(crate::Error::InvalidConfig(
                "manage.max_retry_count must be > 0".into(),
            ));
        }
        if self.agent.max_claim_attempts == 0 {
            return Err(crate::Error::InvalidConfig(
                "agent.max_claim_attempts must be > 0".into(),
            ));
        }
        if self.agent.fs_type.is_empty() || self.agent.mkfs_command.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "agent.fs_type and agent.mkfs_command are required".into(),
            ));
        }
        for (name, poll) in [
            ("manage.volume_create_poll", &self.manage.volume_create_poll),
            ("agent.volume_poll", &self.agent.volume_poll),
            ("agent.dns_poll", &self.agent.dns_poll),
        ] {
            if poll.max_attempts == 0 {
                return Err(crate::Error::InvalidConfig(format!(
                    "{}.max_attempts must be > 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Bound for a wait loop: fixed sleep between checks, fixed number of checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const fn new(interval_ms: u64, max_attempts: u32) -> Self {
        Self {
            interval_ms,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Total time the loop is allowed to run
    pub fn timeout(&self) -> Duration {
        self.interval() * self.max_attempts
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManageConfig {
    /// Create-if-absent retries for devices and static IP assignment
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,

    /// Wait for newly created volumes to become available
    #[serde(default = "default_volume_poll")]
    pub volume_create_poll: PollPolicy,
}

fn default_max_retry_count() -> u32 {
    3
}
fn default_volume_poll() -> PollPolicy {
    PollPolicy::new(2000, 10)
}

impl Default for ManageConfig {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
            volume_create_poll: default_volume_poll(),
        }
    }
}

/// Per-node agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Root directory for service mount points
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,

    #[serde(default = "default_fs_type")]
    pub fs_type: String,

    #[serde(default = "default_mkfs_command")]
    pub mkfs_command: String,

    #[serde(default = "default_mount_options")]
    pub mount_options: String,

    /// Interface that carries static IPs
    #[serde(default = "default_network_interface")]
    pub network_interface: String,

    /// Attach/detach state polling
    #[serde(default = "default_volume_poll")]
    pub volume_poll: PollPolicy,

    /// DNS propagation wait (90s by default)
    #[serde(default = "default_dns_poll")]
    pub dns_poll: PollPolicy,

    /// Selection rounds before giving up on a contended service
    #[serde(default = "default_max_claim_attempts")]
    pub max_claim_attempts: u32,
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/mnt/stateplane")
}
fn default_fs_type() -> String {
    "xfs".to_string()
}
fn default_mkfs_command() -> String {
    "mkfs.xfs".to_string()
}
fn default_mount_options() -> String {
    "discard,defaults".to_string()
}
fn default_network_interface() -> String {
    "eth0".to_string()
}
fn default_dns_poll() -> PollPolicy {
    PollPolicy::new(3000, 30)
}
fn default_max_claim_attempts() -> u32 {
    3
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mount_root: default_mount_root(),
            fs_type: default_fs_type(),
            mkfs_command: default_mkfs_command(),
            mount_options: default_mount_options(),
            network_interface: default_network_interface(),
            volume_poll: default_volume_poll(),
            dns_poll: default_dns_poll(),
            max_claim_attempts: default_max_claim_attempts(),
        }
    }
}
