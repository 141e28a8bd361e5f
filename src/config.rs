//! Huddle Configuration
//!
//! Configuration structures for the matchmaker and for session clients.
//! All protocol timings live here rather than in constants so they can be
//! tuned per deployment and shrunk in tests.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::ClientId;

/// Main Huddle configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HuddleConfig {
    /// Client-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Matchmaker (session registry) configuration
    #[serde(default)]
    pub matchmaker: MatchmakerConfig,

    /// Heartbeat and election timing
    #[serde(default)]
    pub session: SessionConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Client identifier (generated when absent)
    #[serde(default)]
    pub id: Option<String>,

    /// Address to bind for session traffic
    #[serde(default = "default_node_bind")]
    pub bind_address: String,

    /// Advertised address for the matchmaker and peers to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Delay between registration attempts while the matchmaker is unreachable
    #[serde(default = "default_register_retry_ms")]
    pub register_retry_ms: u64,

    /// Maximum registration attempts
    #[serde(default = "default_register_attempts")]
    pub register_attempts: u32,
}

/// When the first formation window starts counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAnchor {
    /// Window opens when the matchmaker starts
    Startup,
    /// Window opens on the first registration into an empty pool
    FirstRegistration,
}

/// How a closed window's pending pool is split into sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPolicy {
    /// Every pending client joins one session
    AllPending,
    /// Chunks of `max_session_size`, in registration order
    FixedSize,
}

/// What happens to registrations that miss a formation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateRegistration {
    /// Windows recur; late clients wait for the next one
    Defer,
    /// The matchmaker closes after its first formation and rejects late clients
    Reject,
}

/// Matchmaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchmakerConfig {
    /// Matchmaker address clients register with
    #[serde(default = "default_matchmaker_address")]
    pub address: String,

    /// Address the matchmaker binds when running
    #[serde(default = "default_matchmaker_bind")]
    pub bind_address: String,

    /// Formation window in milliseconds
    #[serde(default = "default_formation_window_ms")]
    pub formation_window_ms: u64,

    /// When the first window starts counting
    #[serde(default = "default_window_anchor")]
    pub window_anchor: WindowAnchor,

    /// Fewest clients a session may start with
    #[serde(default = "default_min_session_size")]
    pub min_session_size: usize,

    /// Largest session; a full pool forms immediately
    #[serde(default)]
    pub max_session_size: Option<usize>,

    /// Partitioning policy
    #[serde(default = "default_partition")]
    pub partition: PartitionPolicy,

    /// Late registration policy
    #[serde(default = "default_late_registration")]
    pub late_registration: LateRegistration,
}

/// Heartbeat and election timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Leader heartbeat interval (I) in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Leader timeout as a multiple of the heartbeat interval (k)
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: u32,

    /// How long to wait for a presumptive successor's first heartbeat
    /// (defaults to twice the leader timeout)
    #[serde(default)]
    pub grace_ms: Option<u64>,

    /// Timer loop resolution (defaults to a fifth of the heartbeat interval)
    #[serde(default)]
    pub tick_ms: Option<u64>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_node_bind() -> String {
    "127.0.0.1:7700".to_string()
}

fn default_register_retry_ms() -> u64 {
    1000
}

fn default_register_attempts() -> u32 {
    30
}

fn default_matchmaker_address() -> String {
    "127.0.0.1:4421".to_string()
}

fn default_matchmaker_bind() -> String {
    "0.0.0.0:4421".to_string()
}

fn default_formation_window_ms() -> u64 {
    10_000
}

fn default_window_anchor() -> WindowAnchor {
    WindowAnchor::Startup
}

fn default_min_session_size() -> usize {
    2
}

fn default_partition() -> PartitionPolicy {
    PartitionPolicy::AllPending
}

fn default_late_registration() -> LateRegistration {
    LateRegistration::Defer
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_timeout_multiplier() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            bind_address: default_node_bind(),
            advertise_address: None,
            register_retry_ms: default_register_retry_ms(),
            register_attempts: default_register_attempts(),
        }
    }
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            address: default_matchmaker_address(),
            bind_address: default_matchmaker_bind(),
            formation_window_ms: default_formation_window_ms(),
            window_anchor: default_window_anchor(),
            min_session_size: default_min_session_size(),
            max_session_size: None,
            partition: default_partition(),
            late_registration: default_late_registration(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            timeout_multiplier: default_timeout_multiplier(),
            grace_ms: None,
            tick_ms: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SessionConfig {
    /// Heartbeat interval (I)
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Leader timeout (k × I)
    pub fn leader_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.timeout_multiplier
    }

    /// Successor grace period
    pub fn grace(&self) -> Duration {
        match self.grace_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.leader_timeout() * 2,
        }
    }

    /// Timer loop resolution
    pub fn tick(&self) -> Duration {
        match self.tick_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis((self.heartbeat_interval_ms / 5).max(10)),
        }
    }

    /// Validate timing values
    pub fn validate(&self) -> crate::Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config("session.heartbeat_interval_ms must be positive".into()));
        }
        if self.timeout_multiplier < 2 {
            return Err(crate::Error::Config(format!(
                "session.timeout_multiplier must be at least 2 (got {})",
                self.timeout_multiplier
            )));
        }
        if self.grace_ms == Some(0) || self.tick_ms == Some(0) {
            return Err(crate::Error::Config("session.grace_ms and session.tick_ms must be positive".into()));
        }
        Ok(())
    }
}

impl MatchmakerConfig {
    /// Formation window as Duration
    pub fn formation_window(&self) -> Duration {
        Duration::from_millis(self.formation_window_ms)
    }

    /// Validate matchmaker values
    pub fn validate(&self) -> crate::Result<()> {
        if self.formation_window_ms == 0 {
            return Err(crate::Error::Config("matchmaker.formation_window_ms must be positive".into()));
        }
        if self.min_session_size == 0 {
            return Err(crate::Error::Config("matchmaker.min_session_size must be at least 1".into()));
        }
        if let Some(max) = self.max_session_size {
            if max < self.min_session_size {
                return Err(crate::Error::Config(format!(
                    "matchmaker.max_session_size ({}) is below min_session_size ({})",
                    max, self.min_session_size
                )));
            }
        }
        if self.partition == PartitionPolicy::FixedSize && self.max_session_size.is_none() {
            return Err(crate::Error::Config(
                "matchmaker.partition = \"fixed_size\" requires max_session_size".into(),
            ));
        }
        Ok(())
    }
}

impl HuddleConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: HuddleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if matches!(self.node.id.as_deref(), Some("")) {
            return Err(crate::Error::Config("node.id cannot be empty when set".into()));
        }

        if self.matchmaker.address.is_empty() {
            return Err(crate::Error::Config("matchmaker.address cannot be empty".into()));
        }

        self.matchmaker.validate()?;
        self.session.validate()?;

        Ok(())
    }

    /// Resolve this client's identifier, generating one if none is configured
    pub fn client_id(&self) -> ClientId {
        match &self.node.id {
            Some(id) => ClientId::new(id.clone()),
            None => ClientId::generate(),
        }
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Delay between registration attempts
    pub fn register_retry(&self) -> Duration {
        Duration::from_millis(self.node.register_retry_ms)
    }
}
