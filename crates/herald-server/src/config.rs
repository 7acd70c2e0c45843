//! Server configuration.
//!
//! Configuration is layered, lowest priority first:
//! - Built-in defaults
//! - TOML configuration file (`--config`, or the first of the default paths)
//! - Environment variables (`HERALD_*`, `__` between sections, e.g. `HERALD_TOKEN__SECRET`)
//!
//! `SSE_SECRET` is read as a fallback for the token key.

use anyhow::{ensure, Context, Result};
use herald_core::{ConnectionConfig, OverflowPolicy};
use herald_protocol::{SecretKey, DEFAULT_TOKEN_TTL_SECS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file locations, searched in order.
const CONFIG_PATHS: [&str; 3] = [
    "herald.toml",
    "/etc/herald/herald.toml",
    "~/.config/herald/herald.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL clients use to reach this server. Defaults to `http://host:port`.
    #[serde(default)]
    pub public_url: Option<String>,

    /// Token configuration.
    #[serde(default)]
    pub token: TokenConfig,

    /// Event stream configuration.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Subscribe-token issuing endpoint.
    #[serde(default)]
    pub issuer: IssuerConfig,

    /// CORS configuration.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Token configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Hex-encoded 32-byte key shared with publishers.
    #[serde(default)]
    pub secret: String,

    /// Token lifetime in seconds.
    #[serde(default = "default_token_ttl")]
    pub ttl_secs: u32,
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"[REDACTED]")
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

/// Event stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Outbound queue capacity per connection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// What to drop when a queue is full.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,

    /// Keep-alive comment interval in milliseconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of streaming connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum topics in one subscription.
    #[serde(default = "default_max_topics")]
    pub max_topics_per_subscription: usize,

    /// Maximum `/submit` body size in bytes.
    #[serde(default = "default_max_submission_bytes")]
    pub max_submission_bytes: usize,

    /// Maximum events in one submission.
    #[serde(default = "default_max_events")]
    pub max_events_per_submission: usize,

    /// Maximum data size of a single event in bytes.
    #[serde(default = "default_max_event_data_bytes")]
    pub max_event_data_bytes: usize,
}

/// Subscribe-token issuing configuration.
///
/// Who may mint tokens for which topics is a deployment decision, so the
/// endpoint is off unless enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Serve `GET /token` and `GET /subscribe`.
    #[serde(default)]
    pub enabled: bool,

    /// Topics tokens may be issued for. Empty allows any topic.
    #[serde(default)]
    pub allowed_topics: Vec<String>,
}

/// CORS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins. `"*"` allows any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_true() -> bool {
    true
}

fn default_token_ttl() -> u32 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_queue_capacity() -> usize {
    16
}

fn default_keepalive() -> u64 {
    15_000 // 15 seconds
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_topics() -> usize {
    100
}

fn default_max_submission_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_max_events() -> usize {
    1_000
}

fn default_max_event_data_bytes() -> usize {
    64 * 1024 // 64 KiB
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            token: TokenConfig::default(),
            stream: StreamConfig::default(),
            limits: LimitsConfig::default(),
            issuer: IssuerConfig::default(),
            cors: CorsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            ttl_secs: default_token_ttl(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            keepalive_ms: default_keepalive(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_topics_per_subscription: default_max_topics(),
            max_submission_bytes: default_max_submission_bytes(),
            max_events_per_submission: default_max_events(),
            max_event_data_bytes: default_max_event_data_bytes(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load and validate configuration.
    ///
    /// With `path`, that file must exist. Without it, the first existing
    /// default path is used, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be parsed, a value has the wrong
    /// type, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(
                    ::config::File::from(path)
                        .format(::config::FileFormat::Toml)
                        .required(true),
                );
            }
            None => {
                if let Some(found) = Self::find_default_file() {
                    builder = builder.add_source(
                        ::config::File::from(found).format(::config::FileFormat::Toml),
                    );
                }
            }
        }

        let mut config: Config = builder
            .add_source(
                ::config::Environment::with_prefix("HERALD")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        if config.token.secret.is_empty() {
            if let Ok(secret) = std::env::var("SSE_SECRET") {
                config.token.secret = secret;
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn find_default_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Check that the configuration can actually run a server.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.secret_key()?;
        self.bind_addr()?;
        ensure!(self.token.ttl_secs > 0, "token.ttl_secs must be greater than zero");
        ensure!(
            self.stream.queue_capacity > 0,
            "stream.queue_capacity must be greater than zero"
        );
        ensure!(
            self.stream.keepalive_ms > 0,
            "stream.keepalive_ms must be greater than zero"
        );
        Ok(())
    }

    /// Decode the shared token key.
    ///
    /// # Errors
    ///
    /// Returns an error if no key is configured or it is not 32 hex-encoded bytes.
    pub fn secret_key(&self) -> Result<SecretKey> {
        ensure!(
            !self.token.secret.is_empty(),
            "No token secret configured (set token.secret, HERALD_TOKEN__SECRET or SSE_SECRET)"
        );
        SecretKey::from_hex(&self.token.secret)
            .context("token.secret must be a hex-encoded 32-byte secret")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Base URL for links handed to clients, without a trailing slash.
    #[must_use]
    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// Keep-alive interval for event streams.
    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.stream.keepalive_ms)
    }

    /// Connection manager settings derived from this configuration.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            queue_capacity: self.stream.queue_capacity,
            overflow_policy: self.stream.overflow_policy,
            max_connections: self.limits.max_connections,
            max_topics: self.limits.max_topics_per_subscription,
        }
    }
}
