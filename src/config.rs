//! Configuration management for CabalWatch
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. It uses the `figment`
//! crate to layer defaults, a `cabalwatch.toml` file, environment variables
//! and command-line overrides.

use crate::cli::Cli;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, path::PathBuf, time::Duration};

/// The config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "cabalwatch.toml";

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    /// Directory holding the watchlist, profile and processed-URL ledger.
    pub data_dir: PathBuf,
    /// Configuration for the certificate stream connection.
    pub stream: StreamConfig,
    /// Configuration for DNS resolution.
    pub dns: DnsConfig,
    /// Configuration for domain classification.
    pub matching: MatchingConfig,
    /// Configuration for the fingerprint extractor.
    pub extraction: ExtractionConfig,
    /// Configuration for re-verifying matched sites.
    pub verification: VerificationConfig,
    /// Configuration for output and alerting.
    pub output: OutputConfig,
    /// Configuration for the metrics system.
    pub metrics: MetricsConfig,
}

/// Configuration for the certificate stream connection.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StreamConfig {
    /// The URL of the CertStream WebSocket server.
    pub certstream_url: String,
    /// Consecutive failed reconnect attempts before giving up.
    pub max_retries: u32,
    /// Interval between liveness pings while connected.
    pub heartbeat_interval_secs: u64,
    /// Silence after which the connection is considered dead.
    pub stall_timeout_secs: u64,
    /// How often the stall condition is checked.
    pub stall_check_interval_secs: u64,
    /// First reconnect delay; doubles on every consecutive failure.
    pub initial_backoff_ms: u64,
    /// Upper bound for the reconnect delay.
    pub max_backoff_secs: u64,
    /// Timeout for establishing the websocket connection.
    pub connect_timeout_secs: u64,
    /// Whether to accept invalid TLS certificates (for testing).
    pub allow_invalid_certs: bool,
}

impl StreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_interval_secs.max(1))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            certstream_url: "wss://certstream.calidog.io".to_string(),
            max_retries: 10,
            heartbeat_interval_secs: 30,
            stall_timeout_secs: 40,
            stall_check_interval_secs: 5,
            initial_backoff_ms: 1000,
            max_backoff_secs: 30,
            connect_timeout_secs: 15,
            allow_invalid_certs: false,
        }
    }
}

/// Configuration for DNS resolution.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DnsConfig {
    /// `ip:port` of a resolver to use instead of the system configuration.
    pub resolver: Option<String>,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Attempts per query made by the resolver itself.
    pub attempts: usize,
}

impl DnsConfig {
    /// Upper bound for one lookup as seen by the match pipeline.
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms * (self.attempts.max(1) as u64 + 1))
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            resolver: None,
            timeout_ms: 2000,
            attempts: 1,
        }
    }
}

/// Configuration for domain classification.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MatchingConfig {
    /// Domain suffixes that trigger a pattern match (e.g. ".fun").
    pub suffixes: Vec<String>,
    /// Additional regular expressions that trigger a pattern match.
    pub patterns: Vec<String>,
    /// YAML files with `- name: ... pattern: ...` entries.
    pub pattern_files: Vec<PathBuf>,
    /// Substrings that exclude a domain before classification.
    pub excluded: Vec<String>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            suffixes: [".fun", ".xyz", ".club", ".online", ".download"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            patterns: Vec::new(),
            pattern_files: Vec::new(),
            excluded: ["cloudflare.com", "google", "amazon.com"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Configuration for the fingerprint extractor.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ExtractionConfig {
    /// Timeout for the static HTTP fetch tier.
    pub static_timeout_secs: u64,
    /// User agent sent by the static fetch tier.
    pub user_agent: String,
    /// Timeout for the TLS issuer probe.
    pub tls_timeout_secs: u64,
    /// Remote headless-browser service. Tier 2 is skipped when absent.
    pub remote_browser: Option<RemoteBrowserConfig>,
    /// Locally launched headless browser. Tier 3 is skipped when absent.
    pub local_browser: Option<LocalBrowserConfig>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            static_timeout_secs: 15,
            user_agent: format!("cabalwatch/{}", env!("CARGO_PKG_VERSION")),
            tls_timeout_secs: 10,
            remote_browser: None,
            local_browser: None,
        }
    }
}

/// Configuration for the remote rendering tier.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RemoteBrowserConfig {
    /// Base URL of a browserless-compatible service.
    pub endpoint: String,
    /// API token appended as `?token=`.
    pub token: Option<String>,
    pub timeout_secs: u64,
}

/// Configuration for the local rendering tier.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LocalBrowserConfig {
    /// Path or name of a Chromium-compatible binary.
    pub binary: PathBuf,
    pub timeout_secs: u64,
}

/// Configuration for re-verifying matched sites.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct VerificationConfig {
    pub enabled: bool,
    /// Maximum number of verifications running at once.
    pub concurrency: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 4,
        }
    }
}

/// The format for stdout output.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    Json,
    #[default]
    PlainText,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "Json"),
            OutputFormat::PlainText => write!(f, "PlainText"),
        }
    }
}

/// Configuration for output and alerting.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct OutputConfig {
    /// The format to use for stdout output.
    pub format: OutputFormat,
    /// Configuration for Slack alerts.
    pub slack: Option<SlackConfig>,
}

/// Configuration for Slack alerts.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SlackConfig {
    /// The Slack incoming webhook URL.
    pub webhook_url: String,
}

/// Configuration for the metrics system.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetricsConfig {
    /// Whether to expose a Prometheus endpoint.
    pub enabled: bool,
    /// Address the Prometheus endpoint listens on.
    pub listen_address: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_address: SocketAddr::from(([127, 0, 0, 1], 9898)),
        }
    }
}

impl Config {
    /// Loads the application configuration by layering sources: defaults,
    /// the TOML file, environment variables, and CLI arguments.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::figment(config_path)
            .merge(cli)
            .extract()
            .context("Failed to load configuration")
    }

    /// Builds the figment without CLI overrides.
    pub fn figment(config_path: PathBuf) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            // e.g. CABALWATCH_STREAM__MAX_RETRIES=5
            .merge(Env::prefixed("CABALWATCH_").split("__"))
    }
}

// Provide a default implementation for tests and easy setup.
impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            data_dir: PathBuf::from("data"),
            stream: StreamConfig::default(),
            dns: DnsConfig::default(),
            matching: MatchingConfig::default(),
            extraction: ExtractionConfig::default(),
            verification: VerificationConfig::default(),
            output: OutputConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}
