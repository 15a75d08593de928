//! Configuration module with TOML parsing and hot-reload support
//!
//! Every section is optional; missing values fall back to the defaults below.
//! The active configuration is swapped atomically on reload and listeners are
//! notified over a channel so running services can pick up new quotas and
//! thresholds without a restart.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::rules::RateRule;
use crate::suspicious::SuspiciousConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Listener configuration
    pub server: ServerConfig,
    /// Fixed-window rate limiting
    pub rate_limiting: RateLimitConfig,
    /// Suspicious activity thresholds
    pub suspicious: SuspiciousConfig,
    /// Durable state location
    pub storage: StorageConfig,
    /// Abusive content detection
    pub abuse: AbuseConfig,
    /// Admin surface
    pub admin: AdminConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind_address: String,
    /// TCP port
    pub port: u16,
    /// Proxies whose X-Forwarded-For header is trusted (CIDR or bare address)
    pub trusted_proxies: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            trusted_proxies: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Get the full socket address
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per window for endpoints without a rule
    pub default_max_requests: u32,
    /// Window length for endpoints without a rule (milliseconds)
    pub default_window_ms: u64,
    /// Expired-record sweep interval (seconds)
    pub cleanup_interval_secs: u64,
    /// Rules applied at startup (endpoint -> rule)
    pub rules: HashMap<String, RateRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_max_requests: 100,
            default_window_ms: 15 * 60 * 1000,
            cleanup_interval_secs: 60,
            rules: HashMap::from([(
                "/api/submit".to_string(),
                RateRule {
                    max_requests: 5,
                    window_ms: 10_000,
                },
            )]),
        }
    }
}

impl RateLimitConfig {
    /// Process-wide fallback rule
    pub fn default_rule(&self) -> RateRule {
        RateRule {
            max_requests: self.default_max_requests,
            window_ms: self.default_window_ms,
        }
    }
}

/// Durable state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the JSON tables
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl StorageConfig {
    pub const RULES_FILE: &'static str = "rate-rules.json";
    pub const FAILURES_FILE: &'static str = "failures.json";
    pub const FLAGS_FILE: &'static str = "suspicious.json";
    pub const BLOCKS_FILE: &'static str = "blocked.json";
}

/// Abusive content detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseConfig {
    /// Enable the content check
    pub enabled: bool,
    /// Case-insensitive substrings that mark content as abusive
    pub words: Vec<String>,
    /// Additional regex patterns
    pub patterns: Vec<String>,
    /// Maximum body bytes buffered for inspection
    pub max_body_scan_bytes: usize,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            words: ["abuse", "hate", "spam", "fuck", "shit", "asshole"]
                .iter()
                .map(|w| (*w).to_string())
                .collect(),
            patterns: vec![r"(?i)spam+".to_string(), r"(?i)hate".to_string()],
            max_body_scan_bytes: 1024 * 1024,
        }
    }
}

/// Admin surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Path prefix exempt from the block gate
    pub path_prefix: String,
    /// Bearer token required for admin endpoints (None = no token check)
    pub auth_token: Option<String>,
    /// Allowed IP addresses for admin endpoints (empty = any)
    pub allowed_ips: Vec<String>,
    /// Shared secret for the emergency unblock endpoint (None = disabled)
    pub unblock_secret: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            path_prefix: "/admin/".to_string(),
            auth_token: None,
            allowed_ips: vec!["127.0.0.1".to_string(), "::1".to_string()],
            unblock_secret: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: json or text
    pub format: String,
    /// Audit log file path (None = write to stderr)
    pub audit_log_path: Option<PathBuf>,
    /// Enable structured audit logging
    pub audit_log_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            audit_log_path: None,
            audit_log_enabled: true,
        }
    }
}

impl AdmissionConfig {
    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse configuration: {}", e))?;
        Ok(config)
    }

    /// Trusted proxy networks
    pub fn trusted_proxies(&self) -> Vec<IpNet> {
        crate::client_key::parse_trusted_proxies(&self.server.trusted_proxies)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server
            .socket_addr()
            .map_err(|e| anyhow::anyhow!("Invalid server bind address: {}", e))?;

        let parsed = self.trusted_proxies();
        if parsed.len() != self.server.trusted_proxies.len() {
            return Err(anyhow::anyhow!(
                "server.trusted_proxies contains an entry that is neither a CIDR nor an IP address"
            ));
        }

        if self.rate_limiting.default_max_requests == 0 {
            return Err(anyhow::anyhow!(
                "rate_limiting.default_max_requests must be greater than 0"
            ));
        }
        if self.rate_limiting.default_window_ms == 0 {
            return Err(anyhow::anyhow!(
                "rate_limiting.default_window_ms must be greater than 0"
            ));
        }
        if self.rate_limiting.cleanup_interval_secs == 0 {
            return Err(anyhow::anyhow!(
                "rate_limiting.cleanup_interval_secs must be greater than 0"
            ));
        }
        for (endpoint, rule) in &self.rate_limiting.rules {
            if rule.max_requests == 0 || rule.window_ms == 0 {
                return Err(anyhow::anyhow!(
                    "rate_limiting.rules.{:?}: max_requests and window_ms must be greater than 0",
                    endpoint
                ));
            }
        }

        self.suspicious.validate()?;

        if !self.admin.path_prefix.starts_with('/') {
            return Err(anyhow::anyhow!(
                "admin.path_prefix must start with '/' (got {:?})",
                self.admin.path_prefix
            ));
        }
        if self.admin.path_prefix.trim_matches('/').is_empty() {
            return Err(anyhow::anyhow!(
                "admin.path_prefix must name a path segment, not the root"
            ));
        }
        if self.admin.auth_token.is_none() {
            warn!("admin.auth_token is not set; admin endpoints rely on the IP allow-list only");
        }
        if matches!(self.admin.unblock_secret.as_deref(), Some(s) if s.len() < 16) {
            warn!("admin.unblock_secret is shorter than 16 characters");
        }

        for pattern in &self.abuse.patterns {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("Invalid abuse pattern {:?}: {}", pattern, e))?;
        }

        Ok(())
    }
}

/// Events emitted on configuration changes
#[derive(Debug, Clone)]
pub enum ConfigReloadEvent {
    /// Full configuration reload
    ConfigReloaded(Arc<AdmissionConfig>),
    /// Reload failed with error
    ReloadFailed(String),
}

/// Configuration container with hot-reload support
pub struct ConfigManager {
    /// Current active configuration (atomic swap for hot-reload)
    config: Arc<ArcSwap<AdmissionConfig>>,
    /// File watcher for hot-reload
    watcher: RwLock<Option<RecommendedWatcher>>,
    /// Channel to notify config changes
    reload_tx: mpsc::Sender<ConfigReloadEvent>,
    /// Configuration file path (None = built-in defaults)
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Create a configuration manager and load the initial config.
    ///
    /// A missing file is not an error: defaults are used and nothing is watched.
    pub fn new(
        config_path: impl AsRef<Path>,
    ) -> anyhow::Result<(Self, mpsc::Receiver<ConfigReloadEvent>)> {
        let path = config_path.as_ref().to_path_buf();
        let (reload_tx, reload_rx) = mpsc::channel(16);

        let (config, config_path) = if path.exists() {
            let config = Self::load_config(&path)?;
            info!("Configuration loaded from {:?}", path);
            (config, Some(path))
        } else {
            warn!("Configuration file {:?} not found, using defaults", path);
            let config = AdmissionConfig::default();
            config.validate()?;
            (config, None)
        };

        let manager = Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            watcher: RwLock::new(None),
            reload_tx,
            config_path,
        };

        Ok((manager, reload_rx))
    }

    /// Load configuration from TOML file
    fn load_config(path: &Path) -> anyhow::Result<AdmissionConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;

        let config: AdmissionConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", path, e))?;

        config.validate()?;

        Ok(config)
    }

    /// Get current configuration
    pub fn get(&self) -> Arc<AdmissionConfig> {
        self.config.load_full()
    }

    /// Replace the active configuration (CLI overrides)
    pub fn set(&self, config: AdmissionConfig) {
        self.config.store(Arc::new(config));
    }

    /// Manually reload configuration
    pub async fn reload(&self) -> anyhow::Result<()> {
        let Some(path) = self.config_path.as_ref() else {
            return Err(anyhow::anyhow!("No configuration file to reload"));
        };

        match Self::load_config(path) {
            Ok(new_config) => {
                let new_config = Arc::new(new_config);
                self.config.store(new_config.clone());
                info!("Configuration reloaded successfully");

                let _ = self
                    .reload_tx
                    .send(ConfigReloadEvent::ConfigReloaded(new_config))
                    .await;
                Ok(())
            }
            Err(e) => {
                error!("Failed to reload configuration: {}", e);
                let _ = self
                    .reload_tx
                    .send(ConfigReloadEvent::ReloadFailed(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Start watching configuration file for changes
    pub fn start_watching(&self) -> anyhow::Result<()> {
        let Some(config_path) = self.config_path.clone() else {
            info!("No configuration file, hot-reload watching skipped");
            return Ok(());
        };
        let reload_tx = self.reload_tx.clone();
        let active = Arc::clone(&self.config);
        let watched = config_path.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        debug!("Config file change detected: {:?}", event);

                        match Self::load_config(&watched) {
                            Ok(new_config) => {
                                let new_config = Arc::new(new_config);
                                active.store(new_config.clone());
                                info!("Configuration hot-reloaded");

                                // Blocking send: the watcher callback is not async
                                let _ = reload_tx
                                    .blocking_send(ConfigReloadEvent::ConfigReloaded(new_config));
                            }
                            Err(e) => {
                                error!("Failed to hot-reload configuration: {}", e);
                                let _ = reload_tx
                                    .blocking_send(ConfigReloadEvent::ReloadFailed(e.to_string()));
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Config file watch error: {}", e);
                }
            }
        })?;

        watcher.watch(&config_path, RecursiveMode::NonRecursive)?;

        *self.watcher.write() = Some(watcher);
        info!("Configuration file watching enabled");

        Ok(())
    }

    /// Stop watching configuration file
    pub fn stop_watching(&self) {
        *self.watcher.write() = None;
        info!("Configuration file watching disabled");
    }
}
