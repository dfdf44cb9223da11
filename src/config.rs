//! Configuration loader and validator for the bulk message sender.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub sending: Sending,
    pub lock: LockConfig,
    pub transport: TransportConfig,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub database_url: String,
    /// Origin alias used for messages enqueued without one.
    pub default_shortcode: String,
}

/// Rate and pool settings for the sending loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sending {
    pub messages_per_second: u32,
    pub concurrent_workers: usize,
    /// Target length of one dispatch cycle. Keep it below the supervisor's
    /// kill timeout so a stop request never lands mid-group.
    pub seconds_per_group: u64,
    pub max_messages_per_worker: usize,
    pub lock_ttl_seconds: u64,
}

impl Sending {
    pub fn group_window(&self) -> Duration {
        Duration::from_secs(self.seconds_per_group)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Memory,
    Sqlite,
    Redis,
}

/// Where send-lock markers live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockConfig {
    pub backend: LockKind,
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Log,
}

/// Outbound gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub default_backends: Vec<String>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub number_regex: Option<String>,
}

impl Config {
    /// `DATABASE_URL` from the environment wins over the file.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.app.database_url.clone())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    check_database_url(&cfg.app.database_url)?;
    if cfg.app.default_shortcode.trim().is_empty() {
        return Err(ConfigError::Invalid("app.default_shortcode must be non-empty"));
    }

    let s = &cfg.sending;
    if s.messages_per_second == 0 {
        return Err(ConfigError::Invalid("sending.messages_per_second must be > 0"));
    }
    if s.concurrent_workers == 0 {
        return Err(ConfigError::Invalid("sending.concurrent_workers must be > 0"));
    }
    if s.seconds_per_group == 0 {
        return Err(ConfigError::Invalid("sending.seconds_per_group must be > 0"));
    }
    if s.max_messages_per_worker == 0 {
        return Err(ConfigError::Invalid("sending.max_messages_per_worker must be > 0"));
    }
    if s.lock_ttl_seconds == 0 {
        return Err(ConfigError::Invalid("sending.lock_ttl_seconds must be > 0"));
    }

    if cfg.lock.backend == LockKind::Redis
        && cfg
            .lock
            .redis_url
            .as_deref()
            .map_or(true, |u| u.trim().is_empty())
    {
        return Err(ConfigError::Invalid(
            "lock.redis_url is required for the redis backend",
        ));
    }

    let t = &cfg.transport;
    if t.kind == TransportKind::Http {
        if t.timeout_seconds == 0 {
            return Err(ConfigError::Invalid("transport.timeout_seconds must be > 0"));
        }
        if t.backends.is_empty() {
            return Err(ConfigError::Invalid(
                "transport.backends must list at least one backend",
            ));
        }
        for b in &t.backends {
            if b.name.trim().is_empty() {
                return Err(ConfigError::Invalid("transport.backends[].name must be non-empty"));
            }
            if b.url.trim().is_empty() {
                return Err(ConfigError::Invalid("transport.backends[].url must be non-empty"));
            }
        }
        for name in &t.default_backends {
            if !t.backends.iter().any(|b| &b.name == name) {
                return Err(ConfigError::Invalid(
                    "transport.default_backends must name configured backends",
                ));
            }
        }
    }

    Ok(())
}

/// Workers open their own connections, so the store must be a file they
/// all reach. Also applied to a `DATABASE_URL` override.
pub fn check_database_url(url: &str) -> Result<(), ConfigError> {
    if url.trim().is_empty() {
        return Err(ConfigError::Invalid("app.database_url must be non-empty"));
    }
    if url.contains(":memory:") || url.contains("mode=memory") {
        return Err(ConfigError::Invalid(
            "app.database_url must point at a file; workers cannot share an in-memory database",
        ));
    }
    Ok(())
}

/// Example configuration document.
pub fn example() -> &'static str {
    r#"app:
  database_url: "sqlite://./data/bulk_sms.db"
  default_shortcode: "10020"

sending:
  messages_per_second: 50
  concurrent_workers: 10
  seconds_per_group: 5
  max_messages_per_worker: 10000
  lock_ttl_seconds: 60

lock:
  backend: sqlite
  redis_url: null

transport:
  kind: http
  timeout_seconds: 10
  default_backends:
    - almadar
    - libyana
  backends:
    - name: almadar
      url: "http://localhost:8001/send"
      number_regex: "^21891"
    - name: libyana
      url: "http://localhost:8002/send"
      number_regex: "^2189[24]"
    - name: thuraya
      url: "http://localhost:8003/send"
      number_regex: "^88216"
"#
}
