//! Engine configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via WIRELINK_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "WIRELINK_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine tuning.
    pub engine: EngineConfig,
    /// Device transport, used by the driver binary to open the byte streams.
    pub transport: TransportConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            config = Self::from_file(&path)?;
        }

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Applies overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.engine.apply_overrides(&var);
        self.transport.apply_overrides(&var);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.transport.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Consecutive transport failures after which the engine closes itself.
    pub error_threshold: u32,
    /// How long `open` waits for the reader thread to report in.
    pub startup_timeout_ms: u64,
    /// How long `close` waits for the reader thread to exit.
    pub close_timeout_ms: u64,
    /// Deadline for requests that do not pass their own (0 = wait forever).
    pub request_timeout_ms: u64,
    /// Worker threads in the engine-owned pool.
    pub worker_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            error_threshold: 10,
            startup_timeout_ms: 500,
            close_timeout_ms: 2000,
            request_timeout_ms: 5000,
            worker_threads: 2,
        }
    }
}

impl EngineConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(n) = var("WIRELINK_ERROR_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.error_threshold = n;
        }
        if let Some(ms) = var("WIRELINK_STARTUP_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.startup_timeout_ms = ms;
        }
        if let Some(ms) = var("WIRELINK_CLOSE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.close_timeout_ms = ms;
        }
        if let Some(ms) = var("WIRELINK_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.request_timeout_ms = ms;
        }
        if let Some(n) = var("WIRELINK_WORKER_THREADS").and_then(|v| v.parse().ok()) {
            self.worker_threads = n;
        }
    }

    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Returns the default request deadline, `None` meaning no deadline.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.error_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "engine.error_threshold must be at least 1".to_string(),
            ));
        }
        if self.startup_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "engine.startup_timeout_ms must be positive".to_string(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::ValidationError(
                "engine.worker_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// TCP transport settings (serial-to-TCP bridge or networked module).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Device address.
    #[serde(with = "socket_addr_serde")]
    pub addr: SocketAddr,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Socket read timeout in milliseconds. Bounds how quickly the reader
    /// thread notices a close request.
    pub read_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 4001)),
            connect_timeout_secs: 5,
            read_timeout_ms: 100,
        }
    }
}

impl TransportConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("WIRELINK_DEVICE_ADDR").and_then(|v| v.parse().ok()) {
            self.addr = addr;
        }
        if let Some(secs) = var("WIRELINK_CONNECT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.connect_timeout_secs = secs;
        }
        if let Some(ms) = var("WIRELINK_READ_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.read_timeout_ms = ms;
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "transport.read_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
