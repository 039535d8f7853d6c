use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub http_client: HttpClientConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Prefix for the terminal socket paths (e.g. `/agent`).
    #[serde(default)]
    pub base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            base_path: String::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    300
}

// ============================================================================
// TerminalConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Shell used to run command lines (`<shell> -c <line>`).
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    /// Seconds to wait after an interrupt before killing the process.
    /// Zero disables the escalation.
    #[serde(default = "default_interrupt_grace")]
    pub interrupt_grace_seconds: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            cols: default_cols(),
            rows: default_rows(),
            interrupt_grace_seconds: default_interrupt_grace(),
        }
    }
}

impl TerminalConfig {
    pub fn interrupt_grace(&self) -> Option<Duration> {
        (self.interrupt_grace_seconds > 0)
            .then(|| Duration::from_secs(self.interrupt_grace_seconds))
    }
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_cols() -> u16 {
    200
}

fn default_rows() -> u16 {
    50
}

fn default_interrupt_grace() -> u64 {
    30
}

// ============================================================================
// HttpClientConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    /// Upper bound on response bytes read per call. Unbounded when absent.
    #[serde(default = "default_max_download_size")]
    pub max_download_size: Option<usize>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            max_download_size: default_max_download_size(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_download_size() -> Option<usize> {
    Some(64 * 1024)
}

// ============================================================================
// CallbackConfig
// ============================================================================

/// Retry policy for invoke completion callbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_callback_retries")]
    pub max_retries: u32,
    #[serde(default = "default_callback_wait")]
    pub wait_before_retry_millis: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_callback_retries(),
            wait_before_retry_millis: default_callback_wait(),
        }
    }
}

fn default_callback_retries() -> u32 {
    10
}

fn default_callback_wait() -> u64 {
    500
}

// ============================================================================
// OutputConfig
// ============================================================================

/// Durable destinations every session's output is copied to.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    /// Directory for per-session log files. No file sink when absent.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub primary: PrimarySink,
    #[serde(default)]
    pub log: LogOutputConfig,
    #[serde(default)]
    pub queue: Option<QueueOutputConfig>,
}

/// Which durable sink is flushed before completion is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimarySink {
    #[default]
    File,
    Queue,
    None,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogOutputConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueOutputConfig {
    pub topic: String,
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("invalid output config: {0}")]
    InvalidOutput(&'static str),
}

// ============================================================================
// Tests
// ============================================================================
