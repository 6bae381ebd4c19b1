//! Startup configuration – reads/writes `~/.dronelink/config.toml`.
//!
//! Read once at startup; nothing here is mutable at runtime.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dronelink_middleware::LinkConfig;
use dronelink_runtime::{RelayConfig, ThrottleConfig};
use dronelink_types::RelayError;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Persisted relay configuration stored in `~/.dronelink/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Downstream control endpoint host.
    #[serde(default = "default_downstream_host")]
    pub downstream_host: String,

    #[serde(default = "default_downstream_port")]
    pub downstream_port: u16,

    /// Address the observer hub binds to.
    #[serde(default = "default_hub_bind")]
    pub hub_bind: String,

    #[serde(default = "default_hub_port")]
    pub hub_port: u16,

    /// Pre-shared token observers must send first. Required.
    #[serde(default, skip_serializing_if = "is_empty_secret")]
    pub auth_token: Zeroizing<String>,

    /// PEM certificate chain for `wss`. Defaults to `server.crt` next to
    /// the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for `wss`. Defaults to `server.key` next to the
    /// config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,

    /// Generate a self-signed certificate when the TLS files are missing.
    #[serde(default = "default_true")]
    pub generate_self_signed: bool,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_pause_ms")]
    pub reconnect_pause_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_send_retries")]
    pub send_retries: u32,

    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,

    #[serde(default = "default_reset_pause_ms")]
    pub reset_pause_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_initial_throttle")]
    pub initial_throttle: f64,

    #[serde(default = "default_throttle_step_delay_ms")]
    pub throttle_step_delay_ms: u64,

    #[serde(default = "default_drain_pause_ms")]
    pub drain_pause_ms: u64,

    #[serde(default = "default_hub_ping_interval_ms")]
    pub hub_ping_interval_ms: u64,

    /// Read operator commands from stdin.
    #[serde(default)]
    pub keyboard_enabled: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("downstream_host", &self.downstream_host)
            .field("downstream_port", &self.downstream_port)
            .field("hub_bind", &self.hub_bind)
            .field("hub_port", &self.hub_port)
            .field(
                "auth_token",
                if self.auth_token.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("tls_cert", &self.tls_cert)
            .field("tls_key", &self.tls_key)
            .field("generate_self_signed", &self.generate_self_signed)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("reconnect_pause_ms", &self.reconnect_pause_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("send_retries", &self.send_retries)
            .field("retry_pause_ms", &self.retry_pause_ms)
            .field("reset_pause_ms", &self.reset_pause_ms)
            .field("write_timeout_ms", &self.write_timeout_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("initial_throttle", &self.initial_throttle)
            .field("throttle_step_delay_ms", &self.throttle_step_delay_ms)
            .field("drain_pause_ms", &self.drain_pause_ms)
            .field("hub_ping_interval_ms", &self.hub_ping_interval_ms)
            .field("keyboard_enabled", &self.keyboard_enabled)
            .finish()
    }
}

fn is_empty_secret(s: &Zeroizing<String>) -> bool {
    s.is_empty()
}
fn default_downstream_host() -> String {
    "127.0.0.1".to_string()
}
fn default_downstream_port() -> u16 {
    5000
}
fn default_hub_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_hub_port() -> u16 {
    8765
}
fn default_true() -> bool {
    true
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_pause_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    3_000
}
fn default_send_retries() -> u32 {
    3
}
fn default_retry_pause_ms() -> u64 {
    200
}
fn default_reset_pause_ms() -> u64 {
    500
}
fn default_write_timeout_ms() -> u64 {
    3_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_initial_throttle() -> f64 {
    0.05
}
fn default_throttle_step_delay_ms() -> u64 {
    50
}
fn default_drain_pause_ms() -> u64 {
    5
}
fn default_hub_ping_interval_ms() -> u64 {
    20_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            downstream_host: default_downstream_host(),
            downstream_port: default_downstream_port(),
            hub_bind: default_hub_bind(),
            hub_port: default_hub_port(),
            auth_token: Zeroizing::new(String::new()),
            tls_cert: None,
            tls_key: None,
            generate_self_signed: true,
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_pause_ms: default_reconnect_pause_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_retries: default_send_retries(),
            retry_pause_ms: default_retry_pause_ms(),
            reset_pause_ms: default_reset_pause_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            initial_throttle: default_initial_throttle(),
            throttle_step_delay_ms: default_throttle_step_delay_ms(),
            drain_pause_ms: default_drain_pause_ms(),
            hub_ping_interval_ms: default_hub_ping_interval_ms(),
            keyboard_enabled: false,
        }
    }
}

impl Config {
    /// `host:port` of the downstream endpoint.
    pub fn downstream_addr(&self) -> String {
        format!("{}:{}", self.downstream_host, self.downstream_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn hub_ping_interval(&self) -> Duration {
        Duration::from_millis(self.hub_ping_interval_ms)
    }

    /// Certificate and key paths, defaulting to files in `config_dir`.
    pub fn tls_paths(&self, config_dir: &Path) -> (PathBuf, PathBuf) {
        (
            self.tls_cert
                .clone()
                .unwrap_or_else(|| config_dir.join("server.crt")),
            self.tls_key
                .clone()
                .unwrap_or_else(|| config_dir.join("server.key")),
        )
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            link: LinkConfig {
                reconnect_attempts: self.reconnect_attempts,
                reconnect_pause: Duration::from_millis(self.reconnect_pause_ms),
                send_retries: self.send_retries,
                retry_pause: Duration::from_millis(self.retry_pause_ms),
                reset_pause: Duration::from_millis(self.reset_pause_ms),
            },
            throttle: ThrottleConfig {
                initial: self.initial_throttle,
                step_delay: Duration::from_millis(self.throttle_step_delay_ms),
            },
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            drain_pause: Duration::from_millis(self.drain_pause_ms),
        }
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.auth_token.is_empty() {
            return Err(RelayError::Config(
                "auth_token is empty; set it in the config file or DRONELINK_AUTH_TOKEN".to_string(),
            ));
        }
        if self.reconnect_attempts == 0 {
            return Err(RelayError::Config("reconnect_attempts must be at least 1".to_string()));
        }
        if self.send_retries == 0 {
            return Err(RelayError::Config("send_retries must be at least 1".to_string()));
        }
        if !self.initial_throttle.is_finite() {
            return Err(RelayError::Config("initial_throttle must be a number".to_string()));
        }
        if self.heartbeat_interval_ms == 0 || self.hub_ping_interval_ms == 0 {
            return Err(RelayError::Config("intervals must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Return the path to `~/.dronelink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".dronelink").join("config.toml")
}

/// Load the config at `path`, falling back to defaults when the file does
/// not exist. Environment overrides are applied in both cases.
pub fn load_or_default(path: &Path) -> Result<Config, RelayError> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path. Returns `None` if it is missing.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, RelayError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        RelayError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| RelayError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `DRONELINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `DRONELINK_DOWNSTREAM_HOST` | `downstream_host` |
/// | `DRONELINK_DOWNSTREAM_PORT` | `downstream_port` |
/// | `DRONELINK_HUB_PORT` | `hub_port` |
/// | `DRONELINK_AUTH_TOKEN` | `auth_token` |
/// | `DRONELINK_TLS_CERT` | `tls_cert` |
/// | `DRONELINK_TLS_KEY` | `tls_key` |
///
/// Unparseable port numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("DRONELINK_DOWNSTREAM_HOST") {
        cfg.downstream_host = v;
    }
    if let Ok(v) = std::env::var("DRONELINK_DOWNSTREAM_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.downstream_port = port;
    }
    if let Ok(v) = std::env::var("DRONELINK_HUB_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.hub_port = port;
    }
    if let Ok(v) = std::env::var("DRONELINK_AUTH_TOKEN") {
        cfg.auth_token = Zeroizing::new(v);
    }
    if let Ok(v) = std::env::var("DRONELINK_TLS_CERT") {
        cfg.tls_cert = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("DRONELINK_TLS_KEY") {
        cfg.tls_key = Some(PathBuf::from(v));
    }
}

/// Save the config to a specific path, creating its directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), RelayError> {
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| RelayError::Config(format!("failed to serialize config: {e}")))?;
    write_private(path, raw.as_bytes())
}

/// Write `contents` readable by the owner only. A parent directory created
/// here is owner-only as well on Unix; existing directories are left alone.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<(), RelayError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| {
            RelayError::Config(format!("failed to create {}: {e}", parent.display()))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                RelayError::Config(format!("failed to restrict {}: {e}", parent.display()))
            })?;
        }
    }
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(contents))
            .map_err(|e| RelayError::Config(format!("failed to write {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    fs::write(path, contents)
        .map_err(|e| RelayError::Config(format!("failed to write {}: {e}", path.display())))?;
    Ok(())
}
