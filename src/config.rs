use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingest::IngestLimits;

/// Gateway config, loaded from TOML. Every field has a default, so an empty
/// or missing file yields a working configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerSection,
    pub registry: RegistrySection,
    pub poll: PollSection,
    pub limits: LimitsSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
    /// Bearer token required on every route except `/health`.
    pub token: Option<String>,
    /// SQLite database path. In-memory store when unset.
    pub db: Option<PathBuf>,
    pub cors_origins: Vec<String>,
    /// Largest accepted request body.
    pub max_request_bytes: usize,
    /// Largest accepted body on `/results/*`. Bodies under this ceiling are
    /// stored truncated to the per-category caps; larger ones get a 413.
    pub max_result_bytes: usize,
    /// Concurrent agent sockets before upgrades are refused.
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            token: None,
            db: None,
            cors_origins: Vec::new(),
            max_request_bytes: 32 * 1024 * 1024,
            max_result_bytes: 256 * 1024 * 1024,
            max_connections: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub reaper_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            reaper_interval_secs: 30,
            heartbeat_timeout_secs: 60,
        }
    }
}

impl RegistrySection {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSection {
    pub batch_limit: usize,
}

impl Default for PollSection {
    fn default() -> Self {
        Self { batch_limit: 10 }
    }
}

/// Size caps in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub fetch_body_bytes: usize,
    pub tunnel_body_bytes: usize,
    pub snapshot_html_bytes: usize,
    pub screenshot_bytes: usize,
    pub popup_field_bytes: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        let limits = IngestLimits::default();
        Self {
            fetch_body_bytes: limits.fetch_body,
            tunnel_body_bytes: limits.tunnel_body,
            snapshot_html_bytes: limits.snapshot_html,
            screenshot_bytes: limits.screenshot_image,
            popup_field_bytes: limits.popup_field,
        }
    }
}

impl From<&LimitsSection> for IngestLimits {
    fn from(section: &LimitsSection) -> Self {
        IngestLimits {
            fetch_body: section.fetch_body_bytes,
            tunnel_body: section.tunnel_body_bytes,
            snapshot_html: section.snapshot_html_bytes,
            screenshot_image: section.screenshot_bytes,
            popup_field: section.popup_field_bytes,
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll.batch_limit == 0 {
            return Err(ConfigError::Invalid("poll.batch_limit must be at least 1".into()));
        }
        if self.registry.reaper_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "registry.reaper_interval_secs must be at least 1".into(),
            ));
        }
        if self.registry.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "registry.heartbeat_timeout_secs must be at least 1".into(),
            ));
        }
        if self.server.max_result_bytes < self.server.max_request_bytes {
            return Err(ConfigError::Invalid(
                "server.max_result_bytes must not be below server.max_request_bytes".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be at least 1".into()));
        }
        Ok(())
    }
}

/// `<config dir>/cmdgate/config.toml`, if the platform has a config dir.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cmdgate").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if the config file is world-readable; it may hold the API token.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain a token -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
