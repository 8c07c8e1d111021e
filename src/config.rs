use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent config, loaded from TOML. Every field is optional; command-line
/// flags take precedence over anything set here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Address to bind the HTTP/WebSocket listener.
    pub bind: Option<SocketAddr>,
    /// Shared secret for the control socket and the REST API.
    pub token: Option<String>,
    /// Shell used when a spawn request names no command.
    pub shell: Option<String>,
    /// Root of the proc filesystem used for socket tables.
    pub proc_root: Option<PathBuf>,
    /// Grace period between SIGTERM and SIGKILL when killing a shell.
    pub kill_grace_ms: Option<u64>,
    /// Port monitor interval used when a request gives none.
    pub monitor_interval_secs: Option<u64>,
    /// Per-IP requests per second on the REST API.
    pub rate_limit: Option<u32>,
}

impl AgentConfig {
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
        Ok(Some(config))
    }
}

/// Default config location: `<config_dir>/ccw/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ccw").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if the config file is world-readable, since it may hold the secret.
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
             It may contain the auth token -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

/// Use $SHELL or fall back to /bin/sh.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Runtime knobs shared by every session of every connection.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub shell: String,
    pub proc_root: PathBuf,
    pub kill_grace: Duration,
    pub monitor_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            proc_root: PathBuf::from("/proc"),
            kill_grace: Duration::from_millis(2000),
            monitor_interval: Duration::from_secs(2),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        let defaults = Self::default();
        Self {
            shell: config.shell.clone().unwrap_or(defaults.shell),
            proc_root: config.proc_root.clone().unwrap_or(defaults.proc_root),
            kill_grace: config
                .kill_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.kill_grace),
            monitor_interval: config
                .monitor_interval_secs
                .filter(|secs| *secs >= 1)
                .map(Duration::from_secs)
                .unwrap_or(defaults.monitor_interval),
        }
    }
}
