// Local configuration for the sync layer.
//
// Global config: `~/.tracker/config.toml`
// Local store default: `~/.tracker/store.db`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracker_common::auth::{AuthError, StaticAuth, UserId};

use crate::security::{ensure_owner_only_dir, ensure_owner_only_file};
use crate::store::MergePolicy;

/// Root directory for tracker state: `~/.tracker/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tracker"))
}

/// Path to the config file: `~/.tracker/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

/// Default location of the local store: `~/.tracker/store.db`.
pub fn default_store_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("store.db"))
}

// ── Settings ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SyncSettings {
    pub remote: RemoteSettings,
    pub store: StoreSettings,
    pub background: BackgroundSettings,
}

impl SyncSettings {
    /// Load from `~/.tracker/config.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Like `load_from`, but a missing file yields defaults. Parse errors
    /// are still reported.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load_from(path) {
            Err(ConfigError::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Save to `~/.tracker/config.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = config_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories). The file and
    /// its directory are restricted to the owner since `remote.auth_token`
    /// lives here.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
            ensure_owner_only_dir(parent)
                .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io).and_then(|_| {
            ensure_owner_only_file(path)
                .map_err(|error| ConfigError::Io(std::io::Error::other(error.to_string())))
        })
    }
}

/// Which remote implementation backs the sync layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemoteBackend {
    Http,
    /// In-process repository; nothing leaves the machine.
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteSettings {
    pub backend: RemoteBackend,
    /// Service root (e.g. `https://api.example.com`). Required for `http`.
    pub base_url: Option<String>,
    /// Bearer token sent with every request.
    pub auth_token: Option<String>,
    /// Acting user for optimistic writes. Unset means signed out.
    pub user_id: Option<String>,
    /// How often the HTTP backend polls for changes.
    pub poll_interval_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::Memory,
            base_url: None,
            auth_token: None,
            user_id: None,
            poll_interval_ms: 5_000,
        }
    }
}

impl RemoteSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Identity for optimistic writes. A blank `user_id` is rejected.
    pub fn auth(&self) -> Result<StaticAuth, AuthError> {
        match &self.user_id {
            None => Ok(StaticAuth::signed_out()),
            Some(id) => UserId::new(id.as_str()).map(StaticAuth::signed_in),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite file; `~/.tracker/store.db` when unset.
    pub path: Option<PathBuf>,
    pub merge_policy: MergePolicy,
}

impl StoreSettings {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(default_store_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackgroundSettings {
    /// Identifier the background handler is registered under.
    pub task_id: String,
    /// Earliest delay between background runs.
    pub interval_sec: u64,
    /// How long a background grant stays valid.
    pub execution_budget_sec: u64,
    /// Upper bound on kinds fetched concurrently during a full sync.
    pub max_parallel_fetches: usize,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            task_id: "tracker.refresh".into(),
            interval_sec: 900,
            execution_budget_sec: 30,
            max_parallel_fetches: 3,
        }
    }
}

impl BackgroundSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    pub fn execution_budget(&self) -> Duration {
        Duration::from_secs(self.execution_budget_sec)
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}
