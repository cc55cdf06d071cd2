//! Host configuration
//!
//! [`HostConfig`] is the persisted JSON document. [`Settings`] is the shared,
//! runtime-mutable handle the rest of the host reads from, so operator
//! changes (disabling a script, bypassing the cache) apply without a restart.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use thiserror::Error;

/// Default blacklist resource (`name,version` rows)
pub const DEFAULT_BLACKLIST_URL: &str =
    "https://github.com/PunishXIV/Splatoon/raw/main/SplatoonScripts/blacklist.csv";

/// Default update manifest (`name,version,url` rows)
pub const DEFAULT_UPDATE_URL: &str =
    "https://github.com/PunishXIV/Splatoon/raw/main/SplatoonScripts/update.csv";

const SCRIPTS_DIR: &str = "Scripts";
const CACHE_DIR: &str = "ScriptCache";
const OVERRIDES_DIR: &str = "ScriptOverrides";

/// Errors reading or writing the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Root directory holding `Scripts/`, `ScriptCache/` and `ScriptOverrides/`
    pub root_dir: PathBuf,

    /// Host build identifier; part of every cache key
    pub host_version: String,

    /// Full names the user explicitly disabled
    pub disabled_scripts: BTreeSet<String>,

    /// Never read or write the compile cache
    pub disable_cache: bool,

    /// Extra trusted URL prefixes, one per line
    pub extra_trusted_repos: String,

    /// Extra update manifest URLs, one per line
    pub extra_update_links: String,

    /// Opt-in for `extra_update_links`. Scripts listed there are downloaded
    /// and executed without a trust check.
    pub allow_extra_update_links: bool,

    /// Update every loaded script on the next refresh regardless of version
    pub force_update_all: bool,

    pub blacklist_url: String,

    pub update_url: String,

    /// Worker poll interval while the queue is empty
    pub poll_interval_ms: u64,

    /// Consecutive empty polls before the worker exits
    pub max_idle_polls: u32,

    /// Timeout for every network request
    pub fetch_timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            root_dir: Self::default_root(),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            disabled_scripts: BTreeSet::new(),
            disable_cache: false,
            extra_trusted_repos: String::new(),
            extra_update_links: String::new(),
            allow_extra_update_links: false,
            force_update_all: false,
            blacklist_url: DEFAULT_BLACKLIST_URL.to_string(),
            update_url: DEFAULT_UPDATE_URL.to_string(),
            poll_interval_ms: 10,
            max_idle_polls: 10,
            fetch_timeout_secs: 30,
        }
    }
}

impl HostConfig {
    /// Platform config directory, e.g. `~/.config/hotscript`
    pub fn default_root() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hotscript")
    }

    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        Self::default_root().join("config.json")
    }

    /// Configuration rooted at `root_dir`, everything else default
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load `path`, falling back to defaults when the file does not exist yet
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.root_dir.join(SCRIPTS_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root_dir.join(CACHE_DIR)
    }

    pub fn overrides_dir(&self) -> PathBuf {
        self.root_dir.join(OVERRIDES_DIR)
    }

    /// How long an empty queue keeps the worker alive
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.saturating_mul(self.max_idle_polls as u64))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn extra_trusted_prefixes(&self) -> Vec<String> {
        lines(&self.extra_trusted_repos)
    }

    pub fn extra_update_urls(&self) -> Vec<String> {
        lines(&self.extra_update_links)
    }
}

/// Non-blank, trimmed lines of a newline-delimited operator setting
pub fn lines(value: &str) -> Vec<String> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Shared, runtime-mutable configuration
#[derive(Debug, Clone)]
pub struct Settings {
    inner: Arc<RwLock<HostConfig>>,
}

impl Settings {
    pub fn new(config: HostConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, HostConfig> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Owned copy of the current configuration
    pub fn snapshot(&self) -> HostConfig {
        self.read().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut HostConfig) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_layout() {
        let config = HostConfig::with_root("/srv/host");
        assert_eq!(config.scripts_dir(), PathBuf::from("/srv/host/Scripts"));
        assert_eq!(config.cache_dir(), PathBuf::from("/srv/host/ScriptCache"));
        assert_eq!(config.idle_timeout(), Duration::from_millis(100));
        assert!(!config.allow_extra_update_links);
    }

    #[test]
    fn test_lines_skip_blanks() {
        let config = HostConfig {
            extra_trusted_repos: "https://a.example/\n\n  https://b.example/  \r\n".into(),
            ..HostConfig::with_root(".")
        };
        assert_eq!(
            config.extra_trusted_prefixes(),
            vec!["https://a.example/", "https://b.example/"]
        );
        assert!(config.extra_update_urls().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.json");

        let mut config = HostConfig::with_root(temp.path());
        config.disabled_scripts.insert("Foo.Bar".into());
        config.host_version = "9.9.9".into();
        config.save(&path).unwrap();

        let loaded = HostConfig::load(&path).unwrap();
        assert_eq!(loaded.host_version, "9.9.9");
        assert!(loaded.disabled_scripts.contains("Foo.Bar"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{ "disable_cache": true }"#).unwrap();

        let loaded = HostConfig::load(&path).unwrap();
        assert!(loaded.disable_cache);
        assert_eq!(loaded.max_idle_polls, 10);
        assert_eq!(loaded.update_url, DEFAULT_UPDATE_URL);
    }

    #[test]
    fn test_invalid_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            HostConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_settings_update_visible_to_clones() {
        let settings = Settings::new(HostConfig::with_root("."));
        let other = settings.clone();
        settings.update(|c| c.disable_cache = true);
        assert!(other.read().disable_cache);
    }
}
