//! User configuration for the pinthread board.
//!
//! Read once at startup from `$XDG_CONFIG_HOME/pinthread/config.toml`
//! (falling back to `~/.config/pinthread/config.toml`). `PINTHREAD_CONFIG`
//! points at an explicit file instead. Every key is optional:
//!
//! ```toml
//! theme = "catppuccin-mocha"
//! author = "ana"
//!
//! [scope]
//! route = "/pricing"
//! version = "v2"
//!
//! [tracker]
//! provider = "github"
//! repository = "acme/site"
//!
//! [sync]
//! auto_retry = true
//! retry_base_secs = 5
//! retry_cap_secs = 300
//! ```
//!
//! Config errors are soft failures: the problem is printed to stderr and the
//! defaults are used, so a typo never prevents startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pinthread_core::engine::Backoff;
use pinthread_core::tracker::TrackerSettings;
use pinthread_core::types::Scope;
use serde::Deserialize;

const APP_DIR: &str = "pinthread";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub theme: String,
    /// SQLite file holding threads, tombstones and preferences.
    pub database: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    /// Author recorded on comments written from this board.
    pub author: Option<String>,
    pub scope: ScopeConfig,
    pub tracker: TrackerSettings,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            theme: "catppuccin-mocha".to_owned(),
            database: None,
            log_file: None,
            author: None,
            scope: ScopeConfig::default(),
            tracker: TrackerSettings::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub route: String,
    pub version: String,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            route: "/".to_owned(),
            version: "v1".to_owned(),
        }
    }
}

impl ScopeConfig {
    pub fn to_scope(&self) -> Scope {
        Scope::new(self.route.clone(), self.version.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Run the retry pass on a backoff schedule while threads are in error.
    pub auto_retry: bool,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    /// Reconcile the active scope once the board starts.
    pub reconcile_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_retry: true,
            retry_base_secs: 5,
            retry_cap_secs: 300,
            reconcile_on_start: true,
        }
    }
}

impl SyncConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.retry_base_secs.max(1)),
            Duration::from_secs(self.retry_cap_secs),
        )
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Loads the config from its default location. Never fails.
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    /// Loads `path`, falling back to defaults when it is missing or invalid.
    pub fn load_from(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        match Self::from_toml_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("pinthread: config parse error in {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| data_dir().join("pinthread.db"))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| data_dir().join("pinthread.log"))
    }
}

/// Returns the config file path: `PINTHREAD_CONFIG` if set, otherwise the
/// XDG location.
pub fn config_path() -> PathBuf {
    if let Some(explicit) = std::env::var_os("PINTHREAD_CONFIG") {
        return PathBuf::from(explicit);
    }
    xdg_dir("XDG_CONFIG_HOME", ".config").join("config.toml")
}

fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
}

fn xdg_dir(var: &str, home_fallback: &str) -> PathBuf {
    let base = std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(home_fallback))
        })
        .unwrap_or_else(|| PathBuf::from(home_fallback));
    base.join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinthread_core::tracker::TrackerKind;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml_str("").expect("parse");
        assert_eq!(config, Config::default());
        assert_eq!(config.scope.to_scope(), Scope::new("/", "v1"));
        assert!(config.tracker.provider.is_none());
    }

    #[test]
    fn full_file_is_parsed() {
        let config = Config::from_toml_str(
            r#"
            theme = "dark"
            database = "/tmp/pins.db"
            author = "ana"

            [scope]
            route = "/pricing"
            version = "v2"

            [tracker]
            provider = "gitlab"
            repository = "group/site"
            token_env = "SITE_TOKEN"
            max_pages = 5

            [sync]
            auto_retry = false
            retry_base_secs = 2
            "#,
        )
        .expect("parse");
        assert_eq!(config.theme, "dark");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/pins.db"));
        assert_eq!(config.author.as_deref(), Some("ana"));
        assert_eq!(config.scope.to_scope(), Scope::new("/pricing", "v2"));
        assert_eq!(config.tracker.provider, Some(TrackerKind::Gitlab));
        assert_eq!(config.tracker.token_env.as_deref(), Some("SITE_TOKEN"));
        assert_eq!(config.tracker.max_pages, 5);
        assert!(!config.sync.auto_retry);
        assert_eq!(config.sync.retry_base_secs, 2);
        assert_eq!(config.sync.retry_cap_secs, 300);
    }

    #[test]
    fn unknown_provider_is_a_parse_error() {
        assert!(Config::from_toml_str("[tracker]\nprovider = \"bitbucket\"").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/pinthread/config.toml"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn backoff_follows_sync_settings() {
        let sync = SyncConfig {
            retry_base_secs: 2,
            retry_cap_secs: 5,
            ..SyncConfig::default()
        };
        let mut backoff = sync.backoff();
        let delays: Vec<u64> = (0..3).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 5]);
    }
}
