//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for parley
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the reply service; replies are requested from `<base>/ask`
    pub backend_url: Option<String>,
    /// Directory the conversation snapshot is kept in
    pub data_dir: Option<PathBuf>,
    /// Quiet period before a snapshot is written, in milliseconds
    pub save_debounce_ms: Option<u64>,
    /// Length of titles derived from a first message
    pub title_max_chars: Option<usize>,
    /// Connection timeout in seconds
    pub connect_timeout_secs: Option<u64>,
    /// Maximum silence in a reply stream, in seconds
    pub idle_timeout_secs: Option<u64>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PARLEY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Default directory for conversation data
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("parley")
    }

    /// Load config from the default location
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`. A missing or unreadable file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            backend_url: Some("http://localhost:8000".to_string()),
            save_debounce_ms: Some(250),
            title_max_chars: Some(50),
            ..Config::default()
        };

        default_config.save_to(&path)?;
        Ok(path)
    }

    /// Backend URL from the environment, as the web client reads it
    pub fn backend_url_from_env() -> Option<String> {
        ["BACKEND_URL", "NEXT_PUBLIC_BACKEND_URL"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.trim().is_empty())
    }
}

/// Command-line values that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend_url: Option<String>,
    pub data_dir: Option<PathBuf>,
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend_url: Option<String>,
    pub data_dir: PathBuf,
    pub save_debounce: Duration,
    pub title_max_chars: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Settings {
    /// Merge flags, config file and environment (in that order of precedence)
    pub fn resolve(config: &Config, overrides: Overrides, env_backend: Option<String>) -> Self {
        let backend_url = overrides
            .backend_url
            .or_else(|| config.backend_url.clone())
            .or(env_backend)
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        Self {
            backend_url,
            data_dir: overrides
                .data_dir
                .or_else(|| config.data_dir.clone())
                .unwrap_or_else(Config::default_data_dir),
            save_debounce: Duration::from_millis(config.save_debounce_ms.unwrap_or(250)),
            title_max_chars: config.title_max_chars.unwrap_or(50).max(1),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.unwrap_or(10)),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.unwrap_or(60)),
        }
    }

    /// URL reply requests are posted to
    pub fn reply_endpoint(&self) -> Option<String> {
        self.backend_url.as_ref().map(|base| format!("{}/ask", base))
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# parley configuration file
# Place at ~/.config/parley/config.toml (Linux) or set PARLEY_CONFIG_PATH

# Base URL of the reply service (replies are requested from <backend_url>/ask).
# Falls back to the BACKEND_URL environment variable.
backend_url = "http://localhost:8000"

# Where conversations are stored (defaults to the platform data directory)
# data_dir = "/home/me/.local/share/parley"

# Quiet period before conversations are written to disk, in milliseconds
save_debounce_ms = 250

# Titles derived from a conversation's first message are cut to this length
title_max_chars = 50

# Network timeouts, in seconds
# connect_timeout_secs = 10
# idle_timeout_secs = 60
"#
}
