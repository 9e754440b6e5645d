//! Configuration loading.
//!
//! Two optional TOML files share one schema: the project file
//! `<root>/.tm/config.toml` and the user file `<config_dir>/tm/config.toml`.
//! Resolution order, lowest to highest: built-in defaults, user file,
//! project file, environment (`TM_PUSH_DELAY_MS`, `TM_PULL_INTERVAL_MS`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

pub const ENV_PUSH_DELAY_MS: &str = "TM_PUSH_DELAY_MS";
pub const ENV_PULL_INTERVAL_MS: &str = "TM_PULL_INTERVAL_MS";

/// Synchronizer timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Debounce between the first unsent change and the push.
    pub push_delay_ms: u64,
    /// Delay between a pull settling and the next pull.
    pub pull_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_delay_ms: default_push_delay_ms(),
            pull_interval_ms: default_pull_interval_ms(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn push_delay(&self) -> i64 {
        i64::try_from(self.push_delay_ms).unwrap_or(i64::MAX)
    }

    #[must_use]
    pub fn pull_interval(&self) -> i64 {
        i64::try_from(self.pull_interval_ms).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewConfig {
    /// Days before a deadline at which a task counts as "pushing it".
    pub pushing_it_days: u32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            pushing_it_days: default_pushing_it_days(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// On-disk schema. Every key is optional so a file only overrides what it
/// names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub view: ViewSection,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSection {
    #[serde(default)]
    pub push_delay_ms: Option<u64>,
    #[serde(default)]
    pub pull_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSection {
    #[serde(default)]
    pub pushing_it_days: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub sync: SyncConfig,
    pub view: ViewConfig,
    pub remote: RemoteConfig,
}

impl EffectiveConfig {
    /// Layer `file` over the current values.
    #[must_use]
    pub fn merged(mut self, file: &ConfigFile) -> Self {
        if let Some(ms) = file.sync.push_delay_ms {
            self.sync.push_delay_ms = ms;
        }
        if let Some(ms) = file.sync.pull_interval_ms {
            self.sync.pull_interval_ms = ms;
        }
        if let Some(days) = file.view.pushing_it_days {
            self.view.pushing_it_days = days;
        }
        if file.remote.endpoint.is_some() {
            self.remote.endpoint.clone_from(&file.remote.endpoint);
        }
        self
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Fails if an override is set but is not a non-negative integer.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_PUSH_DELAY_MS) {
            self.sync.push_delay_ms = parse_millis(ENV_PUSH_DELAY_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PULL_INTERVAL_MS) {
            self.sync.pull_interval_ms = parse_millis(ENV_PULL_INTERVAL_MS, &raw)?;
        }
        Ok(self)
    }
}

fn parse_millis(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("{name} must be a whole number of milliseconds, got '{raw}'"))
}

fn load_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ConfigFile>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

#[must_use]
pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(".tm/config.toml")
}

#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tm/config.toml"))
}

/// Load `<root>/.tm/config.toml`, or defaults when it is missing.
///
/// # Errors
///
/// Fails if the file exists but cannot be read or parsed.
pub fn load_project_config(project_root: &Path) -> Result<ConfigFile> {
    load_file(&project_config_path(project_root))
}

/// Load the user-level config file, or defaults when it is missing.
///
/// # Errors
///
/// Fails if the file exists but cannot be read or parsed.
pub fn load_user_config() -> Result<ConfigFile> {
    let Some(path) = user_config_path() else {
        return Ok(ConfigFile::default());
    };
    load_file(&path)
}

/// Defaults, then user file, then project file, then environment.
///
/// # Errors
///
/// Fails on an unreadable or malformed config file or a malformed
/// environment override.
pub fn resolve_config(project_root: &Path) -> Result<EffectiveConfig> {
    let user = load_user_config()?;
    let project = load_project_config(project_root)?;

    EffectiveConfig::default()
        .merged(&user)
        .merged(&project)
        .with_env(|name| env::var(name).ok())
}

const fn default_push_delay_ms() -> u64 {
    2_000
}

const fn default_pull_interval_ms() -> u64 {
    20_000
}

const fn default_pushing_it_days() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_project_config(root: &Path, content: &str) {
        let dir = root.join(".tm");
        std::fs::create_dir_all(&dir).expect("create .tm");
        std::fs::write(dir.join("config.toml"), content).expect("write config");
    }

    #[test]
    fn missing_project_config_uses_defaults() {
        let root = tempfile::tempdir().expect("tempdir");
        let file = load_project_config(root.path()).expect("load should succeed");
        assert_eq!(file, ConfigFile::default());

        let cfg = EffectiveConfig::default().merged(&file);
        assert_eq!(cfg.sync.push_delay_ms, 2_000);
        assert_eq!(cfg.sync.pull_interval_ms, 20_000);
        assert_eq!(cfg.view.pushing_it_days, 3);
        assert_eq!(cfg.remote.endpoint, None);
    }

    #[test]
    fn project_file_overrides_user_file() {
        let root = tempfile::tempdir().expect("tempdir");
        write_project_config(
            root.path(),
            r#"
[sync]
push_delay_ms = 500

[remote]
endpoint = "https://tasks.example.net"
"#,
        );
        let project = load_project_config(root.path()).expect("load");
        let user: ConfigFile = toml::from_str(
            r"
[sync]
push_delay_ms = 9000
pull_interval_ms = 60000

[view]
pushing_it_days = 5
",
        )
        .expect("parse user");

        let cfg = EffectiveConfig::default().merged(&user).merged(&project);
        assert_eq!(cfg.sync.push_delay_ms, 500);
        assert_eq!(cfg.sync.pull_interval_ms, 60_000);
        assert_eq!(cfg.view.pushing_it_days, 5);
        assert_eq!(cfg.remote.endpoint.as_deref(), Some("https://tasks.example.net"));
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [(ENV_PULL_INTERVAL_MS, " 1500 ")].into_iter().collect();
        let cfg = EffectiveConfig::default()
            .with_env(|name| env.get(name).map(|v| (*v).to_string()))
            .expect("env should parse");
        assert_eq!(cfg.sync.pull_interval_ms, 1_500);
        assert_eq!(cfg.sync.push_delay_ms, 2_000);
    }

    #[test]
    fn malformed_env_override_is_reported() {
        let err = EffectiveConfig::default()
            .with_env(|name| (name == ENV_PUSH_DELAY_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_PUSH_DELAY_MS));
    }

    #[test]
    fn malformed_file_names_the_path() {
        let root = tempfile::tempdir().expect("tempdir");
        write_project_config(root.path(), "[sync]\npush_delay_ms = \"fast\"\n");
        let err = load_project_config(root.path()).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }
}
