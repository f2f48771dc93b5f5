//! Configuration management for agent-relay
//!
//! Handles loading, saving and reloading the relay configuration, including
//! the list of tracked repositories.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::BackendKind;
use crate::config_diff::{self, RepositoryDiff};
use crate::error::{Error, Result};
use crate::persistence::PersistenceStore;

/// Main relay configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Tracked repositories
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

impl Config {
    /// Look up a repository by id
    pub fn repository(&self, id: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|repo| repo.id == id)
    }

    /// Parse and validate a configuration document
    ///
    /// The repository list is validated structurally before anything is
    /// deserialized, so a bad list rejects the whole document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let document: toml::Table = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config_diff::validate_document(&document)?;

        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }
}

/// General settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Where and for how long session state is kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory holding the session snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Sessions idle longer than this are swept
    pub retention_days: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            retention_days: 30,
            sweep_interval_secs: 3600,
        }
    }
}

impl PersistenceConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(PersistenceStore::default_state_dir)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 3600))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend used when neither the message nor the repository picks one
    pub default: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default: BackendKind::default().to_string(),
        }
    }
}

impl BackendConfig {
    pub fn default_kind(&self) -> Result<BackendKind> {
        self.default.parse()
    }
}

/// One tracked repository
///
/// Identity is `id`. Two configs with the same id are "modified" when they
/// differ in any field, including unknown keys kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub id: String,
    pub name: String,
    pub repository_path: PathBuf,
    pub base_branch: String,
    /// Where per-session worktrees are created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_base_dir: Option<PathBuf>,
    /// Backend name overriding the global default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(flatten)]
    pub extra: toml::Table,
}

fn default_true() -> bool {
    true
}

impl RepositoryConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        repository_path: impl Into<PathBuf>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            repository_path: repository_path.into(),
            base_branch: base_branch.into(),
            workspace_base_dir: None,
            backend: None,
            labels: Vec::new(),
            allowed_tools: Vec::new(),
            is_active: true,
            extra: toml::Table::new(),
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Backend configured for this repository, if any
    pub fn backend_kind(&self) -> Result<Option<BackendKind>> {
        self.backend.as_deref().map(str::parse).transpose()
    }
}

/// Configuration manager for loading, saving and reloading config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    ///
    /// A missing file yields the default configuration.
    pub fn with_path(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };

        Ok(Self { config_path, config })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("agent-relay").join("config.toml"))
    }

    /// Load configuration from a file
    pub fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        Config::from_toml_str(&content)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Re-read the config file and report how the repository list changed
    ///
    /// On any read or validation failure the current configuration stays in
    /// place.
    pub fn reload(&mut self) -> Result<RepositoryDiff> {
        let config = if self.config_path.exists() {
            Self::load_from_path(&self.config_path)?
        } else {
            Config::default()
        };

        let diff = config_diff::diff_repositories(&self.config.repositories, &config.repositories);
        info!(
            path = %self.config_path.display(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "Reloaded configuration"
        );
        self.config = config;
        Ok(diff)
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[general]
log_level = "debug"

[persistence]
retention_days = 7

[backend]
default = "codex"

[[repositories]]
id = "web"
name = "Web App"
repository_path = "/src/web"
base_branch = "main"
labels = ["frontend"]
team_keys = ["WEB"]

[[repositories]]
id = "api"
name = "API"
repository_path = "/src/api"
base_branch = "develop"
backend = "gemini"
is_active = false
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.persistence.retention_days, 30);
        assert_eq!(config.persistence.sweep_interval_secs, 3600);
        assert_eq!(config.backend.default_kind().unwrap(), BackendKind::Claude);
        assert!(config.repositories.is_empty());
    }

    #[test]
    fn test_parse_repositories() {
        let config = Config::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.persistence.retention(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.backend.default_kind().unwrap(), BackendKind::Codex);
        assert_eq!(config.repositories.len(), 2);

        let web = config.repository("web").unwrap();
        assert!(web.is_active);
        assert_eq!(web.labels, vec!["frontend".to_string()]);
        assert!(web.extra.contains_key("team_keys"));
        assert_eq!(web.backend_kind().unwrap(), None);

        let api = config.repository("api").unwrap();
        assert!(!api.is_active);
        assert_eq!(api.backend_kind().unwrap(), Some(BackendKind::Gemini));
    }

    #[test]
    fn test_invalid_repository_list_rejected() {
        let content = r#"
[[repositories]]
id = "web"
name = "Web App"
base_branch = "main"
"#;
        let result = Config::from_toml_str(content);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.toml")).unwrap();
        assert_eq!(manager.config(), &Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut manager = ConfigManager::with_path(&path).unwrap();
        manager
            .config_mut()
            .repositories
            .push(RepositoryConfig::new("web", "Web", "/src/web", "main").with_backend("codex"));
        manager.save().unwrap();

        let loaded = ConfigManager::with_path(&path).unwrap();
        assert_eq!(loaded.config(), manager.config());
    }

    #[test]
    fn test_reload_reports_diff_and_keeps_config_on_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let mut manager = ConfigManager::with_path(&path).unwrap();

        let updated = SAMPLE.replace("base_branch = \"develop\"", "base_branch = \"release\"");
        std::fs::write(&path, updated).unwrap();
        let diff = manager.reload().unwrap();
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].base_branch, "release");

        std::fs::write(&path, "[[repositories]]\nid = 3\n").unwrap();
        assert!(manager.reload().is_err());
        assert_eq!(manager.config().repository("api").unwrap().base_branch, "release");
    }
}
