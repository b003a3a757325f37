//! Tree configuration
//!
//! Node behavior is an immutable [`NodeOptions`] value. How children obtain
//! theirs is decided once, at node construction, by the tree's
//! [`SharingPolicy`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::constants::defaults;

/// How far an expansion rebuilds below the expanding node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpandMode {
    /// Build the direct children only
    #[default]
    Children,
    /// Build the whole subtree
    Descendants,
}

/// Which nodes share one options value
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SharingPolicy {
    /// Every node in the tree shares the root's options
    #[default]
    TreeShared,
    /// Siblings share one copy derived from their parent
    PeerShared,
    /// Every node owns its own copy
    Cloned,
}

/// Per-node behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeOptions {
    /// Build children only when the parent expands
    #[serde(default = "default_lazy")]
    pub lazy: bool,
    #[serde(default)]
    pub expand_mode: ExpandMode,
    /// Used when a request does not say whether it is recursive
    #[serde(default = "default_recursive")]
    pub recursive_default: bool,
    /// Visibility transition length; `None` resolves immediately
    #[serde(default)]
    pub transition_ms: Option<u64>,
}

fn default_lazy() -> bool {
    defaults::LAZY
}

fn default_recursive() -> bool {
    defaults::RECURSIVE
}

fn default_show_root() -> bool {
    defaults::SHOW_ROOT
}

impl NodeOptions {
    pub fn transition(&self) -> Option<Duration> {
        self.transition_ms.map(Duration::from_millis)
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            lazy: default_lazy(),
            expand_mode: ExpandMode::default(),
            recursive_default: default_recursive(),
            transition_ms: None,
        }
    }
}

/// Full tree configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TreeConfig {
    /// A hidden root is a transparent placeholder that always builds its children
    #[serde(default = "default_show_root")]
    pub show_root: bool,
    #[serde(default)]
    pub sharing: SharingPolicy,
    /// Options of the root node; children derive theirs per `sharing`
    #[serde(default)]
    pub options: NodeOptions,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            show_root: default_show_root(),
            sharing: SharingPolicy::default(),
            options: NodeOptions::default(),
        }
    }
}

impl TreeConfig {
    /// Load configuration from a JSON file, falling back to defaults if absent
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).await.map_err(ConfigError::Io)?;

        serde_json::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save configuration as pretty JSON
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(ConfigError::Io)?;
        }

        let contents = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        fs::write(path, contents).await.map_err(ConfigError::Io)?;

        log::info!("Tree configuration saved to {:?}", path);
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(serde_json::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TreeConfig::load(&dir.path().join("tree.json")).await.unwrap();
        assert_eq!(config, TreeConfig::default());
        assert!(config.options.lazy);
        assert!(config.show_root);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tree.json");

        let config = TreeConfig {
            show_root: false,
            sharing: SharingPolicy::PeerShared,
            options: NodeOptions {
                lazy: false,
                expand_mode: ExpandMode::Descendants,
                recursive_default: true,
                transition_ms: Some(150),
            },
        };
        config.save(&path).await.unwrap();

        let loaded = TreeConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.options.transition(), Some(Duration::from_millis(150)));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{"sharing": "cloned", "options": {"expandMode": "descendants"}}"#;
        let config: TreeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sharing, SharingPolicy::Cloned);
        assert_eq!(config.options.expand_mode, ExpandMode::Descendants);
        assert!(config.options.lazy);
        assert!(config.show_root);
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        assert!(matches!(
            TreeConfig::load(&path).await,
            Err(ConfigError::Parse(_))
        ));
    }
}
