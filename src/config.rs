use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub ordering: OrderingConfig,

    #[serde(default)]
    pub undo: UndoConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderingConfig {
    /// Spacing between neighbouring sort keys after a redistribution.
    #[serde(default = "default_sort_step")]
    pub step: i64,

    /// Smallest gap tolerated between neighbours before the group is
    /// renumbered.
    #[serde(default = "default_min_gap")]
    pub min_gap: i64,
}

fn default_sort_step() -> i64 {
    1000
}

fn default_min_gap() -> i64 {
    10
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            step: default_sort_step(),
            min_gap: default_min_gap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoConfig {
    /// How long a deleted tag can be restored, in milliseconds.
    #[serde(default = "default_undo_window_ms")]
    pub window_ms: u64,
}

fn default_undo_window_ms() -> u64 {
    5000
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self {
            window_ms: default_undo_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Quiet period before a filter change is evaluated, in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    150
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Directories scanned to build the media universe.
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "gif".to_string(),
        "webp".to_string(),
        "heic".to_string(),
        "heif".to_string(),
        "mp4".to_string(),
        "mov".to_string(),
    ]
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            image_extensions: default_image_extensions(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tagweave")
        .join("tags.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ordering: OrderingConfig::default(),
            undo: UndoConfig::default(),
            filter: FilterConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tagweave")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}
