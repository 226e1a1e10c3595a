use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub capture: CaptureConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    // Overrides ~/.shelltape when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    // Default age cutoff for `clean`
    pub retention_days: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    pub max_output_size: usize,
    // How long to keep draining the PTY after the child exited
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayConfig {
    pub list_limit: usize,
    // How many recent records the browser loads
    pub browse_limit: usize,
    // Where the browser writes exports; ~/shelltape-export.md when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            retention_days: 90,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_output_size: 100_000, // 100KB
            drain_timeout_ms: 200,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            list_limit: 20,
            browse_limit: 5_000,
            export_path: None,
        }
    }
}

impl Config {
    /// Load `~/.shelltape/config.toml`, writing the defaults on first use.
    pub fn new() -> Result<Self> {
        Self::load_or_init(&Self::get_config_path())
    }

    pub fn load_or_init(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config: {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config: {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            // A read-only home must not stop commands from running
            if let Err(err) = config.save(config_path) {
                tracing::debug!("could not write default config: {err:#}");
            }
            Ok(config)
        }
    }

    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(config_dir) = config_path.parent() {
            fs::create_dir_all(config_dir)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;
        Ok(())
    }

    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shelltape")
    }

    fn get_config_path() -> PathBuf {
        Self::default_dir().join("config.toml")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(Self::default_dir)
    }

    pub fn export_path(&self) -> PathBuf {
        self.display.export_path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("shelltape-export.md")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.capture.max_output_size, 100_000);
        assert_eq!(config.storage.retention_days, 90);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[capture]\nmax_output_size = 512\n").unwrap();

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config.capture.max_output_size, 512);
        assert_eq!(config.capture.drain_timeout_ms, 200);
        assert_eq!(config.display.list_limit, 20);
    }
}
