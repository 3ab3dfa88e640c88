//! Configuration storage for user settings and run data.
//!
//! All files live under one root directory (defaults to ~/Documents/uFocus):
//! `user_settings.json`, the `data/` tree with per-run artifacts and `logs/`.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::settings::{FocusSettings, SettingsError};

const SETTINGS_FILE: &str = "user_settings.json";

/// Storage manager rooted at a single application directory.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Create a config storage with the default path (~/Documents/uFocus)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        let root_path = PathBuf::from(home).join("Documents").join("uFocus");
        Ok(Self { root_path })
    }

    /// Create a config storage with a custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Directory holding per-date run folders
    pub fn data_dir(&self) -> PathBuf {
        self.root_path.join("data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root_path.join("logs")
    }

    fn settings_path(&self) -> PathBuf {
        self.root_path.join(SETTINGS_FILE)
    }

    /// Create the root, data and logs directories if missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.root_path.clone(), self.data_dir(), self.logs_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Load the user settings, writing the defaults first if none exist yet.
    pub fn load_settings(&self) -> Result<FocusSettings, SettingsError> {
        let path = self.settings_path();

        if path.exists() {
            info!("Found existing user settings at {}", path.display());
            let contents = std::fs::read_to_string(&path)?;
            return Ok(serde_json::from_str(&contents)?);
        }

        info!("Using the default settings");
        let settings = FocusSettings::default();
        self.save_settings(&settings)?;
        Ok(settings)
    }

    /// Persist the user settings, returning the file written.
    pub fn save_settings(&self, settings: &FocusSettings) -> Result<PathBuf, SettingsError> {
        std::fs::create_dir_all(&self.root_path)?;
        let path = self.settings_path();
        let json = serde_json::to_string_pretty(settings)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Overwrite the stored settings with the defaults.
    pub fn reset_settings(&self) -> Result<FocusSettings, SettingsError> {
        let settings = FocusSettings::default();
        self.save_settings(&settings)?;
        Ok(settings)
    }
}
