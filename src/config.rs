use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CATALOG_URL: &str = "https://github.com/skyline69/balatro-mod-index";
pub const DEFAULT_BRANCH: &str = "main";
const CONFIG_FILE: &str = "config.json";
const LOG_FILE: &str = "pokerface.log";
const MIRROR_DIR: &str = "modrepo";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub mirror_dir: Option<PathBuf>,
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub cache_thumbnails: bool,
    #[serde(skip)]
    pub data_dir: PathBuf,
}

impl AppConfig {
    pub fn defaults(data_dir: PathBuf) -> Self {
        Self {
            catalog_url: default_catalog_url(),
            branch: default_branch(),
            mirror_dir: None,
            sync_timeout_secs: default_sync_timeout(),
            cache_thumbnails: true,
            data_dir,
        }
    }

    /// Loads `config.json` from `data_dir` (or the platform default), writing
    /// a fresh one when none exists yet.
    pub fn load_or_create(data_dir: Option<&Path>) -> Result<Self> {
        let data_dir = match data_dir {
            Some(dir) => dir.to_path_buf(),
            None => base_data_dir()?,
        };
        fs::create_dir_all(&data_dir).context("create app data dir")?;

        let path = data_dir.join(CONFIG_FILE);
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            config.data_dir = data_dir;
            if config.branch.trim().is_empty() {
                config.branch = default_branch();
                config.save()?;
            }
            return Ok(config);
        }

        let config = AppConfig::defaults(data_dir);
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir).context("create app data dir")?;
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(self.config_path(), raw).context("write app config")?;
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE)
    }

    pub fn mirror_root(&self) -> PathBuf {
        self.mirror_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(MIRROR_DIR))
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        if self.sync_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sync_timeout_secs))
        }
    }
}

fn default_catalog_url() -> String {
    DEFAULT_CATALOG_URL.to_string()
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_sync_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("pokerface"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn creates_defaults_on_first_run() {
        let temp = TempDir::new().unwrap();
        let config = AppConfig::load_or_create(Some(temp.path())).unwrap();

        assert!(temp.path().join("config.json").exists());
        assert_eq!(config.catalog_url, DEFAULT_CATALOG_URL);
        assert_eq!(config.branch, "main");
        assert_eq!(config.mirror_root(), temp.path().join("modrepo"));
        assert_eq!(config.sync_timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn reload_keeps_saved_values() {
        let temp = TempDir::new().unwrap();
        let mut config = AppConfig::load_or_create(Some(temp.path())).unwrap();
        config.catalog_url = "file:///srv/catalog".to_string();
        config.sync_timeout_secs = 0;
        config.save().unwrap();

        let reloaded = AppConfig::load_or_create(Some(temp.path())).unwrap();
        assert_eq!(reloaded, config);
        assert_eq!(reloaded.sync_timeout(), None);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("config.json"),
            r#"{ "branch": "", "mirror_dir": "/tmp/elsewhere" }"#,
        )
        .unwrap();

        let config = AppConfig::load_or_create(Some(temp.path())).unwrap();
        assert_eq!(config.branch, "main");
        assert_eq!(config.catalog_url, DEFAULT_CATALOG_URL);
        assert_eq!(config.mirror_root(), PathBuf::from("/tmp/elsewhere"));
        assert!(config.cache_thumbnails);
    }
}
