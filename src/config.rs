//! Terminal configuration.
//!
//! Read from `pos-config.json` in the data directory; every field has a
//! default so a missing or partial file is fine. A few environment variables
//! override the file for service deployments.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{PosError, Result};
use crate::images::DEFAULT_THUMBNAIL_BUDGET;
use crate::receipt::LayoutConfig;

pub const CONFIG_FILE_NAME: &str = "pos-config.json";

pub const ENV_DATA_DIR: &str = "POS_DATA_DIR";
pub const ENV_REMOTE_URL: &str = "POS_REMOTE_URL";
pub const ENV_REMOTE_API_KEY: &str = "POS_REMOTE_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosConfig {
    pub data_dir: PathBuf,
    pub remote_url: String,
    /// Never written back to disk; prefer the OS credential store.
    #[serde(skip_serializing)]
    pub remote_api_key: Option<String>,

    /// Minimum age of the last reference download before a non-forced
    /// refresh fetches again.
    pub freshness_window_secs: u64,
    /// Safety-net full sync interval.
    pub sync_interval_secs: u64,
    pub network_check_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    pub completed_orders_to_keep: usize,

    pub thumbnail_budget_bytes: usize,
    pub image_batch_size: usize,

    /// `None` retries failed outbox entries on every pass.
    pub max_outbox_retries: Option<u32>,

    /// Printed at the top of every receipt.
    pub organization_name: String,
    /// Characters per receipt line (32 for 58 mm paper, 48 for 80 mm).
    pub receipt_width: usize,
    pub receipt_footer: Option<String>,
}

impl Default for PosConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: String::new(),
            remote_api_key: None,
            freshness_window_secs: 60 * 60,
            sync_interval_secs: 30 * 60,
            network_check_interval_secs: 15,
            maintenance_interval_secs: 30 * 60,
            completed_orders_to_keep: 200,
            thumbnail_budget_bytes: DEFAULT_THUMBNAIL_BUDGET,
            image_batch_size: 5,
            max_outbox_retries: None,
            organization_name: "The Small".to_string(),
            receipt_width: 48,
            receipt_footer: Some("Thank you".to_string()),
        }
    }
}

/// Platform data directory for the terminal.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.pos")
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl PosConfig {
    /// Resolve the data directory, read its config file, then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let data_dir = non_empty_env(ENV_DATA_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let mut config = Self::from_dir(&data_dir)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Read `{data_dir}/pos-config.json`, falling back to defaults when the
    /// file does not exist.
    pub fn from_dir(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let parsed: PosConfig = serde_json::from_str(&raw).map_err(|e| {
                PosError::Config(format!("{}: {e}", path.display()))
            })?;
            info!("Loaded config from {}", path.display());
            parsed
        } else {
            info!("No config file at {}, using defaults", path.display());
            PosConfig::default()
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(url) = non_empty_env(ENV_REMOTE_URL) {
            self.remote_url = url;
        }
        if let Some(key) = non_empty_env(ENV_REMOTE_API_KEY) {
            self.remote_api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("freshness_window_secs", self.freshness_window_secs),
            ("sync_interval_secs", self.sync_interval_secs),
            ("network_check_interval_secs", self.network_check_interval_secs),
            ("maintenance_interval_secs", self.maintenance_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(PosError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.image_batch_size == 0 {
            return Err(PosError::Config("image_batch_size must be at least 1".into()));
        }
        if self.thumbnail_budget_bytes < 1024 {
            return Err(PosError::Config(
                "thumbnail_budget_bytes must be at least 1024".into(),
            ));
        }
        if self.receipt_width < 24 {
            return Err(PosError::Config("receipt_width must be at least 24".into()));
        }
        Ok(())
    }

    /// API key from config or environment, else the OS credential store.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.remote_api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                let stored = crate::storage::get_api_key();
                if stored.is_none() {
                    warn!("No backend API key configured");
                }
                stored
            })
    }

    /// Write the current config (minus the API key) back to the data dir.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let path = self.data_dir.join(CONFIG_FILE_NAME);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn receipts_dir(&self) -> PathBuf {
        self.data_dir.join("receipts")
    }

    pub fn receipt_layout(&self) -> LayoutConfig {
        LayoutConfig {
            width: self.receipt_width,
            organization_name: self.organization_name.clone(),
            footer_text: self.receipt_footer.clone(),
        }
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn network_check_interval(&self) -> Duration {
        Duration::from_secs(self.network_check_interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}
