use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DATA_DIR: &str = "/var/clamav/data";
pub const DEFAULT_MIRROR_URL: &str = "http://database.clamav.net";
pub const DEFAULT_MIRROR_DOMAIN: &str = "current.cvd.clamav.net";
pub const DEFAULT_DIFF_THRESHOLD: u16 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub mirror_url: String,
    pub mirror_domain: String,
    /// Versions behind the mirror after which the `.cvd` is re-downloaded.
    pub diff_threshold: u16,
    pub scratch_dir: Option<PathBuf>,
    pub sigtool_path: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub sigtool_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            mirror_url: DEFAULT_MIRROR_URL.into(),
            mirror_domain: DEFAULT_MIRROR_DOMAIN.into(),
            diff_threshold: DEFAULT_DIFF_THRESHOLD,
            scratch_dir: None,
            sigtool_path: None,
            http_timeout_secs: 300,
            connect_timeout_secs: 30,
            sigtool_timeout_secs: 60,
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening config file {}", path.display()))?;
        let config = serde_json::from_reader(file)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sigtool_timeout(&self) -> Duration {
        Duration::from_secs(self.sigtool_timeout_secs)
    }
}

/// Returns the absolute form of `dir` after checking that it exists and the
/// current user can create files in it.
pub fn validate_data_dir(dir: &Path) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(anyhow!(
            "Data file path doesn't exist or isn't accessible: {}",
            dir.display()
        ));
    }
    let abs = dir.canonicalize().with_context(|| {
        format!(
            "Unable to parse absolute path of data file path: {}",
            dir.display()
        )
    })?;
    tempfile::tempfile_in(&abs).with_context(|| {
        format!(
            "Data file path doesn't have write access for current user at path: {}",
            abs.display()
        )
    })?;
    Ok(abs)
}
