use anyhow::{Context, Result};
use directories::BaseDirs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the storage root
pub const HOME_ENV: &str = "BNSWAP_HOME";

/// All computed paths of the tool's private storage
#[derive(Debug, Clone)]
pub struct Paths {
    /// <data_local_dir>/bnswap
    pub base_dir: PathBuf,
    /// <base>/accounts
    pub accounts_dir: PathBuf,
    /// <base>/accounts.json
    pub catalog_file: PathBuf,
    /// <base>/state.json
    pub state_file: PathBuf,
    /// <base>/config.json
    pub config_file: PathBuf,
    /// <base>/engine.lock
    pub lock_file: PathBuf,
}

impl Paths {
    pub fn new() -> Result<Self> {
        if let Some(root) = std::env::var_os(HOME_ENV) {
            return Ok(Self::from_root(PathBuf::from(root)));
        }

        let base_dirs = BaseDirs::new().context("Failed to determine home directory")?;
        Ok(Self::from_root(base_dirs.data_local_dir().join("bnswap")))
    }

    /// Lay out every path under an explicit storage root
    pub fn from_root(base_dir: PathBuf) -> Self {
        Self {
            accounts_dir: base_dir.join("accounts"),
            catalog_file: base_dir.join("accounts.json"),
            state_file: base_dir.join("state.json"),
            config_file: base_dir.join("config.json"),
            lock_file: base_dir.join("engine.lock"),
            base_dir,
        }
    }

    /// <base>/accounts/<id>
    pub fn identity_dir(&self, id: &str) -> PathBuf {
        self.accounts_dir.join(id)
    }

    /// <base>/accounts/<id>/<snapshot_name>.reg
    pub fn snapshot_file(&self, id: &str, snapshot_name: &str) -> PathBuf {
        self.identity_dir(id).join(format!("{}.reg", snapshot_name))
    }

    /// Check if a path is within the accounts directory
    pub fn is_in_accounts_dir(&self, path: &Path) -> bool {
        path.starts_with(&self.accounts_dir)
    }

    /// Identity id owning `path`, if it lies inside the accounts directory
    pub fn identity_of(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.accounts_dir)
            .ok()
            .and_then(|p| p.components().next())
            .and_then(|c| c.as_os_str().to_str())
            .map(str::to_string)
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.accounts_dir).with_context(|| {
            format!(
                "Failed to create accounts directory: {:?}",
                self.accounts_dir
            )
        })?;
        Ok(())
    }
}
