//! Engine configuration.
//!
//! Every location and timing the engine depends on lives here instead of in
//! constants, so tests can point the engine at a temporary directory standing
//! in for the live client state. Defaults follow the Windows install layout.

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::identities::RegionTag;

/// How an identity's data is attached to the live state roots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// Full mirror copy into the live roots
    #[default]
    Copy,
    /// Live roots become links (junctions) to the identity directory
    Link,
}

/// Launcher argument passed for each region tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionArgs {
    pub cn: Option<String>,
    pub global: Option<String>,
}

impl Default for RegionArgs {
    fn default() -> Self {
        Self {
            cn: Some("CN".to_string()),
            global: Some("KR".to_string()),
        }
    }
}

impl RegionArgs {
    pub fn for_tag(&self, tag: RegionTag) -> Option<&str> {
        match tag {
            RegionTag::Cn => self.cn.as_deref(),
            RegionTag::Global => self.global.as_deref(),
        }
    }
}

/// Registry slice holding the client's cached auth tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub enabled: bool,
    /// Key whose siblings (encryption key, machine id) must survive switches
    pub subtree: String,
    /// Subkey of `subtree` holding one value per cached token
    pub token_container: String,
    /// Snapshot file stem inside the identity directory
    pub snapshot_name: String,
    /// Also export the whole `subtree` next to the snapshot (never imported)
    pub full_backup: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(windows),
            subtree: r"HKEY_CURRENT_USER\Software\Blizzard Entertainment\Battle.net".to_string(),
            token_container: "UnifiedAuth".to_string(),
            snapshot_name: "auth".to_string(),
            full_backup: false,
        }
    }
}

impl RegistryConfig {
    /// Full path of the token container key
    pub fn token_key(&self) -> String {
        format!("{}\\{}", self.subtree, self.token_container)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Live "local" state root (%LOCALAPPDATA%\Battle.net)
    pub local_root: PathBuf,
    /// Live "roaming" state root (%APPDATA%\Battle.net)
    pub roaming_root: PathBuf,
    pub launcher: PathBuf,
    /// Case-insensitive substring matched against process names
    pub process_name: String,
    pub attach: AttachMode,
    pub stop_settle_ms: u64,
    pub link_settle_ms: u64,
    /// Top-level entries of the live roots never captured
    pub mirror_exclude: Vec<String>,
    /// Client config file inside the roaming root
    pub client_config_file: String,
    pub launch_after_switch: bool,
    pub region_args: RegionArgs,
    pub registry: RegistryConfig,
}

impl Default for Config {
    fn default() -> Self {
        let (local_root, roaming_root) = match BaseDirs::new() {
            Some(dirs) => (
                dirs.data_local_dir().join("Battle.net"),
                dirs.data_dir().join("Battle.net"),
            ),
            None => (PathBuf::from("Battle.net"), PathBuf::from("Battle.net")),
        };

        Self {
            local_root,
            roaming_root,
            launcher: default_launcher(),
            process_name: "battle.net".to_string(),
            attach: AttachMode::Copy,
            stop_settle_ms: 3000,
            link_settle_ms: 300,
            mirror_exclude: vec!["Logs".to_string()],
            client_config_file: "Battle.net.config".to_string(),
            launch_after_switch: true,
            region_args: RegionArgs::default(),
            registry: RegistryConfig::default(),
        }
    }
}

fn default_launcher() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Program Files (x86)\Battle.net\Battle.net Launcher.exe")
    } else {
        PathBuf::from("Battle.net Launcher.exe")
    }
}

impl Config {
    /// Read config from file, returning defaults if the file doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Write config atomically (temp file, then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, content)
            .with_context(|| format!("Failed to write temp config file: {:?}", temp_path))?;
        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename config file: {:?} -> {:?}", temp_path, path))
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn link_settle(&self) -> Duration {
        Duration::from_millis(self.link_settle_ms)
    }

    /// Live client config file (holds the saved-accounts list)
    pub fn client_config_path(&self) -> PathBuf {
        self.roaming_root.join(&self.client_config_file)
    }
}
