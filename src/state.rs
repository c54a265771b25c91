use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// State stored in <base>/state.json
///
/// The active identity is bookkeeping only; what is really live is derived
/// by inspecting the live state roots whenever possible.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct State {
    /// Identity most recently made live
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_identity: Option<String>,

    /// When the state was last updated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl State {
    /// Read state from file, returning default if file doesn't exist
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {:?}", path))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {:?}", path))
    }

    /// Write state to file atomically: write to temp file, then rename
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {:?}", parent))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)
            .with_context(|| format!("Failed to write temp state file: {:?}", temp_path))?;

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename state file: {:?} -> {:?}", temp_path, path))
    }

    /// Point the active identity at `id` (or clear it) and persist
    pub fn set_active(path: &Path, id: Option<&str>) -> Result<()> {
        let state = State {
            active_identity: id.map(str::to_string),
            updated_at: Some(Utc::now()),
        };
        state.write(path)
    }
}

/// Exclusive lock held for the whole of a capture/switch/update sequence,
/// so two processes never work on the live state at once
pub struct OperationLock {
    file: File,
}

impl OperationLock {
    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(Err(holder))` with the current holder's description if
    /// another process holds it.
    pub fn try_acquire(path: &Path, holder: &str) -> Result<Result<Self, String>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {:?}", parent))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() != fs2::lock_contended_error().kind() {
                return Err(e).with_context(|| format!("Failed to lock {:?}", path));
            }
            let mut current = String::new();
            let _ = file.read_to_string(&mut current);
            let current = current.trim();
            let holder = if current.is_empty() {
                "another bnswap process".to_string()
            } else {
                current.to_string()
            };
            return Ok(Err(holder));
        }

        file.set_len(0)
            .with_context(|| format!("Failed to truncate lock file: {:?}", path))?;
        file.seek(SeekFrom::Start(0))
            .with_context(|| format!("Failed to seek lock file: {:?}", path))?;
        writeln!(file, "{} (pid {})", holder, std::process::id())
            .with_context(|| format!("Failed to write lock file: {:?}", path))?;

        Ok(Ok(Self { file }))
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        // Release the lock (ignore errors during drop)
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}
