//! Registry snapshot store.
//!
//! Backs up and restores the key holding the client's cached auth tokens
//! (one value per token) without touching sibling keys such as the
//! encryption key or machine identity, which must persist across switches.
//!
//! Every operation is best-effort: failures are logged and reported as
//! `false`. The directory restore is the source of truth; the registry
//! restore only matters for the service variant whose session does not
//! resume from the directories alone.

pub mod backend;
pub mod regfile;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::RegistryConfig;
use backend::RegistryBackend;
use regfile::RegFile;

pub struct RegistrySnapshots {
    backend: Arc<dyn RegistryBackend>,
    config: RegistryConfig,
}

impl RegistrySnapshots {
    pub fn new(backend: Arc<dyn RegistryBackend>, config: RegistryConfig) -> Self {
        Self { backend, config }
    }

    pub fn token_key(&self) -> String {
        self.config.token_key()
    }

    /// Export the token container to `dest`. A previous file at `dest` is
    /// removed first so a failed export never leaves an older snapshot behind.
    pub fn export(&self, dest: &Path) -> bool {
        let key = self.token_key();
        if let Err(e) = prepare_dest(dest) {
            tracing::warn!(dest = %dest.display(), "Cannot prepare snapshot file: {e:#}");
            return false;
        }

        let ok = match self.backend.export_key(&key, dest) {
            Ok(()) => {
                tracing::info!(key = %key, dest = %dest.display(), "Exported auth tokens");
                true
            }
            Err(e) => {
                tracing::warn!(key = %key, "Registry export failed: {e:#}");
                false
            }
        };

        if self.config.full_backup {
            let full = full_backup_path(dest);
            if let Err(e) = prepare_dest(&full)
                .and_then(|()| self.backend.export_key(&self.config.subtree, &full))
            {
                tracing::warn!(key = %self.config.subtree, "Full registry backup failed: {e:#}");
            }
        }
        ok
    }

    /// Restore `src` into the token container.
    ///
    /// Live tokens not present in the snapshot are deleted before the import,
    /// otherwise the client may pick a stale token of another identity over
    /// the restored one.
    pub fn import_merge(&self, src: &Path) -> bool {
        if !src.exists() {
            tracing::info!(src = %src.display(), "No registry snapshot to restore");
            return false;
        }

        let snapshot = match RegFile::read(src) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Unreadable registry snapshot: {e:#}");
                return false;
            }
        };

        let key = self.token_key();
        let keep = snapshot_token_names(&snapshot, &key);
        for name in self.list_token_names() {
            if keep.iter().any(|k| k.eq_ignore_ascii_case(&name)) {
                continue;
            }
            match self.backend.delete_value(&key, &name) {
                Ok(()) => tracing::info!(token = %name, "Pruned foreign auth token"),
                Err(e) => tracing::warn!(token = %name, "Failed to prune auth token: {e:#}"),
            }
        }

        match self.backend.import_file(src) {
            Ok(()) => {
                tracing::info!(src = %src.display(), tokens = keep.len(), "Restored auth tokens");
                true
            }
            Err(e) => {
                tracing::warn!("Registry import failed: {e:#}");
                false
            }
        }
    }

    /// Live token names in enumeration order; empty if the key is missing
    pub fn list_token_names(&self) -> Vec<String> {
        match self.backend.value_names(&self.token_key()) {
            Ok(names) => names,
            Err(e) => {
                tracing::debug!("Cannot list auth tokens: {e:#}");
                Vec::new()
            }
        }
    }

    /// Delete every live token except the last enumerated (most recently
    /// added) one. Returns how many were deleted.
    pub fn prune_all_but_newest(&self) -> usize {
        let names = self.list_token_names();
        let Some((_newest, older)) = names.split_last() else {
            return 0;
        };

        let key = self.token_key();
        older
            .iter()
            .filter(|name| match self.backend.delete_value(&key, name) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(token = %name, "Failed to prune auth token: {e:#}");
                    false
                }
            })
            .count()
    }
}

/// Token names recorded in a snapshot for the given container key
pub fn snapshot_token_names(file: &RegFile, token_key: &str) -> Vec<String> {
    file.key(token_key)
        .map(|k| k.value_names().map(str::to_string).collect())
        .unwrap_or_default()
}

/// `<stem>_full.reg` next to the snapshot
pub fn full_backup_path(snapshot: &Path) -> PathBuf {
    let stem = snapshot
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("snapshot");
    snapshot.with_file_name(format!("{}_full.reg", stem))
}

fn prepare_dest(dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if dest.exists() {
        fs::remove_file(dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::MemoryRegistry;
    use regfile::RegValue;
    use tempfile::TempDir;

    fn setup() -> (Arc<MemoryRegistry>, RegistrySnapshots) {
        let reg = Arc::new(MemoryRegistry::new());
        let config = RegistryConfig {
            enabled: true,
            ..RegistryConfig::default()
        };
        let store = RegistrySnapshots::new(reg.clone(), config);
        (reg, store)
    }

    #[test]
    fn test_export_only_token_container() {
        let temp = TempDir::new().unwrap();
        let (reg, store) = setup();
        let config = RegistryConfig::default();
        reg.set_value(&config.subtree, "EncryptionKey", RegValue::Binary(vec![9]));
        reg.set_value(&store.token_key(), "tokA", RegValue::Binary(vec![1]));

        let dest = temp.path().join("id/auth.reg");
        assert!(store.export(&dest));

        let file = RegFile::read(&dest).unwrap();
        assert_eq!(file.keys.len(), 1);
        assert_eq!(snapshot_token_names(&file, &store.token_key()), vec!["tokA"]);
    }

    #[test]
    fn test_failed_export_drops_old_snapshot() {
        let temp = TempDir::new().unwrap();
        let (_reg, store) = setup();
        let dest = temp.path().join("auth.reg");
        fs::write(&dest, "stale").unwrap();

        assert!(!store.export(&dest));
        assert!(!dest.exists());
    }

    #[test]
    fn test_import_merge_prunes_foreign_tokens() {
        let temp = TempDir::new().unwrap();
        let (reg, store) = setup();
        let key = store.token_key();
        let sibling = RegistryConfig::default().subtree;

        reg.set_value(&key, "alice", RegValue::Binary(vec![1]));
        let snap = temp.path().join("alice.reg");
        assert!(store.export(&snap));

        reg.delete_value(&key, "alice").unwrap();
        reg.set_value(&key, "bob", RegValue::Binary(vec![2]));
        reg.set_value(&sibling, "EncryptionKey", RegValue::Binary(vec![7]));

        assert!(store.import_merge(&snap));
        assert_eq!(store.list_token_names(), vec!["alice"]);
        assert_eq!(
            reg.get_value(&sibling, "EncryptionKey"),
            Some(RegValue::Binary(vec![7]))
        );
    }

    #[test]
    fn test_import_merge_without_snapshot_is_noop() {
        let temp = TempDir::new().unwrap();
        let (reg, store) = setup();
        reg.set_value(&store.token_key(), "bob", RegValue::Binary(vec![2]));

        assert!(!store.import_merge(&temp.path().join("missing.reg")));
        assert_eq!(store.list_token_names(), vec!["bob"]);
    }

    #[test]
    fn test_prune_all_but_newest() {
        let (reg, store) = setup();
        let key = store.token_key();
        assert_eq!(store.prune_all_but_newest(), 0);

        reg.set_value(&key, "old1", RegValue::Binary(vec![1]));
        reg.set_value(&key, "old2", RegValue::Binary(vec![2]));
        reg.set_value(&key, "new", RegValue::Binary(vec![3]));

        assert_eq!(store.prune_all_but_newest(), 2);
        assert_eq!(store.list_token_names(), vec!["new"]);
    }

    #[test]
    fn test_full_backup_path() {
        assert_eq!(
            full_backup_path(Path::new("/a/auth.reg")),
            PathBuf::from("/a/auth_full.reg")
        );
    }
}
