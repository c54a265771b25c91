//! Registry access backends.
//!
//! `RegTool` drives the stock `reg.exe` tool. `MemoryRegistry` keeps keys in
//! process and speaks the same export format, for platforms without a
//! registry and for exercising the snapshot store end to end.

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use super::regfile::{RegFile, RegKey, RegValue};

pub trait RegistryBackend: Send + Sync {
    /// Export `key` and its subkeys to `dest` in the native format
    fn export_key(&self, key: &str, dest: &Path) -> Result<()>;

    /// Import a native export file, merging into existing keys
    fn import_file(&self, src: &Path) -> Result<()>;

    /// Names of the values directly under `key`, in enumeration order
    fn value_names(&self, key: &str) -> Result<Vec<String>>;

    fn delete_value(&self, key: &str, name: &str) -> Result<()>;
}

/// Backend shelling out to `reg.exe`
#[derive(Debug, Clone, Default)]
pub struct RegTool;

impl RegTool {
    fn run(verb: &str, cmd: &mut Command) -> Result<String> {
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run reg {}", verb))?;

        if !output.status.success() {
            bail!(
                "reg {} exited with {}: {}",
                verb,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RegistryBackend for RegTool {
    fn export_key(&self, key: &str, dest: &Path) -> Result<()> {
        Self::run(
            "export",
            Command::new("reg").arg("export").arg(key).arg(dest).arg("/y"),
        )?;
        Ok(())
    }

    fn import_file(&self, src: &Path) -> Result<()> {
        Self::run("import", Command::new("reg").arg("import").arg(src))?;
        Ok(())
    }

    fn value_names(&self, key: &str) -> Result<Vec<String>> {
        let out = Self::run("query", Command::new("reg").arg("query").arg(key))?;
        Ok(parse_query_values(&out))
    }

    fn delete_value(&self, key: &str, name: &str) -> Result<()> {
        Self::run(
            "delete",
            Command::new("reg")
                .args(["delete", key, "/v", name, "/f"]),
        )?;
        Ok(())
    }
}

/// Extract value names from `reg query <key>` output.
///
/// Value lines look like `    <name>    REG_<TYPE>    <data>` and belong to
/// the first key block; later `HKEY_...` lines are subkeys.
pub fn parse_query_values(output: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut seen_key = false;

    for line in output.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(' ') {
            if seen_key {
                break;
            }
            seen_key = true;
            continue;
        }
        if let Some((name, _)) = line.trim_start().split_once("    REG_")
            && name != "(Default)"
        {
            names.push(name.to_string());
        }
    }
    names
}

/// In-process registry keyed by full key path
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    keys: Mutex<Vec<RegKey>>,
}

fn is_under(path: &str, root: &str) -> bool {
    let path = path.to_lowercase();
    let root = root.to_lowercase();
    path == root || path.starts_with(&format!("{}\\", root))
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> std::sync::MutexGuard<'_, Vec<RegKey>> {
        // A panic while holding the lock cannot leave a half-written key
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create or overwrite one value, creating the key if needed
    pub fn set_value(&self, key: &str, name: &str, value: RegValue) {
        let mut keys = self.keys();
        let idx = match keys.iter().position(|k| k.path.eq_ignore_ascii_case(key)) {
            Some(idx) => idx,
            None => {
                keys.push(RegKey::new(key));
                keys.len() - 1
            }
        };
        let entry = &mut keys[idx];
        match entry.values.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => entry.values.push((name.to_string(), value)),
        }
    }

    fn ensure_key(&self, key: &str) {
        let mut keys = self.keys();
        if !keys.iter().any(|k| k.path.eq_ignore_ascii_case(key)) {
            keys.push(RegKey::new(key));
        }
    }

    pub fn get_value(&self, key: &str, name: &str) -> Option<RegValue> {
        self.keys()
            .iter()
            .find(|k| k.path.eq_ignore_ascii_case(key))
            .and_then(|k| k.values.iter().find(|(n, _)| n == name))
            .map(|(_, v)| v.clone())
    }
}

impl RegistryBackend for MemoryRegistry {
    fn export_key(&self, key: &str, dest: &Path) -> Result<()> {
        let file = RegFile {
            keys: self
                .keys()
                .iter()
                .filter(|k| is_under(&k.path, key))
                .cloned()
                .collect(),
        };
        if file.keys.is_empty() {
            bail!("The system was unable to find the specified registry key: {}", key);
        }
        file.write(dest)
    }

    fn import_file(&self, src: &Path) -> Result<()> {
        let file = RegFile::read(src)?;
        for key in file.keys {
            if key.values.is_empty() {
                self.ensure_key(&key.path);
            }
            for (name, value) in key.values {
                self.set_value(&key.path, &name, value);
            }
        }
        Ok(())
    }

    fn value_names(&self, key: &str) -> Result<Vec<String>> {
        self.keys()
            .iter()
            .find(|k| k.path.eq_ignore_ascii_case(key))
            .map(|k| k.value_names().map(str::to_string).collect())
            .with_context(|| format!("Registry key not found: {}", key))
    }

    fn delete_value(&self, key: &str, name: &str) -> Result<()> {
        let mut keys = self.keys();
        let entry = keys
            .iter_mut()
            .find(|k| k.path.eq_ignore_ascii_case(key))
            .with_context(|| format!("Registry key not found: {}", key))?;
        let before = entry.values.len();
        entry.values.retain(|(n, _)| n != name);
        if entry.values.len() == before {
            bail!("Registry value not found: {}\\{}", key, name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: &str = r"HKEY_CURRENT_USER\Software\Test\Auth";

    #[test]
    fn test_parse_query_values() {
        let out = [
            "",
            r"HKEY_CURRENT_USER\Software\Test\Auth",
            "    (Default)    REG_SZ    ",
            "    tok one    REG_BINARY    0102",
            "    tok2    REG_BINARY    0304",
            "",
            r"HKEY_CURRENT_USER\Software\Test\Auth\Sub",
            "    nested    REG_SZ    x",
        ]
        .join("\r\n");
        assert_eq!(parse_query_values(&out), vec!["tok one", "tok2"]);
    }

    #[test]
    fn test_memory_export_import() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("auth.reg");

        let reg = MemoryRegistry::new();
        reg.set_value(KEY, "a", RegValue::Binary(vec![1]));
        reg.set_value(&format!("{}\\Sub", KEY), "b", RegValue::Dword(2));
        reg.set_value(r"HKEY_CURRENT_USER\Software\Test\Authority", "c", RegValue::Dword(3));
        reg.export_key(KEY, &file).unwrap();

        let exported = RegFile::read(&file).unwrap();
        assert_eq!(exported.keys.len(), 2);

        let other = MemoryRegistry::new();
        other.set_value(KEY, "z", RegValue::Dword(9));
        other.import_file(&file).unwrap();
        assert_eq!(other.value_names(KEY).unwrap(), vec!["z", "a"]);
        assert_eq!(other.get_value(&format!("{}\\Sub", KEY), "b"), Some(RegValue::Dword(2)));
    }

    #[test]
    fn test_memory_missing_key() {
        let temp = TempDir::new().unwrap();
        let reg = MemoryRegistry::new();
        assert!(reg.value_names(KEY).is_err());
        assert!(reg.export_key(KEY, &temp.path().join("x.reg")).is_err());
    }

    #[test]
    fn test_memory_delete_value() {
        let reg = MemoryRegistry::new();
        reg.set_value(KEY, "a", RegValue::Dword(1));
        reg.set_value(KEY, "b", RegValue::Dword(2));

        reg.delete_value(KEY, "a").unwrap();
        assert_eq!(reg.value_names(KEY).unwrap(), vec!["b"]);
        assert!(reg.delete_value(KEY, "a").is_err());
    }
}
