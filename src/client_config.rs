//! The client's own JSON config in the live roaming root.
//!
//! Only the `Client.SavedAccountNames` list (comma separated, first entry is
//! the default login) and `Client.AutoLogin` are touched; every other key is
//! written back as it was read.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

const CLIENT: &str = "Client";
const SAVED_ACCOUNTS: &str = "SavedAccountNames";
const AUTO_LOGIN: &str = "AutoLogin";

fn read(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read client config: {:?}", path))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse client config: {:?}", path))?;
    Ok(Some(value))
}

/// Replace the file atomically so the client never reads a half-written config
fn write(path: &Path, value: &Value) -> Result<()> {
    let content = serde_json::to_string_pretty(value).context("Failed to serialize client config")?;
    let temp_path = path.with_extension("config.tmp");
    fs::write(&temp_path, content)
        .with_context(|| format!("Failed to write temp client config: {:?}", temp_path))?;
    fs::rename(&temp_path, path).with_context(|| {
        format!("Failed to rename client config: {:?} -> {:?}", temp_path, path)
    })
}

fn client_section(value: &mut Value) -> Result<&mut Map<String, Value>> {
    let root = value
        .as_object_mut()
        .context("Client config is not a JSON object")?;
    root.entry(CLIENT)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .context("Client section is not a JSON object")
}

/// Saved account names in order; empty if the file or key is missing
pub fn saved_accounts(path: &Path) -> Result<Vec<String>> {
    let Some(value) = read(path)? else {
        return Ok(Vec::new());
    };

    let names = value
        .get(CLIENT)
        .and_then(|c| c.get(SAVED_ACCOUNTS))
        .and_then(Value::as_str)
        .unwrap_or_default();

    Ok(names
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect())
}

/// First saved account, the one the client logs in by default
pub fn current_account(path: &Path) -> Option<String> {
    match saved_accounts(path) {
        Ok(names) => names.into_iter().next(),
        Err(e) => {
            tracing::debug!("Cannot read saved accounts: {e:#}");
            None
        }
    }
}

/// Replace the saved account list. Returns false if there is no config file.
///
/// An unchanged list leaves the file untouched.
pub fn set_saved_accounts(path: &Path, accounts: &[String]) -> Result<bool> {
    let Some(mut value) = read(path)? else {
        return Ok(false);
    };
    if saved_accounts(path)? == accounts {
        return Ok(true);
    }
    client_section(&mut value)?.insert(SAVED_ACCOUNTS.to_string(), Value::from(accounts.join(",")));
    write(path, &value)?;
    Ok(true)
}

/// Forget saved accounts and disable auto login, so the client shows a fresh
/// login screen. Returns false if there is no config file.
pub fn clear_login(path: &Path) -> Result<bool> {
    let Some(mut value) = read(path)? else {
        return Ok(false);
    };
    let client = client_section(&mut value)?;
    client.insert(SAVED_ACCOUNTS.to_string(), Value::from(""));
    client.insert(AUTO_LOGIN.to_string(), Value::from("false"));
    write(path, &value)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
  "Client": {
    "SavedAccountNames": "alice@example.com, bob@example.com",
    "AutoLogin": "true",
    "Install": { "DefaultInstallPath": "D:/Games" }
  },
  "Games": { "wow": { "Region": "CN" } }
}"#;

    #[test]
    fn test_saved_accounts() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Battle.net.config");
        fs::write(&path, SAMPLE).unwrap();

        assert_eq!(
            saved_accounts(&path).unwrap(),
            vec!["alice@example.com", "bob@example.com"]
        );
        assert_eq!(current_account(&path).as_deref(), Some("alice@example.com"));
    }

    #[test]
    fn test_missing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Battle.net.config");

        assert!(saved_accounts(&path).unwrap().is_empty());
        assert!(current_account(&path).is_none());
        assert!(!set_saved_accounts(&path, &["x".to_string()]).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn test_set_saved_accounts_preserves_other_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Battle.net.config");
        fs::write(&path, SAMPLE).unwrap();

        let accounts = vec!["bob@example.com".to_string(), "alice@example.com".to_string()];
        assert!(set_saved_accounts(&path, &accounts).unwrap());

        assert_eq!(current_account(&path).as_deref(), Some("bob@example.com"));
        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["Games"]["wow"]["Region"], "CN");
        assert_eq!(value["Client"]["Install"]["DefaultInstallPath"], "D:/Games");
    }

    #[test]
    fn test_unchanged_list_is_not_rewritten() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Battle.net.config");
        fs::write(&path, SAMPLE).unwrap();

        let accounts = vec!["alice@example.com".to_string(), "bob@example.com".to_string()];
        assert!(set_saved_accounts(&path, &accounts).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), SAMPLE);
    }

    #[test]
    fn test_rewrite_replaces_file_through_temp() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Battle.net.config");
        fs::write(&path, SAMPLE).unwrap();
        // Leftover of a rewrite that crashed before the rename
        fs::write(temp.path().join("Battle.net.config.tmp"), "{\"Cli").unwrap();

        assert!(set_saved_accounts(&path, &["bob@example.com".to_string()]).unwrap());
        assert!(clear_login(&path).unwrap());

        let entries: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries, vec!["Battle.net.config"]);
        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["Client"]["AutoLogin"], "false");
        assert_eq!(value["Games"]["wow"]["Region"], "CN");
    }

    #[test]
    fn test_clear_login() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Battle.net.config");
        fs::write(&path, SAMPLE).unwrap();

        assert!(clear_login(&path).unwrap());
        assert!(saved_accounts(&path).unwrap().is_empty());
        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["Client"]["AutoLogin"], "false");
    }

    #[test]
    fn test_config_without_client_section() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Battle.net.config");
        fs::write(&path, "{}").unwrap();

        assert!(set_saved_accounts(&path, &["a@x.io".to_string()]).unwrap());
        assert_eq!(current_account(&path).as_deref(), Some("a@x.io"));
    }
}
