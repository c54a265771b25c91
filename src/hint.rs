//! Best-effort guess of who is logged in to the live client.
//!
//! The engine only consumes this to pick a default label; nothing
//! deterministic depends on it. Log formats change between client versions,
//! so every failure here degrades to "unknown".

use std::fs;
use std::path::PathBuf;

use crate::client_config;
use crate::config::Config;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityHint {
    pub contact_identifier: Option<String>,
    /// e.g. `Name#1234`
    pub display_tag: Option<String>,
}

impl IdentityHint {
    /// Display tag, else the local part of the contact identifier
    pub fn default_label(&self) -> Option<String> {
        self.display_tag.clone().or_else(|| {
            self.contact_identifier
                .as_deref()
                .map(|c| c.split('@').next().unwrap_or(c).to_string())
        })
    }
}

pub trait HintSource: Send + Sync {
    fn current_hint(&self) -> IdentityHint;
}

/// Reads the live client config and its most recent log files
#[derive(Debug, Clone)]
pub struct LiveStateScraper {
    client_config: PathBuf,
    logs_dir: PathBuf,
    max_logs: usize,
}

impl LiveStateScraper {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client_config: config.client_config_path(),
            logs_dir: config.local_root.join("Logs"),
            max_logs: 3,
        }
    }

    fn scan_logs(&self) -> Option<String> {
        let mut logs: Vec<PathBuf> = fs::read_dir(&self.logs_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
            .collect();
        // Log names start with a timestamp, newest sorts last
        logs.sort();

        logs.iter().rev().take(self.max_logs).find_map(|path| {
            let bytes = fs::read(path).ok()?;
            find_display_tag(&String::from_utf8_lossy(&bytes))
        })
    }
}

impl HintSource for LiveStateScraper {
    fn current_hint(&self) -> IdentityHint {
        IdentityHint {
            contact_identifier: client_config::current_account(&self.client_config),
            display_tag: self.scan_logs(),
        }
    }
}

/// Find the first `BattleTag: Name#1234` style mention in a log
pub fn find_display_tag(content: &str) -> Option<String> {
    const MARKER: &str = "BattleTag";

    content.match_indices(MARKER).find_map(|(idx, _)| {
        let rest = &content[idx + MARKER.len()..];
        let value = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
        if value.len() == rest.len() {
            return None;
        }

        let tag: String = value
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != ',')
            .collect();
        let (name, number) = tag.rsplit_once('#')?;
        let valid = !name.is_empty()
            && !number.is_empty()
            && number.chars().all(|c| c.is_ascii_digit());
        valid.then_some(tag)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_display_tag() {
        assert_eq!(
            find_display_tag("I 10:00 Login ok BattleTag: Hero#1234, region CN").as_deref(),
            Some("Hero#1234")
        );
        assert_eq!(
            find_display_tag("BattleTagless BattleTag Nova#42\n").as_deref(),
            Some("Nova#42")
        );
        assert_eq!(find_display_tag("BattleTag: pending"), None);
        assert_eq!(find_display_tag("nothing here"), None);
    }

    #[test]
    fn test_default_label() {
        let hint = IdentityHint {
            contact_identifier: Some("alice@example.com".into()),
            display_tag: None,
        };
        assert_eq!(hint.default_label().as_deref(), Some("alice"));

        let hint = IdentityHint {
            display_tag: Some("Hero#1234".into()),
            ..hint
        };
        assert_eq!(hint.default_label().as_deref(), Some("Hero#1234"));
    }

    #[test]
    fn test_scraper_reads_config_and_newest_logs() {
        let temp = TempDir::new().unwrap();
        let config = Config {
            local_root: temp.path().join("local"),
            roaming_root: temp.path().join("roaming"),
            ..Config::default()
        };
        let logs = config.local_root.join("Logs");
        fs::create_dir_all(&logs).unwrap();
        fs::create_dir_all(&config.roaming_root).unwrap();
        fs::write(
            config.client_config_path(),
            r#"{"Client":{"SavedAccountNames":"bob@example.com"}}"#,
        )
        .unwrap();
        fs::write(logs.join("battle.net-20240101T000000.log"), "BattleTag: Old#1").unwrap();
        fs::write(logs.join("battle.net-20240301T000000.log"), "BattleTag: New#2").unwrap();

        let hint = LiveStateScraper::from_config(&config).current_hint();
        assert_eq!(hint.contact_identifier.as_deref(), Some("bob@example.com"));
        assert_eq!(hint.display_tag.as_deref(), Some("New#2"));
    }

    #[test]
    fn test_scraper_with_no_live_state() {
        let temp = TempDir::new().unwrap();
        let config = Config {
            local_root: temp.path().join("local"),
            roaming_root: temp.path().join("roaming"),
            ..Config::default()
        };
        assert_eq!(LiveStateScraper::from_config(&config).current_hint(), IdentityHint::default());
    }
}
