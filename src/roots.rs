use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::Config;
use crate::paths::Paths;

/// The two live state trees the client keeps, mirrored per identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateRoot {
    Local,
    Roaming,
}

impl StateRoot {
    pub fn all() -> [StateRoot; 2] {
        [StateRoot::Local, StateRoot::Roaming]
    }

    /// Live path the client reads and writes
    pub fn live_path(&self, config: &Config) -> PathBuf {
        match self {
            StateRoot::Local => config.local_root.clone(),
            StateRoot::Roaming => config.roaming_root.clone(),
        }
    }

    /// Captured copy inside an identity directory
    pub fn identity_path(&self, paths: &Paths, id: &str) -> PathBuf {
        paths.identity_dir(id).join(self.dir_name())
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            StateRoot::Local => "local",
            StateRoot::Roaming => "roaming",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StateRoot::Local => "Local (%LOCALAPPDATA%)",
            StateRoot::Roaming => "Roaming (%APPDATA%)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_paths() {
        let paths = Paths::from_root(PathBuf::from("/store"));
        let config = Config {
            local_root: PathBuf::from("/live/local/Battle.net"),
            roaming_root: PathBuf::from("/live/roaming/Battle.net"),
            ..Config::default()
        };

        assert_eq!(
            StateRoot::Local.live_path(&config),
            PathBuf::from("/live/local/Battle.net")
        );
        assert!(
            StateRoot::Roaming
                .identity_path(&paths, "ab12")
                .ends_with("accounts/ab12/roaming")
        );
    }
}
