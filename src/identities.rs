//! Identity catalog.
//!
//! This module handles the bookkeeping side of saved accounts:
//! - Creating, listing, and removing identities
//! - Validating labels
//! - Editing per-identity fields
//!
//! It owns `accounts.json` and the per-identity data directories under
//! `accounts/`, but never touches the live client state.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::str::FromStr;

use crate::fs_utils::is_missing_or_empty;
use crate::paths::Paths;
use crate::roots::StateRoot;

/// Which auth backend of the service an identity belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionTag {
    #[default]
    Cn,
    Global,
}

impl RegionTag {
    pub fn toggled(self) -> Self {
        match self {
            RegionTag::Cn => RegionTag::Global,
            RegionTag::Global => RegionTag::Cn,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            RegionTag::Cn => "CN",
            RegionTag::Global => "Global",
        }
    }
}

impl FromStr for RegionTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cn" | "china" => Ok(RegionTag::Cn),
            "global" | "intl" => Ok(RegionTag::Global),
            _ => Err(format!("Unknown region tag: {}", s)),
        }
    }
}

/// One saved account slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Catalog key; filled in from the map key on load
    #[serde(skip)]
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logged_in: bool,
    #[serde(default)]
    pub region_tag: RegionTag,
    /// Email or phone number, stored unmasked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_identifier: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            created_at: Some(Utc::now()),
            last_activated_at: None,
            logged_in: false,
            region_tag: RegionTag::default(),
            contact_identifier: None,
        }
    }

    pub fn masked_contact(&self) -> Option<String> {
        self.contact_identifier.as_deref().map(mask_contact)
    }
}

/// A single mutable field, for `IdentityRepository::set_field`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityField {
    Label(String),
    RegionTag(RegionTag),
    Contact(Option<String>),
    LoggedIn(bool),
    LastActivatedAt(DateTime<Utc>),
}

/// Listing row: the record plus whether its data was ever captured
#[derive(Debug, Clone)]
pub struct IdentitySummary {
    pub identity: Identity,
    pub has_data: bool,
}

/// Validate a display label
pub fn validate_label(label: &str) -> Result<()> {
    if label.trim().is_empty() {
        bail!("Label cannot be empty");
    }

    if label.chars().count() > 64 {
        bail!("Label cannot be longer than 64 characters");
    }

    if label.chars().any(char::is_control) {
        bail!("Label cannot contain control characters");
    }

    Ok(())
}

/// Hide the middle of an email local part or a phone number
pub fn mask_contact(contact: &str) -> String {
    if let Some((name, domain)) = contact.split_once('@') {
        let chars: Vec<char> = name.chars().collect();
        let masked: String = match chars.len() {
            0 => String::new(),
            1 | 2 => format!("{}*", chars[0]),
            n => format!("{}{}{}", chars[0], "*".repeat(n - 2), chars[n - 1]),
        };
        return format!("{}@{}", masked, domain);
    }

    let chars: Vec<char> = contact.chars().collect();
    if chars.len() > 6 {
        let head: String = chars[..3].iter().collect();
        let tail: String = chars[chars.len() - 3..].iter().collect();
        format!("{}{}{}", head, "*".repeat(chars.len() - 6), tail)
    } else {
        contact.to_string()
    }
}

pub struct IdentityRepository {
    paths: Paths,
    identities: BTreeMap<String, Identity>,
}

impl IdentityRepository {
    /// Read the catalog fully into memory; a missing file is an empty catalog
    pub fn load(paths: &Paths) -> Result<Self> {
        let mut identities: BTreeMap<String, Identity> = if paths.catalog_file.exists() {
            let content = fs::read_to_string(&paths.catalog_file).with_context(|| {
                format!("Failed to read catalog: {:?}", paths.catalog_file)
            })?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse catalog: {:?}", paths.catalog_file))?
        } else {
            BTreeMap::new()
        };

        for (id, identity) in identities.iter_mut() {
            identity.id = id.clone();
        }

        Ok(Self {
            paths: paths.clone(),
            identities,
        })
    }

    /// Re-read the catalog from disk, dropping what another engine over the
    /// same storage changed since the last load
    pub fn reload(&mut self) -> Result<()> {
        *self = Self::load(&self.paths)?;
        Ok(())
    }

    /// Rewrite the whole catalog atomically
    fn save(&self) -> Result<()> {
        let path = &self.paths.catalog_file;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create catalog directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(&self.identities).context("Failed to serialize catalog")?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content)
            .with_context(|| format!("Failed to write temp catalog: {:?}", temp_path))?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename catalog: {:?} -> {:?}", temp_path, path))
    }

    /// Fresh short id, unused in the catalog and on disk
    pub fn new_id(&self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
            if !self.identities.contains_key(&id) && !self.paths.identity_dir(&id).exists() {
                return id;
            }
        }
    }

    /// Create an identity with empty data directories (not yet captured)
    pub fn create(&mut self, label: &str) -> Result<String> {
        validate_label(label)?;
        let id = self.new_id();

        for root in StateRoot::all() {
            let dir = root.identity_path(&self.paths, &id);
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create identity directory: {:?}", dir))?;
        }

        self.insert(Identity::new(&id, label.trim()))?;
        Ok(id)
    }

    /// Add a fully built record
    pub fn insert(&mut self, identity: Identity) -> Result<()> {
        validate_label(&identity.label)?;
        if self.identities.contains_key(&identity.id) {
            bail!("Identity '{}' already exists", identity.id);
        }
        self.identities.insert(identity.id.clone(), identity);
        self.save()
    }

    /// Remove the record and its data directory. Returns whether a record existed.
    pub fn delete(&mut self, id: &str) -> Result<bool> {
        let existed = self.identities.remove(id).is_some();
        if existed {
            self.save()?;
        }

        let dir = self.paths.identity_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove identity directory: {:?}", dir))?;
        }
        Ok(existed)
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.identities.get(id)
    }

    /// Look up by id, then by exact (case-insensitive) label
    pub fn find(&self, query: &str) -> Option<&Identity> {
        self.identities.get(query).or_else(|| {
            self.identities
                .values()
                .find(|i| i.label.eq_ignore_ascii_case(query))
        })
    }

    pub fn find_by_contact(&self, contact: &str) -> Option<&Identity> {
        self.identities.values().find(|i| {
            i.contact_identifier
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(contact))
        })
    }

    /// All identities, oldest first
    pub fn list(&self) -> Vec<Identity> {
        let mut all: Vec<Identity> = self.identities.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn summaries(&self) -> Vec<IdentitySummary> {
        self.list()
            .into_iter()
            .map(|identity| IdentitySummary {
                has_data: self.is_captured(&identity.id),
                identity,
            })
            .collect()
    }

    pub fn set_field(&mut self, id: &str, field: IdentityField) -> Result<()> {
        if let IdentityField::Label(label) = &field {
            validate_label(label)?;
        }

        let identity = self
            .identities
            .get_mut(id)
            .with_context(|| format!("Identity '{}' does not exist", id))?;

        match field {
            IdentityField::Label(label) => identity.label = label.trim().to_string(),
            IdentityField::RegionTag(tag) => identity.region_tag = tag,
            IdentityField::Contact(contact) => identity.contact_identifier = contact,
            IdentityField::LoggedIn(flag) => identity.logged_in = flag,
            IdentityField::LastActivatedAt(at) => identity.last_activated_at = Some(at),
        }
        self.save()
    }

    /// Record a confirmed login: sets `logged_in` and stamps the activation time
    pub fn mark_activated(&mut self, id: &str) -> Result<()> {
        let identity = self
            .identities
            .get_mut(id)
            .with_context(|| format!("Identity '{}' does not exist", id))?;
        identity.logged_in = true;
        identity.last_activated_at = Some(Utc::now());
        self.save()
    }

    /// Whether the identity has data to switch to: both root directories
    /// exist and at least one holds entries
    pub fn is_captured(&self, id: &str) -> bool {
        let dirs = StateRoot::all().map(|root| root.identity_path(&self.paths, id));
        dirs.iter().all(|d| d.is_dir()) && dirs.iter().any(|d| !is_missing_or_empty(d))
    }

    /// Contact identifiers of every identity, `first` leading, deduplicated
    pub fn contacts_with_first(&self, first: Option<&str>) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let rest = self
            .list()
            .into_iter()
            .filter_map(|i| i.contact_identifier);
        for contact in first.map(str::to_string).into_iter().chain(rest) {
            if !out.iter().any(|c| c.eq_ignore_ascii_case(&contact)) {
                out.push(contact);
            }
        }
        out
    }
}
