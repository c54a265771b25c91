//! Switch engine.
//!
//! This is the only place that mutates the live client state. It handles:
//! - Capturing the live state as a new identity, or refreshing an existing one
//! - Switching the live state to a captured identity
//! - Preparing a clean login screen for adding a new account
//! - Working out which identity is live right now
//!
//! Every mutating operation runs as one session guarded by an in-process
//! mutex and an exclusive lock file; a second caller gets `Busy` instead of
//! waiting. No step is rolled back on failure. Re-running a switch from any
//! partial state converges, because stale links are cleared first and the
//! restore is a full mirror rather than a merge.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use anyhow::{Context, anyhow};
use chrono::Utc;

use crate::client_config;
use crate::config::{AttachMode, Config};
use crate::error::{EngineError, EngineResult, StepContext};
use crate::hint::{HintSource, IdentityHint, LiveStateScraper};
use crate::identities::{
    Identity, IdentityField, IdentityRepository, IdentitySummary, RegionTag, validate_label,
};
use crate::linkstore::{LinkStore, is_link, path_present};
use crate::paths::Paths;
use crate::process::{ProcessProbe, SystemProbe};
use crate::registry::RegistrySnapshots;
use crate::registry::backend::{RegTool, RegistryBackend};
use crate::roots::StateRoot;
use crate::state::{OperationLock, State};

/// Embedded browser cache inside each live root; holds the web login session
const BROWSER_CACHES: &str = "BrowserCaches";

/// Result of `create_from_current` / `update_account_data`
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub id: String,
    pub label: String,
    pub contact_identifier: Option<String>,
    pub stopped_client: bool,
    pub registry_exported: bool,
    /// Live roots now link to the identity directory (link mode only)
    pub linked: bool,
    pub warnings: Vec<String>,
}

/// Result of `switch_to`
#[derive(Debug, Clone)]
pub struct SwitchReport {
    pub id: String,
    pub label: String,
    pub stopped_client: bool,
    pub registry_restored: bool,
    pub launched: bool,
    pub warnings: Vec<String>,
}

/// Result of `prepare_fresh_login`
#[derive(Debug, Clone)]
pub struct FreshLoginReport {
    pub stopped_client: bool,
    pub caches_removed: usize,
    pub login_cleared: bool,
    pub launched: bool,
    pub warnings: Vec<String>,
}

/// Guards held for the whole of one mutating operation. The file lock is
/// released before the in-process guard.
struct Session<'a> {
    _lock: OperationLock,
    _guard: MutexGuard<'a, ()>,
}

pub struct SwitchEngine {
    paths: Paths,
    config: Config,
    repo: Mutex<IdentityRepository>,
    links: LinkStore,
    registry: Option<RegistrySnapshots>,
    probe: Arc<dyn ProcessProbe>,
    hints: Option<Arc<dyn HintSource>>,
    op_lock: Mutex<()>,
}

impl SwitchEngine {
    /// Engine without registry store or hint source
    pub fn new(paths: Paths, config: Config, probe: Arc<dyn ProcessProbe>) -> EngineResult<Self> {
        paths.ensure_dirs().step("prepare storage")?;
        let repo = IdentityRepository::load(&paths).step("load catalog")?;

        Ok(Self {
            links: LinkStore::new(config.link_settle()),
            paths,
            config,
            repo: Mutex::new(repo),
            registry: None,
            probe,
            hints: None,
            op_lock: Mutex::new(()),
        })
    }

    /// Engine wired to the real OS: process list, `reg.exe` when the registry
    /// store is enabled, and the log scraper for default labels
    pub fn from_system(paths: Paths, config: Config) -> EngineResult<Self> {
        let probe = Arc::new(SystemProbe::from_config(&config));
        let hints = Arc::new(LiveStateScraper::from_config(&config));
        let registry_enabled = config.registry.enabled;

        let engine = Self::new(paths, config, probe)?.with_hints(hints);
        Ok(if registry_enabled {
            engine.with_registry(Arc::new(RegTool))
        } else {
            engine
        })
    }

    pub fn with_registry(mut self, backend: Arc<dyn RegistryBackend>) -> Self {
        self.registry = Some(RegistrySnapshots::new(
            backend,
            self.config.registry.clone(),
        ));
        self
    }

    pub fn with_hints(mut self, hints: Arc<dyn HintSource>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn probe(&self) -> &dyn ProcessProbe {
        self.probe.as_ref()
    }

    pub fn registry(&self) -> Option<&RegistrySnapshots> {
        self.registry.as_ref()
    }

    /// All identities, oldest first
    pub fn list(&self) -> Vec<Identity> {
        self.repo().list()
    }

    pub fn summaries(&self) -> Vec<IdentitySummary> {
        self.repo().summaries()
    }

    pub fn get(&self, id: &str) -> Option<Identity> {
        self.repo().get(id).cloned()
    }

    /// Look up by id, then by label ignoring case
    pub fn find(&self, query: &str) -> Option<Identity> {
        self.repo().find(query).cloned()
    }

    pub fn find_by_contact(&self, contact: &str) -> Option<Identity> {
        self.repo().find_by_contact(contact).cloned()
    }

    pub fn is_captured(&self, id: &str) -> bool {
        self.repo().is_captured(id)
    }

    pub fn snapshot_file(&self, id: &str) -> PathBuf {
        self.paths
            .snapshot_file(id, &self.config.registry.snapshot_name)
    }

    /// Identity recorded by the last successful switch or capture, if it
    /// still exists
    pub fn active_identity(&self) -> Option<String> {
        let state = match State::read(&self.paths.state_file) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Ignoring unreadable state file: {e:#}");
                return None;
            }
        };
        state
            .active_identity
            .filter(|id| self.repo().get(id).is_some())
    }

    /// Which identity the live state actually belongs to: the identity a
    /// live link points into, else the identity owning the first saved
    /// account of the live client config
    pub fn detect_live_identity(&self) -> Option<String> {
        let local = StateRoot::Local.live_path(&self.config);
        if let Some(id) = self.linked_identity(&local)
            && self.repo().get(&id).is_some()
        {
            return Some(id);
        }

        let contact = self.live_contact()?;
        self.repo().find_by_contact(&contact).map(|i| i.id.clone())
    }

    /// First saved account of the live client config
    pub fn live_contact(&self) -> Option<String> {
        client_config::current_account(&self.config.client_config_path())
    }

    /// Best-effort guess of who is logged in. The contact falls back to the
    /// live saved-accounts list.
    pub fn current_hint(&self) -> IdentityHint {
        let mut hint = self
            .hints
            .as_ref()
            .map(|h| h.current_hint())
            .unwrap_or_default();
        if hint.contact_identifier.is_none() {
            hint.contact_identifier = self.live_contact();
        }
        hint
    }

    /// Add an identity with empty data, to be filled by a later update
    pub fn create(&self, label: &str) -> EngineResult<String> {
        check_label(label)?;
        let _session = self.begin("create")?;
        let id = self.repo().create(label).step("create identity")?;
        tracing::info!(id = %id, label, "Created empty identity");
        Ok(id)
    }

    pub fn rename(&self, id: &str, label: &str) -> EngineResult<()> {
        let _session = self.begin("rename")?;
        self.lookup(id)?;
        check_label(label)?;
        self.edit(id, IdentityField::Label(label.to_string()))
    }

    pub fn set_region(&self, id: &str, tag: RegionTag) -> EngineResult<()> {
        let _session = self.begin("set region")?;
        self.lookup(id)?;
        self.edit(id, IdentityField::RegionTag(tag))
    }

    /// Flip between the two region tags and return the new one
    pub fn toggle_region(&self, id: &str) -> EngineResult<RegionTag> {
        let _session = self.begin("set region")?;
        let tag = self.lookup(id)?.region_tag.toggled();
        self.edit(id, IdentityField::RegionTag(tag))?;
        Ok(tag)
    }

    /// Record a confirmed login for `id`
    pub fn mark_activated(&self, id: &str) -> EngineResult<()> {
        let _session = self.begin("mark activated")?;
        self.lookup(id)?;
        self.repo().mark_activated(id).step("save catalog")
    }

    /// Capture the live state as a new identity.
    ///
    /// Without a label the hint source's display tag (or the contact's local
    /// part) is used. A missing live root is captured as an empty directory.
    /// On failure the partially built identity directory is left behind.
    pub fn create_from_current(
        &self,
        label: Option<&str>,
        region: RegionTag,
    ) -> EngineResult<CaptureReport> {
        let _session = self.begin("capture")?;
        let mut warnings = Vec::new();

        self.cleanup_stale(&mut warnings);

        let hint = self.current_hint();
        let label = match label {
            Some(label) => label.trim().to_string(),
            None => hint
                .default_label()
                .unwrap_or_else(|| format!("Account {}", self.repo().list().len() + 1)),
        };
        check_label(&label)?;
        let contact = self.live_contact().or(hint.contact_identifier);

        let id = self.repo().new_id();
        for root in StateRoot::all() {
            self.capture_root(root, &id, true)?;
        }

        let registry_exported = self.export_registry(&id, &mut warnings);

        let mut identity = Identity::new(&id, &label);
        identity.region_tag = region;
        identity.contact_identifier = contact.clone();
        identity.logged_in = true;
        self.repo().insert(identity).step("save catalog")?;
        State::set_active(&self.paths.state_file, Some(id.as_str())).step("update active identity")?;

        let linked = self.reattach(&id, &mut warnings);

        tracing::info!(id = %id, label = %label, contact = ?contact, "Captured live state");
        Ok(CaptureReport {
            id,
            label,
            contact_identifier: contact,
            stopped_client: false,
            registry_exported,
            linked,
            warnings,
        })
    }

    /// Refresh a known identity's stored data from the live state, without
    /// creating a new record
    pub fn update_account_data(&self, id: &str) -> EngineResult<CaptureReport> {
        let _session = self.begin("update")?;
        let identity = self.lookup(id)?;
        let mut warnings = Vec::new();

        self.cleanup_stale(&mut warnings);
        let stopped_client = self.stop_client(&mut warnings);
        let contact = self.live_contact();

        for root in StateRoot::all() {
            self.capture_root(root, id, false)?;
        }

        let registry_exported = self.export_registry(id, &mut warnings);

        {
            let mut repo = self.repo();
            if contact.is_some() && contact != identity.contact_identifier {
                repo.set_field(id, IdentityField::Contact(contact.clone()))
                    .step("save catalog")?;
            }
            repo.set_field(id, IdentityField::LoggedIn(true))
                .step("save catalog")?;
        }

        let linked = self.reattach(id, &mut warnings);

        tracing::info!(id, label = %identity.label, "Updated identity from live state");
        Ok(CaptureReport {
            id: id.to_string(),
            label: identity.label,
            contact_identifier: contact.or(identity.contact_identifier),
            stopped_client,
            registry_exported,
            linked,
            warnings,
        })
    }

    /// Make `id` the live identity: stop the client, replace both live roots
    /// with the identity's data, put its account first in the client config,
    /// restore its registry tokens, then relaunch the client
    pub fn switch_to(&self, id: &str) -> EngineResult<SwitchReport> {
        let _session = self.begin("switch")?;
        let identity = self.lookup(id)?;
        if !self.repo().is_captured(id) {
            return Err(EngineError::NotCaptured {
                id: id.to_string(),
                label: identity.label,
            });
        }

        let mut warnings = Vec::new();
        self.cleanup_stale(&mut warnings);

        let stopped_client = self.stop_client(&mut warnings);

        for root in StateRoot::all() {
            self.attach_root(root, id)?;
        }

        self.rewrite_saved_accounts(&identity, &mut warnings);
        let registry_restored = self.restore_registry(id, &mut warnings);

        if let Err(e) = State::set_active(&self.paths.state_file, Some(id)) {
            warnings.push(format!("Failed to record the active account: {e:#}"));
        }
        if let Err(e) = self
            .repo()
            .set_field(id, IdentityField::LastActivatedAt(Utc::now()))
        {
            warnings.push(format!("Failed to record the activation time: {e:#}"));
        }

        let launched = if self.config.launch_after_switch {
            self.launch(identity.region_tag, &mut warnings)
        } else {
            false
        };

        for warning in &warnings {
            tracing::warn!(id, "{warning}");
        }
        tracing::info!(id, label = %identity.label, registry_restored, launched, "Switched account");
        Ok(SwitchReport {
            id: id.to_string(),
            label: identity.label,
            stopped_client,
            registry_restored,
            launched,
            warnings,
        })
    }

    /// Remove the record and every byte of stored data. Live roots linked
    /// into the identity are turned back into real directories first.
    pub fn delete(&self, id: &str) -> EngineResult<()> {
        let _session = self.begin("delete")?;
        let known = self.repo().get(id).is_some();
        if !known && !self.paths.identity_dir(id).exists() {
            return Err(EngineError::UnknownIdentity { id: id.to_string() });
        }

        for live in self.live_paths() {
            if self.linked_identity(&live).as_deref() == Some(id) {
                self.detach(&live).step("detach live state")?;
            }
        }

        self.repo().delete(id).step("delete identity")?;

        let state = State::read(&self.paths.state_file).step("read state")?;
        if state.active_identity.as_deref() == Some(id) {
            State::set_active(&self.paths.state_file, None).step("update active identity")?;
        }

        tracing::info!(id, "Deleted identity");
        Ok(())
    }

    /// Bring the client up on an empty login screen so another account can
    /// sign in: stop it, drop the embedded browser caches, clear the saved
    /// accounts and auto login, then launch with the region argument
    pub fn prepare_fresh_login(&self, region: RegionTag) -> EngineResult<FreshLoginReport> {
        let _session = self.begin("prepare login")?;
        let mut warnings = Vec::new();

        self.cleanup_stale(&mut warnings);
        let stopped_client = self.stop_client(&mut warnings);

        // Never let the fresh session write into a stored identity
        for live in self.live_paths() {
            self.detach(&live).step("detach live state")?;
        }

        let mut caches_removed = 0;
        for live in self.live_paths() {
            let caches = live.join(BROWSER_CACHES);
            if !path_present(&caches) {
                continue;
            }
            if self.links.remove(&caches) {
                caches_removed += 1;
            } else {
                warnings.push(format!("Could not remove {}", caches.display()));
            }
        }

        let login_cleared = match client_config::clear_login(&self.config.client_config_path()) {
            Ok(true) => true,
            Ok(false) => {
                warnings.push("Client config not found; saved accounts were not cleared".into());
                false
            }
            Err(e) => {
                warnings.push(format!("Failed to clear saved accounts: {e:#}"));
                false
            }
        };

        if let Err(e) = State::set_active(&self.paths.state_file, None) {
            warnings.push(format!("Failed to clear the active account: {e:#}"));
        }

        let launched = self.launch(region, &mut warnings);

        tracing::info!(caches_removed, login_cleared, launched, "Prepared fresh login");
        Ok(FreshLoginReport {
            stopped_client,
            caches_removed,
            login_cleared,
            launched,
            warnings,
        })
    }

    fn begin(&self, operation: &'static str) -> EngineResult<Session<'_>> {
        let guard = match self.op_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(EngineError::Busy {
                    holder: "another operation in this process".to_string(),
                });
            }
        };

        let lock = OperationLock::try_acquire(&self.paths.lock_file, operation)
            .step("acquire operation lock")?
            .map_err(|holder| EngineError::Busy { holder })?;

        tracing::debug!(operation, "Session started");
        // Another process may have changed the catalog since it was loaded
        self.repo().reload().step("load catalog")?;

        Ok(Session {
            _lock: lock,
            _guard: guard,
        })
    }

    fn edit(&self, id: &str, field: IdentityField) -> EngineResult<()> {
        self.repo().set_field(id, field).step("save catalog")
    }

    fn repo(&self) -> MutexGuard<'_, IdentityRepository> {
        self.repo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, id: &str) -> EngineResult<Identity> {
        self.get(id).ok_or_else(|| EngineError::UnknownIdentity { id: id.to_string() })
    }

    fn live_paths(&self) -> [PathBuf; 2] {
        StateRoot::all().map(|root| root.live_path(&self.config))
    }

    fn cleanup_stale(&self, warnings: &mut Vec<String>) {
        let removed = self.links.cleanup_stale_links(&self.live_paths());
        if removed > 0 {
            warnings.push(format!("Removed {} stale link(s) from the live state", removed));
        }
    }

    fn stop_client(&self, warnings: &mut Vec<String>) -> bool {
        if !self.probe.is_running() {
            return false;
        }
        let stopped = self.probe.request_stop();
        if self.probe.is_running() {
            warnings.push("The client is still running; locked files may not be replaced".into());
        }
        stopped
    }

    fn launch(&self, region: RegionTag, warnings: &mut Vec<String>) -> bool {
        let launched = self.probe.launch(self.config.region_args.for_tag(region));
        if !launched {
            warnings.push("The client could not be launched; start it manually".into());
        }
        launched
    }

    /// Identity whose directory `live` links into, if any
    fn linked_identity(&self, live: &Path) -> Option<String> {
        if !is_link(live) {
            return None;
        }
        let target = fs::canonicalize(live).ok()?;
        let base = fs::canonicalize(&self.paths.base_dir).ok()?;
        Paths::from_root(base).identity_of(&target)
    }

    /// Whether `live` is a link that already resolves to `stored`
    fn resolves_to(&self, live: &Path, stored: &Path) -> bool {
        if !is_link(live) {
            return false;
        }
        match (fs::canonicalize(live), fs::canonicalize(stored)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Copy one live root into the identity directory
    fn capture_root(&self, root: StateRoot, id: &str, allow_missing: bool) -> EngineResult<()> {
        let live = root.live_path(&self.config);
        let stored = root.identity_path(&self.paths, id);

        if !live.exists() {
            if !allow_missing {
                return Err(EngineError::failed(
                    "capture live state",
                    anyhow!("Live state root is missing: {:?}", live),
                ));
            }
            tracing::warn!(root = root.dir_name(), "Live state root is missing, capturing it empty");
            return fs::create_dir_all(&stored)
                .with_context(|| format!("Failed to create identity directory: {:?}", stored))
                .step("capture live state");
        }

        if self.resolves_to(&live, &stored) {
            tracing::info!(root = root.dir_name(), "Live state already links to the identity");
            return Ok(());
        }

        self.links
            .mirror(&live, &stored, &self.config.mirror_exclude)
            .step("capture live state")?;
        tracing::info!(root = root.dir_name(), id, "Captured live root");
        Ok(())
    }

    /// Replace one live root with the identity's data
    fn attach_root(&self, root: StateRoot, id: &str) -> EngineResult<()> {
        let live = root.live_path(&self.config);
        let stored = root.identity_path(&self.paths, id);

        match self.config.attach {
            AttachMode::Link => {
                if self.resolves_to(&live, &stored) {
                    return Ok(());
                }
                if !self.links.link(&live, &stored) {
                    return Err(EngineError::failed(
                        "link live state",
                        anyhow!("Could not link {:?} to {:?}", live, stored),
                    ));
                }
            }
            AttachMode::Copy => {
                if !self.links.remove(&live) {
                    return Err(EngineError::failed(
                        "clear live state",
                        anyhow!("{:?} is still present", live),
                    ));
                }
                self.links
                    .mirror(&stored, &live, &[])
                    .step("restore live state")?;
            }
        }

        tracing::info!(root = root.dir_name(), attach = ?self.config.attach, "Attached identity data");
        Ok(())
    }

    /// In link mode, point the live roots at the freshly captured directory.
    /// A root that cannot be linked gets a copy instead so the client never
    /// starts on an empty root.
    fn reattach(&self, id: &str, warnings: &mut Vec<String>) -> bool {
        if self.config.attach != AttachMode::Link {
            return false;
        }

        let mut all_linked = true;
        for root in StateRoot::all() {
            let live = root.live_path(&self.config);
            let stored = root.identity_path(&self.paths, id);
            if self.resolves_to(&live, &stored) || self.links.link(&live, &stored) {
                continue;
            }

            all_linked = false;
            warnings.push(format!("Could not link the {} live root", root.dir_name()));
            if let Err(e) = self.links.mirror(&stored, &live, &[]) {
                warnings.push(format!(
                    "Restoring a copy of the {} root failed: {e:#}",
                    root.dir_name()
                ));
            }
        }
        all_linked
    }

    /// Turn a live link back into a real directory holding the same content
    fn detach(&self, live: &Path) -> anyhow::Result<()> {
        if !is_link(live) || !live.exists() {
            return Ok(());
        }
        let target = fs::canonicalize(live)
            .with_context(|| format!("Failed to resolve link: {:?}", live))?;
        if !self.links.remove(live) {
            anyhow::bail!("Failed to remove link: {:?}", live);
        }
        self.links.mirror(&target, live, &[])?;
        tracing::info!(live = %live.display(), "Detached live root from identity");
        Ok(())
    }

    fn export_registry(&self, id: &str, warnings: &mut Vec<String>) -> bool {
        let Some(registry) = &self.registry else {
            return false;
        };

        let pruned = registry.prune_all_but_newest();
        if pruned > 0 {
            tracing::info!(pruned, "Pruned older auth tokens before export");
        }

        let exported = registry.export(&self.snapshot_file(id));
        if !exported {
            warnings.push(
                "Registry tokens were not exported; switching back may require logging in again"
                    .into(),
            );
        }
        exported
    }

    fn restore_registry(&self, id: &str, warnings: &mut Vec<String>) -> bool {
        let Some(registry) = &self.registry else {
            return false;
        };

        let snapshot = self.snapshot_file(id);
        if !snapshot.exists() {
            warnings.push("No registry snapshot for this account; the client may ask to log in".into());
            return false;
        }

        let restored = registry.import_merge(&snapshot);
        if !restored {
            warnings.push("Registry tokens were not restored".into());
        }
        restored
    }

    fn rewrite_saved_accounts(&self, identity: &Identity, warnings: &mut Vec<String>) {
        let Some(contact) = identity.contact_identifier.as_deref() else {
            return;
        };

        let accounts = self.repo().contacts_with_first(Some(contact));
        match client_config::set_saved_accounts(&self.config.client_config_path(), &accounts) {
            Ok(true) => tracing::debug!(count = accounts.len(), "Rewrote saved accounts"),
            Ok(false) => {
                warnings.push("Client config not found; the default account was not changed".into())
            }
            Err(e) => warnings.push(format!("Failed to update saved accounts: {e:#}")),
        }
    }
}

fn check_label(label: &str) -> EngineResult<()> {
    validate_label(label).map_err(|e| EngineError::InvalidLabel {
        reason: e.to_string(),
    })
}
