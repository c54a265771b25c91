//! Test utilities shared across test modules
//!
//! Builds a storage root and a pair of fake live state roots inside a temp
//! directory, plus fakes for the process probe and the registry, so the
//! engine can run end-to-end without a real client installed.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::config::{Config, RegistryConfig};
use crate::engine::SwitchEngine;
use crate::paths::Paths;
use crate::process::ProcessProbe;
use crate::registry::backend::MemoryRegistry;

/// Create a Paths struct for testing rooted at `<temp>/store`
pub fn setup_test_paths(temp_dir: &TempDir) -> Paths {
    Paths::from_root(temp_dir.path().join("store"))
}

/// Config whose live roots are `<temp>/live/{local,roaming}`, with no settle
/// delays and the registry store enabled
pub fn setup_test_config(temp_dir: &TempDir) -> Config {
    Config {
        local_root: temp_dir.path().join("live/local"),
        roaming_root: temp_dir.path().join("live/roaming"),
        launcher: temp_dir.path().join("launcher"),
        stop_settle_ms: 0,
        link_settle_ms: 0,
        registry: RegistryConfig {
            enabled: true,
            ..RegistryConfig::default()
        },
        ..Config::default()
    }
}

/// Process probe that records what the engine asked of it
#[derive(Default)]
pub struct FakeProbe {
    running: AtomicBool,
    stops: AtomicUsize,
    launches: Mutex<Vec<Option<String>>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> Vec<Option<String>> {
        self.launches.lock().unwrap().clone()
    }
}

impl ProcessProbe for FakeProbe {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn request_stop(&self) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.swap(false, Ordering::SeqCst)
    }

    fn launch(&self, region_hint: Option<&str>) -> bool {
        self.launches
            .lock()
            .unwrap()
            .push(region_hint.map(str::to_string));
        self.running.store(true, Ordering::SeqCst);
        true
    }
}

/// Engine over temp storage with a fake probe and an in-memory registry
pub struct TestEngine {
    pub engine: SwitchEngine,
    pub probe: Arc<FakeProbe>,
    pub registry: Arc<MemoryRegistry>,
    pub config: Config,
    pub paths: Paths,
}

pub fn setup_test_engine(temp_dir: &TempDir) -> TestEngine {
    setup_test_engine_with(temp_dir, setup_test_config(temp_dir))
}

pub fn setup_test_engine_with(temp_dir: &TempDir, config: Config) -> TestEngine {
    let paths = setup_test_paths(temp_dir);
    let probe = Arc::new(FakeProbe::new());
    let registry = Arc::new(MemoryRegistry::new());
    let engine = SwitchEngine::new(paths.clone(), config.clone(), probe.clone())
        .unwrap()
        .with_registry(registry.clone());
    TestEngine {
        engine,
        probe,
        registry,
        config,
        paths,
    }
}

/// Write `files` (relative path, content) under `root`, creating parents
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

/// Every file under `root` keyed by its `/`-separated relative path
pub fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                let rel = path.strip_prefix(base).unwrap();
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.insert(key, fs::read(&path).unwrap());
            }
        }
    }

    let mut out = BTreeMap::new();
    if root.exists() {
        walk(root, root, &mut out);
    }
    out
}
