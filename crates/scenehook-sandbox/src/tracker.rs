// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Dependency tracking for one build.
//!
//! Scene code never touches the filesystem or the module table directly: it
//! goes through a [`ResourceTracker`] (via `SceneCfg::open` and the library's
//! module resolution). [`ManifestTracker`] is the recording implementation;
//! outside a `start`/`stop` window it observes nothing and changes nothing.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use scenehook_proto::Manifest;
use thiserror::Error;

/// Observation hooks called while a scene is being constructed.
pub trait ResourceTracker: Send + Sync {
    /// A file at `path` was opened successfully.
    fn record_file(&self, path: &Path);
    /// Module `module` was resolved.
    fn record_module(&self, module: &str);
}

/// Tracker misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// `start` called twice without an intervening `stop`.
    #[error("manifest tracking already in progress")]
    AlreadyTracking,
}

/// Rewrites a compiled artifact path to its source counterpart by replacing
/// a file-name suffix (`foo.frag.spv` → `foo.frag`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRule {
    /// Suffix identifying the artifact (e.g. `".spv"`).
    pub suffix: String,
    /// Replacement for the suffix (empty to strip it).
    pub replacement: String,
}

impl ArtifactRule {
    /// Build a rule.
    pub fn new(suffix: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            replacement: replacement.into(),
        }
    }

    fn apply(&self, path: &Path) -> Option<PathBuf> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(self.suffix.as_str())?;
        if stem.is_empty() {
            return None;
        }
        Some(path.with_file_name(format!("{stem}{}", self.replacement)))
    }
}

/// Filtering applied when a manifest is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Files under any of these prefixes are never reported.
    pub system_prefixes: Vec<PathBuf>,
    /// Artifact → source normalizations, first match wins.
    pub artifact_rules: Vec<ArtifactRule>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            system_prefixes: vec![PathBuf::from("/usr/lib"), PathBuf::from("/usr/share")],
            artifact_rules: vec![ArtifactRule::new(".spv", "")],
        }
    }
}

impl TrackerConfig {
    fn normalize(&self, path: &Path) -> Option<PathBuf> {
        let path = self
            .artifact_rules
            .iter()
            .find_map(|rule| rule.apply(path))
            .unwrap_or_else(|| path.to_path_buf());
        if self.system_prefixes.iter().any(|prefix| path.starts_with(prefix)) {
            return None;
        }
        Some(path)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-visible table of loaded modules.
///
/// Shared by clones. Module resolution inserts into it; a hot reload calls
/// [`forget`](ModuleInventory::forget) with the previous manifest so the next
/// build resolves those modules afresh and reports them again.
#[derive(Debug, Clone, Default)]
pub struct ModuleInventory {
    loaded: Arc<Mutex<BTreeSet<String>>>,
}

impl ModuleInventory {
    /// Create an empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `module` loaded. Returns `true` if it was not loaded before.
    pub fn insert(&self, module: &str) -> bool {
        lock(&self.loaded).insert(module.to_owned())
    }

    /// Is `module` currently loaded?
    pub fn contains(&self, module: &str) -> bool {
        lock(&self.loaded).contains(module)
    }

    /// Copy of the loaded set.
    pub fn snapshot(&self) -> BTreeSet<String> {
        lock(&self.loaded).clone()
    }

    /// Unload every module named by `manifest`.
    pub fn forget(&self, manifest: &Manifest) {
        let mut loaded = lock(&self.loaded);
        for module in &manifest.modules {
            loaded.remove(module);
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    files: BTreeSet<PathBuf>,
    modules: BTreeSet<String>,
    baseline: BTreeSet<String>,
}

/// Records files and modules touched between `start` and `stop`.
#[derive(Debug)]
pub struct ManifestTracker {
    config: TrackerConfig,
    window: Mutex<Option<Window>>,
}

impl ManifestTracker {
    /// Create an idle tracker.
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            window: Mutex::new(None),
        }
    }

    /// Begin recording; snapshots `inventory` as the module baseline.
    pub fn start(&self, inventory: &ModuleInventory) -> Result<(), TrackerError> {
        let mut window = lock(&self.window);
        if window.is_some() {
            return Err(TrackerError::AlreadyTracking);
        }
        *window = Some(Window {
            baseline: inventory.snapshot(),
            ..Window::default()
        });
        Ok(())
    }

    /// End recording and return the manifest. Without a matching `start`
    /// the manifest is empty.
    pub fn stop(&self, inventory: &ModuleInventory) -> Manifest {
        let Some(window) = lock(&self.window).take() else {
            return Manifest::default();
        };
        let files = window
            .files
            .iter()
            .filter_map(|path| self.config.normalize(path))
            .collect();
        let modules = inventory
            .snapshot()
            .into_iter()
            .chain(window.modules)
            .filter(|module| !window.baseline.contains(module))
            .collect();
        Manifest { files, modules }
    }
}

impl ResourceTracker for ManifestTracker {
    fn record_file(&self, path: &Path) {
        if let Some(window) = lock(&self.window).as_mut() {
            if path.exists() {
                let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
                window.files.insert(path);
            }
        }
    }

    fn record_module(&self, module: &str) {
        if let Some(window) = lock(&self.window).as_mut() {
            window.modules.insert(module.to_owned());
        }
    }
}
