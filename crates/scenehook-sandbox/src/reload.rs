// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hot reload of one scene target, driven by build manifests.
//!
//! [`ReloadManager`] lists the scenes of a target and watches every file that
//! listing (or any later query made through the manager) consumed. When one
//! of those files changes, it unloads the modules recorded so far and lists
//! the target again.
//!
//! Queries and reloads never overlap. A reload waits for running queries to
//! finish, and queries issued while a reload waits or runs are held until it
//! is done.
//!
//! A successful listing replaces the watched file set. A failed one only adds
//! to it, so fixing a broken file still triggers the next reload.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use scenehook_proto::{Manifest, ModuleRef, SceneListing, SceneQuery};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::runner::{BuildError, BuildOutput, QueryReply, SandboxRunner};

/// Quiet period before a burst of file events triggers one reload.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// The manager could not start.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// The platform file watcher could not be created.
    #[error("file watcher unavailable: {0}")]
    Watcher(#[from] notify::Error),
}

/// Outcome of one listing of the target.
#[derive(Debug, Clone)]
pub enum ReloadEvent {
    /// The target was listed.
    Listed(Vec<SceneListing>),
    /// Listing failed; previously watched files stay watched.
    Failed(BuildError),
}

#[derive(Debug, Default)]
struct Watched {
    files: BTreeSet<PathBuf>,
    dirs: BTreeSet<PathBuf>,
    modules: BTreeSet<String>,
}

type FileWatcher = Debouncer<RecommendedWatcher, FileIdMap>;

struct Shared {
    runner: Arc<SandboxRunner>,
    target: ModuleRef,
    gate: RwLock<()>,
    watched: Arc<Mutex<Watched>>,
    watcher: Mutex<FileWatcher>,
    events: mpsc::UnboundedSender<ReloadEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    async fn reload(&self) {
        let _exclusive = self.gate.write().await;
        let loaded = Manifest {
            files: BTreeSet::new(),
            modules: std::mem::take(&mut lock(&self.watched).modules),
        };
        self.runner.library().inventory().forget(&loaded);
        debug!(module = ?self.target, modules = loaded.modules.len(), "modules unloaded for reload");

        let output = self.runner.run(SceneQuery::list(self.target.clone())).await;
        let event = match output.outcome {
            Ok(QueryReply::List(listings)) => {
                self.track(output.manifest, true);
                info!(module = ?self.target, scenes = listings.len(), "scene list reloaded");
                ReloadEvent::Listed(listings)
            }
            Ok(QueryReply::Scene(_)) => {
                self.track(output.manifest, false);
                ReloadEvent::Failed(BuildError::Protocol(
                    "list query answered with a scene".to_owned(),
                ))
            }
            Err(err) => {
                warn!(module = ?self.target, %err, "scene list reload failed");
                self.track(output.manifest, false);
                ReloadEvent::Failed(err)
            }
        };
        let _ = self.events.send(event);
    }

    /// Fold `manifest` into the watched set (`replace` drops files the
    /// previous listing used) and move directory watches to match.
    fn track(&self, manifest: Manifest, replace: bool) {
        // Holding the watcher serializes concurrent tracking.
        let mut watcher = lock(&self.watcher);
        let (wanted, current) = {
            let mut watched = lock(&self.watched);
            if replace {
                watched.files = manifest.files;
            } else {
                watched.files.extend(manifest.files);
            }
            watched.modules.extend(manifest.modules);
            let wanted: BTreeSet<PathBuf> = watched
                .files
                .iter()
                .filter_map(|file| file.parent().map(Path::to_path_buf))
                .collect();
            (wanted, watched.dirs.clone())
        };

        for dir in current.difference(&wanted) {
            if let Err(err) = watcher.watcher().unwatch(dir) {
                debug!(dir = %dir.display(), %err, "unwatch failed");
            }
        }
        let mut active = BTreeSet::new();
        for dir in wanted {
            if current.contains(&dir) {
                active.insert(dir);
                continue;
            }
            match watcher.watcher().watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "watching directory");
                    active.insert(dir);
                }
                Err(err) => warn!(dir = %dir.display(), %err, "cannot watch directory"),
            }
        }
        drop(watcher);
        lock(&self.watched).dirs = active;
    }
}

/// Keeps one target's scene list current as its source files change.
pub struct ReloadManager {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ReloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadManager")
            .field("target", &self.shared.target)
            .finish_non_exhaustive()
    }
}

impl ReloadManager {
    /// List `target` once, then keep listing it whenever a watched file
    /// changes. Every listing, the first included, arrives on the returned
    /// receiver.
    pub async fn start(
        runner: Arc<SandboxRunner>,
        target: ModuleRef,
        debounce: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ReloadEvent>), ReloadError> {
        let watched = Arc::new(Mutex::new(Watched::default()));
        let (changes, mut changed) = mpsc::unbounded_channel::<PathBuf>();
        let watcher = new_debouncer(debounce, None, {
            let watched = Arc::clone(&watched);
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let guard = lock(&watched);
                    let hit = events
                        .iter()
                        .filter(|e| {
                            matches!(
                                e.event.kind,
                                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                            )
                        })
                        .flat_map(|e| e.event.paths.iter())
                        .find(|path| guard.files.contains(*path))
                        .cloned();
                    drop(guard);
                    if let Some(path) = hit {
                        let _ = changes.send(path);
                    }
                }
                Err(errors) => {
                    for err in errors {
                        warn!(%err, "file watcher error");
                    }
                }
            }
        })?;

        let (events, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            runner,
            target,
            gate: RwLock::new(()),
            watched,
            watcher: Mutex::new(watcher),
            events,
        });
        shared.reload().await;

        let task = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                while let Some(path) = changed.recv().await {
                    while changed.try_recv().is_ok() {}
                    info!(file = %path.display(), "watched file changed");
                    shared.reload().await;
                }
            }
        });
        Ok((Self { shared, task }, event_rx))
    }

    /// Answer `query` outside any reload. Files and modules it consumed are
    /// watched and unloaded from then on.
    pub async fn query(&self, query: SceneQuery) -> BuildOutput {
        let _shared = self.shared.gate.read().await;
        let output = self.shared.runner.run(query).await;
        self.shared.track(output.manifest.clone(), false);
        output
    }

    /// Unload and list the target now. The outcome arrives on the event
    /// receiver like any other reload.
    pub async fn reload(&self) {
        self.shared.reload().await;
    }

    /// Target being listed.
    pub fn target(&self) -> &ModuleRef {
        &self.shared.target
    }

    /// Files whose change triggers a reload.
    pub fn watched_files(&self) -> BTreeSet<PathBuf> {
        lock(&self.shared.watched).files.clone()
    }

    /// Modules the next reload unloads.
    pub fn loaded_modules(&self) -> BTreeSet<String> {
        lock(&self.shared.watched).modules.clone()
    }
}

impl Drop for ReloadManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}
