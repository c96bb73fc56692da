// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sandbox runner: answers one [`SceneQuery`] at a time, process-wide.
//!
//! Every call to [`SandboxRunner::run`] takes the single build slot before
//! doing anything else. The owned guard travels into the isolated execution
//! (blocking-pool task or worker session) and is released only when that
//! execution ends, whatever the outcome.

use std::any::Any;
use std::fmt;
use std::fs::File;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use scenehook_proto::{
    wire::WireError, Manifest, ModuleRef, QueryKind, SceneListing, SceneMeta, SceneQuery,
    WorkerReply, WorkerResponse,
};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::hud::HudOverlay;
use crate::library::{Scene, SceneCfg, SceneLibrary, SceneModule, SerializedScene};
use crate::tracker::{ManifestTracker, ResourceTracker, TrackerConfig};
use crate::worker;

/// Default bound on one build.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(60);

static BUILD_SLOT: LazyLock<Arc<Mutex<()>>> = LazyLock::new(|| Arc::new(Mutex::new(())));

/// Why a query produced no reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// The scene function returned an error or panicked; formatted trace.
    #[error("{0}")]
    Scene(String),
    /// Target script, package, module or function could not be resolved.
    #[error("{0}")]
    Resolve(String),
    /// The worker process could not be spawned or died.
    #[error("worker failed: {0}")]
    Worker(String),
    /// The worker answered with something that is not a valid reply.
    #[error("worker protocol error: {0}")]
    Protocol(String),
    /// The build exceeded its time bound.
    #[error("build timed out after {0:?}")]
    Timeout(Duration),
}

/// A built scene, owned by whoever receives it.
pub struct SceneResult {
    /// Constructed scene graph.
    pub scene: Box<dyn Scene>,
    /// Configuration left by the scene function.
    pub meta: SceneMeta,
}

impl fmt::Debug for SceneResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneResult")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Successful answer to a query.
#[derive(Debug)]
pub enum QueryReply {
    /// Answer to [`QueryKind::Scene`].
    Scene(SceneResult),
    /// Answer to [`QueryKind::List`].
    List(Vec<SceneListing>),
}

/// Outcome plus the dependency manifest of one run. The manifest is filled
/// in even when the outcome is an error.
#[derive(Debug)]
pub struct BuildOutput {
    /// Reply or failure.
    pub outcome: Result<QueryReply, BuildError>,
    /// Files and modules consumed.
    pub manifest: Manifest,
}

impl BuildOutput {
    fn failed(err: BuildError) -> Self {
        Self {
            outcome: Err(err),
            manifest: Manifest::default(),
        }
    }

    /// Flatten into the worker wire form. The scene is serialized.
    pub fn into_response(self) -> WorkerResponse {
        let reply = match self.outcome {
            Ok(QueryReply::Scene(result)) => WorkerReply::Scene {
                serialized: result.scene.serialize(),
                meta: result.meta,
            },
            Ok(QueryReply::List(listings)) => WorkerReply::List(listings),
            Err(BuildError::Resolve(msg)) => WorkerReply::Unresolved(msg),
            Err(BuildError::Scene(trace)) => WorkerReply::Failed(trace),
            Err(other) => WorkerReply::Failed(other.to_string()),
        };
        WorkerResponse {
            reply,
            manifest: self.manifest,
        }
    }

    /// Rebuild from the worker wire form.
    pub fn from_response(response: WorkerResponse) -> Self {
        let outcome = match response.reply {
            WorkerReply::Scene { serialized, meta } => Ok(QueryReply::Scene(SceneResult {
                scene: Box::new(SerializedScene::new(serialized)),
                meta,
            })),
            WorkerReply::List(listings) => Ok(QueryReply::List(listings)),
            WorkerReply::Unresolved(msg) => Err(BuildError::Resolve(msg)),
            WorkerReply::Failed(trace) => Err(BuildError::Scene(trace)),
        };
        Self {
            outcome,
            manifest: response.manifest,
        }
    }
}

/// Program launched as an out-of-process build worker. It must speak the
/// framed protocol of [`crate::worker`] on stdin/stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Executable.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
}

/// Where the isolated body executes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Isolation {
    /// On the blocking pool of the current process.
    #[default]
    InProcess,
    /// In a fresh worker process per query.
    Subprocess(WorkerCommand),
}

/// Runs scene queries against a [`SceneLibrary`].
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    library: Arc<SceneLibrary>,
    isolation: Isolation,
    timeout: Option<Duration>,
    tracker_config: TrackerConfig,
}

impl SandboxRunner {
    /// In-process runner with the default timeout and tracker filters.
    pub fn new(library: Arc<SceneLibrary>) -> Self {
        Self {
            library,
            isolation: Isolation::InProcess,
            timeout: Some(DEFAULT_BUILD_TIMEOUT),
            tracker_config: TrackerConfig::default(),
        }
    }

    /// Select the isolation mode.
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Bound each build (`None` waits forever).
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the manifest filters.
    pub fn with_tracker_config(mut self, config: TrackerConfig) -> Self {
        self.tracker_config = config;
        self
    }

    /// Library queries resolve against.
    pub fn library(&self) -> &Arc<SceneLibrary> {
        &self.library
    }

    /// Answer `query`. Waits for the build slot first.
    pub async fn run(&self, query: SceneQuery) -> BuildOutput {
        let slot = Arc::clone(&BUILD_SLOT).lock_owned().await;
        debug!(kind = ?query.kind, module = ?query.target, "build slot acquired");
        match &self.isolation {
            Isolation::InProcess => self.run_in_process(slot, query).await,
            Isolation::Subprocess(command) => self.run_worker(slot, command, query).await,
        }
    }

    async fn run_in_process(&self, slot: OwnedMutexGuard<()>, query: SceneQuery) -> BuildOutput {
        let library = Arc::clone(&self.library);
        let config = self.tracker_config.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            execute(&library, &config, query)
        });
        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(?limit, "in-process build timed out; slot stays held until it returns");
                    return BuildOutput::failed(BuildError::Timeout(limit));
                }
            },
            None => task.await,
        };
        joined.unwrap_or_else(|err| BuildOutput::failed(BuildError::Worker(err.to_string())))
    }

    async fn run_worker(
        &self,
        slot: OwnedMutexGuard<()>,
        command: &WorkerCommand,
        query: SceneQuery,
    ) -> BuildOutput {
        let _slot = slot;
        let mut child = match Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                return BuildOutput::failed(BuildError::Worker(format!(
                    "cannot spawn {}: {err}",
                    command.program.display()
                )))
            }
        };
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return BuildOutput::failed(BuildError::Worker("worker pipes unavailable".into()));
        };
        let session = async {
            let reply = worker::exchange(stdout, stdin, &query).await;
            let status = child.wait().await;
            (reply, status)
        };
        let (reply, status) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, session).await {
                Ok(done) => done,
                Err(_) => {
                    warn!(?limit, program = %command.program.display(), "build worker timed out; killing");
                    return BuildOutput::failed(BuildError::Timeout(limit));
                }
            },
            None => session.await,
        };
        let status = status.map_or_else(|err| err.to_string(), |status| status.to_string());
        match reply {
            Ok(Some(response)) => BuildOutput::from_response(response),
            Ok(None) => BuildOutput::failed(BuildError::Worker(format!(
                "worker exited without replying ({status})"
            ))),
            Err(err) if err.downcast_ref::<WireError>().is_some() => {
                BuildOutput::failed(BuildError::Protocol(format!("{err:#}")))
            }
            Err(err) => {
                BuildOutput::failed(BuildError::Worker(format!("{err:#} ({status})")))
            }
        }
    }
}

/// Answer `query` on the calling thread, tracking dependencies. Panics in
/// scene code are caught.
pub(crate) fn execute(library: &SceneLibrary, config: &TrackerConfig, query: SceneQuery) -> BuildOutput {
    let tracker = Arc::new(ManifestTracker::new(config.clone()));
    let inventory = library.inventory();
    if let Err(err) = tracker.start(inventory) {
        warn!(%err, "dependency tracking unavailable for this build");
    }
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| answer(library, &tracker, &query)))
        .unwrap_or_else(|payload| Err(BuildError::Scene(panic_message(payload.as_ref()))));
    let manifest = tracker.stop(inventory);
    debug!(
        files = manifest.files.len(),
        modules = manifest.modules.len(),
        ok = outcome.is_ok(),
        "build finished"
    );
    BuildOutput { outcome, manifest }
}

fn answer(
    library: &SceneLibrary,
    tracker: &Arc<ManifestTracker>,
    query: &SceneQuery,
) -> Result<QueryReply, BuildError> {
    let modules = resolve_target(library, tracker.as_ref(), &query.target)?;
    let scene_ref = match &query.kind {
        QueryKind::List => {
            return Ok(QueryReply::List(
                modules.iter().flat_map(|m| m.scene_listings()).collect(),
            ))
        }
        QueryKind::Scene(scene_ref) => scene_ref,
    };
    let module = library
        .resolve(&scene_ref.module, tracker.as_ref())
        .ok_or_else(|| BuildError::Resolve(format!("No module named '{}'", scene_ref.module)))?;
    let callable = module.callable(&scene_ref.function).ok_or_else(|| {
        BuildError::Resolve(format!(
            "module '{}' has no attribute '{}'",
            scene_ref.module, scene_ref.function
        ))
    })?;
    if !callable.is_scene() {
        return Err(BuildError::Resolve(format!("{scene_ref} is not a scene function")));
    }
    let args = callable.bind_args(&query.extra_args).map_err(trace)?;
    let shared: Arc<dyn ResourceTracker> = tracker.clone();
    let mut cfg = SceneCfg::new(&query.overrides, shared);
    let scene = callable.call(&mut cfg, &args).map_err(trace)?;
    let scene: Box<dyn Scene> = match &query.hud {
        Some(options) => Box::new(HudOverlay::new(scene, options.clone())),
        None => scene,
    };
    Ok(QueryReply::Scene(SceneResult {
        scene,
        meta: cfg.into_meta(),
    }))
}

fn resolve_target<'a>(
    library: &'a SceneLibrary,
    tracker: &dyn ResourceTracker,
    target: &ModuleRef,
) -> Result<Vec<&'a SceneModule>, BuildError> {
    match target {
        ModuleRef::Script(path) => {
            File::open(path).map_err(|err| {
                BuildError::Resolve(format!("cannot load script {}: {err}", path.display()))
            })?;
            tracker.record_file(path);
            let name = library.script_module(path).ok_or_else(|| {
                BuildError::Resolve(format!("{} defines no scene module", path.display()))
            })?;
            library
                .resolve(name, tracker)
                .map(|module| vec![module])
                .ok_or_else(|| BuildError::Resolve(format!("No module named '{name}'")))
        }
        ModuleRef::Package(package) => library
            .resolve_package(package, tracker)
            .ok_or_else(|| BuildError::Resolve(format!("No module named '{package}'"))),
    }
}

fn trace(err: anyhow::Error) -> BuildError {
    BuildError::Scene(format!("{err:?}"))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    format!("scene function panicked: {detail}")
}
