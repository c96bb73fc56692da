// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Distribution controller: keeps the session map current and pushes built
//! scenes to every enabled session concurrently.
//!
//! One actor task owns the session map; nothing else writes it. Each known
//! session gets its own context task, created on first contact and kept
//! until shutdown. A context holds a two-entry work slot (pending probe,
//! latest scene job): submitting a job while another is still pending
//! replaces it, so a busy session never accumulates a backlog. Contexts
//! report back to the actor, which applies the report and emits the event.
//!
//! A context outlives removal of its session, but its upload cache does
//! not: eviction tells the context to forget every synced asset, so a
//! session that comes back (a restarted device) receives its files again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use scenehook_cas::{AssetKey, SyncCache};
use scenehook_proto::{Overrides, SceneQuery};
use scenehook_sandbox::{QueryReply, SandboxRunner};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, PushMetadata, SessionBackend, SessionInfo};
use crate::escape::{rewrite_references, UploadMapping};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionEvent, SessionId, SessionState};

/// Name of the transient file handed to `push_scene`.
pub const SCENE_FILE_NAME: &str = "scene.graph";

/// Controller policy.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Extra probe attempts before a session is evicted.
    pub probe_retries: u32,
    /// Delay between probe attempts.
    pub probe_backoff: Duration,
    /// Remembered enable flags; unknown sessions start enabled.
    pub enabled: BTreeMap<SessionId, bool>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            probe_retries: 0,
            probe_backoff: Duration::from_millis(500),
            enabled: BTreeMap::new(),
        }
    }
}

/// The controller is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    /// Commands can no longer be delivered.
    #[error("distribution controller has shut down")]
    Closed,
    /// The actor task failed.
    #[error("distribution controller task failed: {0}")]
    Join(String),
}

enum Command {
    Refresh(oneshot::Sender<()>),
    Process(SceneQuery),
    SetEnabled(SessionId, bool),
    Sessions(oneshot::Sender<Vec<Session>>),
    Shutdown,
}

enum Report {
    Listed {
        generation: u64,
        sessions: BTreeMap<SessionId, String>,
        done: oneshot::Sender<()>,
    },
    Probed {
        id: SessionId,
        description: String,
        result: Result<SessionInfo, AdapterError>,
    },
    Progress {
        id: SessionId,
        state: SessionState,
        status: String,
    },
}

/// Handle to a running controller.
#[derive(Debug)]
pub struct DistributionController {
    commands: mpsc::UnboundedSender<Command>,
    actor: JoinHandle<()>,
}

impl DistributionController {
    /// Start the controller on the current tokio runtime. Events arrive on
    /// the returned receiver.
    pub fn spawn<B: SessionBackend + 'static>(
        registry: Arc<SessionRegistry<B>>,
        runner: Arc<SandboxRunner>,
        config: ControllerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (reports, report_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            shared: Arc::new(Shared {
                registry,
                runner,
                reports,
                probe_retries: config.probe_retries,
                probe_backoff: config.probe_backoff,
            }),
            sessions: BTreeMap::new(),
            listed: BTreeMap::new(),
            enabled: config.enabled,
            contexts: BTreeMap::new(),
            listers: JoinSet::new(),
            generation: 0,
            applied_generation: 0,
            events,
            stop: watch::channel(false).0,
        };
        let actor = tokio::spawn(actor.run(command_rx, report_rx));
        (Self { commands, actor }, event_rx)
    }

    /// Re-enumerate sessions and probe each one. Returns once the new list
    /// is applied; probe outcomes arrive later as events.
    pub async fn refresh(&self) -> Result<(), ControllerError> {
        let (done, applied) = oneshot::channel();
        self.send(Command::Refresh(done))?;
        applied.await.map_err(|_| ControllerError::Closed)
    }

    /// Build `query` for every enabled session and push the result.
    pub fn process(&self, query: SceneQuery) -> Result<(), ControllerError> {
        self.send(Command::Process(query))
    }

    /// Enable or disable a session. The flag is remembered across removal.
    pub fn set_enabled(&self, id: SessionId, enabled: bool) -> Result<(), ControllerError> {
        self.send(Command::SetEnabled(id, enabled))
    }

    /// Snapshot of the admitted sessions, ordered by id.
    pub async fn sessions(&self) -> Result<Vec<Session>, ControllerError> {
        let (reply, snapshot) = oneshot::channel();
        self.send(Command::Sessions(reply))?;
        snapshot.await.map_err(|_| ControllerError::Closed)
    }

    /// Stop every session context, wait for them, then stop the actor.
    pub async fn shutdown(self) -> Result<(), ControllerError> {
        let _ = self.commands.send(Command::Shutdown);
        self.actor
            .await
            .map_err(|err| ControllerError::Join(err.to_string()))
    }

    fn send(&self, command: Command) -> Result<(), ControllerError> {
        self.commands
            .send(command)
            .map_err(|_| ControllerError::Closed)
    }
}

struct Shared<B> {
    registry: Arc<SessionRegistry<B>>,
    runner: Arc<SandboxRunner>,
    reports: mpsc::UnboundedSender<Report>,
    probe_retries: u32,
    probe_backoff: Duration,
}

struct Job {
    query: SceneQuery,
    scene_id: String,
    backend: String,
    system: String,
}

#[derive(Default)]
struct Pending {
    forget_uploads: bool,
    probe: Option<String>,
    job: Option<Job>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        !self.forget_uploads && self.probe.is_none() && self.job.is_none()
    }
}

#[derive(Default)]
struct WorkSlot {
    pending: Mutex<Pending>,
    wake: Notify,
}

impl WorkSlot {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit_probe(&self, description: String) {
        self.lock().probe = Some(description);
        self.wake.notify_one();
    }

    fn submit_job(&self, job: Job) {
        if let Some(old) = self.lock().job.replace(job) {
            debug!(scene = %old.scene_id, "pending scene job superseded");
        }
        self.wake.notify_one();
    }

    /// Drop the pending job and have the context clear its upload cache
    /// before anything else it runs.
    fn forget_session(&self) {
        {
            let mut pending = self.lock();
            pending.job = None;
            pending.forget_uploads = true;
        }
        self.wake.notify_one();
    }

    fn take(&self) -> Pending {
        std::mem::take(&mut *self.lock())
    }
}

struct Context {
    slot: Arc<WorkSlot>,
    task: JoinHandle<()>,
}

impl Context {
    fn spawn<B: SessionBackend + 'static>(
        id: SessionId,
        shared: Arc<Shared<B>>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let slot = Arc::new(WorkSlot::default());
        let task = tokio::spawn(run_context(id, Arc::clone(&slot), shared, stop));
        Self { slot, task }
    }
}

async fn run_context<B: SessionBackend + 'static>(
    id: SessionId,
    slot: Arc<WorkSlot>,
    shared: Arc<Shared<B>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut cache = SyncCache::new();
    loop {
        let work = slot.take();
        if work.is_empty() {
            tokio::select! {
                () = slot.wake.notified() => continue,
                _ = stop.wait_for(|stop| *stop) => break,
            }
        }
        if work.forget_uploads && !cache.is_empty() {
            debug!(session = %id, synced = cache.len(), "session evicted; forgetting synced assets");
            cache.clear();
        }
        let step = async {
            if let Some(description) = work.probe {
                shared.probe(&id, description).await;
            }
            if let Some(job) = work.job {
                shared.cycle(&id, &mut cache, job).await;
            }
        };
        tokio::select! {
            () = step => {}
            _ = stop.wait_for(|stop| *stop) => break,
        }
    }
    debug!(
        session = %id,
        synced = cache.len(),
        skipped_uploads = cache.hits(),
        "session context stopped"
    );
}

impl<B: SessionBackend> Shared<B> {
    fn report(&self, id: &SessionId, state: SessionState, status: String) {
        debug!(session = %id, %status, "session status");
        let _ = self.reports.send(Report::Progress {
            id: id.clone(),
            state,
            status,
        });
    }

    async fn probe(&self, id: &SessionId, description: String) {
        let mut attempt = 0;
        let result = loop {
            match self.registry.get_session_info(id).await {
                Ok(info) => break Ok(info),
                Err(err) if attempt < self.probe_retries => {
                    attempt += 1;
                    debug!(session = %id, %err, attempt, "session probe failed, retrying");
                    tokio::time::sleep(self.probe_backoff).await;
                }
                Err(err) => break Err(err),
            }
        };
        let _ = self.reports.send(Report::Probed {
            id: id.clone(),
            description,
            result,
        });
    }

    async fn cycle(&self, id: &SessionId, cache: &mut SyncCache, job: Job) {
        let started = Instant::now();
        let scene_id = job.scene_id.clone();
        match self.distribute(id, cache, job).await {
            Ok(()) => {
                let elapsed = started.elapsed().as_secs_f64();
                info!(session = %id, scene = %scene_id, elapsed, "scene submitted");
                self.report(
                    id,
                    SessionState::Idle,
                    format!("Submitted {scene_id} in {elapsed:.6}"),
                );
            }
            Err(status) => {
                warn!(session = %id, scene = %scene_id, %status, "scene distribution failed");
                self.report(id, SessionState::Error, status);
            }
        }
    }

    /// Build → upload → rewrite → send. `Err` carries the status line.
    async fn distribute(&self, id: &SessionId, cache: &mut SyncCache, job: Job) -> Result<(), String> {
        self.report(
            id,
            SessionState::Building,
            format!("Building {} scene in {}...", job.system, job.backend),
        );
        let overrides = Overrides {
            backend: Some(job.backend),
            system: Some(job.system),
        };
        let output = self.runner.run(job.query.with_overrides(overrides)).await;
        let result = match output.outcome {
            Ok(QueryReply::Scene(result)) => result,
            Ok(QueryReply::List(_)) => {
                return Err("Error getting scene: query does not build a scene".to_owned())
            }
            Err(err) => return Err(format!("Error getting scene: {err}")),
        };

        let files: Vec<PathBuf> = result.meta.referenced_files().cloned().collect();
        let total = files.len();
        let mut mappings = Vec::with_capacity(total);
        for (i, local) in files.into_iter().enumerate() {
            self.report(
                id,
                SessionState::Uploading { index: i + 1, total },
                format!("Uploading [{}/{total}]: {}...", i + 1, local.display()),
            );
            let remote = self
                .upload(id, cache, &local)
                .await
                .map_err(|err| format!("Error while uploading {}: {err}", local.display()))?;
            mappings.push(UploadMapping { local, remote });
        }

        let mut serialized = rewrite_references(&result.scene.serialize(), &mappings);
        if !serialized.ends_with('\n') {
            serialized.push('\n');
        }
        let dir = tempfile::Builder::new()
            .prefix("scenehook_")
            .tempdir()
            .map_err(|err| format!("Error while sending scene: {err}"))?;
        let scene_file = dir.path().join(SCENE_FILE_NAME);
        std::fs::write(&scene_file, serialized)
            .map_err(|err| format!("Error while sending scene: {err}"))?;

        self.report(
            id,
            SessionState::Sending,
            format!("Sending scene {}...", job.scene_id),
        );
        self.registry
            .push_scene(id, &scene_file, &PushMetadata::from(&result.meta))
            .await
            .map_err(|err| format!("Error while sending scene: {err}"))
    }

    async fn upload(
        &self,
        id: &SessionId,
        cache: &mut SyncCache,
        local: &Path,
    ) -> Result<PathBuf, AdapterError> {
        let key = AssetKey::for_file(local)
            .map_err(|err| AdapterError::new("sync_file", err.to_string()))?;
        if let Some(remote) = cache.lookup(&key) {
            debug!(session = %id, file = %local.display(), "asset unchanged, skipping upload");
            return Ok(remote.to_path_buf());
        }
        let remote = self.registry.sync_file(id, local).await?;
        cache.record(key, remote.clone());
        Ok(remote)
    }
}

struct Actor<B> {
    shared: Arc<Shared<B>>,
    sessions: BTreeMap<SessionId, Session>,
    listed: BTreeMap<SessionId, String>,
    enabled: BTreeMap<SessionId, bool>,
    contexts: BTreeMap<SessionId, Context>,
    listers: JoinSet<()>,
    generation: u64,
    applied_generation: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    stop: watch::Sender<bool>,
}

impl<B: SessionBackend + 'static> Actor<B> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<Report>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(report) = reports.recv() => self.handle_report(report),
                Some(_) = self.listers.join_next(), if !self.listers.is_empty() => {}
            }
        }
        self.shutdown().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Refresh(done) => {
                self.generation += 1;
                let generation = self.generation;
                let shared = Arc::clone(&self.shared);
                self.listers.spawn(async move {
                    let sessions = shared.registry.list_sessions().await;
                    let _ = shared.reports.send(Report::Listed {
                        generation,
                        sessions,
                        done,
                    });
                });
            }
            Command::Process(query) => self.process(&query),
            Command::SetEnabled(id, enabled) => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.enabled = enabled;
                }
                self.enabled.insert(id, enabled);
            }
            Command::Sessions(reply) => {
                let _ = reply.send(self.sessions.values().cloned().collect());
            }
            Command::Shutdown => {}
        }
    }

    fn process(&mut self, query: &SceneQuery) {
        let Some(scene_ref) = query.scene_ref() else {
            warn!(module = ?query.target, "process expects a scene query; ignoring listing");
            return;
        };
        let scene_id = scene_ref.to_string();
        let jobs: Vec<_> = self
            .sessions
            .values()
            .filter(|session| session.enabled)
            .map(|session| {
                let job = Job {
                    query: query.clone(),
                    scene_id: scene_id.clone(),
                    backend: session.backend.clone(),
                    system: session.system.clone(),
                };
                (session.id.clone(), job)
            })
            .collect();
        debug!(scene = %scene_id, sessions = jobs.len(), "dispatching scene");
        for (id, job) in jobs {
            self.context(&id).slot.submit_job(job);
        }
    }

    fn handle_report(&mut self, report: Report) {
        match report {
            Report::Listed {
                generation,
                sessions,
                done,
            } => {
                if generation < self.applied_generation {
                    debug!(generation, applied = self.applied_generation, "stale session listing dropped");
                } else {
                    self.applied_generation = generation;
                    self.apply_listing(sessions);
                }
                let _ = done.send(());
            }
            Report::Probed {
                id,
                description,
                result,
            } => self.apply_probe(id, description, result),
            Report::Progress { id, state, status } => {
                let Some(session) = self.sessions.get_mut(&id) else {
                    return;
                };
                session.state = state;
                session.status = status;
                let changed = session.clone();
                self.emit(SessionEvent::Changed(changed));
            }
        }
    }

    fn apply_listing(&mut self, sessions: BTreeMap<SessionId, String>) {
        let gone: Vec<SessionId> = self
            .sessions
            .keys()
            .filter(|id| !sessions.contains_key(*id))
            .cloned()
            .collect();
        for id in &gone {
            self.evict(id);
        }
        for (id, description) in &sessions {
            if let Some(session) = self.sessions.get_mut(id) {
                // A session mid-cycle keeps its state; the probe runs after the cycle.
                if matches!(session.state, SessionState::Idle | SessionState::Error) {
                    session.state = SessionState::Probing;
                    let changed = session.clone();
                    self.emit(SessionEvent::Changed(changed));
                }
            }
            self.context(id).slot.submit_probe(description.clone());
        }
        self.listed = sessions;
    }

    fn apply_probe(
        &mut self,
        id: SessionId,
        description: String,
        result: Result<SessionInfo, AdapterError>,
    ) {
        if !self.listed.contains_key(&id) {
            debug!(session = %id, "probe result for an unlisted session ignored");
            return;
        }
        let info = match result {
            Ok(info) => info,
            Err(err) => {
                warn!(session = %id, %err, "could not get session information");
                self.listed.remove(&id);
                self.evict(&id);
                return;
            }
        };
        let (backend, system) = (info.backend().to_owned(), info.system().to_owned());
        if let Some(session) = self.sessions.get_mut(&id) {
            let mut changed = false;
            if session.state == SessionState::Probing {
                session.state = SessionState::Idle;
                changed = true;
            }
            if session.description != description
                || session.backend != backend
                || session.system != system
            {
                session.description = description;
                session.backend = backend;
                session.system = system;
                changed = true;
            }
            if changed {
                let changed = session.clone();
                self.emit(SessionEvent::Changed(changed));
            }
            return;
        }
        let session = Session {
            id: id.clone(),
            description,
            backend,
            system,
            enabled: self.enabled.get(&id).copied().unwrap_or(true),
            state: SessionState::Idle,
            status: String::new(),
        };
        info!(session = %id, backend = %session.backend, system = %session.system, "session added");
        self.sessions.insert(id, session.clone());
        self.emit(SessionEvent::Added(session));
    }

    fn evict(&mut self, id: &SessionId) {
        if let Some(context) = self.contexts.get(id) {
            context.slot.forget_session();
        }
        if self.sessions.remove(id).is_some() {
            info!(session = %id, "session removed");
            self.emit(SessionEvent::Removed(id.clone()));
        }
    }

    fn context(&mut self, id: &SessionId) -> &Context {
        self.contexts.entry(id.clone()).or_insert_with(|| {
            Context::spawn(id.clone(), Arc::clone(&self.shared), self.stop.subscribe())
        })
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn shutdown(mut self) {
        self.stop.send_replace(true);
        self.listers.shutdown().await;
        for (id, context) in std::mem::take(&mut self.contexts) {
            if let Err(err) = context.task.await {
                warn!(session = %id, %err, "session context ended abnormally");
            }
        }
        info!("distribution controller stopped");
    }
}
