// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]
//! Distribution controller behavior against an in-memory backend and an
//! in-process sandbox runner.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scenehook_proto::{ModuleRef, SceneQuery, SceneRef};
use scenehook_sandbox::{Callable, SandboxRunner, SceneLibrary, SceneModule, SerializedScene};
use scenehook_session::{
    escape_path, AdapterError, ControllerConfig, DistributionController, PushMetadata,
    SessionBackend, SessionEvent, SessionId, SessionInfo, SessionRegistry, SessionState,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

#[derive(Default)]
struct FakeState {
    sessions: Vec<(String, String)>,
    info: BTreeMap<String, (String, String)>,
    probe_failures: BTreeMap<String, u32>,
    probes: BTreeMap<String, u32>,
    synced: Vec<(String, PathBuf)>,
    entered: usize,
    pushed: Vec<(String, String)>,
    gate: Option<Arc<Semaphore>>,
    sync_failures: BTreeSet<String>,
    push_failures: BTreeSet<String>,
    lists: usize,
    list_gate: Option<Arc<Semaphore>>,
}

#[derive(Clone, Default)]
struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    fn with_sessions(sessions: &[(&str, &str)]) -> Self {
        let backend = Self::default();
        for (local, render_backend) in sessions {
            backend.add(local, render_backend);
        }
        backend
    }

    fn add(&self, local: &str, render_backend: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .sessions
            .push((local.to_owned(), format!("{local} screen")));
        state
            .info
            .insert(local.to_owned(), (render_backend.to_owned(), "linux".to_owned()));
    }

    fn remove(&self, local: &str) {
        self.state
            .lock()
            .unwrap()
            .sessions
            .retain(|(id, _)| id != local);
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn pushed_to(&self, local: &str) -> Vec<String> {
        self.with(|state| {
            state
                .pushed
                .iter()
                .filter(|(id, _)| id == local)
                .map(|(_, scene)| scene.clone())
                .collect()
        })
    }
}

impl SessionBackend for FakeBackend {
    async fn enumerate_sessions(&self) -> Result<Vec<(String, String)>, AdapterError> {
        // The snapshot is taken before the one-shot gate, so a gated listing is stale.
        let (sessions, gate) = self.with(|state| {
            state.lists += 1;
            (state.sessions.clone(), state.list_gate.take())
        });
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|err| AdapterError::new("get_sessions", err.to_string()))?
                .forget();
        }
        Ok(sessions)
    }

    async fn describe(&self, local: &str) -> Result<SessionInfo, AdapterError> {
        self.with(|state| {
            *state.probes.entry(local.to_owned()).or_default() += 1;
            if let Some(left) = state.probe_failures.get_mut(local) {
                if *left > 0 {
                    *left -= 1;
                    return Err(AdapterError::new("get_session_info", "not answering"));
                }
            }
            let (backend, system) = state
                .info
                .get(local)
                .cloned()
                .ok_or_else(|| AdapterError::new("get_session_info", "unknown session"))?;
            Ok([("backend".to_owned(), backend), ("system".to_owned(), system)]
                .into_iter()
                .collect())
        })
    }

    async fn sync_asset(&self, local: &str, path: &Path) -> Result<PathBuf, AdapterError> {
        if self.with(|state| state.sync_failures.contains(local)) {
            return Err(AdapterError::new("sync_file", "disk full"));
        }
        self.with(|state| state.synced.push((local.to_owned(), path.to_path_buf())));
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        Ok(PathBuf::from(format!("/remote/{local}/{name}")))
    }

    async fn push_scene(
        &self,
        local: &str,
        scene_file: &Path,
        _meta: &PushMetadata,
    ) -> Result<(), AdapterError> {
        let (gate, fail) = self.with(|state| {
            state.entered += 1;
            (state.gate.clone(), state.push_failures.contains(local))
        });
        if fail {
            return Err(AdapterError::new("scene_change", "connection reset"));
        }
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|err| AdapterError::new("scene_change", err.to_string()))?
                .forget();
        }
        let scene = std::fs::read_to_string(scene_file)
            .map_err(|err| AdapterError::new("scene_change", err.to_string()))?;
        self.with(|state| state.pushed.push((local.to_owned(), scene)));
        Ok(())
    }
}

fn show_library(media: Option<PathBuf>) -> SceneLibrary {
    let mut module = SceneModule::new("main")
        .with(Callable::scene("one", |_, _| Ok(Box::new(SerializedScene::new("scene one")))))
        .with(Callable::scene("two", |_, _| Ok(Box::new(SerializedScene::new("scene two")))))
        .with(Callable::scene("three", |_, _| {
            Ok(Box::new(SerializedScene::new("scene three")))
        }))
        .with(Callable::scene("fussy", |cfg, _| {
            if cfg.backend == "broken" {
                anyhow::bail!("unsupported backend {}", cfg.backend);
            }
            Ok(Box::new(SerializedScene::new(format!("fussy {}\n", cfg.backend))))
        }));
    if let Some(media) = media {
        module = module.with(Callable::scene("clip", move |cfg, _| {
            cfg.add_media(media.clone());
            Ok(Box::new(SerializedScene::new(format!(
                "media filename={}\n",
                escape_path(&media)
            ))))
        }));
    }
    let mut lib = SceneLibrary::new();
    lib.add_package("show", vec![module]);
    lib
}

fn show_query(function: &str) -> SceneQuery {
    SceneQuery::scene(
        ModuleRef::Package("show".into()),
        SceneRef::new("show.main", function),
    )
}

fn start(
    backend: &FakeBackend,
    library: SceneLibrary,
    config: ControllerConfig,
) -> (DistributionController, mpsc::UnboundedReceiver<SessionEvent>) {
    let registry = Arc::new(SessionRegistry::new(vec![backend.clone()]));
    let runner = Arc::new(SandboxRunner::new(Arc::new(library)));
    DistributionController::spawn(registry, runner, config)
}

async fn until(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn admitted(controller: &DistributionController, count: usize) {
    timeout(Duration::from_secs(10), async {
        while controller.sessions().await.unwrap().len() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions were not admitted");
}

async fn status_of(controller: &DistributionController, local: &str) -> (SessionState, String) {
    let id = SessionId::new(0, local);
    let session = controller
        .sessions()
        .await
        .unwrap()
        .into_iter()
        .find(|session| session.id == id)
        .expect("session is admitted");
    (session.state, session.status)
}

async fn settled(controller: &DistributionController, local: &str) -> (SessionState, String) {
    timeout(Duration::from_secs(10), async {
        loop {
            let (state, status) = status_of(controller, local).await;
            if matches!(state, SessionState::Idle | SessionState::Error) && !status.is_empty() {
                return (state, status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session did not settle")
}

// ── 1. per-session builds are isolated ──────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_build_on_one_session_leaves_the_other() {
    let backend = FakeBackend::with_sessions(&[("good", "gles"), ("bad", "broken")]);
    let (controller, _events) = start(&backend, show_library(None), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 2).await;

    controller.process(show_query("fussy")).unwrap();

    let (state, status) = settled(&controller, "bad").await;
    assert_eq!(state, SessionState::Error);
    assert!(status.starts_with("Error getting scene"), "{status}");
    assert!(status.contains("unsupported backend broken"), "{status}");

    let (state, status) = settled(&controller, "good").await;
    assert_eq!(state, SessionState::Idle);
    assert!(status.starts_with("Submitted show.main.fussy in "), "{status}");
    assert_eq!(backend.pushed_to("good"), ["fussy gles\n"]);
    assert!(backend.pushed_to("bad").is_empty());

    controller.shutdown().await.unwrap();
}

// ── 2. media references are synced and rewritten ────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn media_paths_are_rewritten_and_synced_once() {
    let dir = TempDir::new().unwrap();
    let media = dir.path().join("my clip.mp4");
    std::fs::write(&media, b"frames").unwrap();
    let backend = FakeBackend::with_sessions(&[("tv", "gles")]);
    let (controller, _events) =
        start(&backend, show_library(Some(media.clone())), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;

    controller.process(show_query("clip")).unwrap();
    until("first push", || backend.pushed_to("tv").len() == 1).await;
    controller.process(show_query("clip")).unwrap();
    until("second push", || backend.pushed_to("tv").len() == 2).await;

    let remote = PathBuf::from("/remote/tv/my clip.mp4");
    let expected = format!("media filename={}\n", escape_path(&remote));
    assert_eq!(backend.pushed_to("tv"), [expected.clone(), expected]);
    assert!(!backend.pushed_to("tv")[0].contains(&escape_path(&media)));
    assert_eq!(
        backend.with(|state| state.synced.clone()),
        [("tv".to_owned(), media)]
    );

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scene_file_is_newline_terminated() {
    let backend = FakeBackend::with_sessions(&[("tv", "gles")]);
    let (controller, _events) = start(&backend, show_library(None), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;

    controller.process(show_query("one")).unwrap();
    until("push", || backend.pushed_to("tv").len() == 1).await;
    assert_eq!(backend.pushed_to("tv"), ["scene one\n"]);

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cycle_reports_each_step_in_order() {
    let dir = TempDir::new().unwrap();
    let media = dir.path().join("clip.mp4");
    std::fs::write(&media, b"frames").unwrap();
    let backend = FakeBackend::with_sessions(&[("tv", "gles")]);
    let (controller, mut events) =
        start(&backend, show_library(Some(media.clone())), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;
    assert!(matches!(events.recv().await, Some(SessionEvent::Added(_))));

    controller.process(show_query("clip")).unwrap();
    let mut steps = Vec::new();
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::Changed(session) => {
                    let done = session.state == SessionState::Idle;
                    steps.push((session.state, session.status));
                    if done {
                        break;
                    }
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    })
    .await
    .expect("cycle did not finish");

    assert_eq!(steps.len(), 4, "{steps:?}");
    assert_eq!(
        steps[0],
        (SessionState::Building, "Building linux scene in gles...".to_owned())
    );
    assert_eq!(
        steps[1],
        (
            SessionState::Uploading { index: 1, total: 1 },
            format!("Uploading [1/1]: {}...", media.display())
        )
    );
    assert_eq!(
        steps[2],
        (SessionState::Sending, "Sending scene show.main.clip...".to_owned())
    );
    assert!(steps[3].1.starts_with("Submitted show.main.clip in "), "{steps:?}");

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_failure_aborts_only_that_session() {
    let dir = TempDir::new().unwrap();
    let media = dir.path().join("clip.mp4");
    std::fs::write(&media, b"frames").unwrap();
    let backend = FakeBackend::with_sessions(&[("tv", "gles"), ("lamp", "gles")]);
    backend.with(|state| state.sync_failures.insert("tv".into()));
    let (controller, _events) =
        start(&backend, show_library(Some(media.clone())), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 2).await;

    controller.process(show_query("clip")).unwrap();

    let (state, status) = settled(&controller, "tv").await;
    assert_eq!(state, SessionState::Error);
    assert_eq!(
        status,
        format!("Error while uploading {}: sync_file: disk full", media.display())
    );
    let (state, status) = settled(&controller, "lamp").await;
    assert_eq!(state, SessionState::Idle);
    assert!(status.starts_with("Submitted show.main.clip in "), "{status}");
    assert!(backend.pushed_to("tv").is_empty());
    assert_eq!(backend.pushed_to("lamp").len(), 1);

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_failure_is_reported_as_a_send_error() {
    let backend = FakeBackend::with_sessions(&[("tv", "gles")]);
    backend.with(|state| state.push_failures.insert("tv".into()));
    let (controller, _events) = start(&backend, show_library(None), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;

    controller.process(show_query("one")).unwrap();

    let (state, status) = settled(&controller, "tv").await;
    assert_eq!(state, SessionState::Error);
    assert_eq!(
        status,
        "Error while sending scene: scene_change: connection reset"
    );

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readmitted_session_gets_its_assets_again() {
    let dir = TempDir::new().unwrap();
    let media = dir.path().join("clip.mp4");
    std::fs::write(&media, b"frames").unwrap();
    let backend = FakeBackend::with_sessions(&[("tv", "gles")]);
    let (controller, _events) =
        start(&backend, show_library(Some(media.clone())), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;

    controller.process(show_query("clip")).unwrap();
    until("first push", || backend.pushed_to("tv").len() == 1).await;

    backend.remove("tv");
    controller.refresh().await.unwrap();
    admitted(&controller, 0).await;
    backend.add("tv", "gles");
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;

    controller.process(show_query("clip")).unwrap();
    until("second push", || backend.pushed_to("tv").len() == 2).await;
    let synced = backend.with(|state| state.synced.clone());
    assert_eq!(synced, [("tv".to_owned(), media.clone()), ("tv".to_owned(), media)]);

    controller.shutdown().await.unwrap();
}

// ── 3. a busy session keeps only the latest job ─────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn jobs_submitted_while_busy_coalesce_to_latest() {
    let backend = FakeBackend::with_sessions(&[("tv", "gles")]);
    let gate = Arc::new(Semaphore::new(0));
    backend.with(|state| state.gate = Some(Arc::clone(&gate)));
    let (controller, _events) = start(&backend, show_library(None), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;

    controller.process(show_query("one")).unwrap();
    until("first push to block", || backend.with(|state| state.entered) == 1).await;
    controller.process(show_query("two")).unwrap();
    controller.process(show_query("three")).unwrap();
    // Commands are applied in order; the snapshot comes back after both jobs.
    controller.sessions().await.unwrap();
    gate.add_permits(8);

    until("two pushes", || backend.pushed_to("tv").len() == 2).await;
    timeout(Duration::from_secs(10), async {
        loop {
            let (state, status) = status_of(&controller, "tv").await;
            if state == SessionState::Idle && status.starts_with("Submitted show.main.three") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("last job was not reported");
    assert_eq!(backend.pushed_to("tv"), ["scene one\n", "scene three\n"]);

    controller.shutdown().await.unwrap();
}

// ── 4. refresh and probe policy ─────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_emits_added_and_removed() {
    let backend = FakeBackend::with_sessions(&[("a", "gles"), ("b", "vulkan")]);
    let (controller, mut events) =
        start(&backend, show_library(None), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 2).await;

    let mut added = Vec::new();
    for _ in 0..2 {
        match events.recv().await.unwrap() {
            SessionEvent::Added(session) => added.push(session.id.to_string()),
            other => panic!("unexpected event {other:?}"),
        }
    }
    added.sort();
    assert_eq!(added, ["0:a", "0:b"]);

    backend.remove("b");
    controller.refresh().await.unwrap();
    let removed = timeout(Duration::from_secs(10), async {
        loop {
            if let SessionEvent::Removed(id) = events.recv().await.unwrap() {
                return id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(removed, SessionId::new(0, "b"));
    admitted(&controller, 1).await;

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_during_a_cycle_keeps_its_state() {
    let backend = FakeBackend::with_sessions(&[("tv", "gles")]);
    let gate = Arc::new(Semaphore::new(0));
    backend.with(|state| state.gate = Some(Arc::clone(&gate)));
    let (controller, mut events) =
        start(&backend, show_library(None), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;

    controller.process(show_query("one")).unwrap();
    until("push to block", || backend.with(|state| state.entered) == 1).await;
    timeout(Duration::from_secs(10), async {
        while status_of(&controller, "tv").await.0 != SessionState::Sending {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never reached Sending");

    controller.refresh().await.unwrap();
    assert_eq!(status_of(&controller, "tv").await.0, SessionState::Sending);

    gate.add_permits(1);
    let (state, _) = settled(&controller, "tv").await;
    assert_eq!(state, SessionState::Idle);
    // The info request queued behind the cycle finds the session idle and stays quiet.
    until("queued info request", || backend.with(|state| state.probes["tv"]) == 2).await;
    controller.sessions().await.unwrap();
    while events.try_recv().is_ok() {}

    controller.refresh().await.unwrap();
    let mut states = Vec::new();
    timeout(Duration::from_secs(10), async {
        while states.len() < 2 {
            if let SessionEvent::Changed(session) = events.recv().await.unwrap() {
                states.push(session.state);
            }
        }
    })
    .await
    .expect("refresh was not reported");
    assert_eq!(states, [SessionState::Probing, SessionState::Idle]);

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_listing_is_dropped() {
    let backend = FakeBackend::with_sessions(&[("a", "gles")]);
    let list_gate = Arc::new(Semaphore::new(0));
    backend.with(|state| state.list_gate = Some(Arc::clone(&list_gate)));
    let (controller, _events) = start(&backend, show_library(None), ControllerConfig::default());
    let controller = Arc::new(controller);

    let first = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.refresh().await }
    });
    until("first listing to block", || backend.with(|state| state.lists) == 1).await;
    backend.add("b", "gles");
    controller.refresh().await.unwrap();
    admitted(&controller, 2).await;

    list_gate.add_permits(1);
    first.await.unwrap().unwrap();
    assert_eq!(controller.sessions().await.unwrap().len(), 2);

    Arc::try_unwrap(controller).unwrap().shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_probe_failures_are_retried() {
    let backend = FakeBackend::with_sessions(&[("flaky", "gles")]);
    backend.with(|state| state.probe_failures.insert("flaky".into(), 2));
    let config = ControllerConfig {
        probe_retries: 2,
        probe_backoff: Duration::from_millis(10),
        ..ControllerConfig::default()
    };
    let (controller, _events) = start(&backend, show_library(None), config);
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;
    assert_eq!(backend.with(|state| state.probes["flaky"]), 3);

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_probe_without_retries_skips_the_session() {
    let backend = FakeBackend::with_sessions(&[("flaky", "gles")]);
    backend.with(|state| state.probe_failures.insert("flaky".into(), 1));
    let (controller, mut events) =
        start(&backend, show_library(None), ControllerConfig::default());

    controller.refresh().await.unwrap();
    until("first probe", || {
        backend.with(|state| state.probes.get("flaky").copied()) == Some(1)
    })
    .await;
    // Let the failed probe report land before the next listing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;

    // Never admitted before, so the failure produced no removal.
    match events.recv().await.unwrap() {
        SessionEvent::Added(session) => assert_eq!(session.id, SessionId::new(0, "flaky")),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(backend.with(|state| state.probes["flaky"]), 2);

    controller.shutdown().await.unwrap();
}

// ── 5. enable flags ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_sessions_receive_nothing() {
    let backend = FakeBackend::with_sessions(&[("a", "gles"), ("b", "gles"), ("c", "gles")]);
    let config = ControllerConfig {
        enabled: [(SessionId::new(0, "c"), false)].into_iter().collect(),
        ..ControllerConfig::default()
    };
    let (controller, _events) = start(&backend, show_library(None), config);
    controller.refresh().await.unwrap();
    admitted(&controller, 3).await;

    controller.set_enabled(SessionId::new(0, "b"), false).unwrap();
    controller.process(show_query("two")).unwrap();
    until("push to a", || backend.pushed_to("a").len() == 1).await;

    let sessions = controller.sessions().await.unwrap();
    let enabled: Vec<bool> = sessions.iter().map(|session| session.enabled).collect();
    assert_eq!(enabled, [true, false, false]);
    assert!(backend.pushed_to("b").is_empty());
    assert!(backend.pushed_to("c").is_empty());

    controller.shutdown().await.unwrap();
}

// ── 6. shutdown ─────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_cancels_blocked_sessions() {
    let backend = FakeBackend::with_sessions(&[("tv", "gles")]);
    backend.with(|state| state.gate = Some(Arc::new(Semaphore::new(0))));
    let (controller, _events) = start(&backend, show_library(None), ControllerConfig::default());
    controller.refresh().await.unwrap();
    admitted(&controller, 1).await;

    controller.process(show_query("one")).unwrap();
    until("push to block", || backend.with(|state| state.entered) == 1).await;

    timeout(Duration::from_secs(5), controller.shutdown())
        .await
        .expect("shutdown hung")
        .unwrap();
    assert!(backend.pushed_to("tv").is_empty());
}
