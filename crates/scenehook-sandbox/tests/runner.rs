// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sandbox runner behavior: build slot exclusion, error capture, manifests,
//! and in-process vs worker transport.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use scenehook_proto::wire::encode_message;
use scenehook_proto::{
    Manifest, Message, ModuleRef, SceneMeta, SceneQuery, SceneRef, WorkerReply, WorkerResponse,
};
use scenehook_sandbox::worker::{exchange, serve};
use scenehook_sandbox::{
    BuildError, BuildOutput, Callable, Isolation, QueryReply, SandboxRunner, SceneLibrary,
    SceneModule, SerializedScene, TrackerConfig, WorkerCommand,
};
use tokio::time::timeout;

static ACTIVE: AtomicUsize = AtomicUsize::new(0);
static PEAK: AtomicUsize = AtomicUsize::new(0);

fn demo_library() -> SceneLibrary {
    let mut lib = SceneLibrary::new();
    lib.add_package(
        "demo",
        vec![SceneModule::new("timing")
            .with(Callable::scene("slow", |_, _| {
                let now = ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
                PEAK.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                ACTIVE.fetch_sub(1, Ordering::SeqCst);
                Ok(Box::new(SerializedScene::new("slow\n")))
            }))
            .with(Callable::scene("boom", |_, _| anyhow::bail!("boom")))
            .with(Callable::scene("quick", |cfg, _| {
                cfg.duration = 2.5;
                Ok(Box::new(SerializedScene::new(format!("quick {}\n", cfg.backend))))
            }))],
    );
    lib.add_package(
        "pkg",
        vec![SceneModule::new("helpers").with(Callable::plain("not_a_scene", |_, _| {
            Ok(Box::new(SerializedScene::new("")))
        }))],
    );
    lib
}

fn demo_query(function: &str) -> SceneQuery {
    SceneQuery::scene(
        ModuleRef::Package("demo".into()),
        SceneRef::new("demo.timing", function),
    )
}

fn runner() -> SandboxRunner {
    SandboxRunner::new(Arc::new(demo_library()))
}

fn scene_of(output: BuildOutput) -> (String, SceneMeta) {
    match output.outcome {
        Ok(QueryReply::Scene(result)) => (result.scene.serialize(), result.meta),
        other => panic!("expected a scene, got {other:?}"),
    }
}

// ── 1. one build at a time ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_never_overlap() {
    let runner = runner();
    let mut handles = Vec::new();
    for _ in 0..6 {
        let runner = runner.clone();
        handles.push(tokio::spawn(async move { runner.run(demo_query("slow")).await }));
    }
    for handle in handles {
        let (text, _) = scene_of(handle.await.unwrap());
        assert_eq!(text, "slow\n");
    }
    assert_eq!(PEAK.load(Ordering::SeqCst), 1);
}

// ── 2. untagged package lists nothing ───────────────────────────────

#[tokio::test]
async fn package_without_scene_functions_lists_nothing() {
    let output = runner()
        .run(SceneQuery::list(ModuleRef::Package("pkg".into())))
        .await;
    match output.outcome {
        Ok(QueryReply::List(listings)) => assert!(listings.is_empty()),
        other => panic!("expected a listing, got {other:?}"),
    }
    assert!(output.manifest.modules.contains("pkg.helpers"));
}

// ── 3. scene errors are captured and release the slot ───────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scene_error_is_reported_and_slot_released() {
    let runner = runner();
    let failed = runner.run(demo_query("boom")).await;
    match failed.outcome {
        Err(BuildError::Scene(trace)) => assert!(trace.contains("boom")),
        other => panic!("expected a scene error, got {other:?}"),
    }

    let (first, second) = tokio::join!(
        runner.run(demo_query("boom")),
        timeout(Duration::from_secs(5), runner.run(demo_query("quick")))
    );
    assert!(first.outcome.is_err());
    let (text, meta) = scene_of(second.expect("second build must not deadlock"));
    assert_eq!(text, "quick opengl\n");
    assert!((meta.duration - 2.5).abs() < f64::EPSILON);
}

// ── 4. manifest completeness ────────────────────────────────────────

#[tokio::test]
async fn manifest_lists_script_files_and_imports() {
    let work = tempfile::tempdir().unwrap();
    let system = tempfile::tempdir().unwrap();
    let script = work.path().join("textured.scene");
    let texture = work.path().join("brick.png");
    let shader = work.path().join("blur.frag.spv");
    let stdlib = system.path().join("builtin.glsl");
    for path in [&script, &texture, &shader, &stdlib] {
        fs::write(path, b"data").unwrap();
    }

    let mut lib = SceneLibrary::new();
    lib.add_module(SceneModule::new("common"));
    let (tex, spv, std_file) = (texture.clone(), shader.clone(), stdlib.clone());
    lib.add_script(
        &script,
        SceneModule::new("textured").import("common").with(Callable::scene(
            "wall",
            move |cfg, _| {
                cfg.read_to_string(&tex)?;
                cfg.read_to_string(&spv)?;
                cfg.read_to_string(&std_file)?;
                cfg.add_file(&tex);
                Ok(Box::new(SerializedScene::new(format!("texture {}\n", tex.display()))))
            },
        )),
    );
    let runner = SandboxRunner::new(Arc::new(lib)).with_tracker_config(TrackerConfig {
        system_prefixes: vec![system.path().to_path_buf()],
        ..TrackerConfig::default()
    });

    let output = runner
        .run(SceneQuery::scene(
            ModuleRef::Script(script.clone()),
            SceneRef::new("textured", "wall"),
        ))
        .await;
    let manifest = output.manifest.clone();
    let (_, meta) = scene_of(output);

    assert!(manifest.files.contains(&script));
    assert!(manifest.files.contains(&texture));
    assert!(manifest.files.contains(&work.path().join("blur.frag")));
    assert!(!manifest.files.contains(&stdlib));
    assert!(manifest.modules.contains("textured"));
    assert!(manifest.modules.contains("common"));
    assert_eq!(meta.aux_files, vec![texture]);
}

#[tokio::test]
async fn missing_script_is_a_resolve_error() {
    let output = runner()
        .run(SceneQuery::list(ModuleRef::Script(PathBuf::from(
            "/nonexistent/scenehook/script.scene",
        ))))
        .await;
    assert!(matches!(output.outcome, Err(BuildError::Resolve(_))));
}

// ── 5. worker transport ─────────────────────────────────────────────

#[tokio::test]
async fn worker_transport_matches_in_process() {
    let query = demo_query("quick");
    let local = runner().run(query.clone()).await;

    let (client_tx, server_rx) = tokio::io::duplex(1024);
    let (server_tx, client_rx) = tokio::io::duplex(1024);
    let server = tokio::spawn(serve(
        Arc::new(demo_library()),
        TrackerConfig::default(),
        server_rx,
        server_tx,
    ));
    let response = exchange(client_rx, client_tx, &query)
        .await
        .unwrap()
        .expect("worker reply");
    server.await.unwrap().unwrap();
    let remote = BuildOutput::from_response(response);

    assert_eq!(remote.manifest, local.manifest);
    assert_eq!(scene_of(remote), scene_of(local));
}

fn reply_file(dir: &Path, response: WorkerResponse) -> PathBuf {
    let path = dir.join("reply.bin");
    fs::write(&path, encode_message(&Message::BuildReply(response)).unwrap()).unwrap();
    path
}

fn shell_worker(script: &str, args: &[&Path]) -> Isolation {
    let mut all = vec!["-c".to_string(), script.to_string()];
    all.extend(args.iter().map(|p| p.display().to_string()));
    Isolation::Subprocess(WorkerCommand {
        program: PathBuf::from("sh"),
        args: all,
    })
}

#[tokio::test]
async fn subprocess_reply_is_decoded() {
    let dir = tempfile::tempdir().unwrap();
    let mut manifest = Manifest::default();
    manifest.modules.insert("remote.scene".into());
    let reply = reply_file(
        dir.path(),
        WorkerResponse {
            reply: WorkerReply::Unresolved("No module named 'ghost'".into()),
            manifest: manifest.clone(),
        },
    );
    let runner = runner().with_isolation(shell_worker("cat >/dev/null; cat \"$0\"", &[&reply]));
    let output = runner.run(demo_query("quick")).await;
    assert_eq!(output.manifest, manifest);
    assert_eq!(
        output.outcome.unwrap_err(),
        BuildError::Resolve("No module named 'ghost'".into())
    );
}

#[tokio::test]
async fn crashed_worker_is_a_worker_error() {
    let runner = runner().with_isolation(shell_worker("exit 3", &[]));
    let output = runner.run(demo_query("quick")).await;
    assert!(matches!(output.outcome, Err(BuildError::Worker(_))));
    assert!(output.manifest.is_empty());
}

#[tokio::test]
async fn garbage_from_worker_is_a_protocol_error() {
    let runner = runner().with_isolation(shell_worker(
        "cat >/dev/null; printf 'not a packet at all'",
        &[],
    ));
    let output = runner.run(demo_query("quick")).await;
    assert!(matches!(output.outcome, Err(BuildError::Protocol(_))));
}

#[tokio::test]
async fn hung_worker_times_out_and_frees_the_slot() {
    let runner = runner()
        .with_isolation(shell_worker("exec sleep 30", &[]))
        .with_timeout(Some(Duration::from_millis(200)));
    let output = runner.run(demo_query("quick")).await;
    assert_eq!(
        output.outcome.unwrap_err(),
        BuildError::Timeout(Duration::from_millis(200))
    );

    let next = timeout(Duration::from_secs(5), self::runner().run(demo_query("quick")))
        .await
        .expect("slot released after timeout");
    assert!(next.outcome.is_ok());
}
