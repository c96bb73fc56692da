// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `scenehook-demo-worker`: build worker over a small built-in library.
//!
//! Speaks the framed worker protocol on stdin/stdout; logs go to stderr so
//! they never interleave with packets. Point `Isolation::Subprocess` (or the
//! saved `worker` preference) at this binary to build out of process.

use std::sync::Arc;

use anyhow::Result;
use scenehook_sandbox::worker::serve_stdio;
use scenehook_sandbox::{Callable, SceneLibrary, SceneModule, SerializedScene, TrackerConfig};
use tracing_subscriber::EnvFilter;

fn library() -> SceneLibrary {
    let mut lib = SceneLibrary::new();
    lib.add_package(
        "demo",
        vec![SceneModule::new("shapes")
            .with(
                Callable::scene("square", |cfg, _| {
                    cfg.duration = 2.0;
                    Ok(Box::new(SerializedScene::new(format!("square {}\n", cfg.backend))))
                })
                .doc("A unit square."),
            )
            .with(Callable::scene("broken", |_, _| anyhow::bail!("demo failure")))],
    );
    lib
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    serve_stdio(Arc::new(library()), TrackerConfig::default()).await
}
