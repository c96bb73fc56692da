// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Isolated scene construction with dependency tracking.
//!
//! [`SandboxRunner`] answers [`SceneQuery`](scenehook_proto::SceneQuery)s
//! against a [`SceneLibrary`], one build at a time process-wide, either on
//! the blocking pool or in a worker process speaking the framed protocol of
//! [`worker`]. Each answer carries the [`Manifest`](scenehook_proto::Manifest)
//! of files and modules the build consumed, which [`ReloadManager`] turns
//! into file watches for hot reload.

pub mod hud;
pub mod library;
pub mod reload;
pub mod runner;
pub mod tracker;
pub mod worker;

pub use hud::HudOverlay;
pub use library::{Callable, Scene, SceneCfg, SceneLibrary, SceneModule, SerializedScene};
pub use reload::{ReloadError, ReloadEvent, ReloadManager};
pub use runner::{
    BuildError, BuildOutput, Isolation, QueryReply, SandboxRunner, SceneResult, WorkerCommand,
};
pub use tracker::{ManifestTracker, ModuleInventory, ResourceTracker, TrackerConfig};
