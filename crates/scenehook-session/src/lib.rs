// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Distribution of built scenes to remote rendering sessions.
//!
//! Backends ([`SessionBackend`], usually a [`ScriptBackend`] hook program)
//! are aggregated by a [`SessionRegistry`] under composite
//! [`SessionId`]s. The [`DistributionController`] probes sessions and, per
//! enabled session, builds the scene with that session's overrides, syncs
//! referenced assets, rewrites their paths and pushes the result.

pub mod adapter;
pub mod controller;
pub mod escape;
pub mod registry;
pub mod session;
pub mod setup;

pub use adapter::{
    AdapterError, HookCommand, PushMetadata, ScriptBackend, SessionBackend, SessionInfo,
};
pub use controller::{ControllerConfig, ControllerError, DistributionController};
pub use escape::{escape_path, rewrite_references, unescape_path, EscapeError, UploadMapping};
pub use registry::{SessionRegistry, SessionSummary};
pub use session::{Session, SessionEvent, SessionId, SessionIdError, SessionState};
