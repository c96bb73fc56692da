// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for SceneHook tools (config, hook prefs).
//! Keeps the CLI and any UI adapters thin and framework-agnostic.

pub mod config;
pub mod prefs;
