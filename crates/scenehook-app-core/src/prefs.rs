// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persisted preferences for the hooks pipeline (hook programs, timeouts,
//! probe policy, remembered session toggles).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Config key under which [`HooksPrefs`] is stored.
pub const HOOKS_PREFS_KEY: &str = "hooks";

/// A program plus leading arguments (e.g. `sh ./hooks/desktop.sh`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPrefs {
    /// Executable to spawn.
    pub program: PathBuf,
    /// Arguments placed before the hook subcommand.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Saved preferences for the sandbox + hooks pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksPrefs {
    /// One entry per session backend, in backend-index order.
    pub hooks: Vec<CommandPrefs>,
    /// Out-of-process build worker; `None` builds in-process.
    pub worker: Option<CommandPrefs>,
    /// Upper bound on one sandboxed build (seconds).
    pub build_timeout_secs: u64,
    /// Upper bound on one hook invocation (seconds).
    pub hook_timeout_secs: u64,
    /// Extra session-info probe attempts before a session is evicted.
    pub probe_retries: u32,
    /// Delay between probe attempts (milliseconds).
    pub probe_backoff_ms: u64,
    /// Path prefixes never reported in a build manifest.
    pub system_prefixes: Vec<PathBuf>,
    /// Remembered enable toggles keyed by composite session id.
    pub sessions_enabled: BTreeMap<String, bool>,
}

impl Default for HooksPrefs {
    fn default() -> Self {
        Self {
            hooks: Vec::new(),
            worker: None,
            build_timeout_secs: 60,
            hook_timeout_secs: 30,
            probe_retries: 0,
            probe_backoff_ms: 500,
            system_prefixes: vec![PathBuf::from("/usr/lib"), PathBuf::from("/usr/share")],
            sessions_enabled: BTreeMap::new(),
        }
    }
}
