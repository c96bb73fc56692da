// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wiring from persisted [`HooksPrefs`] to runtime components.

use std::sync::Arc;
use std::time::Duration;

use scenehook_app_core::prefs::{CommandPrefs, HooksPrefs};
use scenehook_sandbox::{Isolation, SandboxRunner, SceneLibrary, TrackerConfig, WorkerCommand};
use tracing::warn;

use crate::adapter::{AdapterError, HookCommand, ScriptBackend};
use crate::controller::ControllerConfig;
use crate::session::SessionId;

impl From<&CommandPrefs> for HookCommand {
    fn from(prefs: &CommandPrefs) -> Self {
        Self {
            program: prefs.program.clone(),
            args: prefs.args.clone(),
        }
    }
}

/// One [`ScriptBackend`] per saved hook, in order, with the saved timeout.
pub fn backends(prefs: &HooksPrefs) -> Result<Vec<ScriptBackend>, AdapterError> {
    prefs
        .hooks
        .iter()
        .map(|hook| {
            ScriptBackend::new(hook.into())
                .map(|backend| backend.with_timeout(Duration::from_secs(prefs.hook_timeout_secs)))
        })
        .collect()
}

/// Runner over `library` honoring the saved worker, timeout and prefixes.
pub fn runner(library: Arc<SceneLibrary>, prefs: &HooksPrefs) -> SandboxRunner {
    let isolation = prefs.worker.as_ref().map_or(Isolation::InProcess, |worker| {
        Isolation::Subprocess(WorkerCommand {
            program: worker.program.clone(),
            args: worker.args.clone(),
        })
    });
    SandboxRunner::new(library)
        .with_isolation(isolation)
        .with_timeout(Some(Duration::from_secs(prefs.build_timeout_secs)))
        .with_tracker_config(TrackerConfig {
            system_prefixes: prefs.system_prefixes.clone(),
            ..TrackerConfig::default()
        })
}

impl From<&HooksPrefs> for ControllerConfig {
    fn from(prefs: &HooksPrefs) -> Self {
        let enabled = prefs
            .sessions_enabled
            .iter()
            .filter_map(|(id, enabled)| match id.parse::<SessionId>() {
                Ok(id) => Some((id, *enabled)),
                Err(err) => {
                    warn!(%err, "ignoring saved toggle");
                    None
                }
            })
            .collect();
        Self {
            probe_retries: prefs.probe_retries,
            probe_backoff: Duration::from_millis(prefs.probe_backoff_ms),
            enabled,
        }
    }
}
