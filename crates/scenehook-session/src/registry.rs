// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! N session backends behind one view with globally unique session ids.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapter::{AdapterError, PushMetadata, SessionBackend, SessionInfo};
use crate::session::SessionId;

/// Enumerated and probed view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Description from enumeration.
    pub description: String,
    /// Reported rendering backend.
    pub backend: String,
    /// Reported operating system.
    pub system: String,
}

/// Backends in index order. The index of a backend is the prefix of every
/// session id it reports.
#[derive(Debug)]
pub struct SessionRegistry<B> {
    backends: Vec<B>,
}

impl<B: SessionBackend> SessionRegistry<B> {
    /// Aggregate `backends`.
    pub fn new(backends: Vec<B>) -> Self {
        Self { backends }
    }

    /// Registered backends.
    pub fn backends(&self) -> &[B] {
        &self.backends
    }

    /// Enumerate every backend. A backend that fails to enumerate
    /// contributes no sessions.
    pub async fn list_sessions(&self) -> BTreeMap<SessionId, String> {
        let mut sessions = BTreeMap::new();
        for (index, backend) in self.backends.iter().enumerate() {
            match backend.enumerate_sessions().await {
                Ok(listed) => sessions.extend(
                    listed
                        .into_iter()
                        .map(|(local, description)| (SessionId::new(index, local), description)),
                ),
                Err(err) => warn!(backend = index, %err, "could not enumerate sessions"),
            }
        }
        sessions
    }

    /// Enumerate and probe every session. Sessions whose probe fails are
    /// left out.
    pub async fn get_sessions(&self) -> BTreeMap<SessionId, SessionSummary> {
        let mut sessions = BTreeMap::new();
        for (id, description) in self.list_sessions().await {
            match self.get_session_info(&id).await {
                Ok(info) => {
                    sessions.insert(
                        id,
                        SessionSummary {
                            description,
                            backend: info.backend().to_owned(),
                            system: info.system().to_owned(),
                        },
                    );
                }
                Err(err) => warn!(session = %id, %err, "could not get session information"),
            }
        }
        sessions
    }

    /// Probe one session.
    ///
    /// # Panics
    ///
    /// When the id names no registered backend.
    pub async fn get_session_info(&self, id: &SessionId) -> Result<SessionInfo, AdapterError> {
        self.backend(id).describe(id.local_id()).await
    }

    /// Sync one file to a session; returns the remote path.
    ///
    /// # Panics
    ///
    /// When the id names no registered backend.
    pub async fn sync_file(&self, id: &SessionId, path: &Path) -> Result<PathBuf, AdapterError> {
        self.backend(id).sync_asset(id.local_id(), path).await
    }

    /// Push a serialized scene file to a session.
    ///
    /// # Panics
    ///
    /// When the id names no registered backend.
    pub async fn push_scene(
        &self,
        id: &SessionId,
        scene_file: &Path,
        meta: &PushMetadata,
    ) -> Result<(), AdapterError> {
        self.backend(id)
            .push_scene(id.local_id(), scene_file, meta)
            .await
    }

    fn backend(&self, id: &SessionId) -> &B {
        &self.backends[id.backend_index()]
    }
}
