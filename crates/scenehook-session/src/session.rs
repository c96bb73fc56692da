// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session identity, per-session state and the events the controller emits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Globally unique session id: the index of the backend that reported the
/// session plus the backend's own (local) id.
///
/// Displays as `"<backend>:<local>"`; parsing splits on the first `:`, so
/// local ids may themselves contain colons.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId {
    backend: usize,
    local: String,
}

impl SessionId {
    /// Compose an id.
    pub fn new(backend: usize, local: impl Into<String>) -> Self {
        Self {
            backend,
            local: local.into(),
        }
    }

    /// Index of the owning backend.
    pub fn backend_index(&self) -> usize {
        self.backend
    }

    /// Id as known to the owning backend.
    pub fn local_id(&self) -> &str {
        &self.local
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.local)
    }
}

/// Malformed composite session id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid session id {0:?}: expected <backend>:<local>")]
pub struct SessionIdError(pub String);

impl FromStr for SessionId {
    type Err = SessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, local) = s
            .split_once(':')
            .ok_or_else(|| SessionIdError(s.to_owned()))?;
        let backend = index.parse().map_err(|_| SessionIdError(s.to_owned()))?;
        Ok(Self::new(backend, local))
    }
}

impl Serialize for SessionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a session is in its probe/distribution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing in flight.
    Idle,
    /// Capability probe in flight.
    Probing,
    /// Sandboxed build in flight.
    Building,
    /// Syncing referenced file `index` of `total` (1-based).
    Uploading {
        /// Current file.
        index: usize,
        /// File count.
        total: usize,
    },
    /// Pushing the rewritten scene.
    Sending,
    /// Last cycle failed; the next trigger starts over.
    Error,
}

/// One remote rendering target as tracked by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Composite id.
    pub id: SessionId,
    /// Human-readable description from enumeration.
    pub description: String,
    /// Rendering backend reported by the probe.
    pub backend: String,
    /// Operating system reported by the probe.
    pub system: String,
    /// Whether `process` targets this session.
    pub enabled: bool,
    /// Cycle state.
    pub state: SessionState,
    /// Latest status line (replaced at every transition).
    pub status: String,
}

/// Notifications delivered by the distribution controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A probed session was admitted.
    Added(Session),
    /// A session disappeared or failed its probe.
    Removed(SessionId),
    /// Description, backend, system, state or status changed.
    Changed(Session),
}
