// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-session record of assets already synced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::AssetKey;

/// Remembers which asset keys a session already holds and where.
///
/// # Invariants
///
/// - A hit means the exact `(path, size, mtime)` triple was synced before.
/// - `record` of a known key replaces the remote path (last writer wins).
/// - Keys are never evicted implicitly; `clear` drops everything (e.g. when
///   the remote side is known to have been wiped).
#[derive(Debug, Default)]
pub struct SyncCache {
    synced: HashMap<AssetKey, PathBuf>,
    hits: u64,
}

impl SyncCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote path for `key`, counting the lookup as a hit when present.
    pub fn lookup(&mut self, key: &AssetKey) -> Option<&Path> {
        let found = self.synced.get(key).map(PathBuf::as_path);
        if found.is_some() {
            self.hits += 1;
        }
        found
    }

    /// Record that `key` now lives at `remote`.
    pub fn record(&mut self, key: AssetKey, remote: PathBuf) {
        self.synced.insert(key, remote);
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.synced.len()
    }

    /// Returns `true` if nothing was synced yet.
    pub fn is_empty(&self) -> bool {
        self.synced.is_empty()
    }

    /// Number of lookups answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Forget every synced key.
    pub fn clear(&mut self) {
        self.synced.clear();
    }
}
