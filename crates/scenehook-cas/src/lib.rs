// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content addressing for assets pushed to remote sessions.
//!
//! An asset is identified by the triple `(local path, size, mtime)`, hashed
//! with BLAKE3 into an [`AssetKey`]. The remote file name is the key in
//! lowercase hex followed by the local extension, so re-syncing an unchanged
//! file always targets the same remote name and can be skipped.
//!
//! # Hash Domain Policy
//!
//! The key is identity-based, not content-based: two copies of the same
//! bytes at different paths get different keys, and touching a file (new
//! mtime) gets a new key even if its bytes did not change.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod cache;
pub use cache::SyncCache;

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

const KEY_DOMAIN: &[u8] = b"scenehook:asset:v1\0";

/// A 32-byte BLAKE3 asset key.
///
/// Thin newtype over `[u8; 32]`; the `Display` impl renders lowercase hex,
/// which is also the remote file stem.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct AssetKey(pub [u8; 32]);

impl AssetKey {
    /// Derive the key for `path` with the given size and modification time
    /// (offset from the Unix epoch).
    pub fn derive(path: &Path, size: u64, mtime: Duration) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(KEY_DOMAIN);
        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update(&[0]);
        hasher.update(&size.to_be_bytes());
        hasher.update(&mtime.as_nanos().to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Stat `path` and derive its key.
    ///
    /// Modification times before the Unix epoch (or unsupported by the
    /// platform) hash as zero.
    pub fn for_file(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or(Duration::ZERO);
        Ok(Self::derive(path, meta.len(), mtime))
    }

    /// View the key as a byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Remote file name for an asset at `local`: hex key plus the local
    /// extension (if any).
    pub fn remote_name(&self, local: &Path) -> PathBuf {
        let mut name = self.to_string();
        if let Some(ext) = local.extension() {
            name.push('.');
            name.push_str(&ext.to_string_lossy());
        }
        PathBuf::from(name)
    }
}

impl std::fmt::Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
