// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Percent escaping of file paths as they appear in serialized scenes, and
//! the local → remote reference rewrite built on it.
//!
//! Bytes in `!`..=`~` other than `%` are kept; every other byte (space,
//! control, non-ASCII, `%` itself) becomes `%xx` in lowercase hex. Escaped
//! paths contain no whitespace, so a reference in serialized text is a whole
//! token: it starts after a delimiter (or at the start of the text) and ends
//! before one (or at the end).

use std::cmp::Reverse;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Escaped text that does not decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscapeError {
    /// `%` not followed by two hex digits.
    #[error("invalid escape at byte {0}")]
    InvalidEscape(usize),
    /// Decoded bytes are not valid UTF-8.
    #[error("unescaped path is not UTF-8")]
    NotUtf8,
}

/// One synced asset: where it lives here and on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMapping {
    /// Path referenced by the built scene.
    pub local: PathBuf,
    /// Path returned by the backend.
    pub remote: PathBuf,
}

/// Escape `path` for embedding in serialized scene text.
pub fn escape_path(path: &Path) -> String {
    escape_bytes(path.to_string_lossy().as_bytes())
}

fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        if (b'!'..=b'~').contains(&byte) && byte != b'%' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02x}");
        }
    }
    out
}

/// Inverse of [`escape_path`].
pub fn unescape_path(escaped: &str) -> Result<PathBuf, EscapeError> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = escaped
                .get(i + 1..i + 3)
                .filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or(EscapeError::InvalidEscape(i))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map(PathBuf::from)
        .map_err(|_| EscapeError::NotUtf8)
}

/// Replace every escaped local path of `mappings` in `serialized` by the
/// escaped remote path.
///
/// One left-to-right pass: replaced text is never rescanned, a local path
/// only matches as a whole token, and where several locals match at the
/// same place the longest wins. For duplicate locals the first mapping wins.
pub fn rewrite_references(serialized: &str, mappings: &[UploadMapping]) -> String {
    let mut table: Vec<(String, String)> = mappings
        .iter()
        .map(|m| (escape_path(&m.local), escape_path(&m.remote)))
        .filter(|(local, _)| !local.is_empty())
        .collect();
    table.sort_by_key(|(local, _)| Reverse(local.len()));

    let mut out = String::with_capacity(serialized.len());
    let mut rest = serialized;
    let mut at_boundary = true;
    while let Some(c) = rest.chars().next() {
        if at_boundary {
            let hit = table.iter().find(|(local, _)| {
                rest.strip_prefix(local.as_str())
                    .is_some_and(|after| after.chars().next().is_none_or(is_delimiter))
            });
            if let Some((local, remote)) = hit {
                out.push_str(remote);
                rest = &rest[local.len()..];
                at_boundary = false;
                continue;
            }
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
        at_boundary = is_delimiter(c);
    }
    out
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '"' | '\'' | '=' | ',' | ';' | '<' | '>')
}
