//! Hierarchical keys and key-element escaping.
//!
//! Keys are sequences of path segments, e.g. `["trips", <trip id>,
//! "destinations"]`. Segments that carry user-supplied text (usernames,
//! device names) must go through [`escape_key_element`] so that they never
//! contain the `.` separator used when keys are flattened, the `/` reserved
//! by the underlying database, or the `_` used for mixed nodes in snapshots.

use crate::error::SyncError;

/// A path into the replicated tree.
pub type Key = Vec<String>;

/// Separator used when a key is rendered as a single string.
pub const SEPARATOR: char = '.';

/// Snapshot key holding the value of a node that also has children.
pub const VALUE_KEY: &str = "_";

const ESCAPE: char = '_';

/// Builds a key from anything string-like.
pub fn key<S: AsRef<str>>(segments: &[S]) -> Key {
    segments.iter().map(|s| s.as_ref().to_string()).collect()
}

/// Renders a key as `a.b.c`.
pub fn join_key(key: &[String]) -> String {
    key.join(&SEPARATOR.to_string())
}

/// Returns true if the segment can be used as a tree path element.
///
/// Empty segments and the reserved snapshot key are rejected.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != VALUE_KEY
}

/// Rejects keys with any segment failing [`is_valid_segment`].
pub fn validate_key(key: &[String]) -> Result<(), SyncError> {
    if key.iter().all(|segment| is_valid_segment(segment)) {
        Ok(())
    } else {
        Err(SyncError::InvalidKey(join_key(key)))
    }
}

/// Escapes a user-supplied key element.
pub fn escape_key_element(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '_' => out.push_str("__"),
            '.' => out.push_str("_d"),
            '@' => out.push_str("_a"),
            '/' => out.push_str("_s"),
            other => out.push(other),
        }
    }
    out
}

/// Reverses [`escape_key_element`].
///
/// Unknown escape sequences and a trailing lone `_` are kept verbatim.
pub fn unescape_key_element(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('_') => out.push('_'),
            Some('d') => out.push('.'),
            Some('a') => out.push('@'),
            Some('s') => out.push('/'),
            Some(other) => {
                out.push(ESCAPE);
                out.push(other);
            }
            None => out.push(ESCAPE),
        }
    }
    out
}
