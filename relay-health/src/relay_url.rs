//! Canonical relay identities.

use std::{fmt, ops::Deref};


/// The canonical identity of a relay.
///
/// Relay addresses that differ only by surrounding whitespace or a single
/// trailing `/` are the same relay, so every comparison, map key, and
/// persisted record uses this type instead of the raw address.
///
/// Can only be created by [`canonical_relay_url`], so a `RelayUrl` never has
/// surrounding whitespace or a trailing `/`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RelayUrl(String);

/// Normalizes `raw` into a [`RelayUrl`].
///
/// Trims surrounding whitespace and strips exactly one trailing `/`.
///
/// Returns `None` if the result is empty, or if it still ends with `/`
/// (for example `wss://` or `wss://relay.example//`). Rejecting repeated
/// separators keeps canonicalization idempotent.
///
/// Does not check that the address is reachable or well-formed: that is the
/// network collaborator's job.
pub fn canonical_relay_url(raw: &str) -> Option<RelayUrl> {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_suffix('/').unwrap_or(trimmed).trim_end();

    if stripped.is_empty() || stripped.ends_with('/') {
        return None;
    }

    Some(RelayUrl(stripped.to_string()))
}

impl RelayUrl {
    /// Returns the canonical address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for RelayUrl {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0
    }
}
