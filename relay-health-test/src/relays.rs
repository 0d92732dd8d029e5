//! Relay address fixtures.
//!
//! These are plain strings, so they can be fed through the same
//! canonicalization path as addresses coming from the network.

/// Raw relay addresses paired with the canonical form they must normalize to.
///
/// `None` means the raw address must be rejected.
pub const RAW_RELAY_URL_VECTORS: &[(&str, Option<&str>)] = &[
    ("wss://a.example", Some("wss://a.example")),
    ("wss://a.example/", Some("wss://a.example")),
    (" wss://a.example/ ", Some("wss://a.example")),
    ("\twss://a.example\n", Some("wss://a.example")),
    ("wss://a.example/path/", Some("wss://a.example/path")),
    ("wss://a.example /", Some("wss://a.example")),
    ("wss://a.example//", None),
    ("", None),
    ("   ", None),
    ("/", None),
    ("wss://", None),
];

/// Returns a distinct, already-canonical relay address for `index`.
pub fn relay_url(index: usize) -> String {
    format!("wss://relay-{index}.example")
}

/// Returns `count` distinct, already-canonical relay addresses.
pub fn relay_urls(count: usize) -> Vec<String> {
    (0..count).map(relay_url).collect()
}
