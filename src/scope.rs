//! Per-socket scope tags and channel-id rewriting between the socket-local
//! and transport-global naming domains.

use std::hash::{Hash, Hasher};

/// Mints the monotonically increasing scope tag handed to each newly
/// accepted socket, e.g. `"7:"`.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    next_scope_id: u64,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self { next_scope_id: 1 }
    }

    pub fn next_scope(&mut self) -> String {
        let id = self.next_scope_id;
        self.next_scope_id += 1;
        format!("{id}:")
    }
}

/// Prefixes a socket-local channel with that socket's scope, producing the
/// transport-global form.
pub fn add_scope(scope: &str, local: &str) -> String {
    format!("{scope}{local}")
}

/// Strips the scope prefix (up to and including the first `:`) from a
/// transport-global channel, returning the socket-local form. Returns
/// `None` if there is no `:` at all.
pub fn strip_scope(global: &str) -> Option<&str> {
    global.split_once(':').map(|(_, local)| local)
}

/// A channel string used as a hash-map key that compares and hashes only on
/// the bytes up to (not including) the first `:` — the socket's scope
/// prefix. An empty prefix never equals any other prefix, including another
/// empty one, per the spec's scope-equality invariant.
#[derive(Debug, Clone)]
pub struct ScopeKey(pub String);

impl ScopeKey {
    fn prefix(&self) -> &str {
        match self.0.find(':') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }
}

impl PartialEq for ScopeKey {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (self.prefix(), other.prefix());
        !a.is_empty() && a == b
    }
}

impl Eq for ScopeKey {}

impl Hash for ScopeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.prefix().hash(state);
    }
}
