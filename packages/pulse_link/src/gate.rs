//! Environment gate: decide once, at channel construction, whether the
//! deployment target supports long-lived connections at all.
//!
//! Serverless hosting fronts (request-scoped function runtimes) terminate
//! idle connections and make socket/event-stream transports an endless
//! connect-fail loop. Rather than discovering that at runtime, channels
//! pointed at a known-serverless host are disabled outright and the
//! application degrades to polling.

/// Hosting suffixes known not to support long-lived connections.
const SERVERLESS_SUFFIXES: &[&str] = &[
    "vercel.app",
    "netlify.app",
    "amplifyapp.com",
    "pages.dev",
];

/// A pure predicate over an endpoint URL. Evaluated exactly once per channel
/// into an immutable `enabled` flag — never re-derived per method call.
#[derive(Debug, Clone)]
pub struct EnvironmentGate {
    blocked_suffixes: Vec<String>,
}

impl Default for EnvironmentGate {
    fn default() -> Self {
        Self {
            blocked_suffixes: SERVERLESS_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EnvironmentGate {
    /// The default gate plus extra blocked host suffixes.
    pub fn with_blocked(extra: impl IntoIterator<Item = String>) -> Self {
        let mut gate = Self::default();
        gate.blocked_suffixes.extend(extra);
        gate
    }

    /// A gate that never blocks — for loopback/dev targets and tests.
    pub fn permissive() -> Self {
        Self {
            blocked_suffixes: Vec::new(),
        }
    }

    /// True when `endpoint` may host a long-lived connection: a ws/wss or
    /// http/https URL whose host does not match a blocked suffix.
    /// Unparseable URLs are conservatively rejected.
    pub fn allows_push(&self, endpoint: &str) -> bool {
        let Some((scheme, host)) = split_url(endpoint) else {
            return false;
        };
        if !matches!(scheme, "ws" | "wss" | "http" | "https") {
            return false;
        }
        !self
            .blocked_suffixes
            .iter()
            .any(|suffix| host == suffix || host.ends_with(&format!(".{suffix}")))
    }
}

/// Extract `(scheme, host)` from a URL, ignoring port, path, query and
/// userinfo. Returns `None` when there is no scheme or the host is empty.
fn split_url(url: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = match authority.rsplit_once('@') {
        Some((_, host)) => host,
        None => authority,
    };
    let host = authority.split(':').next().unwrap_or(authority);
    if host.is_empty() {
        return None;
    }
    Some((scheme, host))
}
