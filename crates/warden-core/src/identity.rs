//! Peer identity.
//!
//! A [`PeerIdentity`] names the authenticated principal bound to a
//! connection, normally produced by a completed security context. When
//! the daemon runs behind an SSH forced-command front-end the same
//! identity arrives through environment variables instead; that
//! alternate input is treated as equivalent to a completed handshake.

use std::env;

/// Environment variable carrying the authenticated principal name.
pub const ENV_PRINCIPAL: &str = "WARDEN_USER";

/// Environment variable carrying originating-connection metadata.
pub const ENV_CLIENT: &str = "WARDEN_CLIENT";

/// Authenticated identity of a connection peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Authenticated principal name.
    pub principal: String,

    /// Originating-connection description, when known.
    pub client: Option<String>,
}

impl PeerIdentity {
    /// Creates an identity with no connection metadata.
    #[must_use]
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            client: None,
        }
    }

    /// Attaches originating-connection metadata.
    #[must_use]
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    /// Resolves an identity from the process environment.
    ///
    /// Returns `None` unless [`ENV_PRINCIPAL`] is set to a non-empty
    /// value. Used when an external front-end (an SSH forced command)
    /// has already authenticated the peer and passes the result down via
    /// the environment.
    #[must_use]
    pub fn from_environment() -> Option<Self> {
        let principal = env::var(ENV_PRINCIPAL).ok()?;
        if principal.is_empty() {
            return None;
        }
        let client = env::var(ENV_CLIENT).ok().filter(|v| !v.is_empty());
        Some(Self { principal, client })
    }
}
