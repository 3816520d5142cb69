//! Remote sessions.
//!
//! A [`SessionProvider`] performs the login flow and hands back a token.
//! The engine caches the token in a [`Session`] and asks the provider again
//! whenever the remote answers `Unauthorized`.

use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteError;
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// An opaque bearer token for the remote store.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wraps a token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token. Do not log it.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

/// Performs the remote login flow.
pub trait SessionProvider: Send + Sync + 'static {
    /// Obtains a fresh token.
    fn login(&self) -> impl Future<Output = Result<SessionToken, RemoteError>> + Send;
}

/// A provider that always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticSession {
    token: SessionToken,
}

impl StaticSession {
    /// Creates a provider for `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SessionToken::new(token),
        }
    }
}

impl SessionProvider for StaticSession {
    async fn login(&self) -> Result<SessionToken, RemoteError> {
        Ok(self.token.clone())
    }
}

/// A cached token plus the provider that refreshes it.
pub struct Session<P> {
    provider: P,
    token: RwLock<Option<SessionToken>>,
    logins: AtomicU64,
}

impl<P: SessionProvider> Session<P> {
    /// Creates a session with no token yet.
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            token: RwLock::new(None),
            logins: AtomicU64::new(0),
        }
    }

    /// Returns the cached token, logging in first if there is none.
    pub async fn token(&self) -> SyncResult<SessionToken> {
        let cached = self.token.read().clone();
        if let Some(token) = cached {
            return Ok(token);
        }
        let token = self
            .provider
            .login()
            .await
            .map_err(|e| SyncError::Auth(e.to_string()))?;
        let count = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        info!(logins = count, "remote session established");
        *self.token.write() = Some(token.clone());
        Ok(token)
    }

    /// Drops the cached token so the next call logs in again.
    pub fn invalidate(&self) {
        debug!("remote session invalidated");
        *self.token.write() = None;
    }

    /// Number of successful logins.
    pub fn logins(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }
}

impl<P> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("has_token", &self.token.read().is_some())
            .field("logins", &self.logins.load(Ordering::SeqCst))
            .finish()
    }
}
