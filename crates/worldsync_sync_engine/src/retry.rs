//! Bounded, timed retries of remote calls.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteError, RemoteResult};
use crate::session::{Session, SessionProvider, SessionToken};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs remote calls under the retry policy.
///
/// Every attempt is bounded by the attempt timeout; a timeout counts as a
/// transient failure. `Unauthorized` drops the cached session so the next
/// attempt logs in again.
pub struct Retrier<P> {
    session: Arc<Session<P>>,
    retry: RetryConfig,
    attempt_timeout: Duration,
}

impl<P> Clone for Retrier<P> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            retry: self.retry.clone(),
            attempt_timeout: self.attempt_timeout,
        }
    }
}

impl<P: SessionProvider> Retrier<P> {
    /// Creates a retrier.
    pub fn new(session: Arc<Session<P>>, retry: RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            session,
            retry,
            attempt_timeout,
        }
    }

    /// The shared session.
    pub fn session(&self) -> &Arc<Session<P>> {
        &self.session
    }

    /// Calls `op` until it succeeds, fails permanently or runs out of
    /// attempts.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Auth`] if the session cannot be (re-)established or
    ///   the last attempt was still unauthorized
    /// - [`SyncError::TransferFailed`] once retries are exhausted
    /// - [`SyncError::Remote`] for non-retryable remote errors
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut(SessionToken) -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay_for_attempt(attempt);
                debug!(what, attempt, ?delay, "retrying");
                tokio::time::sleep(delay).await;
            }

            let token = self.session.token().await?;
            match tokio::time::timeout(self.attempt_timeout, op(token)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(RemoteError::Unauthorized)) => {
                    warn!(what, attempt, "remote rejected session");
                    self.session.invalidate();
                    if attempt + 1 == max_attempts {
                        return Err(SyncError::Auth(format!(
                            "remote rejected the session for {what}"
                        )));
                    }
                    last_error = RemoteError::Unauthorized.to_string();
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(what, attempt, error = %e, "transient remote error");
                    last_error = e.to_string();
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    warn!(what, attempt, timeout = ?self.attempt_timeout, "remote call timed out");
                    last_error = format!("timed out after {:?}", self.attempt_timeout);
                }
            }
        }

        Err(SyncError::transfer_failed(what, max_attempts, last_error))
    }
}
