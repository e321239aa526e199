//! Matches published requests with their asynchronous responses.
//!
//! Requests are published fire-and-forget; the response arrives later on a
//! separate channel carrying the request's client token. The registry maps
//! each live token to the handler that should see the outcome, and hands every
//! outcome to exactly one handler: whichever of `resolve`, `cancel` or
//! `expire` removes the entry first wins.

mod error;

pub use error::DuplicateToken;

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

/// Opaque identifier linking a request to its response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// Generates a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for CorrelationToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl Borrow<str> for CorrelationToken {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The single result delivered for a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<A, R> {
    /// The service accepted the request.
    Accepted(A),
    /// The service rejected the request.
    Rejected(R),
    /// No response arrived before the request's deadline.
    Timeout,
}

/// Receives the outcome of one request.
pub trait OutcomeHandler<A, R>: Send + Sync + 'static {
    /// Consumes the handler with the outcome.
    fn handle(self: Box<Self>, outcome: Outcome<A, R>);
}

impl<A, R, F> OutcomeHandler<A, R> for F
where
    F: FnOnce(Outcome<A, R>) + Send + Sync + 'static,
{
    fn handle(self: Box<Self>, outcome: Outcome<A, R>) {
        (*self)(outcome);
    }
}

/// A handler paired with a receiver, for callers that want to await the
/// outcome.
pub fn completion<A, R>() -> (impl OutcomeHandler<A, R>, oneshot::Receiver<Outcome<A, R>>)
where
    A: Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = oneshot::channel();

    let handler = move |outcome: Outcome<A, R>| {
        // The caller may have stopped waiting.
        let _ = tx.send(outcome);
    };

    (handler, rx)
}

/// Identifies one registration, so cancelling a stale handle cannot remove a
/// later registration that reused the token.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationHandle {
    token: CorrelationToken,
    registration: u64,
}

impl RegistrationHandle {
    /// The registered token.
    #[must_use]
    pub const fn token(&self) -> &CorrelationToken {
        &self.token
    }
}

struct PendingRequest<A, R> {
    registration: u64,
    issued_at: Instant,
    timeout: Duration,
    handler: Box<dyn OutcomeHandler<A, R>>,
}

impl<A, R> PendingRequest<A, R> {
    /// A deadline beyond what `Instant` can represent never expires.
    fn is_expired(&self, now: Instant) -> bool {
        self.issued_at
            .checked_add(self.timeout)
            .is_some_and(|deadline| deadline <= now)
    }
}

/// Thread-safe map from live tokens to pending requests.
pub struct CorrelationRegistry<A, R> {
    pending: DashMap<CorrelationToken, PendingRequest<A, R>>,
    next_registration: AtomicU64,
    default_timeout: Duration,
}

impl<A, R> fmt::Debug for CorrelationRegistry<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.pending.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl<A, R> CorrelationRegistry<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Creates an empty registry.
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            next_registration: AtomicU64::new(0),
            default_timeout,
        }
    }

    /// Timeout applied by `register`.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Registers a handler under `token` with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateToken` if the token is already pending.
    pub fn register(
        &self,
        token: CorrelationToken,
        handler: impl OutcomeHandler<A, R>,
    ) -> Result<RegistrationHandle, DuplicateToken> {
        self.register_with_timeout(token, self.default_timeout, handler)
    }

    /// Registers a handler under `token` with an explicit timeout.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateToken` if the token is already pending.
    pub fn register_with_timeout(
        &self,
        token: CorrelationToken,
        timeout: Duration,
        handler: impl OutcomeHandler<A, R>,
    ) -> Result<RegistrationHandle, DuplicateToken> {
        match self.pending.entry(token) {
            Entry::Occupied(entry) => Err(DuplicateToken(entry.key().clone())),
            Entry::Vacant(entry) => {
                let registration = self.next_registration.fetch_add(1, Ordering::Relaxed);
                let handle = RegistrationHandle {
                    token: entry.key().clone(),
                    registration,
                };

                entry.insert(PendingRequest {
                    registration,
                    issued_at: Instant::now(),
                    timeout,
                    handler: Box::new(handler),
                });

                trace!(token = %handle.token, ?timeout, "registered request");
                Ok(handle)
            }
        }
    }

    /// Delivers `outcome` to the handler registered under `token`.
    ///
    /// Returns `false` if no request is pending for the token, which happens
    /// for duplicate deliveries, late responses and responses to other
    /// clients.
    pub fn resolve(&self, token: &str, outcome: Outcome<A, R>) -> bool {
        // The handler runs after the map guard is released.
        let Some((token, pending)) = self.pending.remove(token) else {
            debug!(token, "dropping response for unknown token");
            return false;
        };

        trace!(%token, "resolving request");
        pending.handler.handle(outcome);
        true
    }

    /// Removes a pending request without invoking its handler.
    pub fn cancel(&self, handle: &RegistrationHandle) -> bool {
        let removed = self
            .pending
            .remove_if(&handle.token, |_, pending| {
                pending.registration == handle.registration
            })
            .is_some();

        if removed {
            debug!(token = %handle.token, "cancelled request");
        }

        removed
    }

    /// Times out every request whose deadline is at or before `now`.
    ///
    /// Returns the number of handlers that received `Outcome::Timeout`.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<CorrelationToken> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut count = 0;
        for token in expired {
            // Re-check under the shard lock: it may have been resolved or
            // re-registered since the scan.
            if let Some((token, pending)) = self
                .pending
                .remove_if(&token, |_, pending| pending.is_expired(now))
            {
                debug!(%token, "request timed out");
                pending.handler.handle(Outcome::Timeout);
                count += 1;
            }
        }

        count
    }

    /// Whether a request is pending under `token`.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        self.pending.contains_key(token)
    }

    /// Number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no requests are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
