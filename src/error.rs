//! Crate-level error types for query synchronization and token fetching.

/// Error surfaced through a query handle's state.
///
/// Stored inside [`QueryState`](crate::QueryState), so it must be `Clone`.
/// Configuration and connection errors are terminal for the handle that
/// produced them: no automatic retry is attempted, and the consumer must
/// call `refresh()` or change arguments to try again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// No backend deployment URL is configured.
    ///
    /// Raised before any network access is attempted. The handle enters
    /// `error` status immediately.
    #[error("backend deployment URL is not configured")]
    Configuration,

    /// Live subscription features were requested in a context with no
    /// backend connection available.
    ///
    /// Subsequent `refresh()` calls on the affected handle are no-ops.
    #[error("live backend connection is not available")]
    ConnectionUnavailable,

    /// The backend pushed an error signal on a live channel, or a one-shot
    /// fetch failed.
    ///
    /// Recoverable: a `refresh()` call or an argument change opens a fresh
    /// channel. The handle retains its last known data alongside this
    /// error (see [`QueryState`](crate::QueryState)).
    #[error("subscription failed: {0}")]
    Subscription(String),
}

/// Error signal pushed by the backend on a live subscription channel.
///
/// Carries only a message: the backend's own error taxonomy is opaque to
/// this crate. Converted to [`QueryError::Subscription`] before being
/// stored in handle state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SubscriptionError {
    /// Human-readable description from the backend.
    pub message: String,
}

impl SubscriptionError {
    /// Build an error signal from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<SubscriptionError> for QueryError {
    fn from(err: SubscriptionError) -> Self {
        QueryError::Subscription(err.message)
    }
}

/// Error from the one-shot HTTP fetch path.
///
/// Converted to [`QueryError::Subscription`] at the handle boundary; the
/// structured variants exist so the fetch layer can be tested and logged
/// precisely.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport-level failure (connect, timeout, TLS, non-2xx status).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered but rejected the query.
    #[error("backend rejected query: {0}")]
    Rejected(String),

    /// The response body did not match the expected envelope.
    #[error("malformed response body: {0}")]
    Decode(String),
}

impl From<FetchError> for QueryError {
    fn from(err: FetchError) -> Self {
        QueryError::Subscription(err.to_string())
    }
}

/// Error from a forced token refresh.
///
/// Never escapes the token cache: [`TokenCache`](crate::TokenCache)
/// absorbs it, logs a warning, and resolves to `None` so the backend
/// client treats "no credential available" uniformly with "not logged in".
#[derive(Debug, thiserror::Error)]
pub enum TokenFetchError {
    /// Transport-level failure reaching the token endpoint.
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The token endpoint answered with a non-success status code.
    #[error("token endpoint returned status {0}")]
    Status(u16),
}
