//! Backend client abstraction and subscription guards.
//!
//! The live backend is an external collaborator; this crate only depends
//! on the interface below. A production implementation wraps the vendor
//! SDK's websocket client; tests use an in-memory fake.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::descriptor::QueryDescriptor;
use crate::error::SubscriptionError;

/// Callback invoked for each data push on a live channel.
pub type DataCallback = Box<dyn Fn(Value) + Send + Sync>;

/// Callback invoked for each error signal on a live channel.
pub type ErrorCallback = Box<dyn Fn(SubscriptionError) + Send + Sync>;

/// Supplies bearer tokens to the backend client for outgoing calls.
///
/// The client passes `force_refresh = true` when it detects that the
/// previously supplied token was rejected. Implementations must never
/// raise: "no credential available" is expressed as `None`.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a token, or `None` if no credential is available.
    async fn token(&self, force_refresh: bool) -> Option<String>;
}

/// Abstract client for the reactive backend.
///
/// One-shot calls (`query`, `mutation`, `action`) resolve to the function's
/// return value; `on_update` opens a persistent push channel for a query
/// and returns the guard that closes it.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Evaluate a query once and return its current result.
    async fn query(&self, descriptor: &QueryDescriptor) -> Result<Value, SubscriptionError>;

    /// Run a mutation by name.
    async fn mutation(&self, name: &str, args: Value) -> Result<Value, SubscriptionError>;

    /// Run an action by name.
    async fn action(&self, name: &str, args: Value) -> Result<Value, SubscriptionError>;

    /// Open a live push channel for a query.
    ///
    /// `on_data` fires for every new result in channel order; `on_error`
    /// fires when the backend signals a failure for this query. The channel
    /// stays open until the returned guard unsubscribes.
    fn on_update(
        &self,
        descriptor: &QueryDescriptor,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> SubscriptionGuard;

    /// Install the token provider used to authenticate outgoing calls.
    fn set_auth_token_provider(&self, provider: Arc<dyn TokenProvider>);

    /// Cheap read of the client's own cached credential, if any.
    fn cached_auth(&self) -> Option<String>;
}

/// Owns the unsubscribe capability for one live channel.
///
/// The capability fires at most once: explicitly via
/// [`unsubscribe`](SubscriptionGuard::unsubscribe), or on drop if it has
/// not fired yet. This makes consumer disposal an unconditional teardown
/// rather than a best-effort one.
pub struct SubscriptionGuard {
    id: Uuid,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    /// Wrap an unsubscribe closure provided by the backend client.
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: Uuid::new_v4(),
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A guard with no channel behind it, for error paths that must still
    /// hand back a guard-shaped value.
    pub fn noop() -> Self {
        Self {
            id: Uuid::new_v4(),
            unsubscribe: None,
        }
    }

    /// Identity of the channel, for logging and test assertions.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Close the channel now. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
            tracing::debug!(subscription_id = %self.id, "channel closed");
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("id", &self.id)
            .field("armed", &self.unsubscribe.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn guard_fires_exactly_once_on_explicit_unsubscribe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut guard = SubscriptionGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        guard.unsubscribe();
        guard.unsubscribe();
        drop(guard);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_fires_on_drop_when_not_unsubscribed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let guard = SubscriptionGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        drop(guard);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_guard_is_safe_to_drop() {
        let mut guard = SubscriptionGuard::noop();
        guard.unsubscribe();
        drop(guard);
    }

    #[test]
    fn guard_ids_are_distinct() {
        let a = SubscriptionGuard::noop();
        let b = SubscriptionGuard::noop();
        assert_ne!(a.id(), b.id());
    }
}
