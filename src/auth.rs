//! Single-flight cache for short-lived auth bearer tokens.
//!
//! The backend client asks for a token on every authenticated call, forcing
//! a refresh when the previous token was rejected. A storm of simultaneous
//! forced refreshes must collapse into one network call: the first caller
//! creates a shared in-flight future, every concurrent caller awaits the
//! same future, and the slot is cleared before the future settles so the
//! next forced refresh starts a brand-new fetch.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use crate::backend::TokenProvider;
use crate::error::TokenFetchError;

/// Performs the actual token fetch over the network.
///
/// Implemented by [`HttpTokenFetcher`](crate::HttpTokenFetcher) in
/// production and by counting fakes in tests.
#[async_trait]
pub trait TokenFetch: Send + Sync {
    /// Fetch a fresh token. `Ok(None)` means the user is not logged in.
    async fn fetch_token(&self) -> Result<Option<String>, TokenFetchError>;
}

/// Cheap cached-token read, normally backed by the backend client's own
/// credential cache.
pub type CachedTokenRead = dyn Fn() -> Option<String> + Send + Sync;

/// Shared in-flight refresh: every concurrent caller clones and awaits
/// the same future.
type SharedTokenFuture = Shared<BoxFuture<'static, Option<String>>>;

/// Token cache with single-flight forced refresh.
///
/// Invariant: at most one outstanding forced-refresh network call exists
/// at any instant for a given cache instance. The in-flight slot is set
/// and cleared only by the refresh routine itself; callers never mutate it.
pub struct TokenCache {
    fetcher: Arc<dyn TokenFetch>,
    cached: Box<CachedTokenRead>,
    in_flight: Arc<Mutex<Option<SharedTokenFuture>>>,
}

impl TokenCache {
    /// Build a cache over a fetcher and a cheap cached-token read.
    ///
    /// # Arguments
    ///
    /// * `fetcher` - Performs the forced-refresh network call.
    /// * `cached` - Returns the backend client's cached credential, if any.
    ///   Called only for non-forced reads; never triggers network access.
    pub fn new(
        fetcher: Arc<dyn TokenFetch>,
        cached: impl Fn() -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            fetcher,
            cached: Box::new(cached),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolve a token for an outgoing backend call.
    ///
    /// Resolution order:
    ///
    /// 1. A refresh already in flight: await it, whatever the flag says.
    ///    N concurrent callers observe the result of one fetch.
    /// 2. Not forced: return the cheap cached read. May be `None`.
    /// 3. Forced, nothing in flight: start a fetch behind a shared future.
    ///    The slot is cleared before the future resolves, and fetch
    ///    failures are swallowed to `None` -- an unauthenticated call is a
    ///    valid, expected state, not an error.
    pub async fn token(&self, force_refresh: bool) -> Option<String> {
        let shared = {
            let mut slot = self.in_flight.lock().expect("in-flight slot lock poisoned");
            if let Some(existing) = slot.as_ref() {
                existing.clone()
            } else if !force_refresh {
                return (self.cached)();
            } else {
                let fetcher = Arc::clone(&self.fetcher);
                let in_flight = Arc::clone(&self.in_flight);
                let shared = async move {
                    let token = match fetcher.fetch_token().await {
                        Ok(token) => token,
                        Err(error) => {
                            tracing::warn!(%error, "token refresh failed, treating as unauthenticated");
                            None
                        }
                    };
                    // Clear the slot before this future resolves so a later
                    // forced refresh starts a new fetch instead of reusing a
                    // settled future.
                    *in_flight.lock().expect("in-flight slot lock poisoned") = None;
                    token
                }
                .boxed()
                .shared();
                *slot = Some(shared.clone());
                shared
            }
        };
        shared.await
    }
}

#[async_trait]
impl TokenProvider for TokenCache {
    async fn token(&self, force_refresh: bool) -> Option<String> {
        TokenCache::token(self, force_refresh).await
    }
}

/// Wire a token cache to a backend client.
///
/// Cheap (non-forced) reads go through the client's own credential cache;
/// the cache is then installed as the client's token provider. The cached
/// read holds only a `Weak` reference, so the provider does not keep the
/// client alive.
pub fn install_token_provider(
    client: &Arc<dyn crate::backend::BackendClient>,
    fetcher: Arc<dyn TokenFetch>,
) -> Arc<TokenCache> {
    let weak = Arc::downgrade(client);
    let cache = Arc::new(TokenCache::new(fetcher, move || {
        weak.upgrade().and_then(|client| client.cached_auth())
    }));
    client.set_auth_token_provider(Arc::clone(&cache) as Arc<dyn TokenProvider>);
    cache
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_flight = self
            .in_flight
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false);
        f.debug_struct("TokenCache")
            .field("in_flight", &in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Fetcher that counts calls and blocks each fetch on a semaphore
    /// permit, so tests control exactly when a fetch settles.
    struct CountingFetcher {
        calls: AtomicUsize,
        gate: Semaphore,
        results: Mutex<VecDeque<Result<Option<String>, TokenFetchError>>>,
    }

    impl CountingFetcher {
        fn new(results: Vec<Result<Option<String>, TokenFetchError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                results: Mutex::new(results.into()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    #[async_trait]
    impl TokenFetch for CountingFetcher {
        async fn fetch_token(&self) -> Result<Option<String>, TokenFetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
            self.results
                .lock()
                .expect("results lock")
                .pop_front()
                .unwrap_or(Ok(None))
        }
    }

    fn cache_with(fetcher: Arc<CountingFetcher>, cached: Option<String>) -> Arc<TokenCache> {
        Arc::new(TokenCache::new(fetcher, move || cached.clone()))
    }

    #[tokio::test]
    async fn unforced_read_returns_cached_without_network() {
        let fetcher = CountingFetcher::new(vec![]);
        let cache = cache_with(Arc::clone(&fetcher), Some("cached-token".to_string()));

        assert_eq!(cache.token(false).await, Some("cached-token".to_string()));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn unforced_read_may_be_none() {
        let fetcher = CountingFetcher::new(vec![]);
        let cache = cache_with(Arc::clone(&fetcher), None);

        assert_eq!(cache.token(false).await, None);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_forced_refreshes_collapse_into_one_fetch() {
        let fetcher = CountingFetcher::new(vec![Ok(Some("fresh".to_string()))]);
        let cache = cache_with(Arc::clone(&fetcher), None);

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move { cache.token(true).await }));
        }

        // Let every task reach the in-flight future before the fetch settles.
        while fetcher.calls() == 0 {
            tokio::task::yield_now().await;
        }
        fetcher.release(1);

        for task in tasks {
            let token = task.await.expect("task panicked");
            assert_eq!(token, Some("fresh".to_string()));
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn unforced_caller_joins_an_in_flight_refresh() {
        let fetcher = CountingFetcher::new(vec![Ok(Some("fresh".to_string()))]);
        let cache = cache_with(Arc::clone(&fetcher), Some("stale".to_string()));

        let forced = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.token(true).await })
        };
        while fetcher.calls() == 0 {
            tokio::task::yield_now().await;
        }

        // An unforced caller arriving mid-flight shares the pending fetch
        // rather than reading the stale cache.
        let unforced = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.token(false).await })
        };
        tokio::task::yield_now().await;
        fetcher.release(1);

        assert_eq!(forced.await.expect("task"), Some("fresh".to_string()));
        assert_eq!(unforced.await.expect("task"), Some("fresh".to_string()));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn settled_refresh_is_not_reused() {
        let fetcher = CountingFetcher::new(vec![
            Ok(Some("first".to_string())),
            Ok(Some("second".to_string())),
        ]);
        let cache = cache_with(Arc::clone(&fetcher), None);

        fetcher.release(2);
        assert_eq!(cache.token(true).await, Some("first".to_string()));
        assert_eq!(cache.token(true).await, Some("second".to_string()));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn install_wires_cached_reads_and_provider() {
        use crate::backend::{
            BackendClient, DataCallback, ErrorCallback, SubscriptionGuard, TokenProvider,
        };
        use crate::descriptor::QueryDescriptor;
        use crate::error::SubscriptionError;
        use serde_json::Value;

        struct StubClient {
            provider: Mutex<Option<Arc<dyn TokenProvider>>>,
        }

        #[async_trait]
        impl BackendClient for StubClient {
            async fn query(
                &self,
                _descriptor: &QueryDescriptor,
            ) -> Result<Value, SubscriptionError> {
                Ok(Value::Null)
            }

            async fn mutation(&self, _name: &str, _args: Value) -> Result<Value, SubscriptionError> {
                Ok(Value::Null)
            }

            async fn action(&self, _name: &str, _args: Value) -> Result<Value, SubscriptionError> {
                Ok(Value::Null)
            }

            fn on_update(
                &self,
                _descriptor: &QueryDescriptor,
                _on_data: DataCallback,
                _on_error: ErrorCallback,
            ) -> SubscriptionGuard {
                SubscriptionGuard::noop()
            }

            fn set_auth_token_provider(&self, provider: Arc<dyn TokenProvider>) {
                *self.provider.lock().expect("provider lock") = Some(provider);
            }

            fn cached_auth(&self) -> Option<String> {
                Some("client-cached".to_string())
            }
        }

        let stub = Arc::new(StubClient {
            provider: Mutex::new(None),
        });
        let client: Arc<dyn BackendClient> = Arc::clone(&stub) as Arc<dyn BackendClient>;
        let fetcher = CountingFetcher::new(vec![]);
        let cache = install_token_provider(&client, Arc::clone(&fetcher) as Arc<dyn TokenFetch>);

        // Non-forced reads come from the client's own cache, no network.
        assert_eq!(cache.token(false).await, Some("client-cached".to_string()));
        assert_eq!(fetcher.calls(), 0);

        // The provider was installed and answers through the same cache.
        let provider = stub
            .provider
            .lock()
            .expect("provider lock")
            .as_ref()
            .map(Arc::clone)
            .expect("provider installed");
        assert_eq!(provider.token(false).await, Some("client-cached".to_string()));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn fetch_failure_resolves_to_none_and_clears_the_slot() {
        let fetcher = CountingFetcher::new(vec![
            Err(TokenFetchError::Status(500)),
            Ok(Some("recovered".to_string())),
        ]);
        let cache = cache_with(Arc::clone(&fetcher), None);

        fetcher.release(2);
        // Failure is swallowed, never raised.
        assert_eq!(cache.token(true).await, None);
        // The slot was cleared on failure too, so a new fetch runs.
        assert_eq!(cache.token(true).await, Some("recovered".to_string()));
        assert_eq!(fetcher.calls(), 2);
    }
}
