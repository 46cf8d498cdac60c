//! Query synchronization engine: context-aware strategy dispatch and the
//! live subscription lifecycle.
//!
//! Given a [`QueryDescriptor`] and an explicit [`ExecutionContext`], the
//! engine returns a [`QueryRef`] whose state is correct during server
//! rendering (one-shot fetch into the snapshot cache), during the
//! hydration window (consume the snapshot once, then attach a live channel
//! without a pending flash), and during live client operation (straight to
//! a push subscription). Exactly one channel is ever open per handle;
//! argument changes and `refresh()` fully replace the previous channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::backend::{BackendClient, DataCallback, ErrorCallback, SubscriptionGuard};
use crate::descriptor::{QueryDescriptor, canonicalize};
use crate::error::QueryError;
use crate::handle::{QueryState, QueryStatus, StateCell};
use crate::http::{HttpFetcher, SnapshotFetch};
use crate::snapshot::SnapshotCache;

/// Where a query call is executing.
///
/// Passed in explicitly rather than inferred from global runtime flags, so
/// every strategy branch is testable by injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Server-side render: one-shot fetch, result recorded in the
    /// snapshot cache for the page payload.
    Server,
    /// Client taking over a server-rendered page: consume the snapshot
    /// once, then attach a live channel silently.
    Hydrating,
    /// Fully client-side: straight to a live subscription.
    Client,
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the backend deployment. Absence (or an empty string)
    /// makes every query fail with [`QueryError::Configuration`] before
    /// any network access.
    pub deployment_url: Option<String>,
    /// Prefix for canonical snapshot cache keys. Default: `"query"`.
    pub snapshot_key_prefix: String,
    /// Headers forwarded on every one-shot fetch (credential propagation).
    pub forwarded_headers: Vec<(String, String)>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            deployment_url: None,
            snapshot_key_prefix: "query".to_string(),
            forwarded_headers: Vec::new(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Whether the server/hydration pre-fetch path is enabled.
    /// Default: `true`. When disabled, every context behaves like
    /// [`ExecutionContext::Client`].
    pub server_prefetch: bool,
    /// Extra headers for this call's one-shot fetch, appended to the
    /// engine-wide forwarded headers.
    pub forwarded_headers: Vec<(String, String)>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            server_prefetch: true,
            forwarded_headers: Vec::new(),
        }
    }
}

/// Entry point for reactive queries.
///
/// Holds the engine configuration, an optional live backend client (absent
/// on the server), the hydration snapshot cache, and an optional one-shot
/// fetcher override.
pub struct QueryEngine {
    config: SyncConfig,
    client: Option<Arc<dyn BackendClient>>,
    snapshots: Arc<SnapshotCache>,
    fetcher: Option<Arc<dyn SnapshotFetch>>,
}

impl QueryEngine {
    /// Build an engine with no live client and an empty snapshot cache.
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            client: None,
            snapshots: Arc::new(SnapshotCache::new()),
            fetcher: None,
        }
    }

    /// Attach the live backend client (client-side engines only).
    pub fn with_client(mut self, client: Arc<dyn BackendClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Use an existing snapshot cache, e.g. one rebuilt from the page
    /// payload during hydration.
    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotCache>) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Replace the one-shot fetch transport. Defaults to a short-lived
    /// [`HttpFetcher`] per call; tests and custom transports inject their
    /// own implementation here.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn SnapshotFetch>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// The snapshot cache, for serializing into the page payload after a
    /// server render.
    pub fn snapshot_cache(&self) -> &Arc<SnapshotCache> {
        &self.snapshots
    }

    /// Resolve a query into a reactive handle using the strategy for the
    /// given execution context.
    ///
    /// # Arguments
    ///
    /// * `descriptor` - Query name plus arguments.
    /// * `context` - Where this call is executing (injected, see
    ///   [`ExecutionContext`]).
    /// * `options` - Per-call options (pre-fetch toggle, extra headers).
    ///
    /// # Returns
    ///
    /// A [`QueryRef`]. Errors are surfaced through the handle's state
    /// rather than a `Result`: misconfiguration and missing connections
    /// produce a handle already in `error` status, never a panic or a
    /// raised error.
    pub async fn query(
        &self,
        descriptor: QueryDescriptor,
        context: ExecutionContext,
        options: QueryOptions,
    ) -> QueryRef {
        let deployment_url = match self.config.deployment_url.as_deref() {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => {
                tracing::warn!(query = descriptor.name(), "no deployment URL configured");
                return QueryRef::failed(descriptor, QueryError::Configuration);
            }
        };

        let prefetch = options.server_prefetch && context != ExecutionContext::Client;
        if prefetch {
            self.query_prefetched(descriptor, context, &options, &deployment_url)
                .await
        } else {
            self.query_live(descriptor)
        }
    }

    /// Pure client path: no one-shot fetch, pending until the first push.
    fn query_live(&self, descriptor: QueryDescriptor) -> QueryRef {
        let Some(client) = &self.client else {
            tracing::warn!(
                query = descriptor.name(),
                "live subscription requested without a backend connection"
            );
            return QueryRef::failed(descriptor, QueryError::ConnectionUnavailable);
        };
        let handle = QueryRef::connected(descriptor, Some(Arc::clone(client)), None);
        handle.core.subscribe(true);
        handle
    }

    /// Server/hydration path: snapshot cache first, one-shot fetch on miss,
    /// then a silent snapshot-to-live handoff when a connection exists.
    async fn query_prefetched(
        &self,
        descriptor: QueryDescriptor,
        context: ExecutionContext,
        options: &QueryOptions,
        deployment_url: &str,
    ) -> QueryRef {
        let key = descriptor.cache_key(&self.config.snapshot_key_prefix);
        let fetcher = self.fetcher_for(deployment_url, options);
        let handle = QueryRef::connected(descriptor, self.client.clone(), Some(fetcher.clone()));

        // Hydration consumes the page-payload entry exactly once; the
        // server reuses an entry another call site already fetched during
        // this render, so at most one fetch is outstanding per descriptor.
        let cached = match context {
            ExecutionContext::Hydrating => self.snapshots.take(&key),
            _ => self.snapshots.get(&key),
        };

        match cached {
            Some(value) => handle.core.cell.apply_data(value),
            None => {
                handle.core.cell.mark_pending();
                let current = handle.core.descriptor();
                match fetcher.fetch(&current).await {
                    Ok(value) => {
                        if context == ExecutionContext::Server {
                            self.snapshots.insert(key, value.clone());
                        }
                        handle.core.cell.apply_data(value);
                    }
                    Err(error) => {
                        tracing::warn!(query = current.name(), %error, "one-shot fetch failed");
                        handle.core.cell.apply_error(error.into());
                    }
                }
            }
        }

        // Snapshot-to-live handoff: attach without marking pending so the
        // consumer never sees a loading flash between snapshot and push.
        if handle.core.client.is_some() {
            handle.core.subscribe(false);
        }
        handle
    }

    /// Short-lived HTTP client for this call, unless a fetcher override
    /// is installed.
    fn fetcher_for(&self, deployment_url: &str, options: &QueryOptions) -> Arc<dyn SnapshotFetch> {
        if let Some(fetcher) = &self.fetcher {
            return Arc::clone(fetcher);
        }
        let mut headers = self.config.forwarded_headers.clone();
        headers.extend(options.forwarded_headers.iter().cloned());
        Arc::new(HttpFetcher::new(deployment_url).with_forwarded_headers(headers))
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("config", &self.config)
            .field("has_client", &self.client.is_some())
            .field("snapshots", &self.snapshots.len())
            .finish()
    }
}

/// The current subscription channel, if any, plus the descriptor it was
/// (or will be) opened for.
struct SubscriptionSlot {
    descriptor: QueryDescriptor,
    guard: Option<SubscriptionGuard>,
}

/// State shared between a [`QueryRef`], its backend callbacks, and its
/// optional argument-watcher task.
struct QueryCore {
    cell: StateCell,
    client: Option<Arc<dyn BackendClient>>,
    fetcher: Option<Arc<dyn SnapshotFetch>>,
    sub: Mutex<SubscriptionSlot>,
    /// Incremented on every (re)subscribe and teardown. Callbacks capture
    /// the generation they were created under and apply pushes only while
    /// it is still current, so a push in flight during a teardown or
    /// argument change can never land on the wrong channel.
    generation: AtomicU64,
}

impl QueryCore {
    fn descriptor(&self) -> QueryDescriptor {
        self.sub
            .lock()
            .expect("subscription slot lock poisoned")
            .descriptor
            .clone()
    }

    /// Open a fresh channel, tearing down the previous one first.
    ///
    /// At most one channel is ever open per handle. When `mark_pending` is
    /// false (the snapshot-to-live handoff) the currently visible
    /// data/status are preserved.
    fn subscribe(self: &Arc<Self>, mark_pending: bool) {
        let mut slot = self.sub.lock().expect("subscription slot lock poisoned");

        // Invalidate the old channel's callbacks before closing it: the
        // new generation is visible before any teardown side effect, so
        // late pushes are discarded rather than applied.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(mut guard) = slot.guard.take() {
            guard.unsubscribe();
        }

        let Some(client) = &self.client else {
            self.cell.apply_error(QueryError::ConnectionUnavailable);
            return;
        };

        if mark_pending {
            self.cell.mark_pending();
        }

        let weak = Arc::downgrade(self);
        let on_data: DataCallback = Box::new(move |value| {
            if let Some(core) = weak.upgrade()
                && core.generation.load(Ordering::SeqCst) == generation
            {
                core.cell.apply_data(value);
            }
        });
        let weak = Arc::downgrade(self);
        let on_error: ErrorCallback = Box::new(move |error| {
            if let Some(core) = weak.upgrade()
                && core.generation.load(Ordering::SeqCst) == generation
            {
                core.cell.apply_error(error.into());
            }
        });

        let guard = client.on_update(&slot.descriptor, on_data, on_error);
        tracing::debug!(
            query = slot.descriptor.name(),
            subscription_id = %guard.id(),
            "subscribed"
        );
        slot.guard = Some(guard);
    }

    /// Replace the arguments and open a fresh channel with a pending flash.
    fn set_args(self: &Arc<Self>, args: Value) {
        {
            let mut slot = self.sub.lock().expect("subscription slot lock poisoned");
            slot.descriptor.set_args(args);
        }
        self.subscribe(true);
    }

    /// Unconditional teardown: close the channel and discard any push
    /// still in flight.
    fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let guard = self
            .sub
            .lock()
            .expect("subscription slot lock poisoned")
            .guard
            .take();
        if let Some(mut guard) = guard {
            guard.unsubscribe();
        }
    }
}

/// Reactive handle to one query's result.
///
/// Exclusively owned by the consumer that requested it; dropping it tears
/// down the live channel unconditionally. Reads are cheap clones of the
/// current [`QueryState`]; [`QueryRef::updates`] yields a stream of state
/// changes for consumers that want to await pushes.
pub struct QueryRef {
    core: Arc<QueryCore>,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QueryRef {
    /// A handle that is already in terminal `error` status. `refresh()`
    /// on it is a resolved no-op.
    fn failed(descriptor: QueryDescriptor, error: QueryError) -> Self {
        let handle = Self::connected(descriptor, None, None);
        handle.core.cell.apply_error(error);
        handle
    }

    fn connected(
        descriptor: QueryDescriptor,
        client: Option<Arc<dyn BackendClient>>,
        fetcher: Option<Arc<dyn SnapshotFetch>>,
    ) -> Self {
        Self {
            core: Arc::new(QueryCore {
                cell: StateCell::new(QueryState::default()),
                client,
                fetcher,
                sub: Mutex::new(SubscriptionSlot {
                    descriptor,
                    guard: None,
                }),
                generation: AtomicU64::new(0),
            }),
            watcher: Mutex::new(None),
        }
    }

    /// Latest data, if any has ever arrived.
    pub fn data(&self) -> Option<Value> {
        self.core.cell.snapshot().data
    }

    /// Latest error, if the handle is (or last was) in error status.
    pub fn error(&self) -> Option<QueryError> {
        self.core.cell.snapshot().error
    }

    /// Current lifecycle status.
    pub fn status(&self) -> QueryStatus {
        self.core.cell.snapshot().status
    }

    /// `true` while a fetch or first-push wait is outstanding.
    pub fn pending(&self) -> bool {
        self.core.cell.snapshot().pending()
    }

    /// A clone of the full current state.
    pub fn state(&self) -> QueryState {
        self.core.cell.snapshot()
    }

    /// The descriptor this handle is currently subscribed for.
    pub fn descriptor(&self) -> QueryDescriptor {
        self.core.descriptor()
    }

    /// A watch receiver over the handle's state.
    pub fn watch(&self) -> watch::Receiver<QueryState> {
        self.core.cell.watch()
    }

    /// A stream of state changes, for `StreamExt`-style consumption.
    pub fn updates(&self) -> WatchStream<QueryState> {
        WatchStream::new(self.core.cell.watch())
    }

    /// Replace the arguments and re-subscribe with a pending flash.
    ///
    /// Always a fresh subscription: the old channel is closed before the
    /// new channel's first push can be applied.
    pub fn set_args(&self, args: Value) {
        self.core.set_args(args);
    }

    /// Re-run the query and replace the current data.
    ///
    /// With a live connection this opens a fresh channel (pending until the
    /// first push). On a server-side handle it repeats the one-shot fetch.
    /// On a handle in terminal error status (no connection, no fetcher)
    /// this resolves without any effect.
    pub async fn refresh(&self) {
        if self.core.client.is_some() {
            self.core.subscribe(true);
            return;
        }
        let Some(fetcher) = self.core.fetcher.clone() else {
            return;
        };
        let descriptor = self.core.descriptor();
        self.core.cell.mark_pending();
        match fetcher.fetch(&descriptor).await {
            Ok(value) => self.core.cell.apply_data(value),
            Err(error) => self.core.cell.apply_error(error.into()),
        }
    }

    /// Reset the handle state to idle/empty. Does not touch the channel;
    /// the next push repopulates the state.
    pub fn clear(&self) {
        self.core.cell.clear();
    }

    /// Watch an external arguments value and re-subscribe on deep change.
    ///
    /// On each change the new canonical argument form is compared to the
    /// last-subscribed one; only a real change re-subscribes, so producers
    /// that rebuild deeply-equal objects (in any key order) do not churn
    /// the channel. Requires a tokio runtime; the watcher task ends when
    /// the handle is dropped or the sender goes away.
    pub fn watch_args(&self, mut args_rx: watch::Receiver<Value>) {
        let weak = Arc::downgrade(&self.core);
        let mut last = canonicalize(self.core.descriptor().args());
        let task = tokio::spawn(async move {
            while args_rx.changed().await.is_ok() {
                let args = args_rx.borrow_and_update().clone();
                let Some(core) = weak.upgrade() else { break };
                let canonical = canonicalize(&args);
                if canonical != last {
                    last = canonical;
                    core.set_args(args);
                }
            }
        });
        let replaced = self
            .watcher
            .lock()
            .expect("watcher slot lock poisoned")
            .replace(task);
        if let Some(old) = replaced {
            old.abort();
        }
    }
}

impl Drop for QueryRef {
    fn drop(&mut self) {
        if let Ok(mut watcher) = self.watcher.lock()
            && let Some(task) = watcher.take()
        {
            task.abort();
        }
        self.core.teardown();
    }
}

impl std::fmt::Debug for QueryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRef")
            .field("descriptor", &self.core.descriptor())
            .field("state", &self.core.cell.snapshot())
            .finish()
    }
}
