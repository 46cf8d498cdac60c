//! Client-side synchronization between server-rendered query snapshots and
//! live backend subscriptions, plus a single-flight auth token cache.

mod auth;
pub use auth::{TokenCache, TokenFetch, install_token_provider};
mod backend;
pub use backend::{BackendClient, DataCallback, ErrorCallback, SubscriptionGuard, TokenProvider};
mod descriptor;
pub use descriptor::{QueryDescriptor, canonicalize};
mod engine;
pub use engine::{ExecutionContext, QueryEngine, QueryOptions, QueryRef, SyncConfig};
mod error;
pub use error::{FetchError, QueryError, SubscriptionError, TokenFetchError};
mod handle;
pub use handle::{QueryState, QueryStatus};
mod http;
pub use http::{HttpFetcher, HttpTokenFetcher, SnapshotFetch};
mod ops;
pub use ops::{OperationHandle, OperationKind};
mod snapshot;
pub use snapshot::SnapshotCache;
