//! One-shot mutation/action trackers with observable pending/error state.
//!
//! Queries get the full subscription machinery in `engine`; mutations and
//! actions are plain calls, so all a consumer needs is "is it running" and
//! "what went wrong last time".

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;

use crate::backend::BackendClient;
use crate::error::SubscriptionError;

/// Which one-shot backend function kind a tracker wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// A state-changing backend function.
    Mutation,
    /// A side-effecting backend function (may call external services).
    Action,
}

/// Tracks one named mutation or action.
///
/// `run` sets the pending flag for the duration of the call and clears it
/// in all paths; the last error is recorded for display and cleared at the
/// start of the next run. Errors are also returned to the caller, who
/// decides whether to retry.
pub struct OperationHandle {
    client: Arc<dyn BackendClient>,
    name: String,
    kind: OperationKind,
    pending: watch::Sender<bool>,
    last_error: Mutex<Option<SubscriptionError>>,
}

impl OperationHandle {
    /// Tracker for the named mutation.
    pub fn mutation(client: Arc<dyn BackendClient>, name: impl Into<String>) -> Self {
        Self::new(client, name, OperationKind::Mutation)
    }

    /// Tracker for the named action.
    pub fn action(client: Arc<dyn BackendClient>, name: impl Into<String>) -> Self {
        Self::new(client, name, OperationKind::Action)
    }

    fn new(client: Arc<dyn BackendClient>, name: impl Into<String>, kind: OperationKind) -> Self {
        let (pending, _rx) = watch::channel(false);
        Self {
            client,
            name: name.into(),
            kind,
            pending,
            last_error: Mutex::new(None),
        }
    }

    /// The backend function name this tracker wraps.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the operation with the given arguments.
    ///
    /// # Errors
    ///
    /// Returns the backend's error. The same error is retained and
    /// readable via [`last_error`](OperationHandle::last_error) until the
    /// next run.
    pub async fn run(&self, args: Value) -> Result<Value, SubscriptionError> {
        let _ = self.pending.send(true);
        *self.last_error.lock().expect("last error lock poisoned") = None;

        let result = match self.kind {
            OperationKind::Mutation => self.client.mutation(&self.name, args).await,
            OperationKind::Action => self.client.action(&self.name, args).await,
        };

        if let Err(error) = &result {
            tracing::warn!(operation = %self.name, %error, "operation failed");
            *self.last_error.lock().expect("last error lock poisoned") = Some(error.clone());
        }
        let _ = self.pending.send(false);
        result
    }

    /// `true` while a run is outstanding.
    pub fn is_pending(&self) -> bool {
        *self.pending.borrow()
    }

    /// A receiver observing the pending flag, for loading indicators.
    pub fn pending_updates(&self) -> watch::Receiver<bool> {
        self.pending.subscribe()
    }

    /// The error from the most recent failed run, if the run after it has
    /// not started yet.
    pub fn last_error(&self) -> Option<SubscriptionError> {
        self.last_error
            .lock()
            .expect("last error lock poisoned")
            .clone()
    }
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("pending", &self.is_pending())
            .finish()
    }
}
