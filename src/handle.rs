//! Reactive handle state: status enum, state snapshot, and the watch-backed
//! cell that broadcasts mutations to consumers.
//!
//! The original reactive-framework refs map to a plain mutable struct with
//! explicit notification on mutation: a [`tokio::sync::watch`] channel
//! whose sender is owned exclusively by the engine and whose receivers are
//! handed to consumers.

use serde_json::Value;
use tokio::sync::watch;

use crate::error::QueryError;

/// Lifecycle status of a query handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryStatus {
    /// No fetch or subscription has produced a result yet, or the handle
    /// was reset via `clear()`.
    #[default]
    Idle,
    /// A fetch is outstanding or the first push after a (re)subscribe has
    /// not arrived yet.
    Pending,
    /// The handle holds fresh data from the latest snapshot or push.
    Success,
    /// The latest fetch, subscription attempt, or backend push failed.
    Error,
}

impl QueryStatus {
    /// Lowercase wire/display form (`"idle"`, `"pending"`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Point-in-time view of a query handle.
///
/// `data` and `error` are not mutually exclusive: on a subscription error
/// the last known data is deliberately retained so the UI can show
/// "last known value, refresh failed". A successful push always clears
/// the error.
#[derive(Debug, Clone, Default)]
pub struct QueryState {
    /// Latest query result, if any has ever arrived.
    pub data: Option<Value>,
    /// Latest error, cleared by the next successful push.
    pub error: Option<QueryError>,
    /// Current lifecycle status.
    pub status: QueryStatus,
}

impl QueryState {
    /// `true` while a fetch or first-push wait is outstanding.
    pub fn pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }
}

/// Watch-backed state cell owned by the engine.
///
/// All mutation goes through the methods below; consumers only ever see
/// [`QueryState`] clones via [`StateCell::watch`] receivers. The sender is
/// never exposed, which enforces the "no external mutation" ownership rule.
pub(crate) struct StateCell {
    tx: watch::Sender<QueryState>,
}

impl StateCell {
    pub(crate) fn new(initial: QueryState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Apply a backend push or fetch result: replace data, clear any error,
    /// settle to success.
    pub(crate) fn apply_data(&self, value: Value) {
        self.tx.send_modify(|state| {
            state.data = Some(value);
            state.error = None;
            state.status = QueryStatus::Success;
        });
    }

    /// Apply an error. Prior data is retained (pinned policy: consumers may
    /// keep rendering the last known value alongside the error).
    pub(crate) fn apply_error(&self, error: QueryError) {
        self.tx.send_modify(|state| {
            state.error = Some(error);
            state.status = QueryStatus::Error;
        });
    }

    /// Mark the handle pending without touching data or error, so a loading
    /// indicator can show across argument changes.
    pub(crate) fn mark_pending(&self) {
        self.tx.send_modify(|state| {
            state.status = QueryStatus::Pending;
        });
    }

    /// Reset to idle/empty.
    pub(crate) fn clear(&self) {
        self.tx.send_modify(|state| *state = QueryState::default());
    }

    /// A clone of the current state.
    pub(crate) fn snapshot(&self) -> QueryState {
        self.tx.borrow().clone()
    }

    /// A receiver that observes every subsequent state change.
    pub(crate) fn watch(&self) -> watch::Receiver<QueryState> {
        self.tx.subscribe()
    }
}
