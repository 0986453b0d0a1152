// Storage collaborator - what the kernel needs from the database

pub mod sqlite;

pub use sqlite::SqliteBackend;

use crate::contract::{Contract, VersionRef};
use crate::error::Result;
use crate::sql::SqlQuery;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One result row, keyed by output column.
pub type Row = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change to one stored contract. Images carry materialized `links`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub id: String,
    pub kind: ChangeKind,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Receives change events. Called from whichever thread committed the change.
pub type ChangeSink = Box<dyn Fn(ChangeEvent) + Send + Sync>;

/// A registered change sink. Dropping it unregisters the sink.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// The database under the kernel.
pub trait Backend: Send + Sync + 'static {
    /// Held while a row is locked.
    type RowLock<'a>
    where
        Self: 'a;

    /// Run a compiled statement.
    fn execute(&self, query: &SqlQuery) -> Result<Vec<Row>>;

    /// Unfiltered read by id.
    fn get_element_by_id(&self, id: &str) -> Result<Option<Contract>>;

    /// Unfiltered read by slug and version.
    fn get_element_by_slug(&self, slug: &str, version: &VersionRef) -> Result<Option<Contract>>;

    /// Store a new contract. Fails if the id or `slug@version` is taken.
    fn insert_element(&self, contract: &Contract) -> Result<Contract>;

    /// Store a contract, replacing the one with the same `slug@version`.
    fn upsert_element(&self, contract: &Contract) -> Result<Contract>;

    /// Run `f` all-or-nothing. Change events raised inside are delivered
    /// after commit, and dropped on rollback.
    fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>;

    /// Lock the row `id` of `table` until the returned guard drops.
    fn lock_row(&self, table: &str, id: &str) -> Result<Self::RowLock<'_>>;

    /// Active contracts linked to `id` through `link_type`, by forward or
    /// inverse name.
    fn get_links(&self, id: &str, link_type: &str) -> Result<Vec<Contract>>;

    fn subscribe_changes(&self, sink: ChangeSink) -> Subscription;

    fn status(&self) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_subscription_cancels_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let subscription = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subscription.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = calls.clone();
        {
            let _subscription = Subscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
