//! Run record persistence.
//!
//! `SqliteRunStore` is the production `RunStore`; `StoreHandle` moves every
//! store call onto tokio's blocking pool so supervisors and request handlers
//! never run SQLite I/O on async worker threads.

mod sqlite;

use std::sync::Arc;

use anyhow::{Context, Result};
use genepipe_common::RunStore;

pub use sqlite::SqliteRunStore;

/// Cheap-to-clone async handle over any `RunStore`.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn RunStore>,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { inner: store }
    }

    /// Run a closure against the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&dyn RunStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .context("Run store task panicked")?
    }

    /// Direct access for startup code and tests.
    pub fn store(&self) -> &dyn RunStore {
        self.inner.as_ref()
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle").finish_non_exhaustive()
    }
}
