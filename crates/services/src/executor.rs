//! # Transactional Executor
//!
//! Every multi-step mutation runs inside a [`Transaction`] handed out by the
//! [`Executor`]. The guard commits only through [`Transaction::commit`]; on
//! every other exit path (an `?` early return, a panic, a plain drop) the
//! underlying store transaction is rolled back.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use domains::{DomainResult, NewModLogEntry, Store, StoreTx};

/// Hands out scoped transactions on a shared store.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn Store>,
}

impl Executor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn begin(&self) -> DomainResult<Transaction> {
        let tx = self.store.begin().await?;
        Ok(Transaction { tx })
    }

    pub async fn vacuum(&self) -> DomainResult<()> {
        self.store.vacuum().await
    }
}

/// Exclusive handle on an open transaction. Store operations are reached
/// through `Deref` to [`StoreTx`].
pub struct Transaction {
    tx: Box<dyn StoreTx>,
}

impl Transaction {
    pub async fn commit(self) -> DomainResult<()> {
        self.tx.commit().await
    }

    /// Appends a moderation log entry in this transaction, so it is written
    /// if and only if the mutation it documents is.
    pub async fn log_moderation(&mut self, entry: NewModLogEntry) -> DomainResult<u64> {
        let id = self.tx.log_moderation(&entry).await?;
        tracing::info!(
            log_id = id,
            action = %entry.action,
            board = %entry.board,
            post_id = ?entry.post_id,
            by = %entry.by,
            "Moderation action logged"
        );
        Ok(id)
    }
}

impl Deref for Transaction {
    type Target = dyn StoreTx;

    fn deref(&self) -> &Self::Target {
        &*self.tx
    }
}

impl DerefMut for Transaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.tx
    }
}
