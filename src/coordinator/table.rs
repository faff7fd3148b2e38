use ahash::AHashMap as HashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::coordinator::transaction::Transaction;
use crate::types::TxnId;

/// A live transaction. Its mutex is the per-transaction critical section.
pub type SharedTransaction = Arc<Mutex<Transaction>>;

/// Concurrent map of the coordinator's live transactions.
///
/// The map lock is only held to look up, insert or remove entries, never
/// while a transaction is being driven.
#[derive(Default)]
pub struct TransactionTable {
    transactions: RwLock<HashMap<TxnId, SharedTransaction>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, transaction: Transaction) -> SharedTransaction {
        let id = transaction.id().clone();
        let shared = Arc::new(Mutex::new(transaction));
        self.publish(id, shared.clone());
        shared
    }

    /// Makes an already shared transaction visible to the loops. The caller
    /// may hold its lock, which keeps them off it until released.
    pub fn publish(&self, id: TxnId, shared: SharedTransaction) {
        self.transactions.write().insert(id, shared);
    }

    pub fn get(&self, id: &TxnId) -> Option<SharedTransaction> {
        self.transactions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &TxnId) -> Option<SharedTransaction> {
        self.transactions.write().remove(id)
    }

    /// Point-in-time copy of the live transactions, safe to iterate while
    /// other threads insert and remove.
    pub fn snapshot(&self) -> Vec<SharedTransaction> {
        self.transactions.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.transactions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.transactions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.read().is_empty()
    }
}
