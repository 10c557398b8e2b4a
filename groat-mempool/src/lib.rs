use groat_core::{now_ts, Transaction};
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::debug;

/// Unconfirmed transactions older than this are dropped by `prune_expired`.
pub const DEFAULT_TX_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Default)]
struct Inner {
    /// Sorted by fee descending; ties keep insertion order.
    ordered: Vec<Transaction>,
    hashes: HashSet<String>,
}

/// Pool of unconfirmed transactions, ordered by fee for block assembly.
/// A single mutex serializes mutators; readers take consistent snapshots
/// under the same lock.
#[derive(Default)]
pub struct Mempool {
    inner: Mutex<Inner>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `tx` keeping the fee-descending order; among equal fees the
    /// earlier arrival stays first. Returns false on a duplicate hash.
    pub fn push(&self, tx: Transaction) -> bool {
        let mut inner = self.inner.lock();
        if !inner.hashes.insert(tx.tx_hash.clone()) {
            return false;
        }
        let position = inner
            .ordered
            .iter()
            .position(|existing| existing.fee < tx.fee)
            .unwrap_or(inner.ordered.len());
        debug!(tx = %tx.tx_hash, fee = tx.fee, "admitted unconfirmed transaction");
        inner.ordered.insert(position, tx);
        true
    }

    pub fn remove(&self, tx_hash: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.hashes.remove(tx_hash) {
            return false;
        }
        inner.ordered.retain(|tx| tx.tx_hash != tx_hash);
        true
    }

    pub fn remove_batch(&self, transactions: &[Transaction]) {
        let mut inner = self.inner.lock();
        for tx in transactions {
            if inner.hashes.remove(&tx.tx_hash) {
                inner.ordered.retain(|existing| existing.tx_hash != tx.tx_hash);
            }
        }
    }

    pub fn get(&self, tx_hash: &str) -> Option<Transaction> {
        self.inner
            .lock()
            .ordered
            .iter()
            .find(|tx| tx.tx_hash == tx_hash)
            .cloned()
    }

    pub fn contains(&self, tx_hash: &str) -> bool {
        self.inner.lock().hashes.contains(tx_hash)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().ordered.len()
    }

    /// Snapshot of the whole pool, fee-descending.
    pub fn iter_all(&self) -> Vec<Transaction> {
        self.inner.lock().ordered.clone()
    }

    /// Up to `max` highest-fee transactions, without removing them.
    pub fn take_chunk(&self, max: usize) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner.ordered.iter().take(max).cloned().collect()
    }

    /// Units already committed by pending transactions from `source`; the
    /// admission check counts these against the confirmed balance.
    pub fn pending_spend(&self, source: &str) -> u64 {
        self.inner
            .lock()
            .ordered
            .iter()
            .filter(|tx| tx.source == source)
            .map(|tx| tx.amount + tx.fee)
            .sum()
    }

    /// Drops transactions older than `max_age_secs`; returns how many.
    pub fn prune_expired(&self, max_age_secs: u64) -> usize {
        let cutoff = now_ts().saturating_sub(max_age_secs);
        let mut inner = self.inner.lock();
        let before = inner.ordered.len();
        inner.ordered.retain(|tx| tx.timestamp >= cutoff);
        let dropped = before - inner.ordered.len();
        if dropped > 0 {
            let kept: HashSet<String> =
                inner.ordered.iter().map(|tx| tx.tx_hash.clone()).collect();
            inner.hashes = kept;
            debug!(dropped, "pruned expired unconfirmed transactions");
        }
        dropped
    }
}
