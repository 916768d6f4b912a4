//! Optimistic transactions.
//!
//! A [`Transaction`] buffers writes and remembers the version of every entity
//! read through it. Commit re-checks those versions and applies the buffer in
//! one SQLite transaction; a mismatch fails the commit with
//! [`StoreError::Conflict`](crate::StoreError::Conflict) and nothing is written.
//! Dropping a transaction that was never committed discards its writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use convo_shared::Key;

use crate::database::Write;

#[derive(Default)]
struct TxState {
    reads: HashMap<Key, i64>,
    writes: Vec<Write>,
}

pub struct Transaction {
    state: Mutex<TxState>,
    pending: AtomicBool,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TxState::default()),
            pending: AtomicBool::new(true),
        }
    }

    /// `true` until the transaction is committed or rolled back.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Number of buffered writes.
    pub fn len(&self) -> usize {
        self.state().writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // first read wins: later reads must not move the expected version
    pub(crate) fn record_read(&self, key: Key, version: i64) {
        self.state().reads.entry(key).or_insert(version);
    }

    /// The buffered state of `key`: `Some(Some(body))` for a pending put,
    /// `Some(None)` for a pending delete, `None` when untouched.
    pub(crate) fn buffered(&self, key: Key) -> Option<Option<String>> {
        self.state()
            .writes
            .iter()
            .rev()
            .find(|w| w.key() == key)
            .map(|w| match w {
                Write::Put { body, .. } => Some(body.clone()),
                Write::Delete { .. } => None,
            })
    }

    pub(crate) fn buffer(&self, write: Write) {
        let mut state = self.state();
        let key = write.key();
        state.writes.retain(|w| w.key() != key);
        state.writes.push(write);
    }

    /// Drain the transaction for commit. Marks it as no longer pending.
    pub(crate) fn take(&self) -> (Vec<(Key, i64)>, Vec<Write>) {
        self.pending.store(false, Ordering::SeqCst);
        let mut state = self.state();
        let reads = state.reads.drain().collect();
        let writes = std::mem::take(&mut state.writes);
        (reads, writes)
    }

    pub(crate) fn discard(&self) {
        self.pending.store(false, Ordering::SeqCst);
        let mut state = self.state();
        state.reads.clear();
        state.writes.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_pending() {
            let writes = self.state().writes.len();
            tracing::warn!(writes, "rolling back abandoned transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_shared::Kind;

    #[test]
    fn test_buffer_replaces_earlier_write() {
        let tx = Transaction::new();
        let key = Key::new(Kind::User, 1);
        tx.buffer(Write::Put {
            key,
            body: "a".into(),
            index: vec![],
        });
        tx.buffer(Write::Put {
            key,
            body: "b".into(),
            index: vec![],
        });
        assert_eq!(tx.len(), 1);
        assert_eq!(tx.buffered(key), Some(Some("b".to_string())));

        tx.buffer(Write::Delete { key });
        assert_eq!(tx.buffered(key), Some(None));
    }

    #[test]
    fn test_first_read_version_kept() {
        let tx = Transaction::new();
        let key = Key::new(Kind::User, 1);
        tx.record_read(key, 3);
        tx.record_read(key, 4);
        let (reads, _) = tx.take();
        assert_eq!(reads, vec![(key, 3)]);
        assert!(!tx.is_pending());
    }
}
