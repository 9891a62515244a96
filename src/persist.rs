//! `Persister`: debounced, coalesced writes from a room's CRDT to its
//! `DocumentStore`, per spec.md \S4.4.
//!
//! The debounce itself is a per-room timer driven from inside the room
//! actor's own `tokio::select!` loop (see `room.rs`) rather than a
//! fire-and-forget background task, per the "no orphan tasks" design
//! note in spec.md \S9. This module holds the pieces that don't need a
//! mutable borrow of the room: the size gate and the actual write.

use std::sync::Arc;

use tracing::{error, warn};

use crate::store::DocumentStore;

/// Outcome of attempting to flush a room's serialized state.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Written successfully; the room's `dirtySince` may be cleared.
    Written,
    /// Serialized form exceeded `maxPersistedBytes`; logged and skipped.
    /// In-memory state keeps serving clients, but the on-disk copy lags.
    TooLarge { size: usize },
    /// `DocumentStore::save_state` failed; logged. `dirtySince` must be
    /// preserved so the next debounce window retries.
    StoreError,
}

/// Serializes and writes `bytes` for `document_id`, enforcing the
/// `maxPersistedBytes` gate named in spec.md \S4.3/\S4.4.
pub async fn flush(
    store: &Arc<dyn DocumentStore>,
    document_id: &str,
    bytes: &[u8],
    max_persisted_bytes: usize,
) -> FlushOutcome {
    if bytes.len() > max_persisted_bytes {
        error!(
            document_id,
            size = bytes.len(),
            limit = max_persisted_bytes,
            "serialized CRDT exceeds maxPersistedBytes; skipping write"
        );
        return FlushOutcome::TooLarge { size: bytes.len() };
    }

    match store.save_state(document_id, bytes).await {
        Ok(()) => FlushOutcome::Written,
        Err(source) => {
            warn!(document_id, %source, "persist failed; will retry next debounce window");
            FlushOutcome::StoreError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;

    #[tokio::test]
    async fn flush_writes_small_payload() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let outcome = flush(&store, "doc1", b"hello", 1024).await;
        assert_eq!(outcome, FlushOutcome::Written);
        assert_eq!(store.load_state("doc1").await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn flush_rejects_oversized_payload() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let big = vec![0u8; 100];
        let outcome = flush(&store, "doc1", &big, 10).await;
        assert!(matches!(outcome, FlushOutcome::TooLarge { size: 100 }));
        assert!(store.load_state("doc1").await.unwrap().is_none());
    }
}
