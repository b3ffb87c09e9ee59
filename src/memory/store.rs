//! Embedding memory store
//!
//! Writes are buffered per owner and embedded in batches: a buffer
//! reaching the flush threshold triggers an immediate flush, and a
//! periodic background tick flushes every owner. Retrieval is a
//! two-stage hybrid: top candidates by cosine similarity, re-sorted by
//! recency, greedily packed into a token budget.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::timeout;

use crate::config::MemoryConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Result, SpotterError};
use crate::storage::queries::{self, EmbeddedMemory};
use crate::storage::Storage;
use crate::types::{estimate_tokens, MemoryInput, MemoryItem};

/// Options for a retrieval call
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub scope_id: Option<String>,
    pub limit: usize,
    pub token_budget: usize,
}

impl RetrieveOptions {
    pub fn defaults(config: &MemoryConfig) -> Self {
        Self {
            scope_id: None,
            limit: config.default_limit,
            token_budget: config.default_token_budget,
        }
    }
}

/// Queues, embeds, persists, and ranks per-user memory text
pub struct MemoryStore {
    storage: Storage,
    embedder: Arc<dyn EmbeddingProvider>,
    buffers: DashMap<String, Vec<MemoryInput>>,
    config: MemoryConfig,
}

impl MemoryStore {
    pub fn new(storage: Storage, embedder: Arc<dyn EmbeddingProvider>, config: MemoryConfig) -> Self {
        Self {
            storage,
            embedder,
            buffers: DashMap::new(),
            config,
        }
    }

    /// Append an item to the owner's buffer. Reaching the flush threshold
    /// flushes that owner immediately; a flush failure re-queues the batch
    /// for the periodic tick, so enqueue itself never fails on provider
    /// errors.
    pub async fn enqueue(&self, item: MemoryInput) -> Result<()> {
        let owner_id = item.owner_id.clone();
        let should_flush = {
            let mut buffer = self.buffers.entry(owner_id.clone()).or_default();
            buffer.push(item);
            buffer.len() >= self.config.flush_threshold
        };

        if should_flush {
            if let Err(e) = self.flush(&owner_id).await {
                tracing::warn!(owner_id = %owner_id, error = %e, "immediate flush failed, batch re-queued");
            }
        }
        Ok(())
    }

    /// Number of buffered (not yet embedded) items for an owner
    pub fn pending_count(&self, owner_id: &str) -> usize {
        self.buffers.get(owner_id).map_or(0, |b| b.len())
    }

    /// Flush one owner's buffer: swap-and-clear before any I/O, embed in
    /// chunks, persist. On provider failure the unprocessed remainder is
    /// re-queued (at-least-once delivery).
    pub async fn flush(&self, owner_id: &str) -> Result<usize> {
        let batch: Vec<MemoryInput> = match self.buffers.get_mut(owner_id) {
            Some(mut buffer) => std::mem::take(&mut *buffer),
            None => return Ok(0),
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let mut persisted = 0;
        let chunks: Vec<&[MemoryInput]> = batch.chunks(self.config.embed_batch_size).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            match self.embed_chunk(chunk).await {
                Ok(embedded) => {
                    let model = self.embedder.model_id();
                    let now = chrono::Utc::now();
                    self.storage
                        .with_transaction(|conn| queries::insert_memories(conn, &embedded, model, now))?;
                    persisted += embedded.len();
                }
                Err(e) => {
                    // Put this chunk and everything after it back
                    let requeue: Vec<MemoryInput> =
                        chunks[i..].iter().flat_map(|c| c.iter().cloned()).collect();
                    let requeued = requeue.len();
                    self.buffers
                        .entry(owner_id.to_string())
                        .or_default()
                        .extend(requeue);
                    tracing::warn!(
                        owner_id = %owner_id,
                        requeued,
                        error = %e,
                        "embedding batch failed, items re-queued"
                    );
                    return Err(e);
                }
            }
        }

        tracing::debug!(owner_id = %owner_id, persisted, "memory flush complete");
        Ok(persisted)
    }

    /// Flush every owner with a non-empty buffer (periodic tick body)
    pub async fn flush_all(&self) {
        let owners: Vec<String> = self.buffers.iter().map(|e| e.key().clone()).collect();
        for owner_id in owners {
            if let Err(e) = self.flush(&owner_id).await {
                tracing::warn!(owner_id = %owner_id, error = %e, "periodic flush failed");
            }
        }
    }

    async fn embed_chunk(&self, chunk: &[MemoryInput]) -> Result<Vec<EmbeddedMemory>> {
        let texts: Vec<String> = chunk.iter().map(|i| i.text.clone()).collect();
        let vectors = timeout(
            Duration::from_millis(self.config.provider_timeout_ms),
            self.embedder.embed_batch(&texts),
        )
        .await
        .map_err(|_| SpotterError::Timeout("embedding provider".into()))??;

        if vectors.len() != chunk.len() {
            return Err(SpotterError::Embedding(format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                chunk.len()
            )));
        }

        Ok(chunk
            .iter()
            .zip(vectors)
            .map(|(input, embedding)| EmbeddedMemory {
                input: input.clone(),
                embedding,
            })
            .collect())
    }

    /// Two-stage retrieval: top candidates by cosine similarity, re-sorted
    /// by recency descending, greedily packed while the running token
    /// estimate stays within budget, capped at min(max_context_items,
    /// limit). An over-budget candidate is skipped rather than ending the
    /// pack, so a smaller later item can still fit. Provider or storage
    /// failure degrades to an empty set.
    ///
    /// The recency re-sort deliberately considers only the similarity
    /// candidate pool; a highly relevant 21st-by-similarity item loses to
    /// a recent one inside the pool.
    pub async fn retrieve(
        &self,
        owner_id: &str,
        query_text: &str,
        options: &RetrieveOptions,
    ) -> Vec<MemoryItem> {
        self.retrieve_filtered(owner_id, query_text, options, |_| true)
            .await
    }

    /// Same two-stage retrieval with a caller-supplied admission check.
    /// A candidate the check rejects is skipped before packing, so it
    /// consumes neither a result slot nor token budget and the next
    /// pool item can take its place.
    pub async fn retrieve_filtered<F>(
        &self,
        owner_id: &str,
        query_text: &str,
        options: &RetrieveOptions,
        keep: F,
    ) -> Vec<MemoryItem>
    where
        F: Fn(&MemoryItem) -> bool,
    {
        match self.retrieve_inner(owner_id, query_text, options, keep).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(owner_id = %owner_id, error = %e, "memory retrieval degraded to empty");
                Vec::new()
            }
        }
    }

    async fn retrieve_inner<F>(
        &self,
        owner_id: &str,
        query_text: &str,
        options: &RetrieveOptions,
        keep: F,
    ) -> Result<Vec<MemoryItem>>
    where
        F: Fn(&MemoryItem) -> bool,
    {
        let query_vec = timeout(
            Duration::from_millis(self.config.provider_timeout_ms),
            self.embedder.embed(query_text),
        )
        .await
        .map_err(|_| SpotterError::Timeout("embedding provider".into()))??;

        let model = self.embedder.model_id().to_string();
        let pool = self.config.candidate_pool;
        let owner = owner_id.to_string();
        let scope = options.scope_id.clone();
        let candidates = self.storage.with_connection(move |conn| {
            queries::similarity_candidates(conn, &owner, scope.as_deref(), &model, &query_vec, pool)
        })?;

        // Stage two: recency order within the similarity pool
        let mut by_recency: Vec<MemoryItem> = candidates.into_iter().map(|(item, _)| item).collect();
        by_recency.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let cap = options.limit.min(self.config.max_context_items);
        let mut selected = Vec::new();
        let mut spent_tokens = 0usize;
        for item in by_recency {
            if selected.len() >= cap {
                break;
            }
            if !keep(&item) {
                continue;
            }
            let cost = estimate_tokens(&item.text);
            if spent_tokens + cost > options.token_budget {
                continue;
            }
            spent_tokens += cost;
            selected.push(item);
        }

        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn store_with(embedder: Arc<dyn EmbeddingProvider>) -> MemoryStore {
        MemoryStore::new(
            Storage::open_in_memory().unwrap(),
            embedder,
            MemoryConfig::default(),
        )
    }

    fn default_store() -> MemoryStore {
        store_with(Arc::new(HashingEmbedder::new(64)))
    }

    /// Embedder that fails until told otherwise
    struct FlakyEmbedder {
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SpotterError::Provider {
                    message: "503".into(),
                    retryable: true,
                });
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn model_id(&self) -> &str {
            "flaky-v1"
        }
    }

    // Ten rapid enqueues trigger an immediate flush
    #[tokio::test]
    async fn test_flush_at_threshold() {
        let store = default_store();
        for i in 0..10 {
            store
                .enqueue(MemoryInput::new("u1", format!("note {}", i)))
                .await
                .unwrap();
        }
        assert_eq!(store.pending_count("u1"), 0);

        let persisted: i64 = store
            .storage
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE owner_id = 'u1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(persisted, 10);
    }

    #[tokio::test]
    async fn test_below_threshold_stays_buffered() {
        let store = default_store();
        for i in 0..9 {
            store
                .enqueue(MemoryInput::new("u1", format!("note {}", i)))
                .await
                .unwrap();
        }
        assert_eq!(store.pending_count("u1"), 9);

        store.flush("u1").await.unwrap();
        assert_eq!(store.pending_count("u1"), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_requeues_batch() {
        let embedder = Arc::new(FlakyEmbedder {
            fail: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        });
        let store = store_with(embedder.clone());

        for i in 0..3 {
            store
                .enqueue(MemoryInput::new("u1", format!("note {}", i)))
                .await
                .unwrap();
        }
        let err = store.flush("u1").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.pending_count("u1"), 3);

        // provider recovers; the periodic path drains the buffer
        embedder.fail.store(false, Ordering::SeqCst);
        store.flush_all().await;
        assert_eq!(store.pending_count("u1"), 0);
    }

    #[tokio::test]
    async fn test_retrieve_respects_budget_and_cap() {
        let store = default_store();
        for i in 0..12 {
            store
                .enqueue(MemoryInput::new("u1", format!("squat session number {}", i)))
                .await
                .unwrap();
        }
        store.flush("u1").await.unwrap();

        let options = RetrieveOptions {
            scope_id: None,
            limit: 10,
            token_budget: 1500,
        };
        let items = store.retrieve("u1", "squat", &options).await;
        assert!(!items.is_empty());
        // hard cap: min(8, limit)
        assert!(items.len() <= 8);
        let spent: usize = items.iter().map(|m| estimate_tokens(&m.text)).sum();
        assert!(spent <= 1500);
        // recency order
        for pair in items.windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }
    }

    #[tokio::test]
    async fn test_retrieve_tiny_budget() {
        let store = default_store();
        store
            .enqueue(MemoryInput::new("u1", "a".repeat(400)))
            .await
            .unwrap();
        store
            .enqueue(MemoryInput::new("u1", "short note"))
            .await
            .unwrap();
        store.flush("u1").await.unwrap();

        let options = RetrieveOptions {
            scope_id: None,
            limit: 10,
            token_budget: 5,
        };
        // only the short note (3 tokens) fits the 5-token budget
        let items = store.retrieve("u1", "note", &options).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "short note");
    }

    #[tokio::test]
    async fn test_retrieve_filtered_tops_up_from_pool() {
        let store = default_store();
        store
            .enqueue(MemoryInput::new("u1", "older safe note"))
            .await
            .unwrap();
        store
            .enqueue(MemoryInput::new("u1", "newer rejected note"))
            .await
            .unwrap();
        store.flush("u1").await.unwrap();

        let options = RetrieveOptions {
            scope_id: None,
            limit: 1,
            token_budget: 1500,
        };
        // the rejected item is newest and would win the single slot; the
        // admission check must hand that slot to the next pool item
        let items = store
            .retrieve_filtered("u1", "note", &options, |m| !m.text.contains("rejected"))
            .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "older safe note");
    }

    #[tokio::test]
    async fn test_retrieve_fails_open() {
        let embedder = Arc::new(FlakyEmbedder {
            fail: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        });
        let store = store_with(embedder);
        let options = RetrieveOptions {
            scope_id: None,
            limit: 10,
            token_budget: 1500,
        };
        let items = store.retrieve("u1", "anything", &options).await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_scope_filter() {
        let store = default_store();
        store
            .enqueue(MemoryInput::new("u1", "cutting program deadlift").with_scope("cut-2026"))
            .await
            .unwrap();
        store
            .enqueue(MemoryInput::new("u1", "bulking program deadlift"))
            .await
            .unwrap();
        store.flush("u1").await.unwrap();

        let options = RetrieveOptions {
            scope_id: Some("cut-2026".into()),
            limit: 10,
            token_budget: 1500,
        };
        let items = store.retrieve("u1", "deadlift", &options).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].scope_id.as_deref(), Some("cut-2026"));
    }
}
