//! Vector retrieval (C3): embeds a query, fans out to shard collections in
//! parallel, fuses their ranked lists via Reciprocal Rank Fusion, and
//! materializes the top-K passages from the canonical passage collection.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A passage candidate as returned by retrieval, before reranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePassage {
    pub shard_id: String,
    pub passage_id: i64,
    pub document: String,
    pub metadata: HashMap<String, String>,
}

/// Errors the retriever can surface to the orchestrator. Per-shard query
/// failures are contained internally and never reach this type; only
/// materialization failure (the full passage collection is unreachable)
/// propagates.
#[derive(Debug, Clone, Error)]
pub enum RetrieverError {
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
    #[error("passage materialization failed: {0}")]
    MaterializationFailed(String),
    #[error("retrieval cancelled")]
    Cancelled,
}

/// Embeds query text into a dense vector. The embedding backend itself is
/// an opaque external capability.
#[async_trait]
pub trait EmbeddingCapability: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrieverError>;
}

/// One `(passage_id, rank)` hit from a single shard query, rank 1-based.
#[derive(Debug, Clone, Copy)]
pub struct ShardHit {
    pub passage_id: i64,
    pub rank: u32,
}

/// A sharded vector store: per-shard nearest-neighbor query plus bulk
/// materialization from the canonical passage collection. An opaque
/// external capability; this crate only depends on the shape below.
#[async_trait]
pub trait VectorStoreCapability: Send + Sync {
    /// Query a single shard collection, returning hits ordered best-first.
    /// A shard-level failure is reported via `Err`; the caller contains it.
    async fn query_shard(
        &self,
        shard_id: &str,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&HashMap<String, String>>,
    ) -> Result<Vec<ShardHit>, String>;

    /// Fetch full passage records for the given stable ids from the
    /// canonical passage collection, in any order.
    async fn materialize(&self, passage_ids: &[i64]) -> Result<Vec<CandidatePassage>, String>;
}

/// Retriever configuration: shard names, RRF constant, result sizing.
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub shard_collections: Vec<String>,
    pub top_k_per_shard: usize,
    pub max_results: usize,
    pub k_rrf: f64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            shard_collections: Vec::new(),
            top_k_per_shard: 10,
            max_results: 20,
            k_rrf: 60.0,
        }
    }
}

pub struct VectorRetriever {
    embedder: Box<dyn EmbeddingCapability>,
    store: Box<dyn VectorStoreCapability>,
    config: RetrieverConfig,
}

impl VectorRetriever {
    pub fn new(embedder: Box<dyn EmbeddingCapability>, store: Box<dyn VectorStoreCapability>, config: RetrieverConfig) -> Self {
        Self { embedder, store, config }
    }

    /// Fuse per-shard hit lists into one ranking via Reciprocal Rank Fusion.
    /// `score(id) = sum(1 / (k_rrf + rank))` over every shard that returned
    /// the id. Deterministic regardless of shard iteration order.
    fn fuse(&self, shard_results: &[Vec<ShardHit>]) -> Vec<(i64, f64)> {
        let mut scores: HashMap<i64, f64> = HashMap::new();
        for hits in shard_results {
            for hit in hits {
                *scores.entry(hit.passage_id).or_insert(0.0) += 1.0 / (self.config.k_rrf + hit.rank as f64);
            }
        }

        let mut fused: Vec<(i64, f64)> = scores.into_iter().collect();
        fused.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        fused
    }

    /// Run retrieval for one query: embed, fan out to shards, fuse, and
    /// materialize the top-ranked passages in fused order. The shard
    /// fan-out and the materialization call both race `cancellation`, so a
    /// turn cancelled mid-retrieval doesn't wait for either to complete.
    pub async fn retrieve(
        &self,
        query_text: &str,
        filter: Option<HashMap<String, String>>,
        cancellation: &CancellationToken,
    ) -> Result<Vec<CandidatePassage>, RetrieverError> {
        if cancellation.is_cancelled() {
            return Err(RetrieverError::Cancelled);
        }

        let embedding = self.embedder.embed(query_text).await?;

        let shard_futures = self.config.shard_collections.iter().map(|shard_id| {
            let embedding = embedding.clone();
            let filter = filter.clone();
            async move {
                match self.store.query_shard(shard_id, &embedding, self.config.top_k_per_shard, filter.as_ref()).await {
                    Ok(hits) => hits,
                    Err(err) => {
                        warn!(shard_id, error = %err, "shard query failed, continuing with remaining shards");
                        Vec::new()
                    }
                }
            }
        });
        let shard_results: Vec<Vec<ShardHit>> = tokio::select! {
            _ = cancellation.cancelled() => return Err(RetrieverError::Cancelled),
            results = join_all(shard_futures) => results,
        };

        let fused = self.fuse(&shard_results);
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let selected: Vec<i64> = fused.iter().take(self.config.max_results).map(|(id, _)| *id).collect();

        if cancellation.is_cancelled() {
            return Err(RetrieverError::Cancelled);
        }

        let materialized = self
            .store
            .materialize(&selected)
            .await
            .map_err(RetrieverError::MaterializationFailed)?;

        let mut by_id: HashMap<i64, CandidatePassage> = materialized.into_iter().map(|p| (p.passage_id, p)).collect();

        let ordered: Vec<CandidatePassage> = selected.into_iter().filter_map(|id| by_id.remove(&id)).collect();
        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingCapability for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, RetrieverError> {
            Ok(vec![0.1, 0.2, 0.3])
        }
    }

    struct MockStore {
        per_shard: HashMap<String, Vec<ShardHit>>,
        passages: Vec<CandidatePassage>,
        fail_shards: Vec<String>,
    }

    #[async_trait]
    impl VectorStoreCapability for MockStore {
        async fn query_shard(
            &self,
            shard_id: &str,
            _embedding: &[f32],
            _top_k: usize,
            _filter: Option<&HashMap<String, String>>,
        ) -> Result<Vec<ShardHit>, String> {
            if self.fail_shards.contains(&shard_id.to_string()) {
                return Err("shard unreachable".to_string());
            }
            Ok(self.per_shard.get(shard_id).cloned().unwrap_or_default())
        }

        async fn materialize(&self, passage_ids: &[i64]) -> Result<Vec<CandidatePassage>, String> {
            Ok(self.passages.iter().filter(|p| passage_ids.contains(&p.passage_id)).cloned().collect())
        }
    }

    fn passage(id: i64) -> CandidatePassage {
        CandidatePassage { shard_id: "s".to_string(), passage_id: id, document: format!("doc {id}"), metadata: HashMap::new() }
    }

    #[tokio::test]
    async fn fuses_and_materializes_in_fused_order() {
        let mut per_shard = HashMap::new();
        per_shard.insert("a".to_string(), vec![ShardHit { passage_id: 1, rank: 1 }, ShardHit { passage_id: 2, rank: 2 }]);
        per_shard.insert("b".to_string(), vec![ShardHit { passage_id: 2, rank: 1 }]);

        let store = MockStore { per_shard, passages: vec![passage(1), passage(2)], fail_shards: Vec::new() };
        let config = RetrieverConfig { shard_collections: vec!["a".to_string(), "b".to_string()], top_k_per_shard: 5, max_results: 5, k_rrf: 60.0 };
        let retriever = VectorRetriever::new(Box::new(FixedEmbedder), Box::new(store), config);

        let results = retriever.retrieve("query", None, &CancellationToken::new()).await.unwrap();
        // Passage 2 appears in both shards (higher fused score) and should rank first.
        assert_eq!(results[0].passage_id, 2);
        assert_eq!(results[1].passage_id, 1);
    }

    #[tokio::test]
    async fn rrf_score_is_invariant_under_shard_permutation() {
        let retriever_a = VectorRetriever::new(
            Box::new(FixedEmbedder),
            Box::new(MockStore { per_shard: HashMap::new(), passages: Vec::new(), fail_shards: Vec::new() }),
            RetrieverConfig::default(),
        );

        let shard_x = vec![ShardHit { passage_id: 1, rank: 1 }, ShardHit { passage_id: 2, rank: 2 }];
        let shard_y = vec![ShardHit { passage_id: 2, rank: 1 }];

        let forward = retriever_a.fuse(&[shard_x.clone(), shard_y.clone()]);
        let reversed = retriever_a.fuse(&[shard_y, shard_x]);

        assert_eq!(forward, reversed);
    }

    #[tokio::test]
    async fn failing_shard_does_not_prevent_other_shards_from_contributing() {
        let mut per_shard = HashMap::new();
        per_shard.insert("good".to_string(), vec![ShardHit { passage_id: 9, rank: 1 }]);

        let store = MockStore {
            per_shard,
            passages: vec![passage(9)],
            fail_shards: vec!["bad".to_string()],
        };
        let config = RetrieverConfig { shard_collections: vec!["good".to_string(), "bad".to_string()], top_k_per_shard: 5, max_results: 5, k_rrf: 60.0 };
        let retriever = VectorRetriever::new(Box::new(FixedEmbedder), Box::new(store), config);

        let results = retriever.retrieve("query", None, &CancellationToken::new()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].passage_id, 9);
    }

    #[tokio::test]
    async fn empty_fused_scores_yields_empty_list() {
        let store = MockStore { per_shard: HashMap::new(), passages: Vec::new(), fail_shards: Vec::new() };
        let config = RetrieverConfig { shard_collections: vec!["a".to_string()], top_k_per_shard: 5, max_results: 5, k_rrf: 60.0 };
        let retriever = VectorRetriever::new(Box::new(FixedEmbedder), Box::new(store), config);

        let results = retriever.retrieve("query", None, &CancellationToken::new()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn ties_broken_by_lower_passage_id() {
        let mut per_shard = HashMap::new();
        per_shard.insert("a".to_string(), vec![ShardHit { passage_id: 5, rank: 1 }, ShardHit { passage_id: 3, rank: 1 }]);

        let store = MockStore { per_shard, passages: vec![passage(3), passage(5)], fail_shards: Vec::new() };
        let config = RetrieverConfig { shard_collections: vec!["a".to_string()], top_k_per_shard: 5, max_results: 5, k_rrf: 60.0 };
        let retriever = VectorRetriever::new(Box::new(FixedEmbedder), Box::new(store), config);

        let results = retriever.retrieve("query", None, &CancellationToken::new()).await.unwrap();
        assert_eq!(results[0].passage_id, 3);
        assert_eq!(results[1].passage_id, 5);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_embedding() {
        let store = MockStore { per_shard: HashMap::new(), passages: Vec::new(), fail_shards: Vec::new() };
        let config = RetrieverConfig { shard_collections: vec!["a".to_string()], top_k_per_shard: 5, max_results: 5, k_rrf: 60.0 };
        let retriever = VectorRetriever::new(Box::new(FixedEmbedder), Box::new(store), config);

        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let result = retriever.retrieve("query", None, &cancellation).await;
        assert!(matches!(result, Err(RetrieverError::Cancelled)));
    }
}
