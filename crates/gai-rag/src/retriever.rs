use std::sync::Arc;

use gai_core::{ContextDocument, DocumentFilter};
use gai_error::{GaiError, Result};
use gai_llm::EmbedModel;
use gai_store::{Catalog, ScoredRecord, VectorStore};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::mmr::{mmr_rerank, MmrCandidate, MmrConfig};

/// DocumentMetadata 自身的字段，metadata 中同名键不再拷贝
const RESERVED_KEYS: &[&str] = &["source", "score", "title", "url", "publishedDate", "error"];

/// 数据集范围内的向量检索
pub struct Retriever {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn VectorStore>,
    embed: Arc<dyn EmbedModel>,
    mmr: MmrConfig,
}

impl Retriever {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn VectorStore>,
        embed: Arc<dyn EmbedModel>,
        mmr: MmrConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            embed,
            mmr,
        }
    }

    /// 普通模式按相似度取前 k；多样性模式先取更大的候选池再用 MMR 截到 k。
    /// 结果为空是合法的，未登记的数据集返回 NotFound。
    #[instrument(skip(self, filter), fields(dataset_id = %dataset_id))]
    pub async fn search(
        &self,
        dataset_id: &str,
        query: &str,
        filter: Option<&DocumentFilter>,
        k: usize,
        diversity: bool,
    ) -> Result<Vec<ContextDocument>> {
        let database = self
            .catalog
            .rag_database(dataset_id)
            .await?
            .ok_or_else(|| GaiError::NotFound {
                resource: format!("dataset {}", dataset_id),
            })?;

        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embed_one(query).await?;
        let fetch_k = if diversity { self.mmr.fetch_k(k) } else { k };
        let empty = DocumentFilter::default();
        let hits = self
            .store
            .search(
                &database.rag_index_name,
                &query_vector,
                filter.unwrap_or(&empty),
                fetch_k,
            )
            .await?;
        debug!(hits = hits.len(), fetch_k, diversity, "vector search finished");

        let hits = if diversity && hits.len() > 1 {
            self.rerank(&query_vector, hits, k).await?
        } else {
            hits.into_iter().take(k).collect()
        };

        hits.into_iter()
            .map(|hit| to_document(hit, &database.rag_index_name))
            .collect()
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GaiError::EmbeddingService {
                provider: "retriever".to_string(),
                message: "no embedding returned for query".to_string(),
            })
    }

    async fn rerank(
        &self,
        query_vector: &[f32],
        hits: Vec<ScoredRecord>,
        k: usize,
    ) -> Result<Vec<ScoredRecord>> {
        // 后端未返回向量的命中，按原文重新嵌入
        let missing: Vec<String> = hits
            .iter()
            .filter(|h| h.vector.is_none())
            .map(|h| h.text.clone())
            .collect();
        let mut embedded = if missing.is_empty() {
            Vec::new().into_iter()
        } else {
            let vectors = self.embed.embed(&missing).await?;
            if vectors.len() != missing.len() {
                return Err(GaiError::EmbeddingService {
                    provider: "retriever".to_string(),
                    message: format!("expected {} vectors, got {}", missing.len(), vectors.len()),
                });
            }
            vectors.into_iter()
        };

        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            let vector = match &hit.vector {
                Some(v) => v.clone(),
                None => embedded.next().unwrap_or_default(),
            };
            candidates.push(MmrCandidate { item: hit, vector });
        }
        Ok(mmr_rerank(query_vector, candidates, k, self.mmr.lambda))
    }
}

fn to_document(hit: ScoredRecord, index_name: &str) -> Result<ContextDocument> {
    let mut doc = ContextDocument::try_new(hit.text, index_name)?
        .with_score(hit.score)
        .with_extra("documentId", Value::String(hit.id));
    for (key, value) in hit.metadata {
        if !RESERVED_KEYS.contains(&key.as_str()) {
            doc = doc.with_extra(key, value);
        }
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use gai_core::RagDatabase;
    use gai_store::{MemoryStore, VectorIndexMapping, VectorRecord};
    use serde_json::{json, Map};

    use super::*;
    use crate::testing::HashEmbedModel;

    const DIMS: usize = 32;

    async fn seeded(texts: &[&str]) -> (MemoryStore, Arc<HashEmbedModel>) {
        let store = MemoryStore::new();
        let embed = Arc::new(HashEmbedModel::new(DIMS));
        store.ensure_registry().await.unwrap();
        store
            .upsert_rag_database(&RagDatabase {
                dataset_id: "cities".into(),
                ingestion_description: "cities".into(),
                raw_index_name: "raw-cities".into(),
                rag_index_name: "rag-cities".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .create_index_if_absent("rag-cities", &VectorIndexMapping::cosine(DIMS))
            .await
            .unwrap();
        let records = texts
            .iter()
            .map(|t| {
                let mut meta = Map::new();
                meta.insert("transaction_id".into(), json!("tx1"));
                meta.insert("source".into(), json!("should not leak"));
                VectorRecord::new(*t, embed.vector(t), meta)
            })
            .collect();
        store.bulk_write("rag-cities", records).await.unwrap();
        (store, embed)
    }

    fn retriever(store: &MemoryStore, embed: Arc<HashEmbedModel>) -> Retriever {
        Retriever::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            embed,
            MmrConfig::default(),
        )
    }

    #[tokio::test]
    async fn unknown_dataset_is_not_found() {
        let (store, embed) = seeded(&[]).await;
        let err = retriever(&store, embed)
            .search("nope", "paris", None, 5, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GaiError::NotFound { .. }));
    }

    #[tokio::test]
    async fn empty_index_yields_no_documents() {
        let (store, embed) = seeded(&[]).await;
        let docs = retriever(&store, embed)
            .search("cities", "paris", None, 5, false)
            .await
            .unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn plain_mode_ranks_by_similarity() {
        let (store, embed) = seeded(&[
            "**city:** Paris  \n**country:** France",
            "**city:** Berlin  \n**country:** Germany",
            "**city:** Madrid  \n**country:** Spain",
        ])
        .await;
        let docs = retriever(&store, embed)
            .search("cities", "Paris France", None, 2, false)
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].content.contains("Paris"));
        assert_eq!(docs[0].source(), "rag-cities");
        assert_eq!(docs[0].metadata.extra["transaction_id"], "tx1");
        assert!(!docs[0].metadata.extra.contains_key("source"));
        assert!(docs[0].metadata.score.is_some());
    }

    #[tokio::test]
    async fn filter_restricts_matches() {
        let (store, embed) = seeded(&["Paris France", "Berlin Germany"]).await;
        let filter = DocumentFilter::text("berlin");
        let docs = retriever(&store, embed)
            .search("cities", "Paris France", Some(&filter), 5, false)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, "Berlin Germany");
    }

    #[tokio::test]
    async fn diversity_mode_skips_near_duplicates() {
        let (store, embed) = seeded(&[
            "paris france capital",
            "paris france capital city",
            "berlin capital germany",
        ])
        .await;
        let docs = retriever(&store, embed)
            .search("cities", "paris capital", None, 2, true)
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].content, "paris france capital");
        assert_eq!(docs[1].content, "berlin capital germany");
    }
}
