use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gai_core::{DocumentFilter, Ingestion, RagDatabase, Result};
use gai_error::GaiError;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::{
    written_by, Catalog, ScoredRecord, SourceHit, SourcePage, SourceStore, VectorIndexMapping,
    VectorRecord, VectorStore,
};

struct MemoryIndex {
    mapping: VectorIndexMapping,
    records: Vec<VectorRecord>,
}

#[derive(Default)]
struct MemoryState {
    vector_indices: HashMap<String, MemoryIndex>,
    creations: HashMap<String, usize>,
    sources: HashMap<String, Vec<SourceHit>>,
    ingestions: HashMap<String, Ingestion>,
    registry: Option<HashMap<String, RagDatabase>>,
}

/// 基于内存的存储，同时实现向量索引、原始文档与登记表
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 导入原始文档并登记对应的 ingestion
    pub async fn seed_dataset(&self, ingestion: Ingestion, documents: Vec<Value>) {
        let mut state = self.state.write().await;
        let hits = documents
            .into_iter()
            .enumerate()
            .map(|(i, source)| SourceHit {
                id: format!("{}-{}", ingestion.id, i),
                source,
            })
            .collect();
        state.sources.insert(ingestion.index_name.clone(), hits);
        state.ingestions.insert(ingestion.id.clone(), ingestion);
    }

    pub async fn document_count(&self, index: &str) -> usize {
        let state = self.state.read().await;
        state
            .vector_indices
            .get(index)
            .map(|i| i.records.len())
            .unwrap_or(0)
    }

    pub async fn records(&self, index: &str) -> Vec<VectorRecord> {
        let state = self.state.read().await;
        state
            .vector_indices
            .get(index)
            .map(|i| i.records.clone())
            .unwrap_or_default()
    }

    pub async fn mapping(&self, index: &str) -> Option<VectorIndexMapping> {
        let state = self.state.read().await;
        state.vector_indices.get(index).map(|i| i.mapping.clone())
    }

    /// 索引被真正创建的次数
    pub async fn creations(&self, index: &str) -> usize {
        let state = self.state.read().await;
        state.creations.get(index).copied().unwrap_or(0)
    }
}

fn matches_filter(record: &VectorRecord, filter: &DocumentFilter) -> bool {
    filter.must.iter().all(|clause| {
        let field = crate::metadata_field(&clause.field);
        if field == "text" || field == "content" {
            let text = record.text.to_lowercase();
            // 与全文 match 查询一致：任一词项命中即可
            clause
                .value
                .split_whitespace()
                .any(|term| text.contains(&term.to_lowercase()))
        } else {
            let key = field.trim_start_matches("metadata.");
            match record.metadata.get(key) {
                Some(Value::String(s)) => s == &clause.value,
                Some(other) => other.to_string() == clause.value,
                None => false,
            }
        }
    })
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn source_matches(source: &Value, query: &str) -> bool {
    let query = query.trim();
    if query.is_empty() || query == "*" {
        return true;
    }
    let needle = query.to_lowercase();
    match source {
        Value::Object(map) => map.values().any(|v| source_matches(v, query)),
        Value::Array(items) => items.iter().any(|v| source_matches(v, query)),
        Value::String(s) => s.to_lowercase().contains(&needle),
        other => other.to_string().to_lowercase().contains(&needle),
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn exists_index(&self, name: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.vector_indices.contains_key(name))
    }

    async fn create_index_if_absent(
        &self,
        name: &str,
        mapping: &VectorIndexMapping,
    ) -> Result<bool> {
        if self.exists_index(name).await? {
            return Ok(false);
        }
        // 检查与创建之间让出调度，与远端存储的往返行为一致
        tokio::task::yield_now().await;
        let mut state = self.state.write().await;
        state.vector_indices.insert(
            name.to_string(),
            MemoryIndex {
                mapping: mapping.clone(),
                records: Vec::new(),
            },
        );
        *state.creations.entry(name.to_string()).or_insert(0) += 1;
        info!(index = %name, dims = mapping.dims, "created in-memory vector index");
        Ok(true)
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.vector_indices.remove(name).is_some() {
            info!(index = %name, "deleted in-memory vector index");
        }
        Ok(())
    }

    async fn bulk_write(&self, name: &str, records: Vec<VectorRecord>) -> Result<()> {
        let mut state = self.state.write().await;
        let index = state
            .vector_indices
            .get_mut(name)
            .ok_or_else(|| GaiError::NotFound {
                resource: format!("vector index {}", name),
            })?;
        if let Some(bad) = records.iter().find(|r| r.vector.len() != index.mapping.dims) {
            return Err(GaiError::VectorStore {
                operation: "bulk_write".to_string(),
                message: format!(
                    "record {} has {} dims, index expects {}",
                    bad.id,
                    bad.vector.len(),
                    index.mapping.dims
                ),
            });
        }
        index.records.extend(records);
        Ok(())
    }

    async fn retain_transaction(&self, name: &str, transaction_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(index) = state.vector_indices.get_mut(name) {
            let before = index.records.len();
            index.records.retain(|r| written_by(&r.metadata, transaction_id));
            info!(
                index = %name,
                %transaction_id,
                removed = before - index.records.len(),
                "dropped records of earlier transactions"
            );
        }
        Ok(())
    }

    #[instrument(skip(self, vector, filter))]
    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        filter: &DocumentFilter,
        k: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let state = self.state.read().await;
        let index = state
            .vector_indices
            .get(name)
            .ok_or_else(|| GaiError::NotFound {
                resource: format!("vector index {}", name),
            })?;

        let mut scored: Vec<ScoredRecord> = index
            .records
            .iter()
            .filter(|r| matches_filter(r, filter))
            .map(|r| ScoredRecord {
                id: r.id.clone(),
                text: r.text.clone(),
                score: cosine_similarity(vector, &r.vector),
                vector: Some(r.vector.clone()),
                metadata: r.metadata.clone(),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn page(&self, index: &str, query: &str, from: u64, size: u64) -> Result<SourcePage> {
        let state = self.state.read().await;
        let hits = state.sources.get(index).ok_or_else(|| GaiError::NotFound {
            resource: format!("source index {}", index),
        })?;
        let matching: Vec<&SourceHit> = hits.iter().filter(|h| source_matches(&h.source, query)).collect();
        Ok(SourcePage {
            total: matching.len() as u64,
            hits: matching
                .into_iter()
                .skip(from as usize)
                .take(size as usize)
                .cloned()
                .collect(),
        })
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn ingestion(&self, dataset_id: &str) -> Result<Option<Ingestion>> {
        let state = self.state.read().await;
        Ok(state.ingestions.get(dataset_id).cloned())
    }

    async fn ensure_registry(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.registry.get_or_insert_with(HashMap::new);
        Ok(())
    }

    async fn rag_database(&self, dataset_id: &str) -> Result<Option<RagDatabase>> {
        let state = self.state.read().await;
        Ok(state
            .registry
            .as_ref()
            .and_then(|r| r.get(dataset_id).cloned()))
    }

    async fn upsert_rag_database(&self, record: &RagDatabase) -> Result<()> {
        let mut state = self.state.write().await;
        let registry = state.registry.as_mut().ok_or_else(|| GaiError::NotFound {
            resource: "rag registry".to_string(),
        })?;
        registry.insert(record.dataset_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_rag_database(&self, dataset_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(registry) = state.registry.as_mut() {
            registry.remove(dataset_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Map};

    fn record(text: &str, vector: Vec<f32>, tx: &str) -> VectorRecord {
        let mut meta = Map::new();
        meta.insert("transaction_id".into(), json!(tx));
        VectorRecord::new(text, vector, meta)
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_and_filters() {
        let store = MemoryStore::new();
        store
            .create_index_if_absent("rag-a", &VectorIndexMapping::cosine(2))
            .await
            .unwrap();
        store
            .bulk_write(
                "rag-a",
                vec![
                    record("Paris is in France", vec![1.0, 0.0], "t1"),
                    record("Berlin is in Germany", vec![0.0, 1.0], "t1"),
                    record("Lyon is in France", vec![0.9, 0.1], "t2"),
                ],
            )
            .await
            .unwrap();

        let all = store
            .search("rag-a", &[1.0, 0.0], &DocumentFilter::default(), 2)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].text, "Paris is in France");

        let filtered = store
            .search("rag-a", &[1.0, 0.0], &DocumentFilter::text("germany"), 5)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);

        let by_tx = store
            .search(
                "rag-a",
                &[1.0, 0.0],
                &DocumentFilter::default().with("transaction_id", "t2"),
                5,
            )
            .await
            .unwrap();
        assert_eq!(by_tx[0].text, "Lyon is in France");
    }

    #[tokio::test]
    async fn bulk_write_rejects_wrong_dims_atomically() {
        let store = MemoryStore::new();
        store
            .create_index_if_absent("rag-b", &VectorIndexMapping::cosine(2))
            .await
            .unwrap();
        let res = store
            .bulk_write(
                "rag-b",
                vec![record("ok", vec![1.0, 0.0], "t"), record("bad", vec![1.0], "t")],
            )
            .await;
        assert!(res.is_err());
        assert_eq!(store.document_count("rag-b").await, 0);
    }

    #[tokio::test]
    async fn pages_source_documents() {
        let store = MemoryStore::new();
        let ingestion = Ingestion {
            id: "ds".into(),
            ingestion_description: "cities".into(),
            files: vec![],
            index_name: "raw-ds".into(),
            created_at: Utc::now(),
            total_documents: 3,
        };
        store
            .seed_dataset(
                ingestion,
                vec![json!({"city": "Paris"}), json!({"city": "Berlin"}), json!({"city": "Parma"})],
            )
            .await;

        let page = store.page("raw-ds", "par", 0, 10).await.unwrap();
        assert_eq!(page.total, 2);
        let page = store.page("raw-ds", "*", 2, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.hits.len(), 1);
        assert!(store.page("missing", "*", 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn registry_requires_ensure() {
        let store = MemoryStore::new();
        let record = RagDatabase {
            dataset_id: "ds".into(),
            ingestion_description: "d".into(),
            raw_index_name: "raw-ds".into(),
            rag_index_name: "rag-ds".into(),
            created_at: Utc::now(),
        };
        assert!(store.upsert_rag_database(&record).await.is_err());
        store.ensure_registry().await.unwrap();
        store.upsert_rag_database(&record).await.unwrap();
        assert_eq!(store.rag_database("ds").await.unwrap(), Some(record));
        store.delete_rag_database("ds").await.unwrap();
        assert!(store.rag_database("ds").await.unwrap().is_none());
    }
}
