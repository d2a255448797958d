pub mod elastic;
pub mod memory;
pub mod qdrant;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gai_core::{DocumentFilter, Ingestion, RagDatabase, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

pub use elastic::{ElasticConfig, ElasticStore};
pub use memory::MemoryStore;
pub use qdrant::{QdrantConfig, QdrantVectorStore};

/// 向量字段的相似度度量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Similarity {
    Cosine,
}

/// 向量索引的固定映射：一个稠密向量字段加若干原文字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexMapping {
    pub dims: usize,
    pub similarity: Similarity,
    pub text_fields: Vec<String>,
}

impl VectorIndexMapping {
    pub fn cosine(dims: usize) -> Self {
        Self {
            dims,
            similarity: Similarity::Cosine,
            text_fields: vec!["text".to_string(), "content".to_string()],
        }
    }
}

/// 写入向量索引的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: Map<String, Value>,
}

impl VectorRecord {
    pub fn new(text: impl Into<String>, vector: Vec<f32>, metadata: Map<String, Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            vector,
            metadata,
        }
    }
}

/// 相似度检索结果；后端未返回向量时 vector 为空
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub vector: Option<Vec<f32>>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHit {
    pub id: String,
    pub source: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcePage {
    pub total: u64,
    pub hits: Vec<SourceHit>,
}

/// 每条向量记录在 metadata 中携带写入它的事务 id
pub const TRANSACTION_FIELD: &str = "transaction_id";

/// 记录是否由指定事务写入
pub fn written_by(metadata: &Map<String, Value>, transaction_id: &str) -> bool {
    metadata.get(TRANSACTION_FIELD).and_then(Value::as_str) == Some(transaction_id)
}

/// 向量索引存储
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn exists_index(&self, name: &str) -> Result<bool>;

    /// 不存在时创建；返回本次是否真正创建
    async fn create_index_if_absent(&self, name: &str, mapping: &VectorIndexMapping)
        -> Result<bool>;

    /// 删除索引，索引不存在不视为错误
    async fn delete_index(&self, name: &str) -> Result<()>;

    async fn refresh_index(&self, name: &str) -> Result<()> {
        let _ = name;
        Ok(())
    }

    /// 整批写入；任一条失败则整批返回错误
    async fn bulk_write(&self, name: &str, records: Vec<VectorRecord>) -> Result<()>;

    /// 删除不是由该事务写入的记录，结果在返回前可见；索引不存在不视为错误
    async fn retain_transaction(&self, name: &str, transaction_id: &str) -> Result<()>;

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        filter: &DocumentFilter,
        k: usize,
    ) -> Result<Vec<ScoredRecord>>;
}

/// 原始文档存储，按偏移分页
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn page(&self, index: &str, query: &str, from: u64, size: u64) -> Result<SourcePage>;
}

/// 数据集登记表
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn ingestion(&self, dataset_id: &str) -> Result<Option<Ingestion>>;

    async fn ensure_registry(&self) -> Result<()>;

    async fn rag_database(&self, dataset_id: &str) -> Result<Option<RagDatabase>>;

    async fn upsert_rag_database(&self, record: &RagDatabase) -> Result<()>;

    /// 记录不存在不视为错误
    async fn delete_rag_database(&self, dataset_id: &str) -> Result<()>;
}

/// 按索引名串行化“检查并创建”，避免首次并发请求重复建索引
#[derive(Clone, Default)]
pub struct IndexGuard {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl IndexGuard {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn ensure_index(
        &self,
        store: &dyn VectorStore,
        name: &str,
        mapping: &VectorIndexMapping,
    ) -> Result<bool> {
        let lock = self.lock_for(name).await;
        let _held = lock.lock().await;
        if store.exists_index(name).await? {
            debug!(index = %name, "vector index already exists");
            return Ok(false);
        }
        store.create_index_if_absent(name, mapping).await
    }
}

/// 过滤条件中的字段名：text 指向原文，其余字段位于 metadata 下
pub(crate) fn metadata_field(field: &str) -> String {
    if field == "text" || field == "content" || field.starts_with("metadata.") {
        field.to_string()
    } else {
        format!("metadata.{}", field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrent_ensure_creates_once() {
        let store = Arc::new(MemoryStore::new());
        let guard = IndexGuard::new();
        let mapping = VectorIndexMapping::cosine(4);

        let (a, b) = tokio::join!(
            guard.ensure_index(store.as_ref(), "rag-ds", &mapping),
            guard.ensure_index(store.as_ref(), "rag-ds", &mapping),
        );
        let created = [a.unwrap(), b.unwrap()];
        assert_eq!(created.iter().filter(|c| **c).count(), 1);
        assert_eq!(store.creations("rag-ds").await, 1);
        assert_eq!(store.mapping("rag-ds").await, Some(mapping));
    }

    #[test]
    fn records_are_matched_by_transaction() {
        let mut tagged = Map::new();
        tagged.insert(TRANSACTION_FIELD.to_string(), Value::String("tx-1".into()));

        assert!(written_by(&tagged, "tx-1"));
        assert!(!written_by(&tagged, "tx-2"));
        assert!(!written_by(&Map::new(), "tx-1"));
    }

    #[test]
    fn filter_fields_are_scoped_to_metadata() {
        assert_eq!(metadata_field("text"), "text");
        assert_eq!(metadata_field("transaction_id"), "metadata.transaction_id");
        assert_eq!(metadata_field("metadata.city"), "metadata.city");
    }
}
