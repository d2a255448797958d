//! Elasticsearch 后端：原始文档分页、dense_vector 向量索引以及数据集登记表。

use std::time::Duration;

use async_trait::async_trait;
use gai_core::{DocumentFilter, Ingestion, RagDatabase, Result};
use gai_error::GaiError;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::{
    Catalog, ScoredRecord, SourceHit, SourcePage, SourceStore, VectorIndexMapping, VectorRecord,
    VectorStore, TRANSACTION_FIELD,
};

const ENGINE: &str = "elasticsearch";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// 存放密码的环境变量名
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "default_ingestion_index")]
    pub ingestion_index: String,
    #[serde(default = "default_registry_index")]
    pub registry_index: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ingestion_index() -> String {
    "ingestions".to_string()
}

fn default_registry_index() -> String {
    "rag-index".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl ElasticConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password_env: None,
            ingestion_index: default_ingestion_index(),
            registry_index: default_registry_index(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Clone)]
pub struct ElasticStore {
    http: Client,
    cfg: ElasticConfig,
    password: Option<String>,
}

impl ElasticStore {
    pub fn new(cfg: ElasticConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| GaiError::Configuration {
                key: "source_store.url".to_string(),
                reason: e.to_string(),
            })?;
        let password = match &cfg.password_env {
            Some(var) => Some(std::env::var(var).map_err(|_| GaiError::Configuration {
                key: var.clone(),
                reason: "environment variable not set".to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            http,
            cfg,
            password,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.url.trim_end_matches('/'), path)
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.cfg.username {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        self.auth(req).send().await.map_err(GaiError::from)
    }

    async fn fail(operation: &str, resp: Response) -> GaiError {
        let status = resp.status();
        let txt = resp.text().await.unwrap_or_default();
        GaiError::VectorStore {
            operation: operation.to_string(),
            message: format!("status={} body={}", status, txt),
        }
    }

    async fn create_if_absent(&self, index: &str, body: Value) -> Result<bool> {
        let resp = self.send(self.http.put(self.url(index)).json(&body)).await?;
        if resp.status().is_success() {
            info!(index = %index, "created elasticsearch index");
            return Ok(true);
        }
        if resp.status() == StatusCode::BAD_REQUEST {
            let txt = resp.text().await.unwrap_or_default();
            if txt.contains("resource_already_exists_exception") {
                debug!(index = %index, "index created concurrently");
                return Ok(false);
            }
            return Err(GaiError::VectorStore {
                operation: "create_index".to_string(),
                message: format!("status=400 body={}", txt),
            });
        }
        Err(Self::fail("create_index", resp).await)
    }

    async fn get_doc<T: serde::de::DeserializeOwned>(
        &self,
        index: &str,
        id: &str,
    ) -> Result<Option<T>> {
        let resp = self
            .send(self.http.get(self.url(&format!("{}/_doc/{}", index, id))))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::fail("get_document", resp).await);
        }
        let doc: GetDocResp<T> = resp.json().await.map_err(GaiError::from)?;
        Ok(if doc.found { doc.source } else { None })
    }
}

pub(crate) fn vector_mapping_body(mapping: &VectorIndexMapping) -> Value {
    let mut properties = Map::new();
    properties.insert(
        "embedding".to_string(),
        json!({
            "type": "dense_vector",
            "dims": mapping.dims,
            "index": true,
            "similarity": mapping.similarity,
        }),
    );
    for field in &mapping.text_fields {
        properties.insert(field.clone(), json!({"type": "text"}));
    }
    properties.insert("metadata".to_string(), json!({"type": "object"}));
    json!({"mappings": {"properties": properties}})
}

fn single(key: String, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key, value);
    Value::Object(map)
}

fn filter_clauses(filter: &DocumentFilter) -> Vec<Value> {
    filter
        .must
        .iter()
        .map(|c| {
            let field = crate::metadata_field(&c.field);
            let value = Value::String(c.value.clone());
            if field == "text" || field == "content" {
                json!({ "match": single(field, value) })
            } else {
                json!({ "term": single(format!("{}.keyword", field), value) })
            }
        })
        .collect()
}

#[derive(Deserialize)]
struct GetDocResp<T> {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<T>,
}

#[derive(Deserialize)]
struct BulkItemResult {
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct BulkResp {
    errors: bool,
    #[serde(default)]
    items: Vec<std::collections::HashMap<String, BulkItemResult>>,
}

#[derive(Deserialize)]
struct DeleteByQueryResp {
    #[serde(default)]
    deleted: u64,
}

#[derive(Deserialize)]
struct TotalHits {
    value: u64,
}

#[derive(Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: Option<f32>,
    #[serde(rename = "_source", default)]
    source: Value,
}

#[derive(Deserialize)]
struct RawHits {
    #[serde(default)]
    total: Option<TotalHits>,
    hits: Vec<RawHit>,
}

#[derive(Deserialize)]
struct SearchResp {
    hits: RawHits,
}

#[derive(Deserialize)]
struct VectorSource {
    text: String,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[async_trait]
impl VectorStore for ElasticStore {
    async fn exists_index(&self, name: &str) -> Result<bool> {
        let resp = self.send(self.http.head(self.url(name))).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::fail("exists_index", resp).await),
        }
    }

    #[instrument(skip(self, mapping))]
    async fn create_index_if_absent(
        &self,
        name: &str,
        mapping: &VectorIndexMapping,
    ) -> Result<bool> {
        if self.exists_index(name).await? {
            return Ok(false);
        }
        self.create_if_absent(name, vector_mapping_body(mapping)).await
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        let resp = self.send(self.http.delete(self.url(name))).await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            info!(index = %name, "deleted elasticsearch index");
            return Ok(());
        }
        Err(Self::fail("delete_index", resp).await)
    }

    async fn refresh_index(&self, name: &str) -> Result<()> {
        let resp = self
            .send(self.http.post(self.url(&format!("{}/_refresh", name))))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::fail("refresh_index", resp).await);
        }
        Ok(())
    }

    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn bulk_write(&self, name: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for r in &records {
            body.push_str(&serde_json::to_string(
                &json!({"index": {"_index": name, "_id": r.id}}),
            )?);
            body.push('\n');
            body.push_str(&serde_json::to_string(&json!({
                "text": r.text,
                "embedding": r.vector,
                "metadata": r.metadata,
            }))?);
            body.push('\n');
        }

        let resp = self
            .send(
                self.http
                    .post(self.url("_bulk"))
                    .header("content-type", "application/x-ndjson")
                    .body(body),
            )
            .await?;
        if !resp.status().is_success() {
            return Err(Self::fail("bulk_write", resp).await);
        }
        let data: BulkResp = resp.json().await.map_err(GaiError::from)?;
        if data.errors {
            let first = data
                .items
                .iter()
                .flat_map(|item| item.values())
                .find_map(|r| r.error.clone())
                .unwrap_or(Value::Null);
            warn!(index = %name, error = %first, "bulk write rejected");
            return Err(GaiError::VectorStore {
                operation: "bulk_write".to_string(),
                message: first.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn retain_transaction(&self, name: &str, transaction_id: &str) -> Result<()> {
        let term = single(
            format!("metadata.{}.keyword", TRANSACTION_FIELD),
            Value::String(transaction_id.to_string()),
        );
        let body = json!({"query": {"bool": {"must_not": [{"term": term}]}}});
        let resp = self
            .send(
                self.http
                    .post(self.url(&format!(
                        "{}/_delete_by_query?refresh=true&conflicts=proceed",
                        name
                    )))
                    .json(&body),
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(Self::fail("delete_by_query", resp).await);
        }
        let data: DeleteByQueryResp = resp.json().await.map_err(GaiError::from)?;
        info!(
            index = %name,
            %transaction_id,
            deleted = data.deleted,
            "dropped records of earlier transactions"
        );
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
        let mut knn = json!({
            "field": "embedding",
            "query_vector": vector,
            "k": k,
            "num_candidates": (k * 10).max(100),
        });
        if !filter.is_empty() {
            knn["filter"] = json!({"bool": {"must": filter_clauses(filter)}});
        }
        let body = json!({"knn": knn, "size": k});

        let resp = self
            .send(
                self.http
                    .post(self.url(&format!("{}/_search", name)))
                    .json(&body),
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(GaiError::NotFound {
                resource: format!("vector index {}", name),
            });
        }
        if !resp.status().is_success() {
            return Err(Self::fail("search", resp).await);
        }
        let data: SearchResp = resp.json().await.map_err(GaiError::from)?;
        Ok(data
            .hits
            .hits
            .into_iter()
            .filter_map(|h| match serde_json::from_value::<VectorSource>(h.source) {
                Ok(src) => Some(ScoredRecord {
                    id: h.id,
                    text: src.text,
                    score: h.score.unwrap_or(0.0),
                    vector: src.embedding,
                    metadata: src.metadata,
                }),
                Err(e) => {
                    warn!(index = %name, id = %h.id, error = %e, "skipping malformed vector hit");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl SourceStore for ElasticStore {
    #[instrument(skip(self))]
    async fn page(&self, index: &str, query: &str, from: u64, size: u64) -> Result<SourcePage> {
        let query = if query.trim().is_empty() { "*" } else { query };
        let body = json!({
            "from": from,
            "size": size,
            "track_total_hits": true,
            "query": {"bool": {"must": [{"query_string": {"query": query}}]}},
        });
        let resp = self
            .send(
                self.http
                    .post(self.url(&format!("{}/_search", index)))
                    .json(&body),
            )
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(GaiError::NotFound {
                resource: format!("source index {}", index),
            });
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(GaiError::SearchEngine {
                engine: ENGINE.to_string(),
                message: format!("status={} body={}", status, txt),
            });
        }
        let data: SearchResp = resp.json().await.map_err(GaiError::from)?;
        Ok(SourcePage {
            total: data.hits.total.map(|t| t.value).unwrap_or(0),
            hits: data
                .hits
                .hits
                .into_iter()
                .map(|h| SourceHit {
                    id: h.id,
                    source: h.source,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl Catalog for ElasticStore {
    async fn ingestion(&self, dataset_id: &str) -> Result<Option<Ingestion>> {
        self.get_doc(&self.cfg.ingestion_index, dataset_id).await
    }

    async fn ensure_registry(&self) -> Result<()> {
        let index = self.cfg.registry_index.clone();
        if self.exists_index(&index).await? {
            return Ok(());
        }
        let body = json!({
            "mappings": {
                "properties": {
                    "dataset_id": {"type": "keyword"},
                    "ingestion_description": {"type": "text"},
                    "raw_index_name": {"type": "keyword"},
                    "rag_index_name": {"type": "keyword"},
                    "created_at": {"type": "date"},
                }
            }
        });
        self.create_if_absent(&index, body).await.map(|_| ())
    }

    async fn rag_database(&self, dataset_id: &str) -> Result<Option<RagDatabase>> {
        self.get_doc(&self.cfg.registry_index, dataset_id).await
    }

    async fn upsert_rag_database(&self, record: &RagDatabase) -> Result<()> {
        let url = self.url(&format!(
            "{}/_doc/{}?refresh=true",
            self.cfg.registry_index, record.dataset_id
        ));
        let resp = self.send(self.http.put(url).json(record)).await?;
        if !resp.status().is_success() {
            return Err(Self::fail("upsert_registry", resp).await);
        }
        info!(dataset_id = %record.dataset_id, rag_index = %record.rag_index_name, "registered rag database");
        Ok(())
    }

    async fn delete_rag_database(&self, dataset_id: &str) -> Result<()> {
        let url = self.url(&format!(
            "{}/_doc/{}?refresh=true",
            self.cfg.registry_index, dataset_id
        ));
        let resp = self.send(self.http.delete(url)).await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::fail("delete_registry", resp).await)
    }
}
