use std::collections::HashMap;

use async_trait::async_trait;
use gai_core::{DocumentFilter, Result};
use gai_error::GaiError;
use qdrant_client::{
    qdrant::{
        point_id::PointIdOptions, value::Kind, with_payload_selector::SelectorOptions, Condition,
        CreateCollectionBuilder, DeleteCollectionBuilder, DeletePointsBuilder, Distance, Filter,
        ListValue, PointId,
        PointStruct, SearchPoints, Struct, UpsertPoints, Value as QValue, VectorParamsBuilder,
        WithPayloadSelector,
    },
    Qdrant,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::{info, instrument};

use crate::{
    ScoredRecord, Similarity, VectorIndexMapping, VectorRecord, VectorStore, TRANSACTION_FIELD,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    pub url: String,
    /// 存放 API key 的环境变量名
    #[serde(default)]
    pub api_key_env: Option<String>,
}

/// 基于 Qdrant collection 的向量索引；一个向量索引对应一个 collection
pub struct QdrantVectorStore {
    client: Qdrant,
}

impl QdrantVectorStore {
    pub fn new(cfg: &QdrantConfig) -> Result<Self> {
        let mut builder = Qdrant::from_url(&cfg.url);
        if let Some(var) = &cfg.api_key_env {
            let key = std::env::var(var).map_err(|_| GaiError::Configuration {
                key: var.clone(),
                reason: "environment variable not set".to_string(),
            })?;
            builder = builder.api_key(key);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

pub(crate) fn json_to_qdrant(value: Value) -> QValue {
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Kind::StringValue(s),
        Value::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(json_to_qdrant).collect(),
        }),
        Value::Object(map) => Kind::StructValue(Struct {
            fields: map
                .into_iter()
                .map(|(k, v)| (k, json_to_qdrant(v)))
                .collect(),
        }),
    };
    QValue { kind: Some(kind) }
}

pub(crate) fn qdrant_to_json(value: QValue) -> Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::Number(Number::from(i)),
        Some(Kind::DoubleValue(f)) => Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(qdrant_to_json).collect())
        }
        Some(Kind::StructValue(st)) => Value::Object(
            st.fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_to_json(v)))
                .collect(),
        ),
    }
}

fn point_id_string(id: Option<PointId>) -> String {
    match id.and_then(|p| p.point_id_options) {
        Some(PointIdOptions::Uuid(u)) => u,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

fn build_filter(filter: &DocumentFilter) -> Option<Filter> {
    if filter.is_empty() {
        return None;
    }
    let must: Vec<Condition> = filter
        .must
        .iter()
        .map(|c| {
            let field = crate::metadata_field(&c.field);
            if field == "text" || field == "content" {
                Condition::matches_text(field, c.value.clone())
            } else {
                Condition::matches(field, c.value.clone())
            }
        })
        .collect();
    Some(Filter::must(must))
}

/// 匹配不是由该事务写入的点
fn other_transactions(transaction_id: &str) -> Filter {
    Filter::must_not([Condition::matches(
        format!("metadata.{}", TRANSACTION_FIELD),
        transaction_id.to_string(),
    )])
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn exists_index(&self, name: &str) -> Result<bool> {
        Ok(self.client.collection_exists(name).await?)
    }

    #[instrument(skip(self, mapping))]
    async fn create_index_if_absent(
        &self,
        name: &str,
        mapping: &VectorIndexMapping,
    ) -> Result<bool> {
        if self.client.collection_exists(name).await? {
            return Ok(false);
        }
        let distance = match mapping.similarity {
            Similarity::Cosine => Distance::Cosine,
        };
        self.client
            .create_collection(
                CreateCollectionBuilder::new(name)
                    .vectors_config(VectorParamsBuilder::new(mapping.dims as u64, distance).build()),
            )
            .await?;
        info!(collection = %name, dims = mapping.dims, "created qdrant collection");
        Ok(true)
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        if !self.client.collection_exists(name).await? {
            return Ok(());
        }
        self.client
            .delete_collection(DeleteCollectionBuilder::new(name).build())
            .await?;
        info!(collection = %name, "deleted qdrant collection");
        Ok(())
    }

    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn bulk_write(&self, name: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let points: Vec<PointStruct> = records
            .into_iter()
            .map(|r| {
                let mut payload: HashMap<String, QValue> = HashMap::new();
                payload.insert("text".to_string(), json_to_qdrant(Value::String(r.text)));
                payload.insert(
                    "metadata".to_string(),
                    json_to_qdrant(Value::Object(r.metadata)),
                );
                PointStruct {
                    id: Some(r.id.into()),
                    vectors: Some(r.vector.into()),
                    payload,
                }
            })
            .collect();

        // wait=true 使写入在返回前可见
        let request = UpsertPoints {
            collection_name: name.to_string(),
            wait: Some(true),
            points,
            ..Default::default()
        };
        self.client
            .upsert_points(request)
            .await
            .map_err(|e| GaiError::VectorStore {
                operation: "upsert_points".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn retain_transaction(&self, name: &str, transaction_id: &str) -> Result<()> {
        if !self.client.collection_exists(name).await? {
            return Ok(());
        }
        self.client
            .delete_points(
                DeletePointsBuilder::new(name)
                    .points(other_transactions(transaction_id))
                    .wait(true),
            )
            .await
            .map_err(|e| GaiError::VectorStore {
                operation: "delete_points".to_string(),
                message: e.to_string(),
            })?;
        info!(collection = %name, %transaction_id, "dropped points of earlier transactions");
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
        let request = SearchPoints {
            collection_name: name.to_string(),
            vector: vector.to_vec(),
            limit: k as u64,
            filter: build_filter(filter),
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(SelectorOptions::Enable(true)),
            }),
            ..Default::default()
        };
        let response = self
            .client
            .search_points(request)
            .await
            .map_err(|e| GaiError::VectorStore {
                operation: "search".to_string(),
                message: e.to_string(),
            })?;

        Ok(response
            .result
            .into_iter()
            .map(|point| {
                let mut payload = point.payload;
                let text = payload
                    .remove("text")
                    .map(qdrant_to_json)
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                let metadata = match payload.remove("metadata").map(qdrant_to_json) {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                ScoredRecord {
                    id: point_id_string(point.id),
                    text,
                    score: point.score,
                    vector: None,
                    metadata,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_conversion_keeps_nested_values() {
        let original = json!({
            "transaction_id": "abc",
            "count": 3,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "nested": {"ok": true, "none": null}
        });
        let back = qdrant_to_json(json_to_qdrant(original.clone()));
        assert_eq!(back, original);
    }

    #[test]
    fn retain_filter_excludes_the_current_transaction() {
        let filter = other_transactions("tx-1");
        assert!(filter.must.is_empty());
        assert_eq!(filter.must_not.len(), 1);
    }

    #[test]
    fn empty_filter_builds_nothing() {
        assert!(build_filter(&DocumentFilter::default()).is_none());
        assert!(build_filter(&DocumentFilter::text("x")).is_some());
    }
}
