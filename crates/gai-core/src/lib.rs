use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use gai_error::GaiError;

// ========== 对话 ==========

/// 一轮已完成的问答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub prompt: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatEntry {
    pub fn new(prompt: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            response: response.into(),
            timestamp: Utc::now(),
        }
    }
}

// ========== 上下文文档 ==========

/// 文档来源标签，保证非空
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Provenance(String);

impl Provenance {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Provenance {
    type Error = GaiError;

    fn try_from(value: String) -> Result<Self> {
        if value.trim().is_empty() {
            return Err(GaiError::Validation {
                message: "context document source must not be empty".to_string(),
            });
        }
        Ok(Self(value))
    }
}

impl TryFrom<&str> for Provenance {
    type Error = GaiError;

    fn try_from(value: &str) -> Result<Self> {
        Self::try_from(value.to_string())
    }
}

impl From<Provenance> for String {
    fn from(p: Provenance) -> Self {
        p.0
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub source: Provenance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    /// 工具执行失败时为 true，content 为错误描述
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 检索或工具产生的一段证据文本，创建后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    pub content: String,
    pub metadata: DocumentMetadata,
}

impl ContextDocument {
    pub fn new(content: impl Into<String>, source: Provenance) -> Self {
        Self {
            content: content.into(),
            metadata: DocumentMetadata {
                source,
                score: None,
                title: None,
                url: None,
                published_date: None,
                error: false,
                extra: Map::new(),
            },
        }
    }

    pub fn try_new(content: impl Into<String>, source: &str) -> Result<Self> {
        Ok(Self::new(content, Provenance::try_from(source)?))
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.metadata.score = Some(score);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.metadata.title = Some(title.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.metadata.url = Some(url.into());
        self
    }

    pub fn with_published_date(mut self, date: Option<String>) -> Self {
        self.metadata.published_date = date;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.extra.insert(key.into(), value);
        self
    }

    pub fn as_error(mut self) -> Self {
        self.metadata.error = true;
        self
    }

    pub fn source(&self) -> &str {
        self.metadata.source.as_str()
    }
}

// ========== 问答请求与流事件 ==========

/// 精确匹配条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchClause {
    pub field: String,
    pub value: String,
}

/// 检索过滤条件，所有子句须同时满足
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentFilter {
    #[serde(default)]
    pub must: Vec<MatchClause>,
}

impl DocumentFilter {
    /// 对文本字段做词项匹配
    pub fn text(term: impl Into<String>) -> Self {
        Self::default().with("text", term)
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.must.push(MatchClause {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RagRequest {
    pub dataset_id: String,
    pub question: String,
    #[serde(default)]
    pub filter: Option<DocumentFilter>,
    #[serde(default)]
    pub history: Vec<ChatEntry>,
}

/// 回答流中的单个事件；流关闭即表示完成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEvent {
    Context(Vec<ContextDocument>),
    Answer(String),
}

/// 非流式问答结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagAnswer {
    pub question: String,
    pub context: Vec<ContextDocument>,
    pub answer: String,
}

// ========== 向量化流水线 ==========

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curated_content: Option<String>,
    pub finished: bool,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_document: u64,
    pub current_document_index: u64,
    pub start_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl EmbeddingEvent {
    pub fn started(start_date: DateTime<Utc>) -> Self {
        Self {
            message: "Embedding all documents".to_string(),
            original_content: None,
            curated_content: None,
            finished: false,
            failed: false,
            error: None,
            total_document: 0,
            current_document_index: 0,
            start_date,
            end_date: None,
        }
    }

    pub fn progress(
        index: u64,
        total: u64,
        original: String,
        curated: String,
        start_date: DateTime<Utc>,
    ) -> Self {
        Self {
            message: format!("Embedding document {} of {}", index, total),
            original_content: Some(original),
            curated_content: Some(curated),
            finished: false,
            failed: false,
            error: None,
            total_document: total,
            current_document_index: index,
            start_date,
            end_date: None,
        }
    }

    pub fn finished(total: u64, start_date: DateTime<Utc>) -> Self {
        Self {
            message: "All documents embedded successfully".to_string(),
            original_content: None,
            curated_content: None,
            finished: true,
            failed: false,
            error: None,
            total_document: total,
            current_document_index: total,
            start_date,
            end_date: Some(Utc::now()),
        }
    }

    pub fn failed(
        error: &GaiError,
        total: u64,
        current: u64,
        start_date: DateTime<Utc>,
    ) -> Self {
        Self {
            message: format!("Embedding failed: {}", error),
            original_content: None,
            curated_content: None,
            finished: false,
            failed: true,
            error: serde_json::to_string(error).ok(),
            total_document: total,
            current_document_index: current,
            start_date,
            end_date: Some(Utc::now()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finished || self.failed
    }
}

/// 一次向量化运行的追踪信息，写入的每个文档都带 transaction_id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionTransaction {
    pub transaction_id: String,
    pub index_name: String,
    pub description: String,
    pub files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub total_documents: u64,
}

impl IngestionTransaction {
    pub fn begin(ingestion: &Ingestion) -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(10);
        Self {
            transaction_id: id,
            index_name: ingestion.index_name.clone(),
            description: ingestion.ingestion_description.clone(),
            files: ingestion.files.clone(),
            created_at: Utc::now(),
            total_documents: 0,
        }
    }
}

// ========== 数据集登记 ==========

/// 原始数据导入记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingestion {
    pub id: String,
    pub ingestion_description: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub index_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub total_documents: u64,
}

/// 数据集到原始索引与向量索引的显式映射
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagDatabase {
    pub dataset_id: String,
    pub ingestion_description: String,
    pub raw_index_name: String,
    pub rag_index_name: String,
    pub created_at: DateTime<Utc>,
}

/// ES 索引名上限 255 字节，留出前缀与后缀
const MAX_SLUG_LEN: usize = 200;

impl RagDatabase {
    /// 新向量索引的命名规则
    ///
    /// 只保留 ES 索引名允许的小写字母、数字、`-` 和 `_`；id 与其规范形式不同时追加
    /// 由原始 id 派生的固定后缀，避免 `Cities` 与 `cities` 落到同一个索引。
    pub fn vector_index_name(dataset_id: &str) -> String {
        let slug: String = dataset_id
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '-' | '_' => c,
                c if c.is_ascii_uppercase() => c.to_ascii_lowercase(),
                _ => '-',
            })
            .take(MAX_SLUG_LEN)
            .collect();
        if slug == dataset_id {
            return format!("rag-{}", slug);
        }
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, dataset_id.as_bytes()).simple().to_string();
        format!("rag-{}-{}", slug, &digest[..8])
    }

    pub fn for_ingestion(ingestion: &Ingestion) -> Self {
        Self {
            dataset_id: ingestion.id.clone(),
            ingestion_description: ingestion.ingestion_description.clone(),
            raw_index_name: ingestion.index_name.clone(),
            rag_index_name: Self::vector_index_name(&ingestion.id),
            created_at: Utc::now(),
        }
    }
}

pub use gai_error::{GaiError as Error, Result};
