//! 数据集向量化流水线。
//!
//! 分页读取原始文档，渲染所选字段（可选地经过修订子链），按批嵌入并写入向量索引，
//! 每个文档发送一个进度事件。每次运行是一个事务，记录都带有事务 id。
//!
//! - 成功时删除之前事务留下的记录，重复运行不会累积重复文档；随后写入登记记录并发送
//!   finished 事件。
//! - 任何未处理的错误都会删除整个目标索引及其登记记录，包括之前成功运行的结果，
//!   再发送唯一一个 failed 事件。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gai_core::{EmbeddingEvent, Ingestion, IngestionTransaction, RagDatabase};
use gai_error::{ErrorMetadataBuilder, GaiError, Result};
use gai_llm::EmbedModel;
use gai_store::{
    Catalog, IndexGuard, SourceHit, SourceStore, VectorIndexMapping, VectorRecord, VectorStore,
    TRANSACTION_FIELD,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::config::{CurationFailurePolicy, EmbeddingSettings, Services};
use crate::curation::CurationChain;
use crate::markdown::render_markdown;
use crate::websearch::WebResearcher;

const EVENT_BUFFER: usize = 32;

fn match_all() -> String {
    "*".to_string()
}

/// 一次向量化请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingJob {
    pub dataset_id: String,
    /// 原始文档的查询条件
    #[serde(default = "match_all")]
    pub query: String,
    pub columns: Vec<String>,
    /// 修订指令；为空时直接嵌入渲染结果
    #[serde(default)]
    pub instruction: Option<String>,
    /// 覆盖登记记录中的数据集描述
    #[serde(default)]
    pub description: Option<String>,
}

impl EmbeddingJob {
    pub fn new(dataset_id: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            query: match_all(),
            columns,
            instruction: None,
            description: None,
        }
    }

    fn selected_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    }

    fn instruction(&self) -> Option<&str> {
        self.instruction
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// 运行中的计数与副作用标记，失败处理据此决定是否回滚
#[derive(Debug, Default)]
struct RunState {
    total: u64,
    current: u64,
    /// 索引已确认存在之后才设置
    rag_index: Option<String>,
    created_index: bool,
    transaction_id: Option<String>,
}

#[derive(Clone)]
pub struct EmbeddingPipeline {
    source: Arc<dyn SourceStore>,
    vectors: Arc<dyn VectorStore>,
    catalog: Arc<dyn Catalog>,
    embed: Arc<dyn EmbedModel>,
    curation: Option<Arc<CurationChain>>,
    guard: IndexGuard,
    settings: EmbeddingSettings,
}

impl EmbeddingPipeline {
    pub fn new(
        source: Arc<dyn SourceStore>,
        vectors: Arc<dyn VectorStore>,
        catalog: Arc<dyn Catalog>,
        embed: Arc<dyn EmbedModel>,
        guard: IndexGuard,
        settings: EmbeddingSettings,
    ) -> Self {
        Self {
            source,
            vectors,
            catalog,
            embed,
            curation: None,
            guard,
            settings,
        }
    }

    pub fn with_curation(mut self, curation: Arc<CurationChain>) -> Self {
        self.curation = Some(curation);
        self
    }

    pub fn from_services(services: &Services) -> Self {
        let model = services.embedding.curation_model.clone();
        let researcher = Arc::new(WebResearcher::new(
            services.web_search.clone(),
            services.embed.clone(),
            services.chat.clone(),
            model.clone(),
        ));
        let curation = CurationChain::new(services.chat.clone(), model, researcher);
        Self::new(
            services.source_store.clone(),
            services.vector_store.clone(),
            services.catalog.clone(),
            services.embed.clone(),
            services.index_guard.clone(),
            services.embedding.clone(),
        )
        .with_curation(Arc::new(curation))
    }

    /// 在后台任务中运行；消费端停止读取不会中断已经开始的工作
    pub fn run(&self, job: EmbeddingJob) -> ReceiverStream<EmbeddingEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.execute(job, tx).await });
        ReceiverStream::new(rx)
    }

    #[instrument(skip(self, job, tx), fields(dataset_id = %job.dataset_id))]
    async fn execute(&self, job: EmbeddingJob, tx: mpsc::Sender<EmbeddingEvent>) {
        let start = Utc::now();
        let mut state = RunState::default();

        match self.embed_all(&job, start, &mut state, &tx).await {
            Ok(()) => {
                info!(documents = state.total, "all documents embedded");
                emit(&tx, EmbeddingEvent::finished(state.total, start)).await;
            }
            Err(err) => {
                let meta = ErrorMetadataBuilder::new("embedding_pipeline")
                    .operation("embed_dataset")
                    .dataset_id(&job.dataset_id)
                    .context("current_document", &state.current.to_string())
                    .build(&err);
                err.log(&meta);
                self.rollback(&job.dataset_id, &state).await;
                emit(&tx, EmbeddingEvent::failed(&err, state.total, state.current, start)).await;
            }
        }
    }

    async fn embed_all(
        &self,
        job: &EmbeddingJob,
        start: DateTime<Utc>,
        state: &mut RunState,
        tx: &mpsc::Sender<EmbeddingEvent>,
    ) -> Result<()> {
        let columns = job.selected_columns();
        if columns.is_empty() {
            return Err(GaiError::Validation {
                message: "No columns selected for embedding".to_string(),
            });
        }
        let instruction = job.instruction();
        let curation = match (instruction, &self.curation) {
            (Some(_), None) => {
                return Err(GaiError::Configuration {
                    key: "embedding.curation_model".to_string(),
                    reason: "a curation instruction was given but no curation chain is configured"
                        .to_string(),
                })
            }
            (Some(instruction), Some(chain)) => Some((instruction, chain.clone())),
            (None, _) => None,
        };

        let ingestion = self
            .catalog
            .ingestion(&job.dataset_id)
            .await?
            .ok_or_else(|| GaiError::NotFound {
                resource: format!("dataset {}", job.dataset_id),
            })?;

        emit(tx, EmbeddingEvent::started(start)).await;

        let rag_index = RagDatabase::vector_index_name(&ingestion.id);
        let mapping = VectorIndexMapping::cosine(self.settings.dimensions);
        let mut transaction = IngestionTransaction::begin(&ingestion);
        state.transaction_id = Some(transaction.transaction_id.clone());
        state.created_index = self
            .guard
            .ensure_index(self.vectors.as_ref(), &rag_index, &mapping)
            .await?;
        state.rag_index = Some(rag_index.clone());
        info!(
            transaction_id = %transaction.transaction_id,
            raw_index = %ingestion.index_name,
            rag_index = %rag_index,
            created_index = state.created_index,
            "embedding run started"
        );

        let batch_size = self.settings.batch_size.max(1);
        let mut cursor = 0_u64;
        loop {
            let page = self
                .source
                .page(&ingestion.index_name, &job.query, cursor, batch_size)
                .await?;
            state.total = page.total;
            if page.hits.is_empty() {
                break;
            }
            let fetched = page.hits.len() as u64;

            let mut texts = Vec::with_capacity(page.hits.len());
            for hit in &page.hits {
                state.current += 1;
                let original = render_markdown(&hit.source, &columns);
                let (curated, curation_error) = match &curation {
                    Some((instruction, chain)) => match chain.curate(&original, instruction).await {
                        Ok(curated) => (curated, None),
                        Err(err) if self.settings.on_curation_failure == CurationFailurePolicy::Skip => {
                            warn!(document = %hit.id, error = %err, "curation failed, embedding the original rendering");
                            (original.clone(), Some(err))
                        }
                        Err(err) => return Err(err),
                    },
                    None => (original.clone(), None),
                };

                let mut event =
                    EmbeddingEvent::progress(state.current, state.total, original, curated.clone(), start);
                if let Some(err) = curation_error {
                    event.error = serde_json::to_string(&err).ok();
                }
                emit(tx, event).await;
                texts.push(curated);
            }

            let records = self
                .embed_batch(&transaction, &page.hits, texts)
                .await?;
            self.vectors.bulk_write(&rag_index, records).await?;
            transaction.total_documents += fetched;
            debug!(written = transaction.total_documents, total = state.total, "batch written");

            cursor += fetched;
            if cursor >= state.total {
                break;
            }
        }

        self.vectors.refresh_index(&rag_index).await?;
        if !state.created_index {
            self.vectors
                .retain_transaction(&rag_index, &transaction.transaction_id)
                .await?;
        }
        self.register(&ingestion, job.description.as_deref()).await
    }

    async fn embed_batch(
        &self,
        transaction: &IngestionTransaction,
        hits: &[SourceHit],
        texts: Vec<String>,
    ) -> Result<Vec<VectorRecord>> {
        let vectors = self.embed.embed(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(GaiError::EmbeddingService {
                provider: "embedding_pipeline".to_string(),
                message: format!("expected {} vectors, got {}", texts.len(), vectors.len()),
            });
        }

        Ok(hits
            .iter()
            .zip(texts.into_iter().zip(vectors))
            .map(|(hit, (text, vector))| {
                let mut metadata = Map::new();
                metadata.insert(
                    TRANSACTION_FIELD.to_string(),
                    Value::String(transaction.transaction_id.clone()),
                );
                metadata.insert("source_id".to_string(), Value::String(hit.id.clone()));
                if let Value::Object(fields) = &hit.source {
                    for (key, value) in fields {
                        metadata.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
                VectorRecord::new(text, vector, metadata)
            })
            .collect())
    }

    async fn register(&self, ingestion: &Ingestion, description: Option<&str>) -> Result<()> {
        let mut record = RagDatabase::for_ingestion(ingestion);
        if let Some(description) = description.map(str::trim).filter(|d| !d.is_empty()) {
            record.ingestion_description = description.to_string();
        }
        self.catalog.ensure_registry().await?;
        self.catalog.upsert_rag_database(&record).await
    }

    /// 删除目标索引和登记记录；清理失败只记录日志
    async fn rollback(&self, dataset_id: &str, state: &RunState) {
        let Some(rag_index) = state.rag_index.as_deref() else {
            return;
        };
        warn!(
            %dataset_id,
            %rag_index,
            transaction_id = ?state.transaction_id,
            reused_index = !state.created_index,
            "rolling back embedding run"
        );
        if let Err(err) = self.vectors.delete_index(rag_index).await {
            warn!(error = %err, "failed to delete partial vector index");
        }
        if let Err(err) = self.catalog.delete_rag_database(dataset_id).await {
            warn!(error = %err, "failed to delete registry record");
        }
    }
}

/// 消费端已离开时继续运行，事件直接丢弃
async fn emit(tx: &mpsc::Sender<EmbeddingEvent>, event: EmbeddingEvent) {
    if tx.send(event).await.is_err() {
        debug!("embedding event consumer is gone");
    }
}
