use std::sync::Arc;

use gai_error::{GaiError, Result};
use gai_llm::{make_providers, ChatModel, ChatProviderConfig, EmbedModel, EmbedProviderConfig};
use gai_store::{
    Catalog, ElasticConfig, ElasticStore, IndexGuard, MemoryStore, QdrantConfig,
    QdrantVectorStore, SourceStore, VectorStore,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::tools::currency::{ExchangeRates, HexarateClient};
use crate::websearch::{SearxngClient, WebSearch};

/// 未指定 GAI_CONFIG 时读取的配置文件
pub const DEFAULT_CONFIG_PATH: &str = "configs/default.yaml";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub chat_provider: ChatProviderConfig,
    pub embedding_provider: EmbedProviderConfig,
    pub vector_store: VectorStoreConfig,
    pub source_store: SourceStoreConfig,
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub exchange_rates: ExchangeRatesConfig,
    #[serde(default)]
    pub rag: RagSettings,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum VectorStoreConfig {
    #[serde(rename = "elasticsearch")]
    Elasticsearch(ElasticConfig),
    #[serde(rename = "qdrant")]
    Qdrant(QdrantConfig),
    #[serde(rename = "memory")]
    Memory,
}

/// 原始文档与登记表所在的存储
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum SourceStoreConfig {
    #[serde(rename = "elasticsearch")]
    Elasticsearch(ElasticConfig),
    #[serde(rename = "memory")]
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSearchConfig {
    /// SearXNG 实例地址
    pub base_url: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeRatesConfig {
    #[serde(default = "default_rates_url")]
    pub base_url: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for ExchangeRatesConfig {
    fn default() -> Self {
        Self {
            base_url: default_rates_url(),
            timeout_secs: default_http_timeout(),
        }
    }
}

fn default_rates_url() -> String {
    "https://hexarate.paikama.co".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

/// 问答流水线参数；模型名为空时使用 provider 的默认模型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSettings {
    #[serde(default)]
    pub answer_model: Option<String>,
    #[serde(default)]
    pub contextualize_model: Option<String>,
    #[serde(default)]
    pub tool_model: Option<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// 检索是否使用 MMR 多样性重排
    #[serde(default)]
    pub diversity: bool,
    #[serde(default = "default_fetch_multiplier")]
    pub fetch_multiplier: f32,
    #[serde(default = "default_mmr_lambda")]
    pub mmr_lambda: f32,
}

fn default_top_k() -> usize {
    10
}

fn default_fetch_multiplier() -> f32 {
    2.0
}

fn default_mmr_lambda() -> f32 {
    0.5
}

impl Default for RagSettings {
    fn default() -> Self {
        Self {
            answer_model: None,
            contextualize_model: None,
            tool_model: None,
            top_k: default_top_k(),
            diversity: false,
            fetch_multiplier: default_fetch_multiplier(),
            mmr_lambda: default_mmr_lambda(),
        }
    }
}

/// 单个文档整理失败时的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurationFailurePolicy {
    /// 整个运行失败并回滚
    #[default]
    Abort,
    /// 写入未整理的原文，错误记录在该文档的进度事件上
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// 向量维度，须与嵌入模型输出一致
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default)]
    pub curation_model: Option<String>,
    #[serde(default)]
    pub on_curation_failure: CurationFailurePolicy,
}

fn default_batch_size() -> u64 {
    10
}

fn default_dimensions() -> usize {
    1024
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            dimensions: default_dimensions(),
            curation_model: None,
            on_curation_failure: CurationFailurePolicy::Abort,
        }
    }
}

/// 读取 YAML 配置；路径由 GAI_CONFIG 覆盖
pub fn load_config() -> Result<AppConfig> {
    dotenv::dotenv().ok();
    let path = std::env::var("GAI_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_config_from(&path)
}

pub fn load_config_from(path: &str) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| GaiError::Configuration {
        key: path.to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<AppConfig> {
    serde_yaml::from_str(raw).map_err(|e| GaiError::Serialization {
        format: "yaml".to_string(),
        message: e.to_string(),
    })
}

/// 进程启动时构建一次的外部协作者集合
#[derive(Clone)]
pub struct Services {
    pub chat: Arc<dyn ChatModel>,
    pub embed: Arc<dyn EmbedModel>,
    pub vector_store: Arc<dyn VectorStore>,
    pub source_store: Arc<dyn SourceStore>,
    pub catalog: Arc<dyn Catalog>,
    pub web_search: Arc<dyn WebSearch>,
    pub exchange_rates: Arc<dyn ExchangeRates>,
    pub index_guard: IndexGuard,
    pub rag: RagSettings,
    pub embedding: EmbeddingSettings,
}

impl Services {
    pub fn build(cfg: &AppConfig) -> Result<Self> {
        let providers = make_providers(cfg.chat_provider.clone(), cfg.embedding_provider.clone())?;

        // 两侧都为 memory 时共用同一个实例，向量索引与登记表才能互相看到
        let memory = MemoryStore::new();

        let (source_store, catalog): (Arc<dyn SourceStore>, Arc<dyn Catalog>) =
            match &cfg.source_store {
                SourceStoreConfig::Elasticsearch(es) => {
                    let store = Arc::new(ElasticStore::new(es.clone())?);
                    (store.clone(), store)
                }
                SourceStoreConfig::Memory => (Arc::new(memory.clone()), Arc::new(memory.clone())),
            };

        let vector_store: Arc<dyn VectorStore> = match &cfg.vector_store {
            VectorStoreConfig::Elasticsearch(es) => Arc::new(ElasticStore::new(es.clone())?),
            VectorStoreConfig::Qdrant(q) => Arc::new(QdrantVectorStore::new(q)?),
            VectorStoreConfig::Memory => Arc::new(memory.clone()),
        };

        let web_search = Arc::new(SearxngClient::new(
            &cfg.web_search.base_url,
            cfg.web_search.timeout_secs,
        )?);
        let exchange_rates = Arc::new(HexarateClient::new(
            &cfg.exchange_rates.base_url,
            cfg.exchange_rates.timeout_secs,
        )?);

        info!(
            top_k = cfg.rag.top_k,
            diversity = cfg.rag.diversity,
            batch_size = cfg.embedding.batch_size,
            "services initialised"
        );

        Ok(Self {
            chat: providers.chat,
            embed: providers.embed,
            vector_store,
            source_store,
            catalog,
            web_search,
            exchange_rates,
            index_guard: IndexGuard::new(),
            rag: cfg.rag.clone(),
            embedding: cfg.embedding.clone(),
        })
    }
}
