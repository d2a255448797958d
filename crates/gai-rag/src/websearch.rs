//! 网络搜索：SearXNG 客户端，以及“搜索 → MMR 筛选 → 模型作答”的组合。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gai_core::ContextDocument;
use gai_error::{GaiError, Result};
use gai_llm::{ChatModel, CompletionRequest, EmbedModel, Message};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::mmr::{mmr_rerank, MmrCandidate, MmrConfig};
use crate::prompts;

pub const WEB_SEARCH_SOURCE: &str = "WebSearchTool";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub engines: Vec<String>,
}

impl WebResult {
    pub fn into_document(self) -> Result<ContextDocument> {
        let mut doc = ContextDocument::try_new(self.snippet, WEB_SEARCH_SOURCE)?
            .with_title(self.title)
            .with_url(self.url)
            .with_published_date(self.published_date);
        if !self.engines.is_empty() {
            doc = doc.with_extra("engines", Value::String(self.engines.join(", ")));
        }
        Ok(doc)
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<WebResult>>;
}

/// SearXNG 的 JSON 搜索接口
pub struct SearxngClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SearxngResponse {
    #[serde(default)]
    results: Vec<SearxngItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearxngItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    published_date: Option<String>,
    #[serde(default)]
    engines: Vec<String>,
}

fn non_empty(value: Option<String>, fallback: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

impl From<SearxngItem> for WebResult {
    fn from(item: SearxngItem) -> Self {
        Self {
            title: non_empty(item.title, "Untitled"),
            url: non_empty(item.url, "No URL"),
            snippet: non_empty(item.content, "No content available"),
            published_date: item.published_date,
            engines: item.engines,
        }
    }
}

impl SearxngClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| GaiError::Configuration {
                key: "web_search.base_url".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl WebSearch for SearxngClient {
    #[instrument(skip(self))]
    async fn search(&self, query: &str) -> Result<Vec<WebResult>> {
        let resp = self
            .http
            .post(format!("{}/search", self.base_url))
            .form(&[("q", query), ("format", "json")])
            .send()
            .await
            .map_err(|e| GaiError::SearchEngine {
                engine: "searxng".to_string(),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GaiError::SearchEngine {
                engine: "searxng".to_string(),
                message: format!("status {}: {}", status, body),
            });
        }

        let parsed: SearxngResponse = resp.json().await.map_err(|e| GaiError::SearchEngine {
            engine: "searxng".to_string(),
            message: e.to_string(),
        })?;
        debug!(results = parsed.results.len(), "searxng results");
        Ok(parsed.results.into_iter().map(WebResult::from).collect())
    }
}

/// 网络检索结果及据此生成的简短回答
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAnswer {
    pub question: String,
    pub answer: String,
    pub context: Vec<ContextDocument>,
}

/// 先搜索，再用 MMR 从结果中挑出多样的 k 条，最后可选地让模型据此作答
pub struct WebResearcher {
    search: Arc<dyn WebSearch>,
    embed: Arc<dyn EmbedModel>,
    chat: Arc<dyn ChatModel>,
    model: Option<String>,
    k: usize,
    mmr: MmrConfig,
}

impl WebResearcher {
    pub fn new(
        search: Arc<dyn WebSearch>,
        embed: Arc<dyn EmbedModel>,
        chat: Arc<dyn ChatModel>,
        model: Option<String>,
    ) -> Self {
        Self {
            search,
            embed,
            chat,
            model,
            k: 5,
            // 先取 10 条再重排出 5 条
            mmr: MmrConfig::new(0.5, 2.0),
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// 搜索并返回经过多样性筛选的结果文档
    #[instrument(skip(self))]
    pub async fn context(&self, query: &str) -> Result<Vec<ContextDocument>> {
        let mut results = self.search.search(query).await?;
        results.truncate(self.mmr.fetch_k(self.k));
        if results.is_empty() {
            return Ok(Vec::new());
        }
        if results.len() <= 1 {
            return results.into_iter().map(WebResult::into_document).collect();
        }

        let mut texts: Vec<String> = Vec::with_capacity(results.len() + 1);
        texts.push(query.to_string());
        texts.extend(results.iter().map(|r| format!("{}\n{}", r.title, r.snippet)));
        let mut vectors = self.embed.embed(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(GaiError::EmbeddingService {
                provider: "web_search".to_string(),
                message: format!("expected {} vectors, got {}", texts.len(), vectors.len()),
            });
        }
        let query_vector = vectors.remove(0);

        let candidates = results
            .into_iter()
            .zip(vectors)
            .map(|(item, vector)| MmrCandidate { item, vector })
            .collect();
        let picked = mmr_rerank(&query_vector, candidates, self.k, self.mmr.lambda);
        picked.into_iter().map(WebResult::into_document).collect()
    }

    /// 搜索后让模型只依据搜索结果作答
    #[instrument(skip(self))]
    pub async fn research(&self, question: &str) -> Result<WebAnswer> {
        let context = self.context(question).await?;
        if context.is_empty() {
            warn!("web search returned no results");
            return Ok(WebAnswer {
                question: question.to_string(),
                answer: String::new(),
                context,
            });
        }

        let results = context
            .iter()
            .map(|d| d.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let request = CompletionRequest::new(vec![
            Message::system(prompts::WEB_ANSWER_SYSTEM),
            Message::user(prompts::web_answer_user(&results, question)),
        ])
        .model(self.model.clone())
        .temperature(0.0);
        let reply = self.chat.complete(request).await?;

        Ok(WebAnswer {
            question: question.to_string(),
            answer: reply.content.trim().to_string(),
            context,
        })
    }
}
