use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::stream::{line_stream, ndjson_deltas};
use crate::{
    ChatMessage, ChatModel, CompletionRequest, EmbedModel, GaiError, Message, Result,
    TokenStream, ToolCallRequest, ToolSpec,
};

const PROVIDER: &str = "ollama";

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,                // e.g. http://127.0.0.1:11434
    pub chat_model: String,              // e.g. command-r7b, llama3.2
    pub embedding_model: Option<String>, // e.g. mxbai-embed-large
    /// 非流式请求的总期限；流式请求只用作连接与读空闲期限
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            chat_model: "command-r7b".to_string(),
            embedding_model: Some("mxbai-embed-large".to_string()),
            timeout_secs: 300,
        }
    }
}

#[derive(Clone)]
pub struct OllamaClient {
    http: Client,
    stream_http: Client,
    cfg: OllamaConfig,
}

impl OllamaClient {
    pub fn new(cfg: OllamaConfig) -> Result<Self> {
        let deadline = Duration::from_secs(cfg.timeout_secs);
        let http = Client::builder()
            .connect_timeout(deadline)
            .timeout(deadline)
            .build()
            .map_err(client_error)?;
        // 长回答可以超过总期限，只要 token 仍在持续到达
        let stream_http = Client::builder()
            .connect_timeout(deadline)
            .read_timeout(deadline)
            .build()
            .map_err(client_error)?;
        Ok(Self {
            http,
            stream_http,
            cfg,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    fn chat_body<'a>(&self, request: &'a CompletionRequest, stream: bool) -> OllamaChatReq<'a> {
        OllamaChatReq {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.cfg.chat_model.clone()),
            messages: request.messages.clone(),
            stream,
            tools: if stream {
                Vec::new()
            } else {
                request.tools.iter().map(OllamaTool::from).collect()
            },
            options: request.temperature.map(|t| OllamaOptions { temperature: t }),
        }
    }

    async fn post_chat(&self, body: &OllamaChatReq<'_>) -> Result<reqwest::Response> {
        let http = if body.stream { &self.stream_http } else { &self.http };
        let resp = http
            .post(self.url("/api/chat"))
            .json(body)
            .send()
            .await
            .map_err(GaiError::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(GaiError::LlmService {
                provider: PROVIDER.to_string(),
                message: format!("status={} body={}", status, txt),
            });
        }
        Ok(resp)
    }
}

fn client_error(e: reqwest::Error) -> GaiError {
    GaiError::Configuration {
        key: "ollama.http_client".to_string(),
        reason: e.to_string(),
    }
}

#[derive(Serialize)]
struct OllamaFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize)]
struct OllamaTool<'a> {
    r#type: &'static str,
    function: OllamaFunction<'a>,
}

impl<'a> From<&'a ToolSpec> for OllamaTool<'a> {
    fn from(spec: &'a ToolSpec) -> Self {
        Self {
            r#type: "function",
            function: OllamaFunction {
                name: &spec.name,
                description: &spec.description,
                parameters: &spec.parameters,
            },
        }
    }
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Serialize)]
struct OllamaChatReq<'a> {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OllamaTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Deserialize)]
struct OllamaRespFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Deserialize)]
struct OllamaRespToolCall {
    function: OllamaRespFunction,
}

#[derive(Deserialize, Default)]
struct OllamaRespMsg {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaRespToolCall>,
}

#[derive(Deserialize)]
struct OllamaChatResp {
    #[serde(default)]
    message: OllamaRespMsg,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl ChatModel for OllamaClient {
    #[instrument(skip(self, request), fields(tools = request.tools.len()))]
    async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage> {
        let start = Instant::now();
        let body = self.chat_body(&request, false);
        let resp = self.post_chat(&body).await?;

        let data: OllamaChatResp = resp.json().await.map_err(|e| GaiError::LlmService {
            provider: PROVIDER.to_string(),
            message: format!("failed to parse response: {}", e),
        })?;
        if let Some(err) = data.error {
            return Err(GaiError::LlmService {
                provider: PROVIDER.to_string(),
                message: err,
            });
        }

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            model = %body.model,
            response_len = data.message.content.len(),
            tool_calls = data.message.tool_calls.len(),
            duration_ms = elapsed,
            "chat completion finished"
        );
        if elapsed > 30000 {
            warn!(duration_ms = elapsed, slow = true, "slow chat completion");
        }

        Ok(ChatMessage {
            content: data.message.content,
            tool_calls: data
                .message
                .tool_calls
                .into_iter()
                .map(|c| ToolCallRequest {
                    name: c.function.name,
                    arguments: c.function.arguments,
                })
                .collect(),
        })
    }

    #[instrument(skip(self, request))]
    async fn complete_streaming(&self, request: CompletionRequest) -> Result<TokenStream> {
        let body = self.chat_body(&request, true);
        let resp = self.post_chat(&body).await?;
        debug!(model = %body.model, "chat stream opened");

        let deltas = ndjson_deltas(line_stream(resp.bytes_stream()), |chunk: OllamaChatResp| {
            match chunk.error {
                Some(err) => Err(GaiError::LlmService {
                    provider: PROVIDER.to_string(),
                    message: err,
                }),
                None => Ok((chunk.message.content, chunk.done)),
            }
        });
        Ok(TokenStream::new(deltas))
    }
}

#[derive(Serialize)]
struct OllamaEmbedReq<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaEmbedResp {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbedModel for OllamaClient {
    #[instrument(skip(self, texts), fields(input_count = texts.len()))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self
            .cfg
            .embedding_model
            .as_deref()
            .ok_or_else(|| GaiError::Configuration {
                key: "embedding_model".to_string(),
                reason: "not configured".to_string(),
            })?;

        let resp = self
            .http
            .post(self.url("/api/embed"))
            .json(&OllamaEmbedReq {
                model,
                input: texts,
            })
            .send()
            .await
            .map_err(GaiError::from)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(GaiError::EmbeddingService {
                provider: PROVIDER.to_string(),
                message: format!("status={} body={}", status, txt),
            });
        }

        let data: OllamaEmbedResp = resp.json().await.map_err(|e| GaiError::EmbeddingService {
            provider: PROVIDER.to_string(),
            message: format!("failed to parse response: {}", e),
        })?;
        if data.embeddings.len() != texts.len() {
            return Err(GaiError::EmbeddingService {
                provider: PROVIDER.to_string(),
                message: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    data.embeddings.len()
                ),
            });
        }
        Ok(data.embeddings)
    }
}
