// ========== OpenAI-compatible (OpenAI, vLLM, LM Studio, Ollama /v1) ==========

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::stream::{line_stream, sse_deltas};
use crate::{
    ChatMessage, ChatModel, CompletionRequest, EmbedModel, GaiError, Message, Result,
    TokenStream, ToolCallRequest, ToolSpec,
};

const PROVIDER: &str = "openai_compat";

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,                // e.g. https://api.openai.com
    pub api_key: String,                 // Bearer token
    pub chat_model: String,              // e.g. gpt-4o-mini
    pub embedding_model: Option<String>, // e.g. text-embedding-3-small
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    async fn post_chat(&self, body: &OaiChatReq<'_>) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(self.url("/v1/chat/completions"))
            .bearer_auth(&self.cfg.api_key)
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

    fn chat_body<'a>(&self, request: &'a CompletionRequest, stream: bool) -> OaiChatReq<'a> {
        OaiChatReq {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.cfg.chat_model.clone()),
            messages: &request.messages,
            temperature: request.temperature,
            stream,
            tools: if stream {
                Vec::new()
            } else {
                request.tools.iter().map(OaiTool::from).collect()
            },
        }
    }
}

#[derive(Serialize)]
struct OaiFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize)]
struct OaiTool<'a> {
    r#type: &'static str,
    function: OaiFunction<'a>,
}

impl<'a> From<&'a ToolSpec> for OaiTool<'a> {
    fn from(spec: &'a ToolSpec) -> Self {
        Self {
            r#type: "function",
            function: OaiFunction {
                name: &spec.name,
                description: &spec.description,
                parameters: &spec.parameters,
            },
        }
    }
}

#[derive(Serialize)]
struct OaiChatReq<'a> {
    model: String,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool<'a>>,
}

#[derive(Deserialize)]
struct OaiRespFunction {
    name: String,
    /// OpenAI 以字符串形式返回参数
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Deserialize)]
struct OaiRespToolCall {
    function: OaiRespFunction,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OaiRespToolCall>,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiChatResp {
    choices: Vec<OaiChatRespChoice>,
}

#[derive(Deserialize, Default)]
struct OaiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiChunkChoice {
    #[serde(default)]
    delta: OaiDelta,
}

#[derive(Deserialize)]
struct OaiChunk {
    #[serde(default)]
    choices: Vec<OaiChunkChoice>,
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    #[instrument(skip(self, request), fields(tools = request.tools.len()))]
    async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage> {
        let body = self.chat_body(&request, false);
        let resp = self.post_chat(&body).await?;

        let data: OaiChatResp = resp.json().await.map_err(|e| GaiError::LlmService {
            provider: PROVIDER.to_string(),
            message: format!("failed to parse response: {}", e),
        })?;
        let Some(choice) = data.choices.into_iter().next() else {
            return Ok(ChatMessage::default());
        };
        debug!(
            model = %body.model,
            tool_calls = choice.message.tool_calls.len(),
            "chat completion finished"
        );
        Ok(ChatMessage {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
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

        let deltas = sse_deltas(line_stream(resp.bytes_stream()), PROVIDER, |chunk: OaiChunk| {
            chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .collect::<String>()
        });
        Ok(TokenStream::new(deltas))
    }
}

#[derive(Serialize)]
struct OaiEmbedReq<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OaiEmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OaiEmbedResp {
    data: Vec<OaiEmbedData>,
}

#[async_trait]
impl EmbedModel for OpenAiCompatClient {
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
            .post(self.url("/v1/embeddings"))
            .bearer_auth(&self.cfg.api_key)
            .json(&OaiEmbedReq {
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

        let data: OaiEmbedResp = resp.json().await.map_err(|e| GaiError::EmbeddingService {
            provider: PROVIDER.to_string(),
            message: format!("failed to parse response: {}", e),
        })?;
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}
