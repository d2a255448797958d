use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::{AbortHandle, Abortable, BoxStream};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

pub use gai_error::{GaiError, Result};

mod ollama;
mod openai;
mod stream;

pub use ollama::{OllamaClient, OllamaConfig};
pub use openai::{OpenAiCompatClient, OpenAiCompatConfig};

// ========== 消息与工具协议 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// 暴露给模型的函数调用声明，parameters 为 JSON Schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// 模型返回的函数调用。arguments 可能是对象，也可能是尚未解析的 JSON 字符串
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// 为空时使用客户端默认模型
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

// ========== 可中止的 token 流 ==========

/// 流式生成的增量文本。abort() 后流立即结束，底层连接随之释放
pub struct TokenStream {
    inner: Abortable<BoxStream<'static, Result<String>>>,
    handle: AbortHandle,
}

impl TokenStream {
    pub fn new(stream: BoxStream<'static, Result<String>>) -> Self {
        let (handle, registration) = AbortHandle::new_pair();
        Self {
            inner: Abortable::new(stream, registration),
            handle,
        }
    }

    /// 由固定片段构造，主要用于测试替身
    pub fn from_tokens<I>(tokens: I) -> Self
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
    {
        Self::new(futures::stream::iter(tokens.into_iter().map(Ok)).boxed())
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.is_aborted()
    }
}

impl Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

// ========== 模型抽象 ==========

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// 单次补全，可携带工具声明
    async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage>;

    /// 流式补全，工具声明被忽略
    async fn complete_streaming(&self, request: CompletionRequest) -> Result<TokenStream>;
}

#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ========== Provider Factory & Config ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatProviderConfig {
    #[serde(rename = "ollama")]
    Ollama {
        base_url: String,
        model: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        /// 存放 API key 的环境变量名
        api_key_env: String,
        model: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EmbedProviderConfig {
    #[serde(rename = "ollama")]
    Ollama { base_url: String, model: String },
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key_env: String,
        model: String,
    },
}

pub struct Providers {
    pub chat: Arc<dyn ChatModel>,
    pub embed: Arc<dyn EmbedModel>,
}

fn api_key_from_env(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| GaiError::Configuration {
        key: var.to_string(),
        reason: "environment variable not set".to_string(),
    })
}

pub fn make_providers(chat: ChatProviderConfig, embed: EmbedProviderConfig) -> Result<Providers> {
    let chat: Arc<dyn ChatModel> = match chat {
        ChatProviderConfig::Ollama {
            base_url,
            model,
            timeout_secs,
        } => Arc::new(OllamaClient::new(OllamaConfig {
            base_url,
            chat_model: model,
            embedding_model: None,
            timeout_secs: timeout_secs.unwrap_or(300),
        })?),
        ChatProviderConfig::OpenAiCompat {
            base_url,
            api_key_env,
            model,
        } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key: api_key_from_env(&api_key_env)?,
            chat_model: model,
            embedding_model: None,
        })),
    };

    let embed: Arc<dyn EmbedModel> = match embed {
        EmbedProviderConfig::Ollama { base_url, model } => {
            Arc::new(OllamaClient::new(OllamaConfig {
                base_url,
                chat_model: String::new(),
                embedding_model: Some(model),
                timeout_secs: 120,
            })?)
        }
        EmbedProviderConfig::OpenAiCompat {
            base_url,
            api_key_env,
            model,
        } => Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key: api_key_from_env(&api_key_env)?,
            chat_model: String::new(),
            embedding_model: Some(model),
        })),
    };

    Ok(Providers { chat, embed })
}
