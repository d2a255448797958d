//! 单元测试用的进程内协作者。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use gai_error::{GaiError, Result};
use gai_llm::{ChatMessage, ChatModel, CompletionRequest, EmbedModel, TokenStream, ToolCallRequest};

use crate::tools::currency::ExchangeRates;
use crate::websearch::{WebResult, WebSearch};

pub enum Scripted {
    Reply(ChatMessage),
    Tokens(Vec<String>),
    Fail(GaiError),
}

type Responder = dyn Fn(&CompletionRequest) -> Result<ChatMessage> + Send + Sync;

/// 按顺序返回预置回复的聊天模型；队列耗尽后交给 responder，或返回空回复
#[derive(Default)]
pub struct ScriptedChatModel {
    script: Mutex<VecDeque<Scripted>>,
    responder: Option<Box<Responder>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedChatModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<ChatMessage> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::default()
        }
    }

    pub fn reply(self, content: &str) -> Self {
        self.push(Scripted::Reply(ChatMessage {
            content: content.to_string(),
            tool_calls: Vec::new(),
        }))
    }

    pub fn tool_call(self, name: &str, arguments: serde_json::Value) -> Self {
        self.push(Scripted::Reply(ChatMessage {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                name: name.to_string(),
                arguments,
            }],
        }))
    }

    pub fn tool_calls(self, calls: Vec<ToolCallRequest>) -> Self {
        self.push(Scripted::Reply(ChatMessage {
            content: String::new(),
            tool_calls: calls,
        }))
    }

    pub fn tokens(self, tokens: &[&str]) -> Self {
        self.push(Scripted::Tokens(tokens.iter().map(|t| t.to_string()).collect()))
    }

    pub fn fail(self, error: GaiError) -> Self {
        self.push(Scripted::Fail(error))
    }

    fn push(self, item: Scripted) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
        self
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }

    fn next(&self, request: &CompletionRequest) -> Result<Scripted> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(item) => Ok(item),
            None => match &self.responder {
                Some(responder) => responder(request).map(Scripted::Reply),
                None => Ok(Scripted::Reply(ChatMessage::default())),
            },
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn complete(&self, request: CompletionRequest) -> Result<ChatMessage> {
        match self.next(&request)? {
            Scripted::Reply(message) => Ok(message),
            Scripted::Tokens(tokens) => Ok(ChatMessage {
                content: tokens.concat(),
                tool_calls: Vec::new(),
            }),
            Scripted::Fail(err) => Err(err),
        }
    }

    async fn complete_streaming(&self, request: CompletionRequest) -> Result<TokenStream> {
        match self.next(&request)? {
            Scripted::Reply(message) => Ok(TokenStream::from_tokens(vec![message.content])),
            Scripted::Tokens(tokens) => Ok(TokenStream::from_tokens(tokens)),
            Scripted::Fail(err) => Err(err),
        }
    }
}

pub fn transport_error() -> GaiError {
    GaiError::LlmService {
        provider: "scripted".to_string(),
        message: "connection refused".to_string(),
    }
}

/// 把词项散列到固定维度的确定性嵌入
pub struct HashEmbedModel {
    dims: usize,
    fail_from_call: Option<usize>,
    calls: AtomicUsize,
}

impl HashEmbedModel {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            fail_from_call: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// 前 n 次调用成功，之后每次都返回传输错误
    pub fn failing_after(dims: usize, n: usize) -> Self {
        Self {
            dims,
            fail_from_call: Some(n),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0_f32; self.dims];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(7_usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
                % self.dims;
            v[bucket] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbedModel for HashEmbedModel {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if matches!(self.fail_from_call, Some(n) if call >= n) {
            return Err(GaiError::EmbeddingService {
                provider: "hash".to_string(),
                message: "embedding backend unreachable".to_string(),
            });
        }
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

#[derive(Default)]
pub struct StaticWebSearch {
    results: Vec<WebResult>,
    queries: Mutex<Vec<String>>,
}

impl StaticWebSearch {
    pub fn new(results: Vec<WebResult>) -> Self {
        Self {
            results,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl WebSearch for StaticWebSearch {
    async fn search(&self, query: &str) -> Result<Vec<WebResult>> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(query.to_string());
        }
        Ok(self.results.clone())
    }
}

pub fn web_result(title: &str, snippet: &str) -> WebResult {
    WebResult {
        title: title.to_string(),
        url: format!("https://example.org/{}", title.to_lowercase().replace(' ', "-")),
        snippet: snippet.to_string(),
        published_date: None,
        engines: Vec::new(),
    }
}

/// 固定汇率表；未登记的币种对返回 None，fail 为 true 时模拟服务不可达
#[derive(Default)]
pub struct FixedRates {
    rates: HashMap<(String, String), f64>,
    fail: bool,
    requests: Mutex<Vec<(String, String)>>,
}

impl FixedRates {
    pub fn new(pairs: &[(&str, &str, f64)]) -> Self {
        Self {
            rates: pairs
                .iter()
                .map(|(f, t, r)| ((f.to_string(), t.to_string()), *r))
                .collect(),
            ..Self::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ExchangeRates for FixedRates {
    async fn latest_rate(&self, from: &str, to: &str) -> Result<Option<f64>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push((from.to_string(), to.to_string()));
        }
        if self.fail {
            return Err(GaiError::ServiceUnavailable {
                service: "exchange-rates".to_string(),
            });
        }
        Ok(self.rates.get(&(from.to_string(), to.to_string())).copied())
    }
}
