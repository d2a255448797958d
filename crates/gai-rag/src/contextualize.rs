use std::sync::Arc;

use gai_core::ChatEntry;
use gai_error::Result;
use gai_llm::{ChatModel, CompletionRequest, Message};
use tracing::{debug, instrument};

use crate::history::dedupe_history;
use crate::prompts;

/// 结合历史把最新问题改写为独立问题
pub struct Contextualizer {
    chat: Arc<dyn ChatModel>,
    model: Option<String>,
}

impl Contextualizer {
    pub fn new(chat: Arc<dyn ChatModel>, model: Option<String>) -> Self {
        Self { chat, model }
    }

    /// 无历史时原样返回，不调用模型；传输失败直接返回错误
    #[instrument(skip(self, history), fields(entries = history.len()))]
    pub async fn standalone_question(&self, question: &str, history: &[ChatEntry]) -> Result<String> {
        if history.is_empty() {
            return Ok(question.to_string());
        }

        let mut messages = vec![Message::system(prompts::CONTEXTUALIZE_SYSTEM)];
        for entry in dedupe_history(history) {
            messages.push(Message::user(entry.prompt));
            messages.push(Message::assistant(entry.response));
        }
        messages.push(Message::user(question));

        let request = CompletionRequest::new(messages)
            .model(self.model.clone())
            .temperature(0.0);
        let reply = self.chat.complete(request).await?;
        let rewritten = reply.content.trim();
        if rewritten.is_empty() {
            debug!("empty rewrite, keeping the original question");
            return Ok(question.to_string());
        }
        debug!(standalone = %rewritten, "question contextualized");
        Ok(rewritten.to_string())
    }
}
