//! 历史对话的去重、渲染与相关性过滤。

use std::collections::HashMap;
use std::sync::Arc;

use gai_core::ChatEntry;
use gai_error::Result;
use gai_llm::{ChatModel, CompletionRequest, Message};
use tracing::{debug, instrument};

use crate::prompts;

/// 按 prompt 原文去重：保留时间最新的那条回答，位置取首次出现处
pub fn dedupe_history(history: &[ChatEntry]) -> Vec<ChatEntry> {
    let mut out: Vec<ChatEntry> = Vec::with_capacity(history.len());
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for entry in history {
        match positions.get(entry.prompt.as_str()) {
            Some(&idx) => {
                // 时间戳相同按出现顺序，后者覆盖前者
                if entry.timestamp >= out[idx].timestamp {
                    out[idx] = entry.clone();
                }
            }
            None => {
                positions.insert(entry.prompt.as_str(), out.len());
                out.push(entry.clone());
            }
        }
    }
    out
}

/// 渲染为交替的 Human/System 文本块
pub fn render_history(history: &[ChatEntry]) -> String {
    history
        .iter()
        .map(|e| format!("Human: {}\nSystem: {}", e.prompt, e.response))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 只保留与当前问题相关的历史，结果是纯文本
pub struct HistoryCompactor {
    chat: Arc<dyn ChatModel>,
    model: Option<String>,
}

impl HistoryCompactor {
    pub fn new(chat: Arc<dyn ChatModel>, model: Option<String>) -> Self {
        Self { chat, model }
    }

    #[instrument(skip(self, history), fields(entries = history.len()))]
    pub async fn compact(&self, history: &[ChatEntry], question: &str) -> Result<String> {
        let deduped = dedupe_history(history);
        if deduped.is_empty() {
            return Ok(String::new());
        }

        let transcript = render_history(&deduped);
        let request = CompletionRequest::new(vec![
            Message::system(prompts::HISTORY_FILTER_SYSTEM),
            Message::user(prompts::history_filter_user(&transcript, question)),
        ])
        .model(self.model.clone())
        .temperature(0.0);

        let reply = self.chat.complete(request).await?;
        match relevant_blocks(&reply.content) {
            Some(blocks) => Ok(blocks.to_string()),
            None => {
                debug!(reply = %reply.content.trim(), "no relevant history");
                Ok(String::new())
            }
        }
    }
}

/// 回复中至少要有一个原样复制的 Human 块；之前的寒暄文字丢弃，NONE 或其他措辞的拒绝视为无历史
fn relevant_blocks(reply: &str) -> Option<&str> {
    let start = reply.find(HUMAN_MARKER)?;
    let blocks = reply[start..].trim();
    (blocks.len() > HUMAN_MARKER.len()).then_some(blocks)
}

const HUMAN_MARKER: &str = "Human:";
