//! 上下文拼装：固定顺序为工具结果、检索文档、历史对话。

use std::collections::HashSet;

use gai_core::ContextDocument;
use gai_llm::Message;

use crate::prompts;

/// 拼装结果：去重后的文档，以及送入模型的带标签文本
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub documents: Vec<ContextDocument>,
    pub history: String,
    pub text: String,
}

impl AssembledContext {
    /// 没有任何证据时回答只能是拒答
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.history.trim().is_empty()
    }
}

fn format_document(index: usize, doc: &ContextDocument) -> String {
    let mut header = format!("[{}] (source={}", index, doc.source());
    if let Some(title) = &doc.metadata.title {
        header.push_str(&format!(" title={}", title));
    }
    if let Some(url) = &doc.metadata.url {
        header.push_str(&format!(" url={}", url));
    }
    if let Some(score) = doc.metadata.score {
        header.push_str(&format!(" score={:.3}", score));
    }
    if doc.metadata.error {
        header.push_str(" error=true");
    }
    format!("{})\n{}", header, doc.content)
}

/// 按内容去重（先出现者保留），再按固定顺序生成带标签的分节文本
pub fn assemble(
    tool_documents: Vec<ContextDocument>,
    retrieved_documents: Vec<ContextDocument>,
    history: &str,
) -> AssembledContext {
    let mut seen: HashSet<String> = HashSet::new();
    let mut keep = |doc: &ContextDocument| seen.insert(doc.content.trim().to_string());

    let tools: Vec<ContextDocument> = tool_documents.into_iter().filter(|d| keep(d)).collect();
    let retrieved: Vec<ContextDocument> =
        retrieved_documents.into_iter().filter(|d| keep(d)).collect();

    let mut sections = Vec::new();
    let mut counter = 0;
    for (label, docs) in [("Tool results", &tools), ("Retrieved documents", &retrieved)] {
        if docs.is_empty() {
            continue;
        }
        let body = docs
            .iter()
            .map(|d| {
                counter += 1;
                format_document(counter, d)
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        sections.push(format!("## {}\n{}", label, body));
    }
    let history = history.trim().to_string();
    if !history.is_empty() {
        sections.push(format!("## Conversation history\n{}", history));
    }

    let mut documents = tools;
    documents.extend(retrieved);
    AssembledContext {
        documents,
        history,
        text: sections.join("\n\n"),
    }
}

/// 回答模板：只依据上下文作答，不足时拒答
pub fn answer_messages(context: &AssembledContext, question: &str) -> Vec<Message> {
    vec![
        Message::system(prompts::ANSWER_SYSTEM),
        Message::user(prompts::answer_user(&context.text, question)),
    ]
}
