//! 各阶段使用的固定提示词。

use gai_llm::ToolSpec;

/// 上下文不足时回答中使用的固定拒答句
pub const REFUSAL_SENTENCE: &str =
    "I don't have enough information in the provided context to answer that question.";

pub const CONTEXTUALIZE_SYSTEM: &str = "Given a chat history and the latest user question, \
which might reference context in the chat history, formulate a standalone question that can \
be understood without the chat history. Do NOT answer the question. Do NOT invent names, \
entities or facts that are not present in the chat history; if a reference cannot be resolved, \
keep it as it is. If the question is already self-contained, return it exactly as it was given. \
Return only the question.";

pub const HISTORY_FILTER_SYSTEM: &str = "You receive a conversation transcript made of \
\"Human:\" and \"System:\" blocks, followed by the current question. Return only the blocks \
that are relevant to the current question, copied verbatim in their original order. \
If none of them is relevant, return exactly NONE. Do not add any commentary.";

pub const ANSWER_SYSTEM: &str = "You are an assistant for question-answering tasks. \
Use only the pieces of context provided by the user to answer the question. \
Sections labelled \"Tool results\" contain live data from external tools and take precedence \
over retrieved documents when they disagree. \
If the context does not contain the answer, reply with exactly: \"I don't have enough information \
in the provided context to answer that question.\" \
Keep the answer concise, three sentences at most unless the question asks for a list.";

pub const WEB_ANSWER_SYSTEM: &str = "You answer questions using web search results. \
Use only the search results given by the user, keep the answer short and factual, and \
say so when the results do not contain the answer.";

pub const SEARCH_PHRASE_SYSTEM: &str = "You help enrich a dataset record. Given a record in \
markdown and an instruction, generate one concise, search-engine-friendly question or phrase \
that would find the information the instruction asks for about this record. \
Answer in the form [search: <phrase>] and nothing else.";

pub const SEARCH_PHRASE_REFINE_SYSTEM: &str = "Extract the content inside '[search: ...]' from \
the text you are given. Return only the extracted phrase without brackets, quotes or the \
word search.";

pub const MODIFY_MARKDOWN_SYSTEM: &str = "You revise a dataset record written in markdown. \
Each data point title is in bold. Follow these rules:\n\
1. Keep the original data points and their bold titles.\n\
2. Change a value only when the instruction asks for it.\n\
3. When the instruction asks for new data points, append them at the end as **title**: value, \
using the search results as the only source.\n\
4. Do not invent values that are not in the record or the search results.\n\
5. Do not add data points the instruction did not ask for.\n\
6. Separate data points with two spaces followed by a newline.\n\
7. Return only the revised markdown without any commentary.";

pub fn history_filter_user(transcript: &str, question: &str) -> String {
    format!(
        "Transcript:\n{}\n\nCurrent question: {}",
        transcript, question
    )
}

/// 列出所有工具的名称、描述与参数结构
pub fn tool_dispatch_system(tools: &[ToolSpec]) -> String {
    let listing = tools
        .iter()
        .map(|t| format!("{} - {}\n  parameters: {}", t.name, t.description, t.parameters))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "You decide whether external tools are needed to answer the user's request. \
Available tools:\n\n{}\n\n\
Call a tool only when the request needs information the tool provides, with arguments that \
match its parameters. Call several tools if several are needed. \
If no tool is needed, reply with an empty message and call nothing.",
        listing
    )
}

pub fn answer_user(context: &str, question: &str) -> String {
    format!("Context:\n{}\n\nQuestion: {}", context, question)
}

pub fn web_answer_user(results: &str, question: &str) -> String {
    format!("Search results:\n{}\n\nQuestion: {}", results, question)
}

pub fn search_phrase_user(markdown: &str, instruction: &str) -> String {
    format!(
        "Instruction: {}\n\nRecord:\n{}",
        instruction.trim(),
        markdown
    )
}

pub fn modify_markdown_user(markdown: &str, instruction: &str, search_results: &str) -> String {
    format!(
        "Instruction: {}\n\nRecord:\n{}\n\nSearch results:\n{}",
        instruction.trim(),
        markdown,
        search_results
    )
}
