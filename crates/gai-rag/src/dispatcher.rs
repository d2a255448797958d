//! 工具调度：让模型以原生 function-calling 选择工具，逐个执行并把结果包装成上下文文档。
//!
//! 模型没有给出任何结构化调用时，退回到对原始指令的
//! “convert <金额> <币种> to <币种>” 模式匹配，直接调用货币换算工具。

use std::sync::Arc;

use gai_core::ContextDocument;
use gai_error::{GaiError, Result};
use gai_llm::{ChatModel, CompletionRequest, Message, ToolCallRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::prompts;
use crate::tools::{Tool, ToolRegistry, CURRENCY_TOOL};

static CONVERT_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)convert\s+(\d+\.?\d*)\s+([A-Z]{3})\s+to\s+([A-Z]{3})").ok()
});

/// 调度过程经历的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchState {
    Idle,
    PromptingModel,
    ParsingToolCalls,
    FallbackPatternMatch,
    NoToolNeeded,
    InvokingTools,
    AggregatingResults,
}

/// 解析后的一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub tool: String,
    pub args: Value,
}

/// 调度结果及状态轨迹
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub states: Vec<DispatchState>,
    pub calls: Vec<ToolCall>,
    pub documents: Vec<ContextDocument>,
    pub used_fallback: bool,
}

impl DispatchReport {
    fn enter(&mut self, state: DispatchState) {
        debug!(?state, "dispatch state");
        self.states.push(state);
    }

    pub fn final_state(&self) -> DispatchState {
        self.states.last().copied().unwrap_or(DispatchState::Idle)
    }
}

pub struct ToolDispatcher {
    chat: Arc<dyn ChatModel>,
    model: Option<String>,
}

impl ToolDispatcher {
    pub fn new(chat: Arc<dyn ChatModel>, model: Option<String>) -> Self {
        Self { chat, model }
    }

    /// 不需要工具时返回空列表；只有模型调用本身失败才返回错误
    pub async fn dispatch(
        &self,
        instruction: &str,
        registry: &ToolRegistry,
    ) -> Result<Vec<ContextDocument>> {
        Ok(self.dispatch_traced(instruction, registry).await?.documents)
    }

    #[instrument(skip(self, registry), fields(tools = registry.len()))]
    pub async fn dispatch_traced(
        &self,
        instruction: &str,
        registry: &ToolRegistry,
    ) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        report.enter(DispatchState::Idle);

        if registry.is_empty() {
            report.enter(DispatchState::NoToolNeeded);
            return Ok(report);
        }

        report.enter(DispatchState::PromptingModel);
        let specs = registry.specs();
        let request = CompletionRequest::new(vec![
            Message::system(prompts::tool_dispatch_system(&specs)),
            Message::user(instruction),
        ])
        .model(self.model.clone())
        .tools(specs)
        .temperature(0.0);
        let reply = self.chat.complete(request).await?;

        report.enter(DispatchState::ParsingToolCalls);
        let mut calls = parse_tool_calls(&reply.tool_calls);

        if calls.is_empty() {
            report.enter(DispatchState::FallbackPatternMatch);
            match fallback_call(instruction) {
                Some(call) if registry.resolve(&call.tool).is_some() => {
                    info!(args = %call.args, "tool call recovered by pattern fallback");
                    report.used_fallback = true;
                    calls.push(call);
                }
                _ => {
                    report.enter(DispatchState::NoToolNeeded);
                    return Ok(report);
                }
            }
        }

        report.enter(DispatchState::InvokingTools);
        for call in &calls {
            let Some(tool) = registry.resolve(&call.tool) else {
                warn!(tool = %call.tool, "model requested an unknown tool, skipping");
                continue;
            };
            let docs = invoke_isolated(tool, &call.args).await?;
            report.documents.extend(docs);
        }
        report.calls = calls;

        report.enter(DispatchState::AggregatingResults);
        info!(documents = report.documents.len(), "tool dispatch finished");
        Ok(report)
    }
}

/// 严格解析：字符串参数必须是合法 JSON 对象，否则丢弃该调用
pub fn parse_tool_calls(raw: &[ToolCallRequest]) -> Vec<ToolCall> {
    raw.iter()
        .filter_map(|c| {
            let name = c.name.trim();
            if name.is_empty() {
                warn!("tool call without a name, dropping");
                return None;
            }
            let args = match &c.arguments {
                Value::Object(_) => c.arguments.clone(),
                Value::Null => json!({}),
                Value::String(s) if s.trim().is_empty() => json!({}),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(v @ Value::Object(_)) => v,
                    Ok(_) | Err(_) => {
                        warn!(tool = %name, "tool call arguments are not a JSON object, dropping");
                        return None;
                    }
                },
                _ => {
                    warn!(tool = %name, "tool call arguments are not a JSON object, dropping");
                    return None;
                }
            };
            Some(ToolCall {
                tool: name.to_string(),
                args,
            })
        })
        .collect()
}

/// 降级路径：匹配 “convert 100 USD to EUR”
pub fn fallback_call(instruction: &str) -> Option<ToolCall> {
    let pattern = CONVERT_PATTERN.as_ref()?;
    let caps = pattern.captures(instruction)?;
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some(ToolCall {
        tool: CURRENCY_TOOL.to_string(),
        args: json!({
            "from": caps.get(2)?.as_str().to_uppercase(),
            "to": caps.get(3)?.as_str().to_uppercase(),
            "amount": amount,
        }),
    })
}

/// 参数错误与执行错误都变成带 error 标记的文档，不中断后续工具
async fn invoke_isolated(tool: &Tool, args: &Value) -> Result<Vec<ContextDocument>> {
    match tool.invoke(args).await {
        Ok(docs) => Ok(docs),
        Err(GaiError::Validation { message }) => {
            warn!(tool = tool.name(), %message, "invalid tool arguments");
            let text = format!("Invalid arguments for the {}: {}", tool.name(), message);
            Ok(vec![ContextDocument::try_new(text, tool.name())?.as_error()])
        }
        Err(err) => {
            warn!(tool = tool.name(), error = %err, "tool invocation failed");
            let text = format!("The {} failed: {}", tool.name(), err);
            Ok(vec![ContextDocument::try_new(text, tool.name())?.as_error()])
        }
    }
}
