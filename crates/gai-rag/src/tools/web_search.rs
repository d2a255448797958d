use std::sync::Arc;

use gai_core::ContextDocument;
use gai_error::{GaiError, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::websearch::{WebResearcher, WEB_SEARCH_SOURCE};

pub const WEB_SEARCH_TOOL: &str = WEB_SEARCH_SOURCE;

#[derive(Debug, Deserialize)]
struct WebSearchArgs {
    prompt: String,
}

/// 网络搜索工具，每条筛选后的搜索结果成为一个上下文文档
#[derive(Clone)]
pub struct WebSearchTool {
    researcher: Arc<WebResearcher>,
}

impl WebSearchTool {
    pub fn new(researcher: Arc<WebResearcher>) -> Self {
        Self { researcher }
    }

    pub fn description() -> &'static str {
        "Searches the web for recent or public information that is not in the dataset, \
such as news, current events or facts about well-known entities."
    }

    pub fn parameters() -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "What to search for"}
            },
            "required": ["prompt"]
        })
    }

    pub fn parse_prompt(args: &Value) -> Result<String> {
        let parsed: WebSearchArgs =
            serde_json::from_value(args.clone()).map_err(|e| GaiError::Validation {
                message: format!("arguments do not match the schema: {}", e),
            })?;
        let prompt = parsed.prompt.trim();
        if prompt.is_empty() {
            return Err(GaiError::Validation {
                message: "prompt must not be empty".to_string(),
            });
        }
        Ok(prompt.to_string())
    }

    pub async fn invoke(&self, args: &Value) -> Result<Vec<ContextDocument>> {
        let prompt = Self::parse_prompt(args)?;
        self.researcher
            .context(&prompt)
            .await
            .map_err(|e| GaiError::ToolFailure {
                tool: WEB_SEARCH_TOOL.to_string(),
                message: e.to_string(),
            })
    }
}
