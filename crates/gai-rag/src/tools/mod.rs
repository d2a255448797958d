//! 启动时确定的工具注册表。

pub mod currency;
pub mod web_search;

use std::collections::HashSet;

use gai_core::ContextDocument;
use gai_error::{GaiError, Result};
use gai_llm::ToolSpec;
use serde_json::Value;

pub use currency::{CurrencyArgs, CurrencyConverter, ExchangeRates, HexarateClient, CURRENCY_TOOL};
pub use web_search::{WebSearchTool, WEB_SEARCH_TOOL};

/// 可用工具的封闭集合
#[derive(Clone)]
pub enum Tool {
    CurrencyConverter(CurrencyConverter),
    WebSearch(WebSearchTool),
}

impl Tool {
    pub fn name(&self) -> &'static str {
        match self {
            Tool::CurrencyConverter(_) => CURRENCY_TOOL,
            Tool::WebSearch(_) => WEB_SEARCH_TOOL,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Tool::CurrencyConverter(_) => CurrencyConverter::description(),
            Tool::WebSearch(_) => WebSearchTool::description(),
        }
    }

    /// 参数的 JSON Schema
    pub fn parameters(&self) -> Value {
        match self {
            Tool::CurrencyConverter(_) => CurrencyConverter::parameters(),
            Tool::WebSearch(_) => WebSearchTool::parameters(),
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }

    /// 参数不合法返回 `GaiError::Validation`，执行失败返回其他错误
    pub async fn invoke(&self, args: &Value) -> Result<Vec<ContextDocument>> {
        match self {
            Tool::CurrencyConverter(tool) => tool.invoke(args).await,
            Tool::WebSearch(tool) => tool.invoke(args).await,
        }
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
}

impl ToolRegistry {
    /// 工具名必须唯一
    pub fn new(tools: Vec<Tool>) -> Result<Self> {
        let mut seen = HashSet::new();
        for tool in &tools {
            if !seen.insert(tool.name()) {
                return Err(GaiError::Configuration {
                    key: "tools".to_string(),
                    reason: format!("duplicate tool name {}", tool.name()),
                });
            }
        }
        Ok(Self { tools })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// 名称精确匹配
    pub fn resolve(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(Tool::spec).collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(Tool::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::FixedRates;

    fn converter() -> Tool {
        Tool::CurrencyConverter(CurrencyConverter::new(Arc::new(FixedRates::new(&[]))))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        assert!(ToolRegistry::new(vec![converter(), converter()]).is_err());
    }

    #[test]
    fn resolves_by_exact_name() {
        let registry = ToolRegistry::new(vec![converter()]).unwrap();
        assert!(registry.resolve(CURRENCY_TOOL).is_some());
        assert!(registry.resolve("currencyconversiontool").is_none());
        assert_eq!(registry.names(), vec![CURRENCY_TOOL]);
        let specs = registry.specs();
        assert_eq!(specs[0].parameters["required"][0], "from");
    }
}
