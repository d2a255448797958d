//! 检索增强问答与数据集向量化。

pub mod answer;
pub mod assembler;
pub mod config;
pub mod contextualize;
pub mod curation;
pub mod dispatcher;
pub mod embedding;
pub mod history;
pub mod markdown;
pub mod mmr;
pub mod pipeline;
pub mod prompts;
pub mod retriever;
pub mod tools;
pub mod websearch;

#[cfg(test)]
mod testing;

pub use answer::{AnswerGenerator, AnswerStream};
pub use config::{load_config, load_config_from, AppConfig, Services};
pub use embedding::{EmbeddingJob, EmbeddingPipeline};
pub use pipeline::{standard_tools, RagPipeline};
pub use tools::{Tool, ToolRegistry};
pub use websearch::{SearxngClient, WebResearcher, WebResult, WebSearch};
