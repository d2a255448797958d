//! 问答流水线：改写问题、压缩历史、检索、调用工具、拼装上下文，最后流式作答。
//! 各阶段严格顺序执行。

use std::sync::Arc;

use gai_core::{RagAnswer, RagRequest};
use gai_error::{GaiError, Result};
use tracing::{info, instrument};

use crate::answer::{AnswerGenerator, AnswerStream};
use crate::assembler::assemble;
use crate::config::{RagSettings, Services};
use crate::contextualize::Contextualizer;
use crate::dispatcher::ToolDispatcher;
use crate::history::HistoryCompactor;
use crate::mmr::MmrConfig;
use crate::retriever::Retriever;
use crate::tools::{CurrencyConverter, Tool, ToolRegistry, WebSearchTool};
use crate::websearch::WebResearcher;

/// 货币换算与网络搜索两个内置工具
pub fn standard_tools(services: &Services) -> Result<ToolRegistry> {
    let researcher = WebResearcher::new(
        services.web_search.clone(),
        services.embed.clone(),
        services.chat.clone(),
        services.rag.tool_model.clone(),
    );
    ToolRegistry::new(vec![
        Tool::CurrencyConverter(CurrencyConverter::new(services.exchange_rates.clone())),
        Tool::WebSearch(WebSearchTool::new(Arc::new(researcher))),
    ])
}

pub struct RagPipeline {
    contextualizer: Contextualizer,
    compactor: HistoryCompactor,
    retriever: Retriever,
    dispatcher: ToolDispatcher,
    tools: ToolRegistry,
    generator: AnswerGenerator,
    settings: RagSettings,
}

impl RagPipeline {
    pub fn new(services: &Services, tools: ToolRegistry) -> Self {
        let rag = &services.rag;
        let tool_model = rag.tool_model.clone().or_else(|| rag.answer_model.clone());
        info!(tools = ?tools.names(), top_k = rag.top_k, "rag pipeline ready");
        Self {
            contextualizer: Contextualizer::new(services.chat.clone(), rag.contextualize_model.clone()),
            compactor: HistoryCompactor::new(services.chat.clone(), rag.contextualize_model.clone()),
            retriever: Retriever::new(
                services.catalog.clone(),
                services.vector_store.clone(),
                services.embed.clone(),
                MmrConfig::new(rag.mmr_lambda, rag.fetch_multiplier),
            ),
            dispatcher: ToolDispatcher::new(services.chat.clone(), tool_model),
            tools,
            generator: AnswerGenerator::new(services.chat.clone(), rag.answer_model.clone()),
            settings: rag.clone(),
        }
    }

    pub fn from_services(services: &Services) -> Result<Self> {
        Ok(Self::new(services, standard_tools(services)?))
    }

    /// 返回的流先给出 context 事件，再给出回答增量
    #[instrument(skip(self, request), fields(dataset_id = %request.dataset_id))]
    pub async fn ask(&self, request: &RagRequest) -> Result<AnswerStream> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(GaiError::Validation {
                message: "question must not be empty".to_string(),
            });
        }

        let standalone = self
            .contextualizer
            .standalone_question(question, &request.history)
            .await?;
        let history = self.compactor.compact(&request.history, &standalone).await?;
        let retrieved = self
            .retriever
            .search(
                &request.dataset_id,
                &standalone,
                request.filter.as_ref(),
                self.settings.top_k,
                self.settings.diversity,
            )
            .await?;
        let tool_documents = self.dispatcher.dispatch(&standalone, &self.tools).await?;

        info!(
            retrieved = retrieved.len(),
            tool_documents = tool_documents.len(),
            "context gathered"
        );
        let context = assemble(tool_documents, retrieved, &history);
        Ok(self.generator.stream(context, &standalone))
    }

    /// 非流式问答：读完整个流
    pub async fn answer(&self, request: &RagRequest) -> Result<RagAnswer> {
        let (context, answer) = self.ask(request).await?.collect_answer().await?;
        Ok(RagAnswer {
            question: request.question.clone(),
            context,
            answer,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use gai_core::{ChatEntry, RagDatabase};
    use gai_store::{Catalog, IndexGuard, MemoryStore, VectorIndexMapping, VectorRecord, VectorStore};
    use serde_json::Map;

    use super::*;
    use crate::config::EmbeddingSettings;
    use crate::prompts::REFUSAL_SENTENCE;
    use crate::testing::{FixedRates, HashEmbedModel, ScriptedChatModel, StaticWebSearch};
    use crate::tools::CURRENCY_TOOL;

    const DIMS: usize = 32;

    async fn services(chat: Arc<ScriptedChatModel>, texts: &[&str]) -> Services {
        let store = MemoryStore::new();
        let embed = Arc::new(HashEmbedModel::new(DIMS));
        store.ensure_registry().await.unwrap();
        store
            .upsert_rag_database(&RagDatabase {
                dataset_id: "cities".into(),
                ingestion_description: "cities".into(),
                raw_index_name: "raw-cities".into(),
                rag_index_name: "rag-cities".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .create_index_if_absent("rag-cities", &VectorIndexMapping::cosine(DIMS))
            .await
            .unwrap();
        let records = texts
            .iter()
            .map(|t| VectorRecord::new(*t, embed.vector(t), Map::new()))
            .collect();
        store.bulk_write("rag-cities", records).await.unwrap();

        Services {
            chat,
            embed,
            vector_store: Arc::new(store.clone()),
            source_store: Arc::new(store.clone()),
            catalog: Arc::new(store),
            web_search: Arc::new(StaticWebSearch::default()),
            exchange_rates: Arc::new(FixedRates::new(&[("USD", "EUR", 0.9234)])),
            index_guard: IndexGuard::new(),
            rag: RagSettings {
                top_k: 2,
                ..RagSettings::default()
            },
            embedding: EmbeddingSettings::default(),
        }
    }

    fn request(question: &str) -> RagRequest {
        RagRequest {
            dataset_id: "cities".into(),
            question: question.into(),
            filter: None,
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn answers_from_retrieved_documents() {
        let chat = Arc::new(ScriptedChatModel::new().reply("").tokens(&["Paris", "."]));
        let services = services(chat.clone(), &["Paris is the capital of France", "Berlin is in Germany"]).await;
        let pipeline = RagPipeline::from_services(&services).unwrap();

        let answer = pipeline.answer(&request("What is the capital of France?")).await.unwrap();
        assert_eq!(answer.answer, "Paris.");
        assert_eq!(answer.context[0].content, "Paris is the capital of France");
        assert_eq!(answer.context[0].source(), "rag-cities");

        // 无历史时不改写问题，只有工具选择和作答两次调用
        let calls = chat.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tools.len(), 2);
        assert!(calls[1].messages[1].content.contains("## Retrieved documents"));
    }

    #[tokio::test]
    async fn currency_fallback_feeds_the_answer() {
        let chat = Arc::new(
            ScriptedChatModel::new()
                .reply("I would use a tool")
                .tokens(&["About 92 euros."]),
        );
        let services = services(chat.clone(), &[]).await;
        let pipeline = RagPipeline::from_services(&services).unwrap();

        let answer = pipeline.answer(&request("Convert 100 USD to EUR")).await.unwrap();
        assert_eq!(answer.context.len(), 1);
        assert_eq!(answer.context[0].source(), CURRENCY_TOOL);
        assert!(chat.calls()[1].messages[1]
            .content
            .contains("100 USD converts to 92.34 EUR as of today"));
    }

    #[tokio::test]
    async fn nothing_found_is_answered_with_the_refusal() {
        let chat = Arc::new(ScriptedChatModel::new());
        let services = services(chat.clone(), &[]).await;
        let pipeline = RagPipeline::new(&services, ToolRegistry::empty());

        let answer = pipeline.answer(&request("Who won in 1998?")).await.unwrap();
        assert!(answer.context.is_empty());
        assert_eq!(answer.answer, REFUSAL_SENTENCE);
        assert_eq!(chat.call_count(), 0);
    }

    #[tokio::test]
    async fn history_is_contextualized_before_retrieval() {
        let chat = Arc::new(
            ScriptedChatModel::new()
                .reply("What is the population of Paris?")
                .reply("Human: Tell me about Paris\nSystem: Paris is the capital of France.")
                .tokens(&["About two million."]),
        );
        let services = services(chat.clone(), &["Paris has about two million inhabitants"]).await;
        let pipeline = RagPipeline::new(&services, ToolRegistry::empty());

        let mut req = request("And its population?");
        req.history = vec![ChatEntry::new("Tell me about Paris", "Paris is the capital of France.")];
        let answer = pipeline.answer(&req).await.unwrap();

        assert_eq!(answer.question, "And its population?");
        assert_eq!(answer.answer, "About two million.");
        let prompt = &chat.calls()[2].messages[1].content;
        assert!(prompt.contains("## Conversation history"));
        assert!(prompt.ends_with("Question: What is the population of Paris?"));
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let services = services(Arc::new(ScriptedChatModel::new()), &[]).await;
        let pipeline = RagPipeline::new(&services, ToolRegistry::empty());
        assert!(matches!(
            pipeline.ask(&request("   ")).await,
            Err(GaiError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_dataset_is_not_found() {
        let services = services(Arc::new(ScriptedChatModel::new()), &[]).await;
        let pipeline = RagPipeline::new(&services, ToolRegistry::empty());
        let mut req = request("anything");
        req.dataset_id = "nope".into();
        assert!(matches!(pipeline.ask(&req).await, Err(GaiError::NotFound { .. })));
    }
}
