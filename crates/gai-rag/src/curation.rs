//! 文档修订子链：生成搜索短语、联网检索，再让模型按指令改写 markdown。

use std::sync::Arc;

use gai_error::{GaiError, Result};
use gai_llm::{ChatModel, CompletionRequest, Message};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument};

use crate::prompts;
use crate::websearch::WebResearcher;

static SEARCH_TAG: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?is)\[\s*search\s*:\s*(.+?)\s*\]").ok());

/// 从 `[search: ...]` 形式的回复中取出短语
pub fn extract_search_phrase(reply: &str) -> Option<String> {
    let re = SEARCH_TAG.as_ref()?;
    re.captures(reply)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().trim_matches('"').trim().to_string())
        .filter(|s| !s.is_empty())
}

pub struct CurationChain {
    chat: Arc<dyn ChatModel>,
    model: Option<String>,
    researcher: Arc<WebResearcher>,
}

impl CurationChain {
    pub fn new(chat: Arc<dyn ChatModel>, model: Option<String>, researcher: Arc<WebResearcher>) -> Self {
        Self {
            chat,
            model,
            researcher,
        }
    }

    async fn ask(&self, system: &str, user: String) -> Result<String> {
        let request = CompletionRequest::new(vec![Message::system(system), Message::user(user)])
            .model(self.model.clone())
            .temperature(0.0);
        Ok(self.chat.complete(request).await?.content.trim().to_string())
    }

    /// 先生成再提炼；提炼结果为空时退回首轮的标签，再退回指令本身
    async fn search_phrase(&self, markdown: &str, instruction: &str) -> Result<String> {
        let reply = self
            .ask(
                prompts::SEARCH_PHRASE_SYSTEM,
                prompts::search_phrase_user(markdown, instruction),
            )
            .await?;
        let tagged = extract_search_phrase(&reply);

        let refined = self.ask(prompts::SEARCH_PHRASE_REFINE_SYSTEM, reply).await?;
        let refined = extract_search_phrase(&refined).unwrap_or(refined);
        let refined = refined.trim().trim_matches('"').trim();
        if !refined.is_empty() {
            return Ok(refined.to_string());
        }
        match tagged {
            Some(phrase) => Ok(phrase),
            None => {
                debug!("empty search phrase, falling back to the instruction");
                Ok(instruction.trim().to_string())
            }
        }
    }

    #[instrument(skip(self, markdown))]
    pub async fn curate(&self, markdown: &str, instruction: &str) -> Result<String> {
        let phrase = self.search_phrase(markdown, instruction).await?;
        debug!(%phrase, "searching the web for curation");

        let web = self.researcher.research(&phrase).await?;
        let mut results: Vec<String> = Vec::with_capacity(web.context.len() + 1);
        if !web.answer.is_empty() {
            results.push(format!("Summary: {}", web.answer));
        }
        results.extend(web.context.into_iter().map(|d| d.content));
        let results = if results.is_empty() {
            "No search results.".to_string()
        } else {
            results.join("\n\n")
        };

        let revised = self
            .ask(
                prompts::MODIFY_MARKDOWN_SYSTEM,
                prompts::modify_markdown_user(markdown, instruction, &results),
            )
            .await?;
        if revised.is_empty() {
            return Err(GaiError::Pipeline {
                stage: "curation".to_string(),
                message: "model returned an empty revision".to_string(),
            });
        }
        Ok(revised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{web_result, HashEmbedModel, ScriptedChatModel, StaticWebSearch};

    fn chain(chat: Arc<ScriptedChatModel>, search: Arc<StaticWebSearch>) -> CurationChain {
        let researcher = WebResearcher::new(search, Arc::new(HashEmbedModel::new(16)), chat.clone(), None);
        CurationChain::new(chat, None, Arc::new(researcher))
    }

    #[test]
    fn extracts_tagged_phrase() {
        assert_eq!(
            extract_search_phrase("Sure! [search: \"Louvre opening hours\"]").as_deref(),
            Some("Louvre opening hours")
        );
        assert_eq!(extract_search_phrase("[SEARCH:  ]"), None);
        assert_eq!(extract_search_phrase("no tag"), None);
    }

    #[tokio::test]
    async fn curates_with_search_results() {
        let chat = Arc::new(
            ScriptedChatModel::new()
                .reply("[search: Louvre opening hours]")
                .reply("Louvre museum opening hours")
                .reply("Open 9:00 to 18:00")
                .reply("**name:** Louvre  \n**hours:** 9:00-18:00"),
        );
        let search = Arc::new(StaticWebSearch::new(vec![web_result(
            "Louvre",
            "The museum is open from 9:00 to 18:00",
        )]));

        let revised = chain(chat.clone(), search.clone())
            .curate("**name:** Louvre", "add the opening hours")
            .await
            .unwrap();

        assert_eq!(revised, "**name:** Louvre  \n**hours:** 9:00-18:00");
        assert_eq!(search.queries(), vec!["Louvre museum opening hours".to_string()]);
        let calls = chat.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0].messages[0].content, prompts::SEARCH_PHRASE_SYSTEM);
        assert_eq!(calls[1].messages[0].content, prompts::SEARCH_PHRASE_REFINE_SYSTEM);
        assert_eq!(calls[1].messages[1].content, "[search: Louvre opening hours]");
        let modify = &calls[3].messages[1].content;
        assert!(modify.contains("Summary: Open 9:00 to 18:00"));
        assert!(modify.contains("open from 9:00 to 18:00"));
    }

    #[tokio::test]
    async fn empty_refinement_keeps_the_generated_tag() {
        let chat = Arc::new(
            ScriptedChatModel::new()
                .reply("[search: Louvre address]")
                .reply("")
                .reply("**name:** Louvre"),
        );
        let search = Arc::new(StaticWebSearch::default());

        chain(chat.clone(), search.clone())
            .curate("**name:** Louvre", "add the address")
            .await
            .unwrap();
        assert_eq!(search.queries(), vec!["Louvre address".to_string()]);
        assert_eq!(chat.call_count(), 3);
    }

    #[tokio::test]
    async fn untagged_reply_is_refined_then_falls_back_to_instruction() {
        let chat = Arc::new(
            ScriptedChatModel::new()
                .reply("I cannot help with that")
                .reply("   ")
                .reply("**name:** Louvre"),
        );
        let search = Arc::new(StaticWebSearch::default());

        let revised = chain(chat.clone(), search.clone())
            .curate("**name:** Louvre", "  add the city ")
            .await
            .unwrap();
        assert_eq!(revised, "**name:** Louvre");
        assert_eq!(search.queries(), vec!["add the city".to_string()]);
        assert!(chat.calls()[2].messages[1].content.contains("No search results."));
    }

    #[tokio::test]
    async fn empty_revision_is_a_pipeline_error() {
        let chat = Arc::new(ScriptedChatModel::new().reply("[search: x]").reply("x").reply(""));
        let err = chain(chat, Arc::new(StaticWebSearch::default()))
            .curate("**a:** 1", "fix")
            .await
            .unwrap_err();
        assert!(matches!(err, GaiError::Pipeline { .. }));
    }
}
