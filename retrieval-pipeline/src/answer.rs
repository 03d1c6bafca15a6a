use std::sync::Arc;

use common::{error::AppError, utils::llm::LanguageModel};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::search::ScoredPassage;

pub const DEFAULT_CONTEXT_CHARS: usize = 8_000;
pub const MAX_CITATIONS: usize = 6;
pub const SNIPPET_CHARS: usize = 240;
pub const NOT_FOUND_PHRASE: &str = "not found in the documents";

pub static ANSWER_SYSTEM_PROMPT: &str = r#"
You answer questions about tender documents.

Use only the passages in the provided context. Each passage starts with a header such as
[Volume 1 p.3] naming the document and page it came from. Cite those headers when you rely on
a passage.

If the context does not contain the answer, say that it was "not found in the documents"
and do not guess. Never use outside knowledge.
"#;

pub static BRIEF_SYSTEM_PROMPT: &str = r#"
You write bid briefs for tender teams.

Use only the passages in the provided context. Cover scope, deadlines, submission
requirements, evaluation criteria and commercial terms when the context mentions them, citing
the passage headers such as [Volume 1 p.3].

Anything the context does not cover must be marked as "not found in the documents". Never use
outside knowledge.
"#;

/// A source passage quoted back to the caller.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    #[serde(rename = "docId")]
    pub document_id: String,
    pub page_start: u32,
    pub page_end: u32,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroundedAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Context block handed to the model.
#[derive(Debug, Clone)]
pub struct ComposedContext {
    pub text: String,
    pub included: usize,
    pub citations: Vec<Citation>,
}

pub fn passage_header(passage: &ScoredPassage) -> String {
    if passage.page_start == passage.page_end {
        format!("[{} p.{}]", passage.title, passage.page_start)
    } else {
        format!(
            "[{} p.{}-{}]",
            passage.title, passage.page_start, passage.page_end
        )
    }
}

pub fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= SNIPPET_CHARS {
        return trimmed.to_string();
    }
    trimmed.chars().take(SNIPPET_CHARS).collect()
}

/// Appends passages in rank order until the next one would exceed `budget` characters.
///
/// Passages are never cut; a passage that does not fit ends the context.
pub fn compose_context(
    passages: &[ScoredPassage],
    budget: usize,
) -> Result<ComposedContext, AppError> {
    let mut text = String::new();
    let mut used = 0_usize;
    let mut included = 0_usize;
    let mut citations = Vec::new();

    for passage in passages {
        let body = passage.text.trim();
        if body.is_empty() {
            continue;
        }
        let header = passage_header(passage);
        let separator = if included == 0 { 0 } else { 2 };
        let cost = separator + header.chars().count() + 1 + body.chars().count();
        if used.saturating_add(cost) > budget {
            break;
        }

        if included > 0 {
            text.push_str("\n\n");
        }
        text.push_str(&header);
        text.push('\n');
        text.push_str(body);
        used = used.saturating_add(cost);
        included += 1;

        if citations.len() < MAX_CITATIONS {
            citations.push(Citation {
                document_id: passage.document_id.clone(),
                page_start: passage.page_start,
                page_end: passage.page_end,
                snippet: snippet(body),
            });
        }
    }

    if included == 0 {
        return Err(AppError::NoGrounding(
            "no passage fits the context budget".into(),
        ));
    }

    Ok(ComposedContext {
        text,
        included,
        citations,
    })
}

pub fn answer_user_message(context: &str, question: &str) -> String {
    format!(
        r"
        Context:
        ==================
        {context}

        Question:
        ==================
        {question}
        "
    )
}

/// Turns retrieved passages into a grounded answer.
pub struct AnswerComposer {
    llm: Option<Arc<dyn LanguageModel>>,
    context_chars: usize,
}

impl AnswerComposer {
    pub fn new(llm: Option<Arc<dyn LanguageModel>>, context_chars: usize) -> Self {
        Self {
            llm,
            context_chars: if context_chars == 0 {
                DEFAULT_CONTEXT_CHARS
            } else {
                context_chars
            },
        }
    }

    #[instrument(skip_all, fields(passages = passages.len()))]
    pub async fn answer(
        &self,
        question: &str,
        passages: &[ScoredPassage],
    ) -> Result<GroundedAnswer, AppError> {
        self.compose(ANSWER_SYSTEM_PROMPT, question, passages).await
    }

    #[instrument(skip_all, fields(passages = passages.len()))]
    pub async fn brief(
        &self,
        tender_name: &str,
        passages: &[ScoredPassage],
    ) -> Result<GroundedAnswer, AppError> {
        let instruction = format!("Write the bid brief for tender {tender_name}.");
        self.compose(BRIEF_SYSTEM_PROMPT, &instruction, passages)
            .await
    }

    async fn compose(
        &self,
        system_prompt: &str,
        question: &str,
        passages: &[ScoredPassage],
    ) -> Result<GroundedAnswer, AppError> {
        let context = compose_context(passages, self.context_chars)?;
        debug!(
            included = context.included,
            chars = context.text.chars().count(),
            "context composed"
        );

        let answer = match &self.llm {
            Some(llm) => llm
                .complete(system_prompt, &answer_user_message(&context.text, question))
                .await?
                .trim()
                .to_string(),
            None => {
                warn!("no language model configured; returning the retrieved passages");
                context.text.clone()
            }
        };

        Ok(GroundedAnswer {
            answer,
            citations: context.citations,
        })
    }
}
