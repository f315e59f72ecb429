//! Answer generator
//!
//! Grounded synthesis over retrieved context with citation extraction.
//! The generation call itself is never retried here; pipeline callers own
//! retry decisions. An out-of-band validation pass scores groundedness
//! for offline evaluation only.

use std::time::Instant;

use dealership_core::{ConversationTurn, RetrievedDocument, SourceDocument};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chat::ChatClient;
use crate::prompt::{build_user_prompt, Message, SYSTEM_PROMPT};
use crate::LlmError;

static GROUNDEDNESS_SCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)groundedness score:\s*(\d{1,2})").unwrap());

/// Character cap for cited source snippets
const SNIPPET_CHARS: usize = 200;

/// A generated, cited answer
#[derive(Debug, Clone)]
pub struct GeneratedAnswer {
    pub answer: String,
    pub sources: Vec<SourceDocument>,
    pub model: String,
    pub tokens_in: usize,
    pub tokens_out: usize,
    pub processing_time_ms: f64,
}

/// Offline groundedness evaluation result
#[derive(Debug, Clone)]
pub struct GroundednessReport {
    /// 1-10 when the evaluator reply was parseable
    pub score: Option<u8>,
    pub evaluation: String,
}

/// Grounded answer generator
pub struct AnswerGenerator {
    chat: Arc<ChatClient>,
    max_tokens: usize,
    temperature: f32,
}

impl AnswerGenerator {
    pub fn new(chat: Arc<ChatClient>, max_tokens: usize) -> Self {
        Self {
            chat,
            max_tokens,
            temperature: 0.2,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Generate an answer constrained to `context_docs`, citing sources.
    pub async fn generate(
        &self,
        query: &str,
        context_docs: &[RetrievedDocument],
        history: &[ConversationTurn],
    ) -> Result<GeneratedAnswer, LlmError> {
        let started = Instant::now();
        let user_prompt = build_user_prompt(query, context_docs, history);
        let messages = [Message::user(user_prompt)];

        let response = self
            .chat
            .generate(Some(SYSTEM_PROMPT), &messages, self.max_tokens, self.temperature)
            .await?;

        let sources = extract_sources(&response.text, context_docs);

        Ok(GeneratedAnswer {
            answer: response.text,
            sources,
            model: self.chat.model().to_string(),
            tokens_in: response.input_tokens,
            tokens_out: response.output_tokens,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Streaming variant; chunks are forwarded on `tx` as they arrive.
    pub async fn generate_stream(
        &self,
        query: &str,
        context_docs: &[RetrievedDocument],
        history: &[ConversationTurn],
        tx: mpsc::Sender<String>,
    ) -> Result<GeneratedAnswer, LlmError> {
        let started = Instant::now();
        let user_prompt = build_user_prompt(query, context_docs, history);
        let messages = [Message::user(user_prompt)];

        let response = self
            .chat
            .generate_stream(
                Some(SYSTEM_PROMPT),
                &messages,
                self.max_tokens,
                self.temperature,
                tx,
            )
            .await?;

        let sources = extract_sources(&response.text, context_docs);

        Ok(GeneratedAnswer {
            answer: response.text,
            sources,
            model: self.chat.model().to_string(),
            tokens_in: response.input_tokens,
            tokens_out: response.output_tokens,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Out-of-band anti-hallucination check: a second model call compares
    /// answer claims to the context and scores groundedness 1-10. Never
    /// used for user-visible gating.
    pub async fn validate_answer(
        &self,
        answer: &str,
        context_docs: &[RetrievedDocument],
    ) -> Result<GroundednessReport, LlmError> {
        let context = crate::prompt::format_context(context_docs);
        let prompt = format!(
            "Given this answer and the context it was based on, evaluate if the answer \
             contains only information from the context.\n\n\
             Answer:\n{answer}\n\n\
             Context:\n{context}\n\n\
             Evaluate:\n\
             1. Are all factual claims in the answer supported by the context?\n\
             2. List any claims that appear to be unsupported or hallucinated\n\
             3. Rate the answer's groundedness on a scale of 1-10\n\n\
             Provide your evaluation in this format:\n\
             Groundedness Score: [1-10]\n\
             Supported Claims: [list]\n\
             Unsupported Claims: [list]\n\
             Overall Assessment: [brief summary]"
        );

        let messages = [Message::user(prompt)];
        let response = self
            .chat
            .generate(
                Some("You are an expert fact-checker evaluating answer quality."),
                &messages,
                500,
                0.0,
            )
            .await?;

        Ok(GroundednessReport {
            score: parse_groundedness(&response.text),
            evaluation: response.text,
        })
    }
}

/// Collect sources actually cited in the answer, deduplicated in
/// first-appearance order over the supplied context.
fn extract_sources(answer: &str, context_docs: &[RetrievedDocument]) -> Vec<SourceDocument> {
    let mut seen = std::collections::HashSet::new();
    let mut sources = Vec::new();

    for doc in context_docs {
        let source = doc.source();
        if source == "Unknown" || !answer.contains(source) || !seen.insert(source.to_string()) {
            continue;
        }

        let snippet: String = doc.content.chars().take(SNIPPET_CHARS).collect();
        let snippet = if doc.content.chars().count() > SNIPPET_CHARS {
            format!("{snippet}...")
        } else {
            snippet
        };

        let metadata = doc
            .metadata
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "text" | "content"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        sources.push(SourceDocument {
            source: source.to_string(),
            document_type: doc.document_type().to_string(),
            content_snippet: snippet,
            metadata,
        });
    }

    sources
}

fn parse_groundedness(evaluation: &str) -> Option<u8> {
    GROUNDEDNESS_SCORE
        .captures(evaluation)
        .and_then(|caps| caps[1].parse::<u8>().ok())
        .filter(|score| (1..=10).contains(score))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str, source: &str) -> RetrievedDocument {
        RetrievedDocument::new(content).with_metadata("source", source)
    }

    #[test]
    fn test_extract_cited_sources_only() {
        let docs = vec![
            doc("Camry pricing details", "inventory.csv"),
            doc("Brake pad procedure", "service-manual.pdf"),
        ];
        let answer = "The 2024 Camry is $28,000 [Source: inventory.csv].";

        let sources = extract_sources(answer, &docs);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source, "inventory.csv");
    }

    #[test]
    fn test_sources_deduplicated_in_order() {
        let docs = vec![
            doc("chunk a", "manual.pdf"),
            doc("chunk b", "manual.pdf"),
            doc("chunk c", "pricing.csv"),
        ];
        let answer = "Per [Source: pricing.csv] and [Source: manual.pdf], yes.";

        let sources = extract_sources(answer, &docs);
        assert_eq!(sources.len(), 2);
        // Order follows the context, not the answer
        assert_eq!(sources[0].source, "manual.pdf");
        assert_eq!(sources[1].source, "pricing.csv");
    }

    #[test]
    fn test_snippet_capped_at_200_chars() {
        let long = "y".repeat(500);
        let docs = vec![doc(&long, "long.txt")];
        let answer = "See [Source: long.txt].";

        let sources = extract_sources(answer, &docs);
        assert_eq!(sources[0].content_snippet.chars().count(), 203);
        assert!(sources[0].content_snippet.ends_with("..."));
    }

    #[test]
    fn test_uncited_answer_has_no_sources() {
        let docs = vec![doc("body", "inventory.csv")];
        let sources = extract_sources("I don't have that information.", &docs);
        assert!(sources.is_empty());
    }

    #[test]
    fn test_groundedness_parsing() {
        assert_eq!(parse_groundedness("Groundedness Score: 9\nSupported..."), Some(9));
        assert_eq!(parse_groundedness("groundedness score: 10"), Some(10));
        assert_eq!(parse_groundedness("Score unclear"), None);
        assert_eq!(parse_groundedness("Groundedness Score: 0"), None);
    }
}
