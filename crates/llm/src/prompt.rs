//! Prompt construction
//!
//! Builds the system and user messages for grounded answer generation.
//! Context documents are grouped by source and merged (up to three chunks
//! per source) so the model sees one coherent block per document.

use dealership_core::{ConversationTurn, RetrievedDocument};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Canonical phrase the model uses when the context cannot answer
pub const NO_INFORMATION_PHRASE: &str =
    "I don't have that specific information in my current knowledge base.";

/// System message: strictly grounded dealership assistant
pub const SYSTEM_PROMPT: &str = "\
You are an expert automotive dealership assistant with deep knowledge of vehicle \
specifications, dealership operations, service procedures, and customer service.

Your responsibilities:
1. Answer questions ONLY using the provided context documents
2. Never invent or hallucinate information
3. Always cite your sources using [Source: ...] notation
4. If the context doesn't contain enough information, clearly state that
5. Be concise, professional, and customer-focused
6. For vehicle queries, provide specific details like VIN, price, specifications
7. For service questions, reference exact procedures from manuals

Key principles:
- FACTUAL ONLY: Only use information from the provided sources
- CITE SOURCES: Every factual statement must reference its source
- ADMIT LIMITATIONS: If unsure or lacking information, say so explicitly
- BE SPECIFIC: Use exact numbers, VINs, model names, not generalizations
- CUSTOMER FIRST: Prioritize helpfulness while maintaining accuracy";

/// Chunks merged per source when formatting context
const MAX_CHUNKS_PER_SOURCE: usize = 3;
/// Character cap per history turn side
const HISTORY_TRUNCATE_CHARS: usize = 500;

/// Format retrieved documents for the prompt, grouped by source.
///
/// Multiple chunks from one source merge into a single labeled block:
/// `[Document N - Source: S, Type: T, Merged: k chunks]`.
pub fn format_context(documents: &[RetrievedDocument]) -> String {
    if documents.is_empty() {
        return "No context documents available.".to_string();
    }

    // Group by source, preserving first-appearance order
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, Vec<&RetrievedDocument>> =
        std::collections::HashMap::new();
    for doc in documents {
        let source = doc.source().to_string();
        if !groups.contains_key(&source) {
            order.push(source.clone());
        }
        groups.entry(source).or_default().push(doc);
    }

    let mut parts = Vec::with_capacity(order.len());
    for (i, source) in order.iter().enumerate() {
        let docs = &groups[source];
        let doc_type = docs[0].document_type();
        let doc_num = i + 1;

        if docs.len() > 1 {
            let merged = docs
                .iter()
                .take(MAX_CHUNKS_PER_SOURCE)
                .map(|d| d.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            parts.push(format!(
                "[Document {doc_num} - Source: {source}, Type: {doc_type}, Merged: {} chunks]\n{merged}\n",
                docs.len()
            ));
        } else {
            parts.push(format!(
                "[Document {doc_num} - Source: {source}, Type: {doc_type}]\n{}\n",
                docs[0].content
            ));
        }
    }

    parts.join("\n---\n")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{head}...")
    }
}

/// Compose the user message: optional conversation context, a divider,
/// the formatted context documents, a divider, the question, and the
/// citation instructions.
pub fn build_user_prompt(
    query: &str,
    documents: &[RetrievedDocument],
    history: &[ConversationTurn],
) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !history.is_empty() {
        let mut lines = vec!["Previous conversation:".to_string()];
        for turn in history {
            lines.push(format!("User: {}", truncate(&turn.user, HISTORY_TRUNCATE_CHARS)));
            lines.push(format!(
                "Assistant: {}",
                truncate(&turn.assistant, HISTORY_TRUNCATE_CHARS)
            ));
        }
        sections.push(lines.join("\n"));
    }

    sections.push(format!("Context Documents:\n{}", format_context(documents)));

    sections.push(format!(
        "Customer Question: {query}\n\n\
         Instructions:\n\
         1. Analyze the context documents carefully\n\
         2. Answer the question using ONLY information from the context\n\
         3. Cite sources for each factual claim using [Source: document_name]\n\
         4. If the context doesn't answer the question, say: \"{NO_INFORMATION_PHRASE}\"\n\
         5. Be specific and include relevant details (VIN, prices, specs, etc.)\n\n\
         Your Answer:"
    ));

    sections.join("\n\n---\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;

    fn doc(content: &str, source: &str) -> RetrievedDocument {
        RetrievedDocument::new(content).with_metadata("source", source)
    }

    #[test]
    fn test_empty_context_placeholder() {
        assert_eq!(format_context(&[]), "No context documents available.");
    }

    #[test]
    fn test_single_chunk_label() {
        let context = format_context(&[doc("Camry pricing", "inventory.csv")]);
        assert!(context.contains("[Document 1 - Source: inventory.csv, Type: document]"));
        assert!(!context.contains("Merged"));
    }

    #[test]
    fn test_merged_chunks_capped_at_three() {
        let docs = vec![
            doc("chunk one", "manual.pdf"),
            doc("chunk two", "manual.pdf"),
            doc("chunk three", "manual.pdf"),
            doc("chunk four", "manual.pdf"),
        ];
        let context = format_context(&docs);

        assert!(context.contains("Merged: 4 chunks"));
        assert!(context.contains("chunk three"));
        assert!(!context.contains("chunk four"));
    }

    #[test]
    fn test_groups_preserve_first_appearance_order() {
        let docs = vec![
            doc("a", "second.txt"),
            doc("b", "first.txt"),
            doc("c", "second.txt"),
        ];
        let context = format_context(&docs);

        let pos_second = context.find("second.txt").unwrap();
        let pos_first = context.find("first.txt").unwrap();
        assert!(pos_second < pos_first);
        assert!(context.contains("[Document 1 - Source: second.txt"));
        assert!(context.contains("[Document 2 - Source: first.txt"));
    }

    #[test]
    fn test_user_prompt_ordering() {
        let history = vec![ConversationTurn {
            user: "Do you have a Camry?".to_string(),
            assistant: "Yes, a 2024 Camry LE.".to_string(),
            timestamp: Utc::now(),
        }];
        let docs = vec![doc("2024 Camry LE $28,000", "inventory.csv")];
        let prompt = build_user_prompt("How much is it?", &docs, &history);

        let conversation = prompt.find("Previous conversation:").unwrap();
        let context = prompt.find("Context Documents:").unwrap();
        let question = prompt.find("Customer Question:").unwrap();
        assert!(conversation < context && context < question);
        assert!(prompt.contains(NO_INFORMATION_PHRASE));
    }

    #[test]
    fn test_history_truncated() {
        let history = vec![ConversationTurn {
            user: "x".repeat(2000),
            assistant: "short".to_string(),
            timestamp: Utc::now(),
        }];
        let prompt = build_user_prompt("q", &[], &history);
        assert!(prompt.contains(&format!("{}...", "x".repeat(500))));
        assert!(!prompt.contains(&"x".repeat(600)));
    }

    #[test]
    fn test_document_type_from_metadata() {
        let mut document = doc("body", "dms");
        document
            .metadata
            .insert("document_type".to_string(), Value::from("live_data"));
        let context = format_context(&[document]);
        assert!(context.contains("Type: live_data"));
    }
}
