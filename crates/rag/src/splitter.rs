//! Recursive text splitter
//!
//! Splits documents on a separator priority list, falling through to finer
//! separators only when a piece exceeds the chunk size. Adjacent chunks
//! share a character overlap so sentence fragments at boundaries stay
//! retrievable.

use crate::chunk::Chunk;
use crate::loader::LoadedDocument;
use serde_json::Value;
use unicode_segmentation::UnicodeSegmentation;

/// Separator priority: paragraphs, lines, sentences, words, characters
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

/// Recursive-separator splitter
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        // A degenerate overlap would make merging loop forever
        let chunk_overlap = chunk_overlap.min(chunk_size.saturating_sub(1));
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
        }
    }

    /// Split raw text into pieces of at most `chunk_size` characters
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &SEPARATORS)
    }

    /// Split a loaded document into indexable chunks.
    ///
    /// Chunks inherit the parent metadata and gain `chunk_index`,
    /// `chunk_size`, and a `chunk_id` label.
    pub fn split_document(&self, document: &LoadedDocument, namespace: &str) -> Vec<Chunk> {
        let source = document
            .metadata
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let document_type = document
            .metadata
            .get("document_type")
            .and_then(Value::as_str)
            .unwrap_or("document")
            .to_string();

        self.split_text(&document.content)
            .into_iter()
            .enumerate()
            .map(|(i, piece)| {
                let mut chunk = Chunk::new(piece, &source, i, namespace)
                    .with_document_type(&document_type)
                    .with_metadata(document.metadata.clone());
                chunk
                    .metadata
                    .insert("chunk_size".to_string(), Value::from(chunk.content.chars().count()));
                let label = chunk.chunk_label();
                chunk.metadata.insert("chunk_id".to_string(), Value::from(label));
                chunk
            })
            .collect()
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }

        let (separator, rest) = match separators.split_first() {
            Some((sep, rest)) => (*sep, rest),
            None => return vec![text.to_string()],
        };

        // Pick the first separator that actually occurs; character-level
        // splitting is the terminal fallback
        if !separator.is_empty() && !text.contains(separator) && !rest.is_empty() {
            return self.split_recursive(text, rest);
        }

        let pieces: Vec<String> = if separator.is_empty() {
            text.graphemes(true).map(str::to_string).collect()
        } else {
            text.split(separator).map(str::to_string).collect()
        };

        // Oversize pieces recurse into finer separators before merging
        let mut sized: Vec<String> = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if char_len(&piece) > self.chunk_size && !rest.is_empty() {
                sized.extend(self.split_recursive(&piece, rest));
            } else if !piece.is_empty() {
                sized.push(piece);
            }
        }

        self.merge_pieces(sized, separator)
    }

    /// Greedily merge pieces up to `chunk_size`, retaining up to
    /// `chunk_overlap` trailing characters for the next chunk.
    fn merge_pieces(&self, pieces: Vec<String>, separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut chunks = Vec::new();
        let mut window: Vec<String> = Vec::new();
        let mut window_len = 0usize;

        for piece in pieces {
            let piece_len = char_len(&piece);
            let joined = if window.is_empty() { 0 } else { sep_len };

            if window_len + joined + piece_len > self.chunk_size && !window.is_empty() {
                chunks.push(window.join(separator).trim().to_string());

                // Slide the window: drop leading pieces until the retained
                // tail fits inside the overlap budget
                while window_len > self.chunk_overlap
                    || (window_len + piece_len + sep_len > self.chunk_size && window_len > 0)
                {
                    let dropped = window.remove(0);
                    window_len -= char_len(&dropped);
                    if !window.is_empty() {
                        window_len -= sep_len.min(window_len);
                    }
                }
            }

            let joined = if window.is_empty() { 0 } else { sep_len };
            window_len += joined + piece_len;
            window.push(piece);
        }

        if !window.is_empty() {
            let last = window.join(separator).trim().to_string();
            if !last.is_empty() {
                chunks.push(last);
            }
        }

        chunks.retain(|c| !c.is_empty());
        chunks
    }
}

/// Grapheme-aware length so multi-codepoint characters never split
fn char_len(s: &str) -> usize {
    s.graphemes(true).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_short_text_single_chunk() {
        let splitter = RecursiveSplitter::new(1000, 200);
        let chunks = splitter.split_text("A short paragraph about the Camry.");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_chunks_respect_size_limit() {
        let splitter = RecursiveSplitter::new(50, 10);
        let text = "First sentence here. Second sentence here. Third sentence here. \
                    Fourth sentence here. Fifth sentence here.";
        let chunks = splitter.split_text(text);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 50, "oversize chunk: {chunk:?}");
        }
    }

    #[test]
    fn test_paragraph_separator_preferred() {
        let splitter = RecursiveSplitter::new(40, 0);
        let text = "First paragraph body.\n\nSecond paragraph body.";
        let chunks = splitter.split_text(text);

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains("First"));
        assert!(chunks[1].contains("Second"));
    }

    #[test]
    fn test_adjacent_chunks_overlap() {
        let splitter = RecursiveSplitter::new(30, 15);
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunks = splitter.split_text(text);

        assert!(chunks.len() > 1);
        // The start of each later chunk repeats words from its predecessor
        let first_words: Vec<&str> = chunks[0].split_whitespace().collect();
        let second_words: Vec<&str> = chunks[1].split_whitespace().collect();
        assert!(second_words.iter().any(|w| first_words.contains(w)));
    }

    #[test]
    fn test_unbroken_text_falls_back_to_characters() {
        let splitter = RecursiveSplitter::new(10, 0);
        let text = "x".repeat(35);
        let chunks = splitter.split_text(&text);

        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        let splitter = RecursiveSplitter::new(100, 20);
        assert!(splitter.split_text("").is_empty());
    }

    #[test]
    fn test_document_chunks_carry_metadata() {
        let splitter = RecursiveSplitter::new(40, 5);
        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), Value::from("policies.md"));
        metadata.insert("document_type".to_string(), Value::from("policy"));
        metadata.insert("make".to_string(), Value::from("Toyota"));

        let document = LoadedDocument {
            content: "Return policy text.\n\nWarranty policy text.\n\nService policy text."
                .to_string(),
            metadata,
        };

        let chunks = splitter.split_document(&document, "tenant-1");
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.source, "policies.md");
            assert_eq!(chunk.document_type, "policy");
            assert_eq!(chunk.namespace, "tenant-1");
            assert_eq!(chunk.metadata.get("make"), Some(&Value::from("Toyota")));
            assert!(chunk
                .metadata
                .get("chunk_id")
                .and_then(Value::as_str)
                .unwrap()
                .starts_with(&format!("chunk_{i}_")));
        }
    }

    #[test]
    fn test_same_content_same_id_across_runs() {
        let splitter = RecursiveSplitter::new(1000, 200);
        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), Value::from("a.txt"));
        let document = LoadedDocument {
            content: "Stable content.".to_string(),
            metadata,
        };

        let first = splitter.split_document(&document, "default");
        let second = splitter.split_document(&document, "default");
        assert_eq!(first[0].id, second[0].id);
    }
}
