//! Document loaders
//!
//! Dispatch by file extension to a format-specific loader. Every loader
//! produces documents with `source`, `file_type`, and `ingested_at`
//! populated; the ingestion pipeline owns splitting and indexing.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::RagError;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[^>]+>").unwrap());
static HTML_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style).*?>.*?</(script|style)\s*>").unwrap());

/// A pre-chunking text blob with source metadata
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub content: String,
    pub metadata: HashMap<String, Value>,
}

fn base_metadata(source: &str, file_type: &str, extra: &HashMap<String, Value>) -> HashMap<String, Value> {
    let mut metadata = extra.clone();
    metadata.insert("source".to_string(), Value::from(source));
    metadata.insert("file_type".to_string(), Value::from(file_type));
    metadata.insert(
        "ingested_at".to_string(),
        Value::from(Utc::now().to_rfc3339()),
    );
    metadata
}

/// Wrap raw text as a single document
pub fn text_document(content: &str, extra: &HashMap<String, Value>) -> LoadedDocument {
    let mut metadata = base_metadata("text_input", "text", extra);
    metadata
        .entry("document_type".to_string())
        .or_insert_with(|| Value::from("text"));
    LoadedDocument {
        content: content.to_string(),
        metadata,
    }
}

/// Load one file, dispatching on its extension.
///
/// Supported: `.txt`, `.md`, `.csv`, `.json`, `.html`, `.pdf`. `.docx` is
/// reported as an unsupported format error and handled per-file by the
/// pipeline.
pub fn load_path(path: &Path, extra: &HashMap<String, Value>) -> Result<Vec<LoadedDocument>, RagError> {
    if !path.exists() {
        return Err(RagError::Loader(format!("file not found: {}", path.display())));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    let source = path.display().to_string();

    match extension.as_str() {
        "txt" | "md" => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| RagError::Loader(format!("failed to read {source}: {e}")))?;
            Ok(vec![LoadedDocument {
                content,
                metadata: base_metadata(&source, &extension, extra),
            }])
        }
        "csv" => load_csv(path, &source, extra),
        "json" => load_json(path, &source, extra),
        "html" => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| RagError::Loader(format!("failed to read {source}: {e}")))?;
            let stripped = HTML_SCRIPT.replace_all(&raw, " ");
            let text = HTML_TAG.replace_all(&stripped, " ");
            let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
            Ok(vec![LoadedDocument {
                content: collapsed,
                metadata: base_metadata(&source, "html", extra),
            }])
        }
        "pdf" => {
            let content = pdf_extract::extract_text(path)
                .map_err(|e| RagError::Loader(format!("failed to parse pdf {source}: {e}")))?;
            Ok(vec![LoadedDocument {
                content,
                metadata: base_metadata(&source, "pdf", extra),
            }])
        }
        "docx" => Err(RagError::Loader(format!(
            "unsupported format .docx: {source} (convert to pdf or text first)"
        ))),
        other => Err(RagError::Loader(format!(
            "unsupported file extension '.{other}': {source}"
        ))),
    }
}

/// One document per CSV row, rendered as `header: value` pairs
fn load_csv(
    path: &Path,
    source: &str,
    extra: &HashMap<String, Value>,
) -> Result<Vec<LoadedDocument>, RagError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| RagError::Loader(format!("failed to read csv {source}: {e}")))?;
    let headers = reader
        .headers()
        .map_err(|e| RagError::Loader(format!("failed to read csv headers: {e}")))?
        .clone();

    let mut documents = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| RagError::Loader(format!("bad csv row {row_index}: {e}")))?;
        let content = headers
            .iter()
            .zip(record.iter())
            .map(|(header, field)| format!("{header}: {field}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut metadata = base_metadata(source, "csv", extra);
        metadata.insert("row".to_string(), Value::from(row_index));
        documents.push(LoadedDocument { content, metadata });
    }

    Ok(documents)
}

/// Arrays become one document per element; objects become one document
fn load_json(
    path: &Path,
    source: &str,
    extra: &HashMap<String, Value>,
) -> Result<Vec<LoadedDocument>, RagError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RagError::Loader(format!("failed to read {source}: {e}")))?;
    let parsed: Value = serde_json::from_str(&raw)
        .map_err(|e| RagError::Loader(format!("invalid json in {source}: {e}")))?;

    let render = |value: &Value| serde_json::to_string_pretty(value).unwrap_or_default();

    let documents = match parsed {
        Value::Array(items) => items
            .iter()
            .map(|item| LoadedDocument {
                content: render(item),
                metadata: base_metadata(source, "json", extra),
            })
            .collect(),
        other => vec![LoadedDocument {
            content: render(&other),
            metadata: base_metadata(source, "json", extra),
        }],
    };

    Ok(documents)
}

/// Load every regular file under a directory, recursively.
///
/// Returns the loaded documents plus per-file errors; a bad file never
/// stops the walk.
pub fn load_directory(
    dir: &Path,
    extra: &HashMap<String, Value>,
) -> (Vec<LoadedDocument>, Vec<String>) {
    let mut documents = Vec::new();
    let mut errors = Vec::new();
    walk(dir, extra, &mut documents, &mut errors);
    (documents, errors)
}

fn walk(
    dir: &Path,
    extra: &HashMap<String, Value>,
    documents: &mut Vec<LoadedDocument>,
    errors: &mut Vec<String>,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            errors.push(format!("failed to read directory {}: {e}", dir.display()));
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, extra, documents, errors);
        } else {
            match load_path(&path, extra) {
                Ok(loaded) => documents.extend(loaded),
                Err(e) => errors.push(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_text_document_metadata() {
        let doc = text_document("hello", &HashMap::new());
        assert_eq!(doc.metadata.get("source"), Some(&Value::from("text_input")));
        assert!(doc.metadata.contains_key("ingested_at"));
    }

    #[test]
    fn test_load_txt() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        writeln!(file, "Oil changes every 5,000 miles.").unwrap();

        let docs = load_path(file.path(), &HashMap::new()).unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].content.contains("5,000 miles"));
        assert_eq!(docs[0].metadata.get("file_type"), Some(&Value::from("txt")));
    }

    #[test]
    fn test_load_csv_rows() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "vin,make,price").unwrap();
        writeln!(file, "ABC123,Toyota,28000").unwrap();
        writeln!(file, "DEF456,Honda,31000").unwrap();

        let docs = load_path(file.path(), &HashMap::new()).unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].content.contains("make: Toyota"));
        assert!(docs[1].content.contains("vin: DEF456"));
    }

    #[test]
    fn test_load_json_array() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"[{{"make":"Toyota"}},{{"make":"Honda"}}]"#).unwrap();

        let docs = load_path(file.path(), &HashMap::new()).unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].content.contains("Toyota"));
    }

    #[test]
    fn test_load_html_strips_markup() {
        let mut file = tempfile::Builder::new().suffix(".html").tempfile().unwrap();
        write!(
            file,
            "<html><script>var x=1;</script><body><h1>Warranty</h1><p>5 years</p></body></html>"
        )
        .unwrap();

        let docs = load_path(file.path(), &HashMap::new()).unwrap();
        assert!(docs[0].content.contains("Warranty"));
        assert!(docs[0].content.contains("5 years"));
        assert!(!docs[0].content.contains("var x"));
        assert!(!docs[0].content.contains('<'));
    }

    #[test]
    fn test_docx_reports_unsupported() {
        let file = tempfile::Builder::new().suffix(".docx").tempfile().unwrap();
        let err = load_path(file.path(), &HashMap::new());
        assert!(matches!(err, Err(RagError::Loader(_))));
    }

    #[test]
    fn test_missing_file_errors() {
        let err = load_path(Path::new("/nonexistent/file.txt"), &HashMap::new());
        assert!(matches!(err, Err(RagError::Loader(_))));
    }

    #[test]
    fn test_directory_walk_collects_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "fine").unwrap();
        std::fs::write(dir.path().join("bad.docx"), "binary").unwrap();

        let (docs, errors) = load_directory(dir.path(), &HashMap::new());
        assert_eq!(docs.len(), 1);
        assert_eq!(errors.len(), 1);
    }
}
