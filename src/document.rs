use anyhow::{Context, Result};
use log::{debug, info, warn};
use mime_guess::from_path;
use pdf_extract::extract_text;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Article identifier as issued by the content system
pub type ArticleId = String;

/// An article as seen by the retrieval pipeline: read-only, already normalized text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Article {
    pub id: ArticleId,
    /// Normalized plain text (markup stripped, whitespace collapsed)
    pub content: String,
    /// Last-modified time, milliseconds since the Unix epoch
    pub updated_at: u64,
}

impl Article {
    pub fn new(id: impl Into<ArticleId>, content: impl Into<String>, updated_at: u64) -> Self {
        Article {
            id: id.into(),
            content: content.into(),
            updated_at,
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A file imported as an article body
#[derive(Debug, Clone)]
pub struct Document {
    /// Normalized text content of the document
    pub content: String,
    /// The document's file name, used as the default article id
    pub document_id: String,
    /// The document's MIME type
    pub mime_type: String,
}

impl Document {
    /// Load and normalize a document from a file path
    pub fn from_file<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let path = file_path.as_ref();
        let file_name = path
            .file_name()
            .context("Invalid file name")?
            .to_str()
            .context("Invalid file name encoding")?
            .to_string();

        let mime = from_path(path).first_or_octet_stream();
        let mime_type = mime.to_string();
        debug!("Detected MIME type: {}", mime_type);

        let raw = read_document_content(path, &mime_type)?;
        let content = normalize_article_text(&raw);
        if content.is_empty() {
            warn!("Document {} has no text content", path.display());
        }

        Ok(Document {
            content,
            document_id: file_name,
            mime_type,
        })
    }

    /// Turn the document into an article last modified at `updated_at`
    pub fn into_article(self, article_id: Option<String>, updated_at: u64) -> Article {
        Article::new(
            article_id.unwrap_or(self.document_id),
            self.content,
            updated_at,
        )
    }
}

/// Read raw content from a document based on its MIME type
pub fn read_document_content<P: AsRef<Path>>(file_path: P, mime_type: &str) -> Result<String> {
    let path = file_path.as_ref();

    match mime_type {
        mime if mime.starts_with("application/pdf") => {
            info!("Processing PDF document: {}", path.display());
            extract_text(path)
                .with_context(|| format!("Failed to extract text from PDF: {}", path.display()))
        }

        // HTML is also text/*; markup is stripped during normalization
        mime if mime.starts_with("text/") => {
            info!("Processing text document: {}", path.display());
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read text file: {}", path.display()))
        }

        _ => Err(anyhow::anyhow!(
            "Unsupported document format: {}. Only text, HTML and PDF files are supported.",
            mime_type
        )),
    }
}

static SCRIPT_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>").expect("valid regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));

/// Strip markup, decode common entities and collapse all whitespace to single spaces.
///
/// This is the normalization the chunker expects its input to have gone through.
pub fn normalize_article_text(raw: &str) -> String {
    let without_scripts = SCRIPT_STYLE.replace_all(raw, " ");
    // Tags become spaces so adjacent block elements do not glue words together
    let without_tags = TAG.replace_all(&without_scripts, " ");
    let decoded = decode_entities(&without_tags);
    collapse_whitespace(&decoded)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        // last, so "&amp;lt;" decodes to "&lt;" and not "<"
        .replace("&amp;", "&")
}

/// Collapse runs of whitespace (including newlines) into a single space and trim the ends
fn collapse_whitespace(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    let mut pending_space = false;

    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !normalized.is_empty() {
            normalized.push(' ');
        }
        pending_space = false;
        normalized.push(c);
    }

    normalized
}
