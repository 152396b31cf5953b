use crate::config::ChunkingConfig;
use crate::error::RagError;

/// A contiguous slice of an article's normalized text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of this chunk in the article (0-based)
    pub index: usize,
    /// The text content of this chunk
    pub text: String,
    /// Character offset where this chunk starts in the source text
    pub start_char: usize,
    /// Character offset one past the end of this chunk
    pub end_char: usize,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.end_char - self.start_char
    }
}

/// Split text into chunks, validating size and overlap first
pub fn chunk(text: &str, size: i64, overlap: i64) -> Result<Vec<Chunk>, RagError> {
    let config = ChunkingConfig::new(size, overlap)?;
    Ok(chunk_text(text, &config))
}

/// Split text into fixed-size overlapping chunks.
///
/// Chunk `i` starts at character `i * (size - overlap)` and spans `size`
/// characters; only the last chunk may be shorter. Chunking stops as soon
/// as a chunk reaches the end of the text, so no chunk is made up purely of
/// overlap. Offsets count Unicode scalar values, never bytes.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    // Byte position of every char boundary, including the end of the string
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total_chars = boundaries.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < total_chars {
        let end = (start + config.size).min(total_chars);
        chunks.push(Chunk {
            index: chunks.len(),
            text: text[boundaries[start]..boundaries[end]].to_string(),
            start_char: start,
            end_char: end,
        });

        if end == total_chars {
            break;
        }
        start += config.step();
    }

    chunks
}

/// Rebuild the source text from an ordered, gap-free chunk sequence
pub fn reassemble_text(chunks: &[Chunk]) -> String {
    let mut text = String::new();
    let mut covered: usize = 0;

    for chunk in chunks {
        let skip = covered.saturating_sub(chunk.start_char);
        text.extend(chunk.text.chars().skip(skip));
        covered = covered.max(chunk.end_char);
    }

    text
}
