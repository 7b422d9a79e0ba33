//! Byte-budgeted splitting of fetched HTML ahead of extraction.
//!
//! Boundaries are byte offsets. Within the last tenth of a chunk the split is
//! pulled back to the start of a tag when one is there, so event markup is cut
//! less often, but no semantic guarantee is made. Anything past
//! `max_chunks * max_chunk_bytes` is dropped.

use crate::config::ChunkingConfig;
use crate::pipeline::fetcher::truncate_at_char_boundary;

const MIN_CHUNK_BYTES: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    /// Byte offset of this chunk in the original document
    pub offset: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    max_chunk_bytes: usize,
    max_chunks: usize,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            // Room for the widest UTF-8 char, so every chunk makes progress within budget
            max_chunk_bytes: config.max_chunk_bytes.max(MIN_CHUNK_BYTES),
            max_chunks: config.max_chunks,
        }
    }

    pub fn chunk(&self, html: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut offset = 0;

        while offset < html.len() && chunks.len() < self.max_chunks {
            let rest = &html[offset..];
            let mut piece = truncate_at_char_boundary(rest, self.max_chunk_bytes);
            if piece.is_empty() {
                break;
            }
            if piece.len() < rest.len() {
                piece = self.pull_back_to_tag(piece);
            }

            chunks.push(Chunk {
                index: chunks.len(),
                offset,
                text: piece.to_string(),
            });
            offset += piece.len();
        }

        chunks
    }

    fn pull_back_to_tag<'a>(&self, piece: &'a str) -> &'a str {
        let floor = piece.len() - piece.len() / 10;
        match piece.rfind('<') {
            Some(pos) if pos >= floor && pos > 0 => &piece[..pos],
            _ => piece,
        }
    }
}
