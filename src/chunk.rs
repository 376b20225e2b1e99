//! Paragraph- and heading-aware text chunker.
//!
//! Splits document text into [`Chunk`]s that respect the configured
//! `max_tokens` limit. Blocks are separated by blank lines and by Markdown
//! headings; consecutive blocks are packed into one chunk until the next block
//! would overflow it. A block that alone exceeds the limit is hard-split at the
//! last newline or space before the limit.
//!
//! Every chunk after the first begins with the tail of the previous chunk's
//! content (at most `overlap_tokens`, cut at a word boundary) so that context
//! spanning a boundary is retrievable from either side.
//!
//! Output is a pure function of `(document id, text, config)`: identical input
//! yields identical boundaries, ids and hashes.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkId, DocumentId};

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

const BLOCK_SEPARATOR: &str = "\n\n";

/// Rough token count for `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split a document into chunks with contiguous sequence numbers from 0.
///
/// An empty (or whitespace-only) document yields no chunks.
pub fn chunk_document(document: &DocumentId, text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let max_chars = config.max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = config.overlap_tokens.min(config.max_tokens.saturating_sub(1))
        * CHARS_PER_TOKEN;
    // Room left for new content once the overlap and its separator are prepended.
    let body_limit = max_chars
        .saturating_sub(overlap_chars)
        .saturating_sub(BLOCK_SEPARATOR.len())
        .max(1);

    let bodies = pack_blocks(&split_blocks(text), body_limit);

    let mut chunks = Vec::with_capacity(bodies.len());
    let mut previous: Option<&str> = None;
    for (seq, body) in bodies.iter().enumerate() {
        let tail = previous
            .map(|prev| overlap_tail(prev, overlap_chars))
            .unwrap_or("");
        let chunk = if tail.is_empty() {
            make_chunk(document, seq as u32, body.clone(), false)
        } else {
            make_chunk(
                document,
                seq as u32,
                format!("{tail}{BLOCK_SEPARATOR}{body}"),
                true,
            )
        };
        chunks.push(chunk);
        previous = Some(body);
    }
    chunks
}

/// Split text into trimmed, non-empty blocks on blank lines and before headings.
fn split_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut start: Option<usize> = None;
    let mut end = 0;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let content = line.trim();

        if content.is_empty() {
            if let Some(s) = start.take() {
                blocks.push(text[s..end].trim());
            }
            continue;
        }
        if content.starts_with('#') {
            if let Some(s) = start.take() {
                blocks.push(text[s..end].trim());
            }
        }
        if start.is_none() {
            start = Some(line_start);
        }
        end = offset;
    }
    if let Some(s) = start {
        blocks.push(text[s..end].trim());
    }

    blocks.retain(|b| !b.is_empty());
    blocks
}

/// Greedily pack blocks into bodies of at most `limit` bytes.
fn pack_blocks(blocks: &[&str], limit: usize) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut current_buf = String::new();

    for block in blocks {
        // If adding this block would exceed the limit, flush the current buffer
        let would_be = if current_buf.is_empty() {
            block.len()
        } else {
            current_buf.len() + BLOCK_SEPARATOR.len() + block.len()
        };
        if would_be > limit && !current_buf.is_empty() {
            bodies.push(std::mem::take(&mut current_buf));
        }

        if block.len() > limit {
            bodies.extend(hard_split(block, limit).into_iter().map(str::to_string));
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str(BLOCK_SEPARATOR);
            }
            current_buf.push_str(block);
        }
    }

    if !current_buf.is_empty() {
        bodies.push(current_buf);
    }
    bodies
}

/// Split an oversized block at newline or space boundaries.
fn hard_split(block: &str, limit: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = block;

    while !remaining.is_empty() {
        let actual_split = if remaining.len() > limit {
            let mut split_at = snap_to_char_boundary(remaining, limit);
            if split_at == 0 {
                // A single character wider than the limit still makes progress.
                split_at = remaining
                    .char_indices()
                    .nth(1)
                    .map(|(i, _)| i)
                    .unwrap_or(remaining.len());
            }
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            remaining.len()
        };

        let piece = remaining[..actual_split].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = &remaining[actual_split..];
    }
    pieces
}

/// Largest char boundary `<= index`.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// The last `max_chars` bytes of `text`, starting at a word boundary.
fn overlap_tail(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    if text.len() <= max_chars {
        return text.trim();
    }
    let mut start = text.len() - max_chars;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let preceded_by_space = text[..start]
        .chars()
        .next_back()
        .is_some_and(char::is_whitespace);
    if !preceded_by_space {
        // Drop the partial word at the cut.
        match text[start..].find(char::is_whitespace) {
            Some(pos) => start += pos,
            None => return "",
        }
    }
    text[start..].trim()
}

fn make_chunk(document: &DocumentId, seq: u32, text: String, overlaps_previous: bool) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: ChunkId::new(document.clone(), seq),
        token_estimate: estimate_tokens(&text),
        text,
        overlaps_previous,
        hash,
    }
}
