//! Paragraph-boundary node parser with overlap.
//!
//! Splits extracted document text into [`Node`]s of at most
//! `chunk_size_limit` tokens. Paragraphs (`\n\n`) are kept together where
//! possible; oversized paragraphs are hard-split at the nearest newline or
//! space. Every node after the first repeats the tail of its predecessor
//! (`max_chunk_overlap` tokens) so that sentences straddling a boundary are
//! retrievable from either side.
//!
//! Token counts are estimated at four characters per token.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Node;

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split `text` into nodes of at most `chunk_tokens` tokens, each carrying
/// `overlap_tokens` of the previous node's tail.
///
/// Returns no nodes for empty or whitespace-only text. Indices are
/// contiguous from 0.
pub fn split_into_nodes(
    document_id: &str,
    text: &str,
    chunk_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Node> {
    let max_chars = chunk_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);
    let body_chars = max_chars - overlap_chars;

    let bodies = pack_paragraphs(text, body_chars);

    let mut nodes = Vec::with_capacity(bodies.len());
    let mut previous: Option<&str> = None;
    for (index, body) in bodies.iter().enumerate() {
        let text = match previous {
            Some(prev) if overlap_chars > 0 => {
                let tail = overlap_tail(prev, overlap_chars);
                if tail.is_empty() {
                    body.clone()
                } else {
                    format!("{} {}", tail, body)
                }
            }
            _ => body.clone(),
        };
        nodes.push(make_node(document_id, index as i64, &text));
        previous = Some(body);
    }
    nodes
}

/// Greedily accumulates paragraphs into bodies of at most `max_chars`
/// characters.
fn pack_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        let para_chars = trimmed.chars().count();

        let would_be = if current.is_empty() {
            para_chars
        } else {
            current_chars + 2 + para_chars
        };
        if would_be > max_chars && !current.is_empty() {
            bodies.push(std::mem::take(&mut current));
            current_chars = 0;
        }

        if para_chars > max_chars {
            hard_split(trimmed, max_chars, &mut bodies);
            continue;
        }

        if !current.is_empty() {
            current.push_str("\n\n");
            current_chars += 2;
        }
        current.push_str(trimmed);
        current_chars += para_chars;
    }

    if !current.is_empty() {
        bodies.push(current);
    }
    bodies
}

fn hard_split(paragraph: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let limit = byte_offset_of_char(remaining, max_chars);
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind(['\n', ' '])
                .filter(|&pos| pos > 0)
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

/// Byte offset of the `n`th character, or the string length.
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// The last `max_chars` characters of `text`, advanced to a word start.
fn overlap_tail(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text.trim();
    }
    let start = byte_offset_of_char(text, total - max_chars);
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(ws) if ws + 1 < tail.len() => tail[ws..].trim(),
        _ => tail.trim(),
    }
}

fn make_node(document_id: &str, index: i64, text: &str) -> Node {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Node {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        node_index: index,
        text: text.to_string(),
        hash,
    }
}
