//! Sentence-aware text chunker.
//!
//! Splits extracted page text into overlapping chunks bounded by a
//! configurable character budget. Sentences are accumulated greedily and
//! never split across chunks, except when a single sentence exceeds the
//! budget (hard split at character boundaries). When a chunk closes, the
//! trailing `overlap` characters' worth of sentences seed the next chunk
//! so adjacent chunks share context.
//!
//! Chunking is page-scoped: a chunk closes at its page's end and the
//! overlap seed carries only between chunks of the same page, so every
//! produced chunk is attributable to one page. Chunk indices are
//! contiguous across the whole document, starting at 0.
//!
//! Identical input and parameters always produce an identical chunk
//! sequence — no randomness, no time-based tie-breaks.

use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::dedup::fingerprint_text;
use crate::models::{Chunk, PageText};

/// A sentence with its character offset within the page.
#[derive(Debug, Clone)]
struct Sentence {
    text: String,
    start: i64,
}

/// Split page text into chunks, assigning contiguous indices from 0.
pub fn chunk_pages(document_id: &str, pages: &[PageText], config: &ChunkingConfig) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut next_index: i64 = 0;

    for page in pages {
        chunk_page(document_id, page, config, &mut next_index, &mut chunks);
    }

    chunks
}

fn chunk_page(
    document_id: &str,
    page: &PageText,
    config: &ChunkingConfig,
    next_index: &mut i64,
    out: &mut Vec<Chunk>,
) {
    let sentences = split_sentences(&page.text);
    if sentences.is_empty() {
        return;
    }

    let chunk_size = config.chunk_size;
    let mut current: Vec<Sentence> = Vec::new();
    let mut current_len = 0usize;

    for sentence in sentences {
        let s_chars = sentence.text.chars().count();

        // A single sentence over the budget is hard-split at character
        // boundaries; whole pieces become chunks, the final partial piece
        // seeds the ongoing buffer.
        if s_chars > chunk_size {
            if !current.is_empty() {
                out.push(make_chunk(document_id, page, next_index, &current));
                current.clear();
                current_len = 0;
            }

            let chars: Vec<char> = sentence.text.chars().collect();
            let mut pos = 0usize;
            while pos < chars.len() {
                let take = chunk_size.min(chars.len() - pos);
                let piece: String = chars[pos..pos + take].iter().collect();
                let piece_start = sentence.start + pos as i64;
                if pos + take < chars.len() {
                    let piece_sentence = Sentence {
                        text: piece,
                        start: piece_start,
                    };
                    out.push(make_chunk(
                        document_id,
                        page,
                        next_index,
                        std::slice::from_ref(&piece_sentence),
                    ));
                } else {
                    current_len = piece.chars().count();
                    current.push(Sentence {
                        text: piece,
                        start: piece_start,
                    });
                }
                pos += take;
            }
            continue;
        }

        let would_be = if current.is_empty() {
            s_chars
        } else {
            current_len + 1 + s_chars
        };

        if would_be > chunk_size && !current.is_empty() {
            out.push(make_chunk(document_id, page, next_index, &current));

            let seed = overlap_tail(&current, config.overlap);
            current = seed;
            current_len = joined_len(&current);

            // An overlap seed plus an unusually long sentence can overflow
            // the budget; drop the seed to guarantee progress.
            if !current.is_empty() && current_len + 1 + s_chars > chunk_size {
                current.clear();
                current_len = 0;
            }
        }

        current_len = if current.is_empty() {
            s_chars
        } else {
            current_len + 1 + s_chars
        };
        current.push(sentence);
    }

    if !current.is_empty() {
        out.push(make_chunk(document_id, page, next_index, &current));
    }
}

fn make_chunk(
    document_id: &str,
    page: &PageText,
    next_index: &mut i64,
    sentences: &[Sentence],
) -> Chunk {
    let text = sentences
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let first = &sentences[0];
    let last = &sentences[sentences.len() - 1];
    let end_char = last.start + last.text.chars().count() as i64;

    let chunk = Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: *next_index,
        page_number: Some(page.page_number),
        start_char: first.start,
        end_char,
        token_count: text.split_whitespace().count() as i64,
        fingerprint: fingerprint_text(&text),
        text,
    };
    *next_index += 1;
    chunk
}

/// Sentences from the tail of `current` whose joined length fits within
/// `overlap` characters, capped at half the chunk's sentences.
fn overlap_tail(current: &[Sentence], overlap: usize) -> Vec<Sentence> {
    if overlap == 0 {
        return Vec::new();
    }

    let max_sentences = current.len() / 2;
    let mut total = 0usize;
    let mut count = 0usize;

    for sentence in current.iter().rev() {
        let add = if count == 0 {
            sentence.text.chars().count()
        } else {
            sentence.text.chars().count() + 1
        };
        if total + add > overlap || count >= max_sentences {
            break;
        }
        total += add;
        count += 1;
    }

    current[current.len() - count..].to_vec()
}

fn joined_len(sentences: &[Sentence]) -> usize {
    if sentences.is_empty() {
        return 0;
    }
    let chars: usize = sentences.iter().map(|s| s.text.chars().count()).sum();
    chars + sentences.len() - 1
}

/// Split text into sentences on `.`, `!`, or `?` followed by whitespace,
/// recording each sentence's character offset within the text.
fn split_sentences(text: &str) -> Vec<Sentence> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut sentences = Vec::new();
    let mut i = 0usize;

    while i < n {
        while i < n && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= n {
            break;
        }

        let start = i;
        let mut end = i;
        while end < n {
            let c = chars[end];
            end += 1;
            if matches!(c, '.' | '!' | '?') && (end >= n || chars[end].is_whitespace()) {
                break;
            }
        }

        let sentence: String = chars[start..end].iter().collect();
        let trimmed = sentence.trim_end();
        if !trimmed.is_empty() {
            sentences.push(Sentence {
                text: trimmed.to_string(),
                start: start as i64,
            });
        }
        i = end;
    }

    sentences
}
