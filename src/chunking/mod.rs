//! Token-budgeted chunking of transcripts for embedding.
//!
//! Chunks are packed greedily from whole units (caption segments, or words when
//! the transcript has no usable timing) up to a target token budget, and each
//! new chunk starts with a short overlap taken from the end of the previous one.

mod segment;
mod word;

pub use segment::SegmentChunker;
pub use word::WordChunker;

use crate::config::ChunkingSettings;
use crate::transcript::{has_valid_timestamps, TranscriptSegment};
use serde::{Deserialize, Serialize};

/// Characters per token in the approximate token count.
pub const CHARS_PER_TOKEN: usize = 4;

/// Approximate token count of `text` as `ceil(chars / 4)`.
///
/// Chunking only ever counts tokens through this function.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// A chunk of transcript text ready for embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptChunk {
    /// Position of this chunk within its transcript.
    pub chunk_index: usize,
    pub text: String,
    /// `None` when the transcript had no valid timestamps.
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub token_count: usize,
}

impl TranscriptChunk {
    pub fn has_timestamps(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_some()
    }
}

/// Token budget for chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// A chunk closes before it would exceed this many tokens.
    pub target_tokens: usize,
    /// Tokens carried from the end of a closed chunk into the next one.
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 400,
            overlap_tokens: 75,
        }
    }
}

impl From<&ChunkingSettings> for ChunkingConfig {
    fn from(settings: &ChunkingSettings) -> Self {
        Self {
            target_tokens: settings.target_tokens,
            overlap_tokens: settings.overlap_tokens,
        }
    }
}

/// Splits a segment list into chunks.
pub trait Chunker: Send + Sync {
    fn chunk(&self, segments: &[TranscriptSegment], config: &ChunkingConfig) -> Vec<TranscriptChunk>;
}

/// Chunk a transcript, choosing the strategy from its timing.
///
/// Timing validity is decided once for the whole segment list: with any valid
/// timestamp every chunk is timed, otherwise no chunk is.
pub fn chunk_segments(segments: &[TranscriptSegment], config: &ChunkingConfig) -> Vec<TranscriptChunk> {
    if segments.is_empty() {
        return Vec::new();
    }

    if has_valid_timestamps(segments) {
        SegmentChunker.chunk(segments, config)
    } else {
        WordChunker.chunk(segments, config)
    }
}

/// Smallest piece of text a chunk is built from. Never split.
#[derive(Debug, Clone)]
struct Unit<'a> {
    text: &'a str,
    start: Option<f64>,
    end: Option<f64>,
}

/// Running chunk under construction.
#[derive(Default)]
struct Pending {
    units: Vec<usize>,
    chars: usize,
    /// Units added after the overlap seed.
    fresh: usize,
}

impl Pending {
    fn chars_with(&self, unit_chars: usize) -> usize {
        if self.units.is_empty() {
            unit_chars
        } else {
            self.chars + 1 + unit_chars
        }
    }

    fn push(&mut self, index: usize, unit_chars: usize, fresh: bool) {
        self.chars = self.chars_with(unit_chars);
        self.units.push(index);
        if fresh {
            self.fresh += 1;
        }
    }
}

/// Greedy packer shared by both chunkers.
fn pack(units: &[Unit<'_>], config: &ChunkingConfig) -> Vec<TranscriptChunk> {
    let lengths: Vec<usize> = units.iter().map(|u| u.text.chars().count()).collect();
    let mut chunks = Vec::new();
    let mut pending = Pending::default();

    for (index, &unit_chars) in lengths.iter().enumerate() {
        let candidate = pending.chars_with(unit_chars).div_ceil(CHARS_PER_TOKEN);

        if pending.fresh > 0 && candidate > config.target_tokens {
            chunks.push(build_chunk(units, &pending.units, chunks.len()));
            pending = seed_overlap(&pending, &lengths, config.overlap_tokens);
        }

        pending.push(index, unit_chars, true);
    }

    if pending.fresh > 0 {
        chunks.push(build_chunk(units, &pending.units, chunks.len()));
    }

    chunks
}

/// Start the next chunk with trailing units of `closed`.
///
/// Walks back over the closed chunk's own units only, and always leaves at
/// least one of them behind, so overlap is shared with the immediate
/// neighbour and every chunk makes progress.
fn seed_overlap(closed: &Pending, lengths: &[usize], overlap_tokens: usize) -> Pending {
    let mut seed = Pending::default();
    if overlap_tokens == 0 {
        return seed;
    }

    let max_units = closed.fresh.min(closed.units.len().saturating_sub(1));
    let mut taken: Vec<usize> = Vec::new();
    let mut chars = 0usize;

    for &index in closed.units.iter().rev().take(max_units) {
        if chars.div_ceil(CHARS_PER_TOKEN) >= overlap_tokens {
            break;
        }
        chars = if taken.is_empty() {
            lengths[index]
        } else {
            chars + 1 + lengths[index]
        };
        taken.push(index);
    }

    for &index in taken.iter().rev() {
        seed.push(index, lengths[index], false);
    }
    seed
}

fn build_chunk(units: &[Unit<'_>], members: &[usize], chunk_index: usize) -> TranscriptChunk {
    let text = members
        .iter()
        .map(|&i| units[i].text)
        .collect::<Vec<_>>()
        .join(" ");

    let start_time = members
        .iter()
        .filter_map(|&i| units[i].start)
        .reduce(f64::min);
    let end_time = members
        .iter()
        .filter_map(|&i| units[i].end)
        .reduce(f64::max);

    TranscriptChunk {
        chunk_index,
        token_count: estimate_tokens(&text),
        text,
        start_time,
        end_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(text: &str, start: f64, end: f64) -> TranscriptSegment {
        TranscriptSegment::new(text, start, end)
    }

    /// Segments of `chars` characters each, 5 seconds apart.
    fn uniform_segments(count: usize, chars: usize) -> Vec<TranscriptSegment> {
        (0..count)
            .map(|i| {
                let text = format!("{}{}", i % 10, "x".repeat(chars - 1));
                seg(&text, i as f64 * 5.0, i as f64 * 5.0 + 5.0)
            })
            .collect()
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_empty_segments_yield_no_chunks() {
        assert!(chunk_segments(&[], &ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn test_two_segments_fit_one_chunk() {
        let segments = vec![seg("Hello", 0.0, 2.0), seg("world", 2.0, 4.0)];
        let chunks = chunk_segments(&segments, &ChunkingConfig::default());

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello world");
        assert_eq!(chunks[0].start_time, Some(0.0));
        assert_eq!(chunks[0].end_time, Some(4.0));
        assert_eq!(chunks[0].token_count, 3);
    }

    #[test]
    fn test_chunks_respect_target_and_overlap() {
        // 40 chars per segment = 10 tokens; 5 segments fit under 50 tokens with separators.
        let segments = uniform_segments(20, 40);
        let config = ChunkingConfig {
            target_tokens: 50,
            overlap_tokens: 15,
        };
        let chunks = chunk_segments(&segments, &config);

        assert!(chunks.len() > 1);
        for window in chunks.windows(2) {
            let (prev, next) = (&window[0], &window[1]);
            // Next chunk opens with the last two segments of the previous one.
            let prev_tail: Vec<&str> = prev.text.split(' ').rev().take(2).collect();
            let next_head: Vec<&str> = next.text.split(' ').take(2).collect();
            assert_eq!(prev_tail.into_iter().rev().collect::<Vec<_>>(), next_head);
            assert!(next.start_time.unwrap() < prev.end_time.unwrap());
        }
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert!(chunk.token_count <= config.target_tokens);
        }
    }

    #[test]
    fn test_reconstructs_segment_order_without_overlap() {
        let segments = uniform_segments(17, 30);
        let config = ChunkingConfig {
            target_tokens: 40,
            overlap_tokens: 0,
        };
        let chunks = chunk_segments(&segments, &config);

        let rebuilt = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let original = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_timestamps_monotonic() {
        let segments = uniform_segments(50, 60);
        let chunks = chunk_segments(&segments, &ChunkingConfig {
            target_tokens: 60,
            overlap_tokens: 20,
        });

        for chunk in &chunks {
            assert!(chunk.end_time.unwrap() >= chunk.start_time.unwrap());
        }
        for window in chunks.windows(2) {
            assert!(window[0].start_time.unwrap() <= window[1].start_time.unwrap());
        }
    }

    #[test]
    fn test_oversized_segment_is_kept_whole() {
        let long = "y".repeat(4000);
        let segments = vec![seg("intro", 0.0, 1.0), seg(&long, 1.0, 300.0), seg("outro", 300.0, 301.0)];
        let chunks = chunk_segments(&segments, &ChunkingConfig::default());

        assert!(chunks.iter().any(|c| c.text.contains(&long)));
        assert!(chunks.iter().all(|c| c.text.split(' ').all(|w| w == long || w.len() < 10)));
        assert_eq!(chunks.last().unwrap().end_time, Some(301.0));
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let segments = uniform_segments(40, 50);
        let config = ChunkingConfig::default();
        assert_eq!(chunk_segments(&segments, &config), chunk_segments(&segments, &config));
    }

    #[test]
    fn test_sentinel_timestamps_degrade_to_untimed() {
        let segments: Vec<TranscriptSegment> = (0..30)
            .map(|i| seg(&format!("word{} and some more text here", i), 0.0, 0.0))
            .collect();
        let chunks = chunk_segments(&segments, &ChunkingConfig {
            target_tokens: 30,
            overlap_tokens: 5,
        });

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.start_time.is_none() && c.end_time.is_none()));
        assert!(chunks.iter().all(|c| !c.has_timestamps()));
    }

    #[test]
    fn test_validity_is_decided_per_transcript() {
        let mut segments: Vec<TranscriptSegment> = (0..30)
            .map(|i| seg(&format!("segment number {} text", i), 0.0, 0.0))
            .collect();
        segments[29] = seg("the only timed segment", 10.0, 12.0);

        let chunks = chunk_segments(&segments, &ChunkingConfig {
            target_tokens: 20,
            overlap_tokens: 5,
        });
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.has_timestamps()));
    }
}
