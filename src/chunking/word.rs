//! Word-based fallback for transcripts without usable timing.

use super::{pack, Chunker, ChunkingConfig, TranscriptChunk, Unit};
use crate::transcript::TranscriptSegment;

/// Packs words of the full text. Chunks carry no timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordChunker;

impl Chunker for WordChunker {
    fn chunk(&self, segments: &[TranscriptSegment], config: &ChunkingConfig) -> Vec<TranscriptChunk> {
        let units: Vec<Unit<'_>> = segments
            .iter()
            .flat_map(|s| s.text.split_whitespace())
            .map(|text| Unit {
                text,
                start: None,
                end: None,
            })
            .collect();

        pack(&units, config)
    }
}
