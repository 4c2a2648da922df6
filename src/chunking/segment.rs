//! Segment-aware chunking for transcripts with valid timestamps.

use super::{pack, Chunker, ChunkingConfig, TranscriptChunk, Unit};
use crate::transcript::TranscriptSegment;

/// Packs whole caption segments, keeping each chunk's earliest start and latest end.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentChunker;

impl Chunker for SegmentChunker {
    fn chunk(&self, segments: &[TranscriptSegment], config: &ChunkingConfig) -> Vec<TranscriptChunk> {
        let units: Vec<Unit<'_>> = segments
            .iter()
            .filter_map(|s| {
                let text = s.text.trim();
                (!text.is_empty()).then_some(Unit {
                    text,
                    start: Some(s.start),
                    end: Some(s.end.max(s.start)),
                })
            })
            .collect();

        pack(&units, config)
    }
}
