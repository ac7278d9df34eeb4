//! # Capture Chunk Accumulator
//!
//! Collects arbitrarily sized device blocks into fixed-length chunks.
//!
//! ## Key Features:
//! - **Fixed chunk length**: set at construction and never renegotiated, so every
//!   audio-append message of a session carries the same number of samples
//! - **No loss inside the accumulator**: leftover samples carry over to the next chunk
//! - **Discard on stop**: a partial chunk is thrown away when capture stops
//!
//! ## Rust Concepts:
//! - **Vec::drain(..n)**: moves the first `n` samples out without reallocating the rest

/// Accumulates samples until a full chunk is available.
#[derive(Debug)]
pub struct ChunkAccumulator {
    chunk_samples: usize,
    pending: Vec<f32>,
}

impl ChunkAccumulator {
    /// Create an accumulator producing chunks of `chunk_samples` samples (at least 1).
    pub fn new(chunk_samples: usize) -> Self {
        let chunk_samples = chunk_samples.max(1);
        Self {
            chunk_samples,
            pending: Vec::with_capacity(chunk_samples * 2),
        }
    }

    pub fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    /// Append a device block and return every chunk it completed, oldest first.
    pub fn push(&mut self, block: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(block);
        let mut chunks = Vec::new();
        while self.pending.len() >= self.chunk_samples {
            chunks.push(self.pending.drain(..self.chunk_samples).collect());
        }
        chunks
    }

    /// Samples waiting for the next chunk.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_blocks_accumulate_into_one_chunk() {
        let mut acc = ChunkAccumulator::new(4);
        assert!(acc.push(&[0.1, 0.2]).is_empty());
        assert!(acc.push(&[0.3]).is_empty());

        let chunks = acc.push(&[0.4, 0.5]);
        assert_eq!(chunks, vec![vec![0.1, 0.2, 0.3, 0.4]]);
        assert_eq!(acc.buffered(), 1);
    }

    #[test]
    fn test_large_block_yields_several_chunks() {
        let mut acc = ChunkAccumulator::new(3);
        let block: Vec<f32> = (0..10).map(|i| i as f32).collect();
        let chunks = acc.push(&block);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 3));
        assert_eq!(chunks[2], vec![6.0, 7.0, 8.0]);
        assert_eq!(acc.buffered(), 1);
    }

    #[test]
    fn test_clear_discards_partial_chunk() {
        let mut acc = ChunkAccumulator::new(4);
        acc.push(&[1.0, 1.0, 1.0]);
        acc.clear();
        assert!(acc.push(&[2.0, 2.0, 2.0]).is_empty());
        assert_eq!(acc.push(&[2.0]), vec![vec![2.0; 4]]);
    }

    #[test]
    fn test_zero_length_is_promoted() {
        assert_eq!(ChunkAccumulator::new(0).chunk_samples(), 1);
    }
}
