//! Batch construction for a single golden case.
//!
//! The model always sees a full `[batch, max_len]` batch. A golden case
//! holds one token sequence, so that sequence is replicated into every row
//! and paired with per-row positions `0..max_len` and a constant segment id
//! marking every token as part of the active sequence.

use super::GoldenCase;
use crate::config::RunConfig;
use crate::error::{GoldcheckError, Result};
use candle_core::{Device, Tensor};

/// Segment id of tokens that belong to the sequence being decoded.
///
/// Segment `0` is reserved for padding.
pub const ACTIVE_SEQUENCE_SEGMENT: u32 = 1;

/// Model inputs derived from one golden case. All tensors are `u32`.
#[derive(Debug, Clone)]
pub struct BatchedInput {
    /// Token ids: [batch, max_len].
    pub ids: Tensor,
    /// Position of each token: [batch, max_len].
    pub decoder_positions: Tensor,
    /// Segment of each token: [batch, max_len].
    pub decoder_segment_ids: Tensor,
}

impl BatchedInput {
    /// Number of rows.
    pub fn batch_size(&self) -> usize {
        self.ids.dims()[0]
    }

    /// Tokens per row.
    pub fn seq_len(&self) -> usize {
        self.ids.dims()[1]
    }

    /// Device the inputs live on.
    pub fn device(&self) -> &Device {
        self.ids.device()
    }

    /// Take `len` rows starting at `start`.
    pub fn narrow_batch(&self, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            ids: self.ids.narrow(0, start, len)?,
            decoder_positions: self.decoder_positions.narrow(0, start, len)?,
            decoder_segment_ids: self.decoder_segment_ids.narrow(0, start, len)?,
        })
    }
}

/// Builds [`BatchedInput`]s with a fixed batch width and sequence length.
#[derive(Debug, Clone)]
pub struct BatchInputBuilder {
    batch_size: usize,
    max_sequence_length: usize,
    device: Device,
}

impl BatchInputBuilder {
    /// Create a builder.
    pub fn new(batch_size: usize, max_sequence_length: usize, device: Device) -> Self {
        Self {
            batch_size,
            max_sequence_length,
            device,
        }
    }

    /// Create a builder sized by a run config.
    pub fn from_config(config: &RunConfig, device: Device) -> Self {
        Self::new(config.global_batch_size(), config.max_target_length, device)
    }

    /// Rows per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Tokens per row.
    pub fn max_sequence_length(&self) -> usize {
        self.max_sequence_length
    }

    /// Build the batch for a case.
    ///
    /// The token sequence must already be exactly `max_sequence_length`
    /// long; no padding or truncation is applied.
    pub fn build(&self, case: &GoldenCase) -> Result<BatchedInput> {
        let len = self.max_sequence_length;
        if case.tokens.len() != len {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "case \"{}\" has {} tokens but max_target_length is {}",
                case.prompt,
                case.tokens.len(),
                len
            )));
        }

        let rows = self.batch_size;
        let ids = Tensor::from_slice(&case.tokens, (1, len), &self.device)?.repeat((rows, 1))?;
        let decoder_positions = Tensor::arange(0u32, len as u32, &self.device)?
            .unsqueeze(0)?
            .repeat((rows, 1))?;
        let decoder_segment_ids = Tensor::from_vec(
            vec![ACTIVE_SEQUENCE_SEGMENT; rows * len],
            (rows, len),
            &self.device,
        )?;

        Ok(BatchedInput {
            ids,
            decoder_positions,
            decoder_segment_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(tokens: Vec<u32>) -> GoldenCase {
        let rows = tokens.len();
        GoldenCase::new("I love to", tokens, vec![vec![0.0; 8]; rows])
    }

    #[test]
    fn batch_shapes() {
        let builder = BatchInputBuilder::new(4, 3, Device::Cpu);
        let batch = builder.build(&case(vec![1, 2, 3])).unwrap();

        assert_eq!(batch.ids.dims(), &[4, 3]);
        assert_eq!(batch.decoder_positions.dims(), &[4, 3]);
        assert_eq!(batch.decoder_segment_ids.dims(), &[4, 3]);
        assert_eq!(batch.batch_size(), 4);
        assert_eq!(batch.seq_len(), 3);
    }

    #[test]
    fn positions_and_segments() {
        let builder = BatchInputBuilder::new(2, 4, Device::Cpu);
        let batch = builder.build(&case(vec![9, 8, 7, 6])).unwrap();

        let positions: Vec<Vec<u32>> = batch.decoder_positions.to_vec2().unwrap();
        assert_eq!(positions, vec![vec![0, 1, 2, 3], vec![0, 1, 2, 3]]);

        let segments: Vec<Vec<u32>> = batch.decoder_segment_ids.to_vec2().unwrap();
        assert!(segments
            .iter()
            .flatten()
            .all(|&s| s == ACTIVE_SEQUENCE_SEGMENT));
    }

    #[test]
    fn length_mismatch_rejected() {
        let builder = BatchInputBuilder::new(1, 8, Device::Cpu);
        let result = builder.build(&case(vec![1, 2, 3]));
        assert!(matches!(result, Err(GoldcheckError::ShapeMismatch(_))));
    }

    #[test]
    fn narrow_batch_rows() {
        let builder = BatchInputBuilder::new(5, 2, Device::Cpu);
        let batch = builder.build(&case(vec![3, 4])).unwrap();

        let part = batch.narrow_batch(3, 2).unwrap();
        assert_eq!(part.batch_size(), 2);
        let ids: Vec<Vec<u32>> = part.ids.to_vec2().unwrap();
        assert_eq!(ids, vec![vec![3, 4], vec![3, 4]]);

        assert!(batch.narrow_batch(4, 2).is_err());
    }

    #[test]
    fn from_config_uses_global_batch() {
        let config = RunConfig {
            per_device_batch_size: 2,
            num_shards: 3,
            max_target_length: 5,
            ..RunConfig::default()
        };
        let builder = BatchInputBuilder::from_config(&config, Device::Cpu);
        assert_eq!(builder.batch_size(), 6);
        assert_eq!(builder.max_sequence_length(), 5);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Invariant: every row of ids equals the case's token sequence
        #[test]
        fn invariant_rows_replicate_tokens(
            tokens in prop::collection::vec(0u32..32_000, 1..24),
            batch_size in 1usize..6,
        ) {
            let builder = BatchInputBuilder::new(batch_size, tokens.len(), Device::Cpu);
            let case = GoldenCase::new("p", tokens.clone(), vec![vec![0.0]; tokens.len()]);
            let batch = builder.build(&case).unwrap();

            let ids: Vec<Vec<u32>> = batch.ids.to_vec2().unwrap();
            prop_assert_eq!(ids.len(), batch_size);
            for row in ids {
                prop_assert_eq!(&row, &tokens);
            }
        }

        /// Invariant: position rows count up from zero
        #[test]
        fn invariant_positions_count_up(len in 1usize..32, batch_size in 1usize..4) {
            let builder = BatchInputBuilder::new(batch_size, len, Device::Cpu);
            let case = GoldenCase::new("p", vec![0; len], vec![vec![0.0]; len]);
            let batch = builder.build(&case).unwrap();

            let expected: Vec<u32> = (0..len as u32).collect();
            let positions: Vec<Vec<u32>> = batch.decoder_positions.to_vec2().unwrap();
            for row in positions {
                prop_assert_eq!(&row, &expected);
            }
        }
    }
}
