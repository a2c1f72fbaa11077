//! Sample-rate conversion between device rates and the fixed endpoint rates.
//!
//! Equal rates pass samples through untouched.

use crate::{constants::RESAMPLE_CHUNK_SIZE, error::CodecError};
use rubato::{FftFixedIn, Resampler};

fn make_resampler(from: u32, to: u32) -> Result<FftFixedIn<f32>, CodecError> {
    FftFixedIn::<f32>::new(
        from as usize,
        to as usize,
        RESAMPLE_CHUNK_SIZE,
        2, // sub-chunks
        1, // mono
    )
    .map_err(|e| CodecError::Resample(e.to_string()))
}

/// Streaming mono resampler. Keeps leftover input and the filter state
/// between calls, so consecutive buffers join without seams and arbitrary
/// callback sizes can be fed in.
pub struct StreamResampler {
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from: u32, to: u32) -> Result<Self, CodecError> {
        let resampler = if from == to {
            None
        } else {
            Some(make_resampler(from, to)?)
        };

        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Input frames the next conversion step consumes
    pub fn input_frames_next(&self) -> usize {
        self.resampler
            .as_ref()
            .map_or(RESAMPLE_CHUNK_SIZE, |resampler| resampler.input_frames_next())
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return input.to_vec();
        };

        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        let mut consumed = 0;

        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() - consumed < needed {
                break;
            }

            match resampler.process(&[&self.pending[consumed..consumed + needed]], None) {
                Ok(resampled) => output.extend_from_slice(&resampled[0]),
                Err(e) => warn!("Resampling error: {e}"),
            }
            consumed += needed;
        }

        self.pending.drain(..consumed);
        output
    }
}
