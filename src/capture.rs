//! Microphone capture pipeline
//!
//! Samples arrive from the input device callback at the device's native rate.
//! They are resampled to 16 kHz, cut into fixed-size frames, encoded as PCM16
//! packets and handed to a [PacketSink]. Nothing here blocks or awaits, so the
//! whole pipeline runs inside the device callback.

use crate::{
    codec::EncodedAudioPacket,
    constants::CAPTURE_SAMPLE_RATE,
    device::SampleSink,
    error::CodecError,
    resample::StreamResampler,
};

/// Destination for encoded capture frames. Implementations must not block.
pub trait PacketSink: Send {
    fn send(&self, packet: EncodedAudioPacket);
}

/// Cuts a continuous sample stream into frames of exactly `frame_len`
/// samples, keeping the remainder for the next push.
pub struct FrameChunker {
    frame_len: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Samples waiting for a frame to fill up
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);

        let whole = self.pending.len() / self.frame_len * self.frame_len;
        let frames = self
            .pending
            .drain(..whole)
            .collect::<Vec<_>>()
            .chunks_exact(self.frame_len)
            .map(<[f32]>::to_vec)
            .collect();

        frames
    }
}

pub struct CapturePipeline<S: PacketSink> {
    resampler: StreamResampler,
    chunker: FrameChunker,
    sink: S,
    frames_sent: u64,
}

impl<S: PacketSink + 'static> CapturePipeline<S> {
    pub fn new(device_rate: u32, frame_len: usize, sink: S) -> Result<Self, CodecError> {
        Ok(Self {
            resampler: StreamResampler::new(device_rate, CAPTURE_SAMPLE_RATE)?,
            chunker: FrameChunker::new(frame_len),
            sink,
            frames_sent: 0,
        })
    }

    /// Feeds one device callback worth of mono samples through the pipeline
    pub fn process(&mut self, samples: &[f32]) {
        let resampled = self.resampler.process(samples);

        for frame in self.chunker.push(&resampled) {
            let packet = EncodedAudioPacket::from_samples(&frame, CAPTURE_SAMPLE_RATE);
            self.sink.send(packet);
            self.frames_sent += 1;

            trace!("Captured frame {}", self.frames_sent);
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Turns the pipeline into a callback for [crate::device::InputStream::start]
    pub fn into_sink(mut self) -> SampleSink {
        Box::new(move |samples: &[f32]| self.process(samples))
    }
}
