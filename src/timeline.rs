//! Output timeline for scheduled playback.
//!
//! The playback scheduler places 24 kHz sample buffers at absolute positions
//! and the output device pulls mixed samples from it. The number of frames
//! pulled so far is the output clock. Devices running at another rate read
//! through a [DeviceReader], which converts the mixed stream as a whole.

use crate::{error::CodecError, resample::StreamResampler};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type UnitId = u64;

/// Timeline shared between the scheduler and the output device callback
pub type SharedTimeline = Arc<Mutex<OutputTimeline>>;

struct ScheduledSamples {
    id: UnitId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl ScheduledSamples {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

pub struct OutputTimeline {
    sample_rate: u32,
    /// Frames handed to the device so far
    frames_rendered: u64,
    scheduled: Vec<ScheduledSamples>,
}

impl OutputTimeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            scheduled: Vec::new(),
        }
    }

    pub fn shared(sample_rate: u32) -> SharedTimeline {
        Arc::new(Mutex::new(Self::new(sample_rate)))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current output clock in seconds
    pub fn now(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    fn frame_at(&self, time: f64) -> u64 {
        (time * self.sample_rate as f64).round().max(0.0) as u64
    }

    /// Schedules mono samples to start at `start_time` seconds. A start time
    /// in the past is moved up to the current clock.
    pub fn schedule(&mut self, id: UnitId, start_time: f64, samples: Vec<f32>) {
        let start_frame = self.frame_at(start_time).max(self.frames_rendered);
        self.scheduled.push(ScheduledSamples {
            id,
            start_frame,
            samples,
        });
    }

    /// Stops every scheduled buffer immediately. The clock keeps running.
    pub fn stop_all(&mut self) {
        self.scheduled.clear();
    }

    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_idle(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Mixes the next `count` frames, padding with silence, and advances the
    /// clock. Returns the samples and the ids of buffers that finished within
    /// this window.
    pub fn pull_samples(&mut self, count: usize) -> (Vec<f32>, Vec<UnitId>) {
        let window_start = self.frames_rendered;
        let window_end = window_start + count as u64;
        let mut samples = vec![0.0f32; count];

        for unit in &self.scheduled {
            if unit.start_frame >= window_end || unit.end_frame() <= window_start {
                continue;
            }

            let from = unit.start_frame.max(window_start);
            let to = unit.end_frame().min(window_end);

            for frame in from..to {
                let out = (frame - window_start) as usize;
                let src = (frame - unit.start_frame) as usize;
                samples[out] += unit.samples[src];
            }
        }

        for sample in samples.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.frames_rendered = window_end;

        let mut ended = Vec::new();
        self.scheduled.retain(|unit| {
            if unit.end_frame() <= window_end {
                ended.push(unit.id);
                false
            } else {
                true
            }
        });

        (samples, ended)
    }

    /// Advances the clock without producing output, reporting finished buffers
    pub fn advance(&mut self, count: usize) -> Vec<UnitId> {
        self.pull_samples(count).1
    }
}

/// Output side of a timeline as seen by a device running at `device_rate`.
///
/// One resampler runs over the mixed timeline for the lifetime of the output
/// stream, so unit boundaries and silence never restart the filter.
pub struct DeviceReader {
    timeline: SharedTimeline,
    resampler: StreamResampler,
    ready: VecDeque<f32>,
}

impl DeviceReader {
    pub fn new(timeline: SharedTimeline, device_rate: u32) -> Result<Self, CodecError> {
        let timeline_rate = lock(&timeline).sample_rate();

        Ok(Self {
            resampler: StreamResampler::new(timeline_rate, device_rate)?,
            timeline,
            ready: VecDeque::new(),
        })
    }

    /// Produces `frames` device-rate frames and the ids of units that
    /// finished on the timeline meanwhile
    pub fn read(&mut self, frames: usize) -> (Vec<f32>, Vec<UnitId>) {
        if self.resampler.is_passthrough() {
            return lock(&self.timeline).pull_samples(frames);
        }

        let mut ended = Vec::new();

        while self.ready.len() < frames {
            let needed = self.resampler.input_frames_next();
            let (samples, finished) = lock(&self.timeline).pull_samples(needed);
            ended.extend(finished);

            let converted = self.resampler.process(&samples);
            if converted.is_empty() {
                break;
            }
            self.ready.extend(converted);
        }

        let available = frames.min(self.ready.len());
        let mut samples: Vec<f32> = self.ready.drain(..available).collect();
        samples.resize(frames, 0.0);

        (samples, ended)
    }
}

fn lock(timeline: &SharedTimeline) -> MutexGuard<'_, OutputTimeline> {
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}
