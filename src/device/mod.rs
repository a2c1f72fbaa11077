//! Audio device seams.
//!
//! The session owns one input and one output stream at a time. Acquiring a
//! device may suspend (permission prompts, backend start-up), so acquisition
//! is async; everything the device callbacks do is synchronous and
//! non-blocking.

#[cfg(feature = "audio-device")]
pub mod host;
pub mod worker;


use crate::{
    error::Result,
    timeline::{SharedTimeline, UnitId},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Receives mono float samples from the input device callback
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send>;

/// Called from the input device callback when the stream breaks
pub type InputErrorSink = Arc<dyn Fn(String) + Send + Sync>;

/// Notifications raised from the output device callback
#[derive(Clone, Debug, PartialEq)]
pub enum OutputEvent {
    /// A scheduled buffer has been fully handed to the device
    Ended(UnitId),

    /// The output stream broke; the session cannot continue
    Failed(String),
}

pub type OutputEventSink = Arc<dyn Fn(OutputEvent) + Send + Sync>;

#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquires the input device. Fails with [crate::error::Error::Permission]
    /// when access is denied or no device exists. Stream failures after that
    /// are reported through `errors`.
    async fn acquire(&self, errors: InputErrorSink) -> Result<Box<dyn InputStream>>;
}

pub trait InputStream: Send + Sync {
    /// Native sample rate of the acquired device
    fn sample_rate(&self) -> u32;

    /// Starts delivering samples to `sink`
    fn start(&mut self, sink: SampleSink) -> Result<()>;

    /// Stops capture and releases the device, returning once it is free.
    /// Safe to call more than once.
    fn release(&mut self);
}

#[async_trait]
pub trait Speaker: Send + Sync {
    /// Acquires the output device, playing whatever is scheduled on the
    /// returned stream's timeline. Fails with [crate::error::Error::Device].
    async fn acquire(&self, events: OutputEventSink) -> Result<Box<dyn OutputStream>>;
}

pub trait OutputStream: Send + Sync {
    /// The 24 kHz timeline this stream plays
    fn timeline(&self) -> SharedTimeline;

    /// Stops output and releases the device, returning once it is free.
    /// Safe to call more than once.
    fn release(&mut self);
}
