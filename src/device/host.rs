//! Audio devices backed by cpal
//!
//! cpal streams are not Send, so every stream lives on a [DeviceWorker]
//! thread and is driven through commands. The thread owns the stream until it
//! is released or its handle is dropped.

use super::{
    worker::{DeviceWorker, Inbox},
    InputErrorSink, InputStream, Microphone, OutputEvent, OutputEventSink, OutputStream,
    SampleSink, Speaker,
};
use crate::{
    constants::PLAYBACK_SAMPLE_RATE,
    error::{Error, Result},
    timeline::{DeviceReader, OutputTimeline, SharedTimeline},
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Host, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use crossbeam_channel::{bounded, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

type SinkSlot = Arc<Mutex<Option<SampleSink>>>;

enum InputCommand {
    Start(SampleSink, Sender<Result<()>>),
}

/// Microphone using the default cpal host
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self, errors: InputErrorSink) -> Result<Box<dyn InputStream>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let device_name = self.device_name.clone();

        let worker = DeviceWorker::spawn("audio-capture", move |inbox| {
            run_input_thread(device_name, errors, inbox, reply_tx)
        })
        .map_err(|e| Error::Permission(format!("Failed to spawn capture thread: {e}")))?;

        let sample_rate = reply_rx
            .await
            .map_err(|_| Error::Permission("Capture thread exited".to_string()))??;

        Ok(Box::new(CpalInputStream {
            worker,
            sample_rate,
        }))
    }
}

struct CpalInputStream {
    worker: DeviceWorker<InputCommand>,
    sample_rate: u32,
}

impl InputStream for CpalInputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, sink: SampleSink) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        if !self.worker.send(InputCommand::Start(sink, done_tx)) {
            return Err(Error::Permission("Capture thread is gone".to_string()));
        }

        done_rx
            .recv_timeout(COMMAND_TIMEOUT)
            .map_err(|_| Error::Permission("Capture thread did not respond".to_string()))?
    }

    fn release(&mut self) {
        self.worker.release();
    }
}

fn run_input_thread(
    device_name: Option<String>,
    errors: InputErrorSink,
    inbox: Inbox<InputCommand>,
    reply: oneshot::Sender<Result<u32>>,
) {
    let slot: SinkSlot = Arc::new(Mutex::new(None));

    let (stream, sample_rate) = match open_input_stream(device_name.as_deref(), slot.clone(), errors) {
        Ok(opened) => opened,
        Err(e) => {
            error!("Failed to open input stream: {e}");
            let _ = reply.send(Err(e));
            return;
        }
    };

    if reply.send(Ok(sample_rate)).is_err() {
        return;
    }

    debug!("Audio capture thread started");

    while let Some(command) = inbox.recv() {
        match command {
            InputCommand::Start(sink, done) => {
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(sink);
                }
                let result = stream
                    .play()
                    .map_err(|e| Error::Permission(format!("Failed to start input stream: {e}")));
                let _ = done.send(result);
            }
        }
    }

    debug!("Audio capture thread stopping");
    drop(stream);
}

fn open_input_stream(
    device_name: Option<&str>,
    slot: SinkSlot,
    errors: InputErrorSink,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => {
            let devices = host
                .input_devices()
                .map_err(|e| Error::Permission(format!("Failed to enumerate input devices: {e}")))?;
            find_device_by_name(devices, name).ok_or_else(|| {
                warn!("Available input devices: {:?}", list_input_devices(&host));
                Error::Permission(format!("No input device matching {name}"))
            })?
        }
        None => host
            .default_input_device()
            .ok_or_else(|| Error::Permission("No default input device".to_string()))?,
    };

    info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported = device
        .default_input_config()
        .map_err(|e| Error::Permission(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();

    debug!(
        "Input stream config: {} Hz, {} channels, {:?}",
        config.sample_rate.0, config.channels, sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config, slot, errors),
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config, slot, errors),
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config, slot, errors),
        SampleFormat::I32 => build_input_stream::<i32>(&device, &config, slot, errors),
        other => Err(Error::Permission(format!(
            "Unsupported input sample format: {other:?}"
        ))),
    }?;

    Ok((stream, config.sample_rate.0))
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    slot: SinkSlot,
    errors: InputErrorSink,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Down-mix to mono
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                    })
                    .collect();

                // Never block the audio thread; skip the buffer if the sink is being swapped
                if let Ok(mut slot) = slot.try_lock() {
                    if let Some(sink) = slot.as_mut() {
                        sink(&mono);
                    }
                }
            },
            move |err| {
                error!("Audio input stream error: {}", err);
                errors(err.to_string());
            },
            None,
        )
        .map_err(|e| Error::Permission(format!("Failed to build input stream: {e}")))
}

/// Speaker using the default cpal host
pub struct CpalSpeaker {
    device_name: Option<String>,
}

impl CpalSpeaker {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl Speaker for CpalSpeaker {
    async fn acquire(&self, events: OutputEventSink) -> Result<Box<dyn OutputStream>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let device_name = self.device_name.clone();

        let worker = DeviceWorker::spawn("audio-output", move |inbox| {
            run_output_thread(device_name, events, inbox, reply_tx)
        })
        .map_err(|e| Error::Device(format!("Failed to spawn output thread: {e}")))?;

        let timeline = reply_rx
            .await
            .map_err(|_| Error::Device("Output thread exited".to_string()))??;

        Ok(Box::new(CpalOutputStream { worker, timeline }))
    }
}

struct CpalOutputStream {
    worker: DeviceWorker<()>,
    timeline: SharedTimeline,
}

impl OutputStream for CpalOutputStream {
    fn timeline(&self) -> SharedTimeline {
        self.timeline.clone()
    }

    fn release(&mut self) {
        self.worker.release();
    }
}

fn run_output_thread(
    device_name: Option<String>,
    events: OutputEventSink,
    inbox: Inbox<()>,
    reply: oneshot::Sender<Result<SharedTimeline>>,
) {
    let stream = match open_output_stream(device_name.as_deref(), events) {
        Ok((stream, timeline)) => {
            if reply.send(Ok(timeline)).is_err() {
                return;
            }
            stream
        }
        Err(e) => {
            error!("Failed to open output stream: {e}");
            let _ = reply.send(Err(e));
            return;
        }
    };

    debug!("Audio output thread started");

    inbox.wait_for_release();

    debug!("Audio output thread stopping");
    drop(stream);
}

fn open_output_stream(
    device_name: Option<&str>,
    events: OutputEventSink,
) -> Result<(Stream, SharedTimeline)> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => {
            let devices = host
                .output_devices()
                .map_err(|e| Error::Device(format!("Failed to enumerate output devices: {e}")))?;
            find_device_by_name(devices, name).ok_or_else(|| {
                warn!("Available output devices: {:?}", list_output_devices(&host));
                Error::Device(format!("No output device matching {name}"))
            })?
        }
        None => host
            .default_output_device()
            .ok_or_else(|| Error::Device("No default output device".to_string()))?,
    };

    info!(
        "Using output device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let default = device
        .default_output_config()
        .map_err(|e| Error::Device(e.to_string()))?;

    // Prefer the endpoint's native rate so no resampling is needed
    let native_rate = SampleRate(PLAYBACK_SAMPLE_RATE);
    let supported = device
        .supported_output_configs()
        .ok()
        .and_then(|mut configs| {
            configs.find(|c| {
                c.channels() == default.channels()
                    && c.sample_format() == default.sample_format()
                    && c.min_sample_rate() <= native_rate
                    && c.max_sample_rate() >= native_rate
            })
        })
        .map(|c| c.with_sample_rate(native_rate))
        .unwrap_or(default);

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();

    let timeline = OutputTimeline::shared(PLAYBACK_SAMPLE_RATE);
    let reader = DeviceReader::new(timeline.clone(), config.sample_rate.0)?;

    debug!(
        "Output stream config: {} Hz, {} channels, {:?}",
        config.sample_rate.0, config.channels, sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &config, reader, events),
        SampleFormat::I16 => build_output_stream::<i16>(&device, &config, reader, events),
        SampleFormat::U16 => build_output_stream::<u16>(&device, &config, reader, events),
        SampleFormat::I32 => build_output_stream::<i32>(&device, &config, reader, events),
        other => Err(Error::Device(format!(
            "Unsupported output sample format: {other:?}"
        ))),
    }?;

    stream
        .play()
        .map_err(|e| Error::Device(format!("Failed to start output stream: {e}")))?;

    Ok((stream, timeline))
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut reader: DeviceReader,
    events: OutputEventSink,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let error_events = events.clone();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                let (samples, ended) = reader.read(frames);

                // Duplicate mono onto every output channel
                for (frame, sample) in data.chunks_mut(channels).zip(samples) {
                    for out in frame.iter_mut() {
                        *out = T::from_sample(sample);
                    }
                }

                for id in ended {
                    events(OutputEvent::Ended(id));
                }
            },
            move |err| {
                error!("Audio output stream error: {}", err);
                error_events(OutputEvent::Failed(err.to_string()));
            },
            None,
        )
        .map_err(|e| Error::Device(format!("Failed to build output stream: {e}")))
}

fn find_device_by_name(devices: impl Iterator<Item = Device>, name: &str) -> Option<Device> {
    devices.into_iter().find(|device| {
        device
            .name()
            .map(|device_name| device_name.contains(name) || name.contains(&device_name))
            .unwrap_or(false)
    })
}

fn list_input_devices(host: &Host) -> Vec<String> {
    host.input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

fn list_output_devices(host: &Host) -> Vec<String> {
    host.output_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}
