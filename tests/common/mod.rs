//! Test infrastructure for talking-cat-rs integration tests.
//!
//! Provides in-memory audio devices, a scripted local websocket agent and
//! helper functions for exercising sessions without real hardware or
//! network access.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};

// Re-export key types from the main crate
pub use talking_cat_rs::character::{CharacterAction, CharacterBridge, CharacterState};
pub use talking_cat_rs::codec::EncodedAudioPacket;
pub use talking_cat_rs::config::{AudioConfig, Config, SessionConfig};
pub use talking_cat_rs::controller::{
    self, CloseReason, ControllerStatus, SessionAction, SessionController, SharedController,
};
pub use talking_cat_rs::device::{
    InputErrorSink, InputStream, Microphone, OutputEvent, OutputEventSink, OutputStream,
    SampleSink, Speaker,
};
pub use talking_cat_rs::error::{CodecError, Error};
pub use talking_cat_rs::event::{Event, EventBus, Subscriber};
pub use talking_cat_rs::timeline::{DeviceReader, OutputTimeline, SharedTimeline};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const AGENT_RATE: u32 = 24000;

/// Creates a test configuration pointing at a local agent.
pub fn test_config(endpoint: &str) -> Config {
    Config {
        session: SessionConfig {
            endpoint: endpoint.to_string(),
            api_key: None,
            model: "test-model".to_string(),
            voice: "Puck".to_string(),
            system_instruction: "You are a test cat".to_string(),
            open_timeout_secs: 2,
        },
        audio: AudioConfig {
            input_device: None,
            output_device: None,
            frame_size: 160,
        },
    }
}

/// Polls `condition` until it holds or the timeout expires.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until the controller status satisfies `predicate`.
pub async fn wait_for_status<F>(status: &mut watch::Receiver<ControllerStatus>, predicate: F) -> bool
where
    F: FnMut(&ControllerStatus) -> bool,
{
    // The borrowed value is dropped before returning so senders never block
    matches!(
        tokio::time::timeout(TEST_TIMEOUT, status.wait_for(predicate)).await,
        Ok(Ok(_))
    )
}

/// Waits for a specific event within a timeout.
pub async fn wait_for_event<F>(
    subscriber: &mut Subscriber,
    timeout: Duration,
    matches: F,
) -> Option<Event>
where
    F: Fn(&Event) -> bool,
{
    tokio::time::timeout(timeout, async {
        while let Some(event) = subscriber.recv().await {
            if matches(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Inbound message carrying `seconds` of 24 kHz agent speech
pub fn audio_message(seconds: f64) -> String {
    let len = (seconds * AGENT_RATE as f64).round() as usize;
    let packet = EncodedAudioPacket::from_samples(&vec![0.2; len], AGENT_RATE);

    serde_json::json!({
        "serverContent": {
            "modelTurn": {
                "parts": [{ "inlineData": { "mimeType": packet.mime_type, "data": packet.payload } }]
            }
        }
    })
    .to_string()
}

pub fn interrupted_message() -> String {
    r#"{"serverContent":{"interrupted":true}}"#.to_string()
}

pub fn malformed_audio_message() -> String {
    r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"%%%"}}]}}}"#
        .to_string()
}

// ---------------------------------------------------------------------------
// Microphone

#[derive(Default)]
struct MicState {
    live: AtomicUsize,
    acquired: AtomicUsize,
    sink: Mutex<Option<SampleSink>>,
    errors: Mutex<Option<InputErrorSink>>,
}

/// Microphone whose samples are pushed by the test
#[derive(Clone)]
pub struct FakeMicrophone {
    sample_rate: u32,
    denied: bool,
    state: Arc<MicState>,
}

impl FakeMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            denied: false,
            state: Arc::default(),
        }
    }

    /// A microphone the user refused access to
    pub fn denied() -> Self {
        Self {
            denied: true,
            ..Self::new(16000)
        }
    }

    /// Handles acquired and not yet released
    pub fn live_handles(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn times_acquired(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    pub fn is_capturing(&self) -> bool {
        self.state.sink.lock().unwrap().is_some()
    }

    /// Delivers samples as the device callback would. Returns false when
    /// capture is not running.
    pub fn push(&self, samples: &[f32]) -> bool {
        match self.state.sink.lock().unwrap().as_mut() {
            Some(sink) => {
                sink(samples);
                true
            }
            None => false,
        }
    }

    /// Simulates the input stream breaking, e.g. the microphone being
    /// unplugged
    pub fn fail(&self, reason: &str) {
        let errors = self.state.errors.lock().unwrap().clone();
        if let Some(errors) = errors {
            errors(reason.to_string());
        }
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn acquire(&self, errors: InputErrorSink) -> Result<Box<dyn InputStream>, Error> {
        if self.denied {
            return Err(Error::Permission("Permission denied by user".to_string()));
        }

        *self.state.errors.lock().unwrap() = Some(errors);
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        self.state.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeInputStream {
            sample_rate: self.sample_rate,
            state: self.state.clone(),
            released: false,
        }))
    }
}

struct FakeInputStream {
    sample_rate: u32,
    state: Arc<MicState>,
    released: bool,
}

impl InputStream for FakeInputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, sink: SampleSink) -> Result<(), Error> {
        *self.state.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            *self.state.sink.lock().unwrap() = None;
            *self.state.errors.lock().unwrap() = None;
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeInputStream {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Speaker

struct SpeakerOutput {
    timeline: SharedTimeline,
    reader: DeviceReader,
    events: OutputEventSink,
}

#[derive(Default)]
struct SpeakerState {
    live: AtomicUsize,
    output: Mutex<Option<SpeakerOutput>>,
}

/// Speaker whose clock only moves when the test renders frames. Runs at
/// `sample_rate` and reads the 24 kHz timeline through a [DeviceReader].
#[derive(Clone)]
pub struct FakeSpeaker {
    sample_rate: u32,
    unavailable: bool,
    state: Arc<SpeakerState>,
}

impl FakeSpeaker {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            unavailable: false,
            state: Arc::default(),
        }
    }

    /// No output device present
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new(AGENT_RATE)
        }
    }

    pub fn live_handles(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn timeline(&self) -> Option<SharedTimeline> {
        self.state
            .output
            .lock()
            .unwrap()
            .as_ref()
            .map(|output| output.timeline.clone())
    }

    /// Plays `frames` frames and reports finished units like a device
    /// callback would. Returns the rendered samples.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let mut output = self.state.output.lock().unwrap();

        let Some(output) = output.as_mut() else {
            return Vec::new();
        };

        let (samples, ended) = output.reader.read(frames);
        for id in ended {
            (output.events)(OutputEvent::Ended(id));
        }
        samples
    }

    /// Simulates the output stream breaking
    pub fn fail(&self, reason: &str) {
        let events = self
            .state
            .output
            .lock()
            .unwrap()
            .as_ref()
            .map(|output| output.events.clone());

        if let Some(events) = events {
            events(OutputEvent::Failed(reason.to_string()));
        }
    }
}

#[async_trait]
impl Speaker for FakeSpeaker {
    async fn acquire(&self, events: OutputEventSink) -> Result<Box<dyn OutputStream>, Error> {
        if self.unavailable {
            return Err(Error::Device("No output device".to_string()));
        }

        let timeline = OutputTimeline::shared(AGENT_RATE);
        let reader = DeviceReader::new(timeline.clone(), self.sample_rate)?;
        *self.state.output.lock().unwrap() = Some(SpeakerOutput {
            timeline: timeline.clone(),
            reader,
            events,
        });
        self.state.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeOutputStream {
            timeline,
            state: self.state.clone(),
            released: false,
        }))
    }
}

struct FakeOutputStream {
    timeline: SharedTimeline,
    state: Arc<SpeakerState>,
    released: bool,
}

impl OutputStream for FakeOutputStream {
    fn timeline(&self) -> SharedTimeline {
        self.timeline.clone()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            *self.state.output.lock().unwrap() = None;
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeOutputStream {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Agent

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentMode {
    /// Acknowledges setup and then follows commands
    Normal,

    /// Never acknowledges setup
    Silent,

    /// Closes the connection as soon as setup arrives
    RejectSetup,
}

#[derive(Debug)]
pub enum AgentCommand {
    /// Sends a text frame
    Send(String),

    /// Sends a close frame
    Close(String),

    /// Drops the TCP connection without a close handshake
    Drop,
}

/// Local websocket server standing in for the live endpoint
pub struct MockAgent {
    pub url: String,
    received: mpsc::UnboundedReceiver<Value>,
    commands: mpsc::UnboundedSender<AgentCommand>,
    connections: Arc<AtomicUsize>,
}

impl MockAgent {
    pub async fn start() -> Self {
        Self::start_with(AgentMode::Normal).await
    }

    pub async fn start_with(mode: AgentMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let (received_tx, received) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let commands_rx = Arc::new(tokio::sync::Mutex::new(commands_rx));
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(
                    stream,
                    mode,
                    received_tx.clone(),
                    commands_rx.clone(),
                ));
            }
        });

        Self {
            url,
            received,
            commands,
            connections,
        }
    }

    /// An endpoint nobody listens on
    pub async fn unreachable_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);
        url
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn send(&self, text: String) {
        self.commands.send(AgentCommand::Send(text)).unwrap();
    }

    pub fn close(&self, reason: &str) {
        self.commands
            .send(AgentCommand::Close(reason.to_string()))
            .unwrap();
    }

    pub fn drop_connection(&self) {
        self.commands.send(AgentCommand::Drop).unwrap();
    }

    /// Next JSON message the client sent
    pub async fn next_message(&mut self) -> Option<Value> {
        tokio::time::timeout(TEST_TIMEOUT, self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next message with the given top-level key
    pub async fn next_message_with(&mut self, key: &str) -> Option<Value> {
        loop {
            let message = self.next_message().await?;
            if message.get(key).is_some() {
                return Some(message);
            }
        }
    }

    /// Messages already received, without waiting
    pub fn drain_messages(&mut self) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Ok(message) = self.received.try_recv() {
            messages.push(message);
        }
        messages
    }
}

async fn serve(
    stream: TcpStream,
    mode: AgentMode,
    received: mpsc::UnboundedSender<Value>,
    commands: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<AgentCommand>>>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    // The first frame is the setup message
    match ws.next().await {
        Some(Ok(Message::Text(text))) => {
            if let Ok(value) = serde_json::from_str(text.as_str()) {
                let _ = received.send(value);
            }
        }
        _ => return,
    }

    match mode {
        AgentMode::Normal => {
            if ws
                .send(Message::text(r#"{"setupComplete":{}}"#))
                .await
                .is_err()
            {
                return;
            }
        }
        AgentMode::Silent => {
            // Keep the socket open until the client gives up
            while let Some(Ok(_)) = ws.next().await {}
            return;
        }
        AgentMode::RejectSetup => {
            let _ = ws.close(None).await;
            return;
        }
    }

    let mut commands = commands.lock().await;

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str(text.as_str()) {
                        let _ = received.send(value);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Some(AgentCommand::Send(text)) => {
                    if ws.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(AgentCommand::Close(reason)) => {
                    let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                        reason: reason.into(),
                    };
                    let _ = ws.close(Some(frame)).await;
                    break;
                }
                Some(AgentCommand::Drop) | None => break,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Harness

/// Controller wired to fake devices and a local agent
pub struct TestHarness {
    pub bus: EventBus,
    pub character: CharacterBridge,
    pub microphone: FakeMicrophone,
    pub speaker: FakeSpeaker,
    pub config: Config,
}

impl TestHarness {
    pub fn new(endpoint: &str) -> Self {
        Self::with_devices(
            endpoint,
            FakeMicrophone::new(16000),
            FakeSpeaker::new(AGENT_RATE),
        )
    }

    pub fn with_devices(endpoint: &str, microphone: FakeMicrophone, speaker: FakeSpeaker) -> Self {
        Self {
            bus: EventBus::new(),
            character: CharacterBridge::new(),
            microphone,
            speaker,
            config: test_config(endpoint),
        }
    }

    /// Controller not attached to the bus, driven by direct calls
    pub fn controller(&self) -> SessionController {
        SessionController::new(
            self.bus.clone(),
            self.config.clone(),
            Arc::new(self.microphone.clone()),
            Arc::new(self.speaker.clone()),
            self.character.clone(),
        )
    }

    /// Controller handling session events from the bus
    pub fn shared_controller(&self) -> SharedController {
        controller::init(self.controller())
    }

    pub fn subscribe(&self) -> Subscriber {
        self.bus.subscribe()
    }

    pub fn send(&self, event: Event) {
        self.bus.send(event);
    }

    /// True once no device handle is held
    pub fn devices_released(&self) -> bool {
        self.microphone.live_handles() == 0 && self.speaker.live_handles() == 0
    }
}
