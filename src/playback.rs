use crate::{
    character::CharacterBridge,
    codec::EncodedAudioPacket,
    constants::{CHANNELS, PLAYBACK_SAMPLE_RATE},
    controller::{CloseReason, SessionAction},
    device::{OutputEvent, OutputEventSink},
    error::Result,
    event::{Event, EventBus},
    session::SessionId,
    timeline::{OutputTimeline, SharedTimeline, UnitId},
};
use std::{
    collections::HashMap,
    sync::{Arc, MutexGuard, PoisonError},
};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};

/// A decoded chunk of agent speech placed on the output timeline
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackUnit {
    pub id: UnitId,
    /// Seconds on the output clock
    pub start_time: f64,
    /// Seconds
    pub duration: f64,
}

impl PlaybackUnit {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

pub type SharedScheduler = Arc<RwLock<PlaybackScheduler>>;

/// Places inbound audio back to back on the output timeline and tracks which
/// units are still sounding.
pub struct PlaybackScheduler {
    timeline: SharedTimeline,
    character: CharacterBridge,

    /// Where the next unit starts, in seconds on the output clock
    cursor: f64,

    sounding: HashMap<UnitId, PlaybackUnit>,
    next_id: UnitId,

    /// Set on teardown, after which everything is a no-op
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(timeline: SharedTimeline, character: CharacterBridge) -> Self {
        Self {
            timeline,
            character,
            cursor: 0.0,
            sounding: HashMap::new(),
            next_id: 0,
            closed: false,
        }
    }

    pub fn shared(self) -> SharedScheduler {
        Arc::new(RwLock::new(self))
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn sounding_count(&self) -> usize {
        self.sounding.len()
    }

    pub fn is_speaking(&self) -> bool {
        !self.sounding.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Decodes a 24 kHz PCM16 packet and schedules it right after the
    /// previous unit, or at the current clock if that has already passed.
    /// The timeline runs at 24 kHz; conversion to the device rate happens on
    /// the output side.
    ///
    /// Packets that decode to no samples are ignored.
    pub fn enqueue(&mut self, packet: &EncodedAudioPacket) -> Result<Option<PlaybackUnit>> {
        if self.closed {
            trace!("Scheduler closed, dropping audio chunk");
            return Ok(None);
        }

        let samples = packet
            .decode(CHANNELS)?
            .into_iter()
            .next()
            .unwrap_or_default();

        if samples.is_empty() {
            return Ok(None);
        }

        let duration = samples.len() as f64 / PLAYBACK_SAMPLE_RATE as f64;

        // Locks the field directly so the cursor stays assignable
        let mut timeline = self.timeline.lock().unwrap_or_else(PoisonError::into_inner);

        let start_time = self.cursor.max(timeline.now());
        self.cursor = start_time + duration;

        let id = self.next_id;
        self.next_id += 1;

        timeline.schedule(id, start_time, samples);
        drop(timeline);

        let unit = PlaybackUnit {
            id,
            start_time,
            duration,
        };

        self.sounding.insert(id, unit);

        trace!(
            "Scheduled unit {id} at {start_time:.3}s for {duration:.3}s ({} sounding)",
            self.sounding.len()
        );

        if self.sounding.len() == 1 {
            self.character.audio_started();
        }

        Ok(Some(unit))
    }

    /// Called when the output device has played a unit to the end
    pub fn unit_ended(&mut self, id: UnitId) {
        if self.closed {
            return;
        }

        if self.sounding.remove(&id).is_some() && self.sounding.is_empty() {
            debug!("Utterance finished");
            self.character.audio_stopped();
        }
    }

    /// Silences everything immediately and starts the next utterance fresh
    pub fn flush(&mut self) {
        if self.closed {
            return;
        }

        self.lock_timeline().stop_all();

        if !self.sounding.is_empty() {
            debug!("Flushing {} sounding unit(s)", self.sounding.len());
        }

        self.sounding.clear();
        self.cursor = 0.0;
        self.character.audio_stopped();
    }

    pub fn close(&mut self) {
        self.flush();
        self.closed = true;
    }

    fn lock_timeline(&self) -> MutexGuard<'_, OutputTimeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub enum PlaybackCommand {
    /// Inbound agent audio
    Enqueue(EncodedAudioPacket),

    /// Agent was interrupted
    Flush,

    /// Output device finished a unit
    UnitEnded(UnitId),

    /// Output stream broke
    DeviceFailed(String),
}

/// Cheap handle for feeding the playback loop from the session reader and the
/// output device callback. Never blocks.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::UnboundedSender<PlaybackCommand>,
}

pub type PlaybackCommands = mpsc::UnboundedReceiver<PlaybackCommand>;

pub fn channel() -> (PlaybackHandle, PlaybackCommands) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PlaybackHandle { tx }, rx)
}

impl PlaybackHandle {
    pub fn enqueue(&self, packet: EncodedAudioPacket) {
        self.send(PlaybackCommand::Enqueue(packet));
    }

    pub fn flush(&self) {
        self.send(PlaybackCommand::Flush);
    }

    pub fn unit_ended(&self, id: UnitId) {
        self.send(PlaybackCommand::UnitEnded(id));
    }

    pub fn device_failed(&self, reason: String) {
        self.send(PlaybackCommand::DeviceFailed(reason));
    }

    /// Callback for [crate::device::Speaker::acquire]
    pub fn output_events(&self) -> OutputEventSink {
        let handle = self.clone();

        Arc::new(move |event| match event {
            OutputEvent::Ended(id) => handle.unit_ended(id),
            OutputEvent::Failed(reason) => handle.device_failed(reason),
        })
    }

    fn send(&self, command: PlaybackCommand) {
        if self.tx.send(command).is_err() {
            trace!("Playback loop is gone, dropping command");
        }
    }
}

/// Applies playback commands one at a time in arrival order
pub fn spawn_loop(
    session_id: SessionId,
    scheduler: SharedScheduler,
    mut commands: PlaybackCommands,
    bus: EventBus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            handle_command(session_id, &scheduler, &bus, command).await;
        }

        trace!("Playback loop for session {session_id} finished");
    })
}

async fn handle_command(
    session_id: SessionId,
    scheduler: &SharedScheduler,
    bus: &EventBus,
    command: PlaybackCommand,
) {
    let mut scheduler = scheduler.write().await;

    match command {
        PlaybackCommand::Enqueue(packet) => {
            if let Err(e) = scheduler.enqueue(&packet) {
                warn!("Dropping malformed audio chunk: {e}");
            }
        }
        PlaybackCommand::Flush => {
            info!("Agent interrupted, flushing playback");
            scheduler.flush();
        }
        PlaybackCommand::UnitEnded(id) => scheduler.unit_ended(id),
        PlaybackCommand::DeviceFailed(reason) => {
            if scheduler.is_closed() {
                return;
            }

            error!("Output device failed: {reason}");
            bus.send(Event::Session(SessionAction::Closed {
                session_id,
                reason: CloseReason::Device(reason),
            }));
        }
    }
}
