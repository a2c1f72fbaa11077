//! Session lifecycle
//!
//! The controller owns at most one [ActiveSession]. `start` acquires devices
//! and opens the channel in order, undoing whatever was already acquired if a
//! later step fails. `stop` is the single teardown path, used for user stops,
//! remote closes and device failures alike. A stop that arrives while a start
//! is still connecting cancels that start.

use crate::{
    capture::CapturePipeline,
    character::CharacterBridge,
    config::Config,
    constants::STATUS_MESSAGE_TTL,
    device::{InputErrorSink, InputStream, Microphone, OutputStream, Speaker},
    error::{Error, Result},
    event::{Event, EventBus, Subscriber},
    playback::{self, PlaybackScheduler, SharedScheduler},
    session::{SessionChannel, SessionId},
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub enum SessionAction {
    /// User asked to start talking
    Start,

    /// User asked to stop talking
    Stop,

    /// Start if idle, stop otherwise
    Toggle,

    /// Channel is open and capture is running
    Opened { session_id: SessionId },

    /// Session ended without the user asking for it
    Closed {
        session_id: SessionId,
        reason: CloseReason,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Server closed the connection
    Server(String),

    /// Connection broke
    Transport(String),

    /// Output device failed
    Device(String),

    /// Microphone stream failed
    Input(String),
}

impl CloseReason {
    /// Status line message, if the user should be told about it
    fn user_message(&self) -> Option<&'static str> {
        match self {
            CloseReason::Server(_) => None,
            CloseReason::Transport(reason) => {
                Some(Error::Transport(reason.clone()).user_message())
            }
            CloseReason::Device(reason) => Some(Error::Device(reason.clone()).user_message()),
            CloseReason::Input(reason) => Some(Error::Permission(reason.clone()).user_message()),
        }
    }
}

/// What the microphone button shows
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerStatus {
    pub is_mic_on: bool,
    pub is_connecting: bool,

    /// Short-lived message after a failure
    pub error: Option<String>,
}

impl ControllerStatus {
    pub fn label(&self) -> &'static str {
        if self.is_connecting {
            "Connecting..."
        } else if self.is_mic_on {
            "Listening"
        } else {
            "Idle"
        }
    }
}

/// Everything one session holds, released together
struct ActiveSession {
    id: SessionId,
    input: Box<dyn InputStream>,
    output: Box<dyn OutputStream>,
    scheduler: SharedScheduler,
    playback_task: JoinHandle<()>,
    channel: SessionChannel,
}

impl ActiveSession {
    async fn shutdown(mut self) {
        self.input.release();
        self.scheduler.write().await.close();
        self.playback_task.abort();
        self.output.release();
        self.channel.close().await;
    }
}

pub type SharedController = Arc<RwLock<SessionController>>;

pub struct SessionController {
    bus: EventBus,
    config: Config,
    microphone: Arc<dyn Microphone>,
    speaker: Arc<dyn Speaker>,
    character: CharacterBridge,
    status_tx: Arc<watch::Sender<ControllerStatus>>,
    active: Option<ActiveSession>,
    next_id: SessionId,
}

impl SessionController {
    pub fn new(
        bus: EventBus,
        config: Config,
        microphone: Arc<dyn Microphone>,
        speaker: Arc<dyn Speaker>,
        character: CharacterBridge,
    ) -> Self {
        let (status_tx, _rx) = watch::channel(ControllerStatus::default());

        Self {
            bus,
            config,
            microphone,
            speaker,
            character,
            status_tx: Arc::new(status_tx),
            active: None,
            next_id: 1,
        }
    }

    pub fn status(&self) -> ControllerStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.active.as_ref().map(|active| active.id)
    }

    pub fn character(&self) -> &CharacterBridge {
        &self.character
    }

    /// Starts a new session. Rejected with [Error::SessionActive] while one
    /// exists. On failure nothing stays acquired and the status carries a
    /// short message.
    pub async fn start(&mut self) -> Result<()> {
        self.start_cancellable(CancellationToken::new()).await
    }

    /// Like [Self::start], but fails with [Error::Cancelled] and releases
    /// everything once `cancel` fires before the session is up
    pub async fn start_cancellable(&mut self, cancel: CancellationToken) -> Result<()> {
        if self.active.is_some() {
            warn!("Session already active, ignoring start");
            return Err(Error::SessionActive);
        }

        let session_id = self.next_id;
        self.next_id += 1;

        self.status_tx.send_replace(ControllerStatus {
            is_mic_on: false,
            is_connecting: true,
            error: None,
        });

        match self.open_session(session_id, &cancel).await {
            Ok(active) => {
                self.active = Some(active);
                self.status_tx.send_modify(|status| {
                    status.is_connecting = false;
                    status.is_mic_on = true;
                });

                info!("Session {session_id} started");
                self.bus
                    .send(Event::Session(SessionAction::Opened { session_id }));
                Ok(())
            }
            Err(e) => {
                self.character.reset();
                self.status_tx.send_modify(|status| {
                    status.is_connecting = false;
                    status.is_mic_on = false;
                });

                if let Error::Cancelled = e {
                    info!("Session {session_id} start cancelled");
                } else {
                    error!("Failed to start session: {e}");
                    self.show_error(e.user_message());
                }
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<ActiveSession> {
        let mut input = self
            .microphone
            .acquire(self.input_error_sink(session_id))
            .await?;

        let (playback, commands) = playback::channel();

        let mut output = match self.speaker.acquire(playback.output_events()).await {
            Ok(output) => output,
            Err(e) => {
                input.release();
                return Err(e);
            }
        };

        let scheduler = PlaybackScheduler::new(output.timeline(), self.character.clone()).shared();
        let playback_task =
            playback::spawn_loop(session_id, scheduler.clone(), commands, self.bus.clone());

        let mut channel = SessionChannel::new(session_id);
        let opened = tokio::select! {
            opened = channel.open(&self.config.session, playback, &self.bus) => opened,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        if let Err(e) = opened {
            playback_task.abort();
            output.release();
            input.release();
            channel.close().await;
            return Err(e);
        }

        let mut active = ActiveSession {
            id: session_id,
            input,
            output,
            scheduler,
            playback_task,
            channel,
        };

        // Capture only begins once the channel can take frames
        let started = CapturePipeline::new(
            active.input.sample_rate(),
            self.config.audio.frame_size,
            active.channel.sender(),
        )
        .map_err(Error::from)
        .and_then(|pipeline| active.input.start(pipeline.into_sink()));

        let started = started.and_then(|()| {
            if cancel.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                Ok(())
            }
        });

        match started {
            Ok(()) => Ok(active),
            Err(e) => {
                active.shutdown().await;
                Err(e)
            }
        }
    }

    /// Reports a broken microphone stream, once, as a close of `session_id`
    fn input_error_sink(&self, session_id: SessionId) -> InputErrorSink {
        let bus = self.bus.clone();
        let reported = AtomicBool::new(false);

        Arc::new(move |reason| {
            if !reported.swap(true, Ordering::SeqCst) {
                bus.send(Event::Session(SessionAction::Closed {
                    session_id,
                    reason: CloseReason::Input(reason),
                }));
            }
        })
    }

    /// Tears the current session down. Does nothing extra when called again.
    pub async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            let session_id = active.id;
            active.shutdown().await;
            info!("Session {session_id} stopped");
        }

        self.character.reset();
        self.status_tx.send_if_modified(|status| {
            let changed = status.is_mic_on || status.is_connecting;
            status.is_mic_on = false;
            status.is_connecting = false;
            changed
        });
    }

    pub async fn toggle(&mut self) -> Result<()> {
        if self.active.is_some() {
            self.stop().await;
            Ok(())
        } else {
            self.start().await
        }
    }

    /// Handles a close reported by the channel or the output device
    pub async fn session_closed(&mut self, session_id: SessionId, reason: CloseReason) {
        if self.active_session_id() != Some(session_id) {
            debug!("Ignoring close of stale session {session_id}");
            return;
        }

        warn!("Session {session_id} ended: {reason:?}");
        self.stop().await;

        if let Some(message) = reason.user_message() {
            self.show_error(message);
        }
    }

    /// Sets the status message and clears it again after a while, unless it
    /// has been replaced in the meantime
    fn show_error(&self, message: &str) {
        let message = message.to_string();
        self.status_tx
            .send_modify(|status| status.error = Some(message.clone()));

        let status_tx = self.status_tx.clone();
        tokio::spawn(async move {
            sleep(STATUS_MESSAGE_TTL).await;
            status_tx.send_if_modified(|status| {
                if status.error.as_deref() == Some(message.as_str()) {
                    status.error = None;
                    true
                } else {
                    false
                }
            });
        });
    }
}

pub fn init(controller: SessionController) -> SharedController {
    let bus = controller.bus.clone();
    let controller = Arc::new(RwLock::new(controller));

    handle_incoming_event_loop(bus, controller.clone());

    controller
}

/// Session events are handled one at a time so a stop never overlaps a start.
/// The one exception is a start still connecting: the bus is watched while it
/// runs so a Stop or Toggle can cancel it. Other events wait their turn.
fn handle_incoming_event_loop(bus: EventBus, controller: SharedController) {
    let mut bus_rx = bus.subscribe();

    tokio::spawn(async move {
        let mut deferred = VecDeque::new();

        loop {
            let action = match deferred.pop_front() {
                Some(action) => action,
                None => match bus_rx.recv().await {
                    Some(Event::Session(action)) => action,
                    Some(_) => continue,
                    None => break,
                },
            };

            handle_incoming_event(&controller, &mut bus_rx, &mut deferred, action).await;
        }
    });
}

async fn handle_incoming_event(
    controller: &SharedController,
    bus_rx: &mut Subscriber,
    deferred: &mut VecDeque<SessionAction>,
    action: SessionAction,
) {
    let mut controller = controller.write().await;

    match action {
        SessionAction::Start => start_interruptible(&mut controller, bus_rx, deferred).await,
        SessionAction::Stop => controller.stop().await,
        SessionAction::Toggle => {
            if controller.is_active() {
                controller.stop().await;
            } else {
                start_interruptible(&mut controller, bus_rx, deferred).await;
            }
        }
        SessionAction::Closed { session_id, reason } => {
            controller.session_closed(session_id, reason).await
        }
        SessionAction::Opened { .. } => {}
    }
}

async fn start_interruptible(
    controller: &mut SessionController,
    bus_rx: &mut Subscriber,
    deferred: &mut VecDeque<SessionAction>,
) {
    let cancel = CancellationToken::new();
    let start = controller.start_cancellable(cancel.clone());
    tokio::pin!(start);

    loop {
        tokio::select! {
            _ = &mut start => break,
            event = bus_rx.recv() => match event {
                Some(Event::Session(SessionAction::Stop | SessionAction::Toggle)) => {
                    if !cancel.is_cancelled() {
                        info!("Stop requested while connecting");
                        cancel.cancel();
                    }
                }
                Some(Event::Session(action)) => deferred.push_back(action),
                Some(_) => {}
                None => {
                    let _ = (&mut start).await;
                    break;
                }
            },
        }
    }
}
