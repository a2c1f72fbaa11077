//! Connection to the live streaming agent
//!
//! A [SessionChannel] goes `Connecting -> Open -> Closed` exactly once. It is
//! Open only after the server acknowledged the setup message. Once open, a
//! reader task dispatches inbound audio and interruptions to playback and a
//! writer task drains the outbound queue onto the socket.
//!
//! Any way the connection can end remotely (close frame, transport error,
//! stream end) is reported once on the bus as [SessionAction::Closed], so the
//! controller runs the same teardown as for a user stop.

use crate::{
    capture::PacketSink,
    codec::EncodedAudioPacket,
    config::SessionConfig,
    constants::OUTBOUND_QUEUE_LEN,
    controller::{CloseReason, SessionAction},
    error::{Error, Result},
    event::{Event, EventBus},
    playback::PlaybackHandle,
    protocol::{ClientMessage, ServerMessage},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub type SessionId = u64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Outbound side of a session, handed to the capture pipeline
#[derive(Clone)]
pub struct SessionSender {
    state: watch::Receiver<SessionState>,
    outbound: mpsc::Sender<ClientMessage>,
}

impl SessionSender {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Queues a packet for the agent. Returns false if it was dropped because
    /// the session is not open or the queue is full.
    pub fn send_packet(&self, packet: EncodedAudioPacket) -> bool {
        if self.state() != SessionState::Open {
            trace!("Session not open, dropping audio frame");
            return false;
        }

        match self.outbound.try_send(ClientMessage::audio(packet)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full, dropping audio frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl PacketSink for SessionSender {
    fn send(&self, packet: EncodedAudioPacket) {
        self.send_packet(packet);
    }
}

/// Reports a remote close at most once, and never after a local close
#[derive(Clone)]
struct CloseNotifier {
    session_id: SessionId,
    state_tx: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
    bus: EventBus,
}

impl CloseNotifier {
    fn closed(&self, reason: CloseReason) {
        if self.cancel.is_cancelled() {
            return;
        }

        let changed = mark_closed(&self.state_tx);
        self.cancel.cancel();

        if changed {
            info!("Session {} closed: {:?}", self.session_id, reason);
            self.bus.send(Event::Session(SessionAction::Closed {
                session_id: self.session_id,
                reason,
            }));
        }
    }
}

fn mark_closed(state_tx: &watch::Sender<SessionState>) -> bool {
    state_tx.send_if_modified(|state| {
        if *state == SessionState::Closed {
            false
        } else {
            *state = SessionState::Closed;
            true
        }
    })
}

pub struct SessionChannel {
    id: SessionId,
    state_tx: Arc<watch::Sender<SessionState>>,
    outbound_tx: mpsc::Sender<ClientMessage>,
    outbound_rx: Option<mpsc::Receiver<ClientMessage>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionChannel {
    pub fn new(id: SessionId) -> Self {
        let (state_tx, _rx) = watch::channel(SessionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);

        Self {
            id,
            state_tx: Arc::new(state_tx),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn sender(&self) -> SessionSender {
        SessionSender {
            state: self.state_tx.subscribe(),
            outbound: self.outbound_tx.clone(),
        }
    }

    /// Connects, sends the setup message and waits for the server to accept
    /// it. Inbound audio goes to `playback` from then on.
    pub async fn open(
        &mut self,
        config: &SessionConfig,
        playback: PlaybackHandle,
        bus: &EventBus,
    ) -> Result<()> {
        let outbound_rx = match (self.state(), self.outbound_rx.take()) {
            (SessionState::Connecting, Some(rx)) => rx,
            _ => return Err(Error::Transport("Session channel already used".to_string())),
        };

        info!("Opening session {} to {}", self.id, config.endpoint);

        let limit = Duration::from_secs(config.open_timeout_secs);
        let ws = match timeout(limit, handshake(config)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                mark_closed(&self.state_tx);
                return Err(e);
            }
            Err(_) => {
                mark_closed(&self.state_tx);
                return Err(Error::Transport(format!(
                    "No setup acknowledgement within {}s",
                    config.open_timeout_secs
                )));
            }
        };

        self.state_tx.send_replace(SessionState::Open);
        info!("Session {} open", self.id);

        let notifier = CloseNotifier {
            session_id: self.id,
            state_tx: self.state_tx.clone(),
            cancel: self.cancel.clone(),
            bus: bus.clone(),
        };

        let (write, read) = ws.split();

        self.tasks.push(tokio::spawn(write_loop(
            write,
            outbound_rx,
            notifier.clone(),
        )));
        self.tasks
            .push(tokio::spawn(read_loop(read, playback, notifier)));

        Ok(())
    }

    /// Stops both tasks and marks the channel closed. Safe on a channel that
    /// never opened or is already closed.
    pub async fn close(&mut self) {
        self.cancel.cancel();

        for mut task in self.tasks.drain(..) {
            if timeout(TASK_SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        self.outbound_rx = None;

        if mark_closed(&self.state_tx) {
            debug!("Session {} closed locally", self.id);
        }
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handshake(config: &SessionConfig) -> Result<WsStream> {
    let (mut ws, _response) = connect_async(config.url()).await?;

    let setup = serde_json::to_string(&ClientMessage::setup(config))
        .map_err(|e| Error::Transport(e.to_string()))?;
    ws.send(Message::text(setup)).await?;

    while let Some(frame) = ws.next().await {
        let text = match frame? {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_owned())
                    .unwrap_or_default();
                return Err(Error::Transport(format!("Server closed during setup: {reason}")));
            }
            _ => continue,
        };

        match ServerMessage::parse(&text) {
            Ok(message) if message.is_setup_complete() => return Ok(ws),
            Ok(_) => trace!("Ignoring message before setup completed"),
            Err(e) => warn!("Unparseable message during setup: {e}"),
        }
    }

    Err(Error::Transport("Connection ended during setup".to_string()))
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<ClientMessage>,
    notifier: CloseNotifier,
) {
    loop {
        tokio::select! {
            _ = notifier.cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };

                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to serialize outbound message: {e}");
                        continue;
                    }
                };

                if let Err(e) = write.send(Message::text(text)).await {
                    notifier.closed(CloseReason::Transport(e.to_string()));
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    playback: PlaybackHandle,
    notifier: CloseNotifier,
) {
    loop {
        let frame = tokio::select! {
            _ = notifier.cancel.cancelled() => break,
            frame = read.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_server_text(text.as_str(), &playback),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_server_text(text, &playback),
                Err(_) => warn!("Ignoring non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.as_str().to_owned())
                    .unwrap_or_default();
                notifier.closed(CloseReason::Server(reason));
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                notifier.closed(CloseReason::Transport(e.to_string()));
                break;
            }
            None => {
                notifier.closed(CloseReason::Server("Connection ended".to_string()));
                break;
            }
        }
    }
}

fn handle_server_text(text: &str, playback: &PlaybackHandle) {
    let message = match ServerMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring unparseable server message: {e}");
            return;
        }
    };

    if message.is_interrupted() {
        playback.flush();
    }

    for packet in message.audio_parts() {
        playback.enqueue(packet.clone());
    }

    if let Some(content) = &message.server_content {
        if content.turn_complete {
            debug!("Agent turn complete");
        }
    }

    if let Some(go_away) = &message.go_away {
        warn!(
            "Server is going away, time left: {}",
            go_away.time_left.as_deref().unwrap_or("unknown")
        );
    }
}
