//! Single-key commands from the terminal

use crate::{
    character::CharacterAction,
    controller::SessionAction,
    event::{Event, EventBus},
};
use std::io::Read;
use std::thread;
use tokio::sync::oneshot;

pub const HELP_TEXT: &str = "t: talk/stop, p: poke, f: feed, m: meow, q: quit";

/// Maps a key press to the event it triggers
pub fn key_to_event(key: u8) -> Option<Event> {
    match key {
        b't' => Some(Event::Session(SessionAction::Toggle)),
        b'p' => Some(Event::Character(CharacterAction::Poke)),
        b'f' => Some(Event::Character(CharacterAction::Feed)),
        b'm' => Some(Event::Character(CharacterAction::Meow)),
        _ => None,
    }
}

/// Reads stdin on a detached thread. The returned receiver fires when `q`
/// is pressed or stdin closes.
pub fn start(bus: EventBus) -> oneshot::Receiver<()> {
    spawn_reader(std::io::stdin(), bus)
}

/// Turns key presses from `reader` into bus events. The thread is never
/// joined, so a read blocked forever does not hold up runtime shutdown.
pub fn spawn_reader<R>(reader: R, bus: EventBus) -> oneshot::Receiver<()>
where
    R: Read + Send + 'static,
{
    let (quit_tx, quit_rx) = oneshot::channel();

    let spawned = thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for byte in reader.bytes() {
                let key = match byte {
                    Ok(key) => key,
                    Err(e) => {
                        error!("Failed to read stdin: {e}");
                        break;
                    }
                };

                if key == b'q' {
                    break;
                }

                if let Some(event) = key_to_event(key) {
                    bus.send(event);
                }
            }

            let _ = quit_tx.send(());
        });

    if let Err(e) = spawned {
        error!("Failed to spawn stdin reader: {e}");
    }

    quit_rx
}
