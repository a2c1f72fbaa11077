//! Character state shared with the rendering layer
//!
//! Audio playback and user reactions both feed requests into one
//! [CharacterBridge], which resolves them into a single [CharacterState]:
//!
//! - While agent audio is sounding the character is `Talking` and reactions
//!   are ignored.
//! - Audio starting cancels a running reaction.
//! - Audio stopping, interruption and session reset always return to `Idle`.
//! - A new reaction replaces the remaining steps of an older one.

use crate::{
    constants::{FEED_EATING, FEED_HAPPY, MEOW_TALKING, POKE_SURPRISE},
    event::{Event, EventBus},
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CharacterState {
    #[default]
    Idle,
    Talking,
    Happy,
    Surprised,
    Eating,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CharacterAction {
    Poke,
    Feed,
    Meow,
}

type Reaction = &'static [(CharacterState, Duration)];

const POKE: Reaction = &[(CharacterState::Surprised, POKE_SURPRISE)];
const FEED: Reaction = &[
    (CharacterState::Eating, FEED_EATING),
    (CharacterState::Happy, FEED_HAPPY),
];
const MEOW: Reaction = &[(CharacterState::Talking, MEOW_TALKING)];

#[derive(Default)]
struct Inner {
    speaking: bool,
    reaction: Option<CharacterState>,

    /// Bumped whenever a reaction starts or is cancelled, so stale timers can
    /// tell they have been superseded
    generation: u64,
}

impl Inner {
    fn resolve(&self) -> CharacterState {
        if self.speaking {
            CharacterState::Talking
        } else {
            self.reaction.unwrap_or_default()
        }
    }

    fn cancel_reaction(&mut self) {
        self.reaction = None;
        self.generation += 1;
    }
}

#[derive(Clone)]
pub struct CharacterBridge {
    inner: Arc<Mutex<Inner>>,
    state_tx: Arc<watch::Sender<CharacterState>>,
}

impl Default for CharacterBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl CharacterBridge {
    pub fn new() -> Self {
        let (state_tx, _rx) = watch::channel(CharacterState::Idle);

        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            state_tx: Arc::new(state_tx),
        }
    }

    /// The value the renderer should show right now
    pub fn current(&self) -> CharacterState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CharacterState> {
        self.state_tx.subscribe()
    }

    /// First unit of an utterance started sounding
    pub fn audio_started(&self) {
        let mut inner = self.lock();
        inner.speaking = true;
        inner.cancel_reaction();
        self.publish(&inner);
    }

    /// Last sounding unit ended or playback was flushed
    pub fn audio_stopped(&self) {
        let mut inner = self.lock();
        inner.speaking = false;
        inner.cancel_reaction();
        self.publish(&inner);
    }

    /// Back to idle on session teardown
    pub fn reset(&self) {
        self.audio_stopped();
    }

    pub fn poke(&self) {
        self.react(POKE);
    }

    pub fn feed(&self) {
        self.react(FEED);
    }

    pub fn meow(&self) {
        self.react(MEOW);
    }

    fn react(&self, steps: Reaction) {
        let Some((first, _)) = steps.first() else {
            return;
        };

        let generation = {
            let mut inner = self.lock();

            if inner.speaking {
                debug!("Ignoring reaction while speaking");
                return;
            }

            inner.generation += 1;
            inner.reaction = Some(*first);
            self.publish(&inner);
            inner.generation
        };

        let bridge = self.clone();
        tokio::spawn(async move {
            for (i, (_, hold)) in steps.iter().enumerate() {
                sleep(*hold).await;

                let next = steps.get(i + 1).map(|(state, _)| *state);
                if !bridge.advance_reaction(generation, next) {
                    return;
                }
            }
        });
    }

    /// Moves a running reaction to its next step. Returns false if the
    /// reaction has been superseded.
    fn advance_reaction(&self, generation: u64, next: Option<CharacterState>) -> bool {
        let mut inner = self.lock();

        if inner.generation != generation {
            return false;
        }

        inner.reaction = next;
        self.publish(&inner);
        true
    }

    fn publish(&self, inner: &Inner) {
        let state = inner.resolve();

        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            debug!("Character state: {:?}", state);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn init(bus: &EventBus, character: CharacterBridge) {
    handle_incoming_event_loop(bus.clone(), character);
}

fn handle_incoming_event_loop(bus: EventBus, character: CharacterBridge) {
    let mut bus_rx = bus.subscribe();

    tokio::spawn(async move {
        while let Some(event) = bus_rx.recv().await {
            if let Event::Character(action) = event {
                handle_incoming_event(&character, action);
            }
        }
    });
}

fn handle_incoming_event(character: &CharacterBridge, action: CharacterAction) {
    match action {
        CharacterAction::Poke => character.poke(),
        CharacterAction::Feed => character.feed(),
        CharacterAction::Meow => character.meow(),
    }
}
