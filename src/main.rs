use anyhow::Result;
use std::sync::Arc;
use talking_cat_rs::{
    character::{self, CharacterBridge},
    config,
    constants::ANIMATION_TICK,
    controller::{self, SessionAction, SessionController},
    device::host::{CpalMicrophone, CpalSpeaker},
    event::{self, Event, EventBus},
    stdin,
};
use tokio::time::interval;

#[macro_use]
extern crate log;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = config::load().await?;

    let bus = EventBus::new();
    event::debug(&bus);

    let character = CharacterBridge::new();
    character::init(&bus, character.clone());

    let microphone = Arc::new(CpalMicrophone::new(config.audio.input_device.clone()));
    let speaker = Arc::new(CpalSpeaker::new(config.audio.output_device.clone()));
    let controller = controller::init(SessionController::new(
        bus.clone(),
        config,
        microphone,
        speaker,
        character.clone(),
    ));

    let mut status = controller.read().await.subscribe_status();
    let mut quit = stdin::start(bus.clone());

    info!("{}", stdin::HELP_TEXT);

    // Stand-in for the renderer: sample the character once per frame
    let mut tick = interval(ANIMATION_TICK);
    let mut shown = character.current();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let state = character.current();
                if state != shown {
                    info!("Character: {:?}", state);
                    shown = state;
                }
            }
            Ok(()) = status.changed() => {
                let status = status.borrow_and_update().clone();
                match &status.error {
                    Some(error) => info!("[{}] {}", status.label(), error),
                    None => info!("[{}]", status.label()),
                }
            }
            _ = &mut quit => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Cancels a start that is still connecting, then tears down
    bus.send(Event::Session(SessionAction::Stop));
    controller.write().await.stop().await;

    Ok(())
}
