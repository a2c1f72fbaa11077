use crate::{
    constants::CAPTURE_FRAME_SIZE,
    error::{Error, Result},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs::read_to_string;

pub const CONFIG_FILE: &str = "Config.toml";

const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
const DEFAULT_VOICE: &str = "Puck";
const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Tom, a playful and cheeky cartoon cat. \
Keep your answers short, funny and friendly, and sprinkle in the occasional meow.";
const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 10;

/// Settings passed through to the live endpoint when a session opens
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Websocket URL of the bidirectional streaming endpoint
    pub endpoint: String,

    /// API key appended to the endpoint URL. Overridden by `GEMINI_API_KEY`
    /// or `API_KEY` from the environment.
    pub api_key: Option<String>,

    pub model: String,
    pub voice: String,
    pub system_instruction: String,

    /// Time allowed for the connect + setup handshake
    pub open_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            open_timeout_secs: DEFAULT_OPEN_TIMEOUT_SECS,
        }
    }
}

impl SessionConfig {
    /// Endpoint URL with the API key query parameter, if a key is configured
    pub fn url(&self) -> String {
        match &self.api_key {
            Some(key) if !key.is_empty() => {
                let separator = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{separator}key={key}", self.endpoint)
            }
            _ => self.endpoint.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Substring of the input device name, default device when unset
    pub input_device: Option<String>,

    /// Substring of the output device name, default device when unset
    pub output_device: Option<String>,

    /// Samples per outbound capture frame
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            input_device: None,
            output_device: None,
            frame_size: CAPTURE_FRAME_SIZE,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub audio: AudioConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.audio.frame_size == 0 {
            return Err(Error::Config("audio.frame_size must be positive".to_string()));
        }
        if self.session.model.trim().is_empty() {
            return Err(Error::Config("session.model must not be empty".to_string()));
        }
        if self.session.voice.trim().is_empty() {
            return Err(Error::Config("session.voice must not be empty".to_string()));
        }
        Ok(())
    }

    /// Applies environment overrides on top of the file contents
    fn apply_env(&mut self) {
        let key = std::env::var("GEMINI_API_KEY").or_else(|_| std::env::var("API_KEY"));
        if let Ok(key) = key {
            self.session.api_key = Some(key);
        }
    }
}

pub fn parse(text: &str) -> Result<Config> {
    let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

pub async fn load_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();

    let mut config = match read_to_string(path).await {
        Ok(text) => parse(&text)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No config file at {}, using defaults", path.display());
            Config::default()
        }
        Err(e) => return Err(e.into()),
    };

    config.apply_env();
    Ok(config)
}

pub async fn load() -> Result<Config> {
    load_from(CONFIG_FILE).await
}
