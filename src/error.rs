//! Error types for talking-cat-rs

use thiserror::Error;

/// Main error type for the audio pipeline and session lifecycle
#[derive(Error, Debug)]
pub enum Error {
    /// Microphone access denied or no input device present
    #[error("Microphone unavailable: {0}")]
    Permission(String),

    /// Connection to the live endpoint failed or broke
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Output device missing or its stream failed
    #[error("Output device error: {0}")]
    Device(String),

    #[error("A session is already active")]
    SessionActive,

    /// Start was called off by a stop before the session opened
    #[error("Session start cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from converting audio payloads
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("PCM16 buffer of {len} bytes does not hold whole frames of {channels} channel(s)")]
    Format { len: usize, channels: usize },

    #[error("Resampling failed: {0}")]
    Resample(String),
}

impl Error {
    /// Short message suitable for the on-screen status line
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::Permission(_) => "Permission denied or microphone missing.",
            Error::Transport(_) => "Connection error. Try again.",
            Error::Device(_) => "Audio output unavailable.",
            Error::SessionActive => "Already talking.",
            Error::Cancelled => "Stopped.",
            Error::Codec(_) | Error::Config(_) | Error::Io(_) => "Something went wrong. Try again.",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
