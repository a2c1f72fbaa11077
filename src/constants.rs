use std::time::Duration;

// Audio parameters of the live endpoint
pub const CAPTURE_SAMPLE_RATE: u32 = 16000; // 16 kHz microphone stream
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000; // 24 kHz agent speech
pub const CHANNELS: usize = 1; // Mono in both directions
pub const CAPTURE_FRAME_SIZE: usize = 4096; // Samples per outbound frame

pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";
pub const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Outbound frames waiting for the socket writer. Frames beyond this are dropped.
pub const OUTBOUND_QUEUE_LEN: usize = 32;

/// Input chunk size used by the resamplers.
pub const RESAMPLE_CHUNK_SIZE: usize = 1024;

/// Rate at which the front end samples the character state.
pub const ANIMATION_TICK: Duration = Duration::from_millis(33);

/// How long an error stays visible in the controller status.
pub const STATUS_MESSAGE_TTL: Duration = Duration::from_secs(5);

// Cosmetic reactions, each returns to idle after its last step
pub const POKE_SURPRISE: Duration = Duration::from_millis(1000);
pub const FEED_EATING: Duration = Duration::from_millis(1500);
pub const FEED_HAPPY: Duration = Duration::from_millis(1500);
pub const MEOW_TALKING: Duration = Duration::from_millis(2000);
