//! Conversions between base64 text, little-endian PCM16 bytes and float
//! samples.

use crate::{
    constants::PCM_MIME_PREFIX,
    error::CodecError,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

const PCM16_SCALE: f32 = 32768.0;

/// A chunk of PCM16 audio as carried on the wire
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedAudioPacket {
    /// Base64 of the raw little-endian PCM16 bytes
    #[serde(rename = "data")]
    pub payload: String,

    pub mime_type: String,
}

impl EncodedAudioPacket {
    /// Encodes mono float samples as a PCM16 packet tagged with `sample_rate`
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        EncodedAudioPacket {
            payload: encode_base64(&float_to_pcm16(samples)),
            mime_type: pcm_mime_type(sample_rate),
        }
    }

    /// Decodes the payload into planar float samples
    pub fn decode(&self, channels: usize) -> Result<Vec<Vec<f32>>, CodecError> {
        let bytes = decode_base64(&self.payload)?;
        pcm16_to_float(&bytes, channels)
    }

    pub fn is_pcm(&self) -> bool {
        self.mime_type.starts_with(PCM_MIME_PREFIX)
    }
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{PCM_MIME_PREFIX};rate={sample_rate}")
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(B64.decode(text)?)
}

pub fn encode_base64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// De-interleaves PCM16 bytes into one float vector per channel, each sample
/// scaled by 1/32768.
pub fn pcm16_to_float(bytes: &[u8], channels: usize) -> Result<Vec<Vec<f32>>, CodecError> {
    if channels == 0 || bytes.len() % (2 * channels) != 0 {
        return Err(CodecError::Format {
            len: bytes.len(),
            channels,
        });
    }

    let mut interleaved = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut interleaved);

    let frame_count = interleaved.len() / channels;
    let mut planar = vec![Vec::with_capacity(frame_count); channels];

    for frame in interleaved.chunks_exact(channels) {
        for (channel, &sample) in planar.iter_mut().zip(frame) {
            channel.push(sample as f32 / PCM16_SCALE);
        }
    }

    Ok(planar)
}

/// Converts float samples to PCM16 bytes. Out-of-range input saturates at the
/// i16 limits instead of wrapping.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let pcm: Vec<i16> = samples
        .iter()
        .map(|&s| (s * PCM16_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect();

    let mut bytes = vec![0u8; pcm.len() * 2];
    LittleEndian::write_i16_into(&pcm, &mut bytes);
    bytes
}
