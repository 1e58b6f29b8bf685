//! Host-provided media seams: microphone capture and inbound audio decoding.

use std::sync::Arc;

use async_trait::async_trait;

use super::track::MediaStream;
use crate::error::VoiceError;

/// Source of local capture streams
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request microphone access. Fails on denied permission or no device.
    async fn acquire_microphone(&self) -> Result<MediaStream, VoiceError>;
}

/// Decodes one RTP payload of the negotiated codec into interleaved PCM
pub trait AudioDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<f32>, VoiceError>;
}

/// Creates a decoder for each inbound track: `(sample_rate, channels)`
pub type DecoderFactory = Arc<dyn Fn(u32, u16) -> Result<Box<dyn AudioDecoder>, VoiceError> + Send + Sync>;
