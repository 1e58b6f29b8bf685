//! Media primitives.

pub mod devices;
pub mod track;

pub use devices::{AudioDecoder, DecoderFactory, MediaDevices};
pub use track::{AudioFrame, FrameSink, MediaStream, MediaTrack, SinkId};
