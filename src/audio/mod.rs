//! Local audio graph: context, speaking analysis and playback.

pub mod analyser;
pub mod analysis;
pub mod context;
pub mod playback;

pub use analysis::{AudioAnalysisPipeline, Sampler};
pub use context::AudioContext;
pub use playback::{AudioOutput, AudioOutputFactory, PlaybackSinks};
