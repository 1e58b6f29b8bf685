//! Per-participant speaking analysis.
//!
//! Each tap connects an analyser to every track of a stream as an extra sink.
//! The tap only reads audio; it never feeds an output, so analysing a remote
//! stream cannot cause echo or double playback.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::analyser::AnalyserNode;
use super::context::AudioContext;
use crate::config::AnalyserConfig;
use crate::error::VoiceError;
use crate::media::{AudioFrame, FrameSink, MediaStream, MediaTrack, SinkId};

/// Pull handle for one tap's current amplitude
#[derive(Clone)]
pub struct Sampler {
    analyser: Arc<Mutex<AnalyserNode>>,
}

impl Sampler {
    /// Average frequency-bin magnitude (0.0 - 255.0)
    pub fn sample(&self) -> f32 {
        self.analyser.lock().average_magnitude()
    }
}

struct TapSink {
    analyser: Arc<Mutex<AnalyserNode>>,
    context: AudioContext,
}

impl FrameSink for TapSink {
    fn on_frame(&self, frame: &AudioFrame) {
        if !self.context.is_open() {
            return;
        }
        let mono: Vec<f32> = frame.mono().collect();
        self.analyser.lock().write_samples(&mono);
    }
}

struct AnalysisTap {
    stream_id: String,
    context: AudioContext,
    sampler: Sampler,
    connections: Vec<(Arc<MediaTrack>, SinkId)>,
}

impl AnalysisTap {
    fn is_live(&self, context: &AudioContext) -> bool {
        self.context.is_open() && self.context.id() == context.id()
    }

    fn disconnect(&self) {
        for (track, sink) in &self.connections {
            track.disconnect(*sink);
        }
    }
}

/// Analysis taps keyed by participant (`"local"` for self, session id for peers)
pub struct AudioAnalysisPipeline {
    config: AnalyserConfig,
    taps: HashMap<String, AnalysisTap>,
}

impl AudioAnalysisPipeline {
    pub fn new(config: AnalyserConfig) -> Self {
        Self {
            config,
            taps: HashMap::new(),
        }
    }

    /// Tap `stream` under `id`.
    ///
    /// Re-attaching an id whose tap is live on the same open context keeps the
    /// existing tap and returns its sampler.
    pub fn attach(&mut self, id: &str, stream: &MediaStream, context: &AudioContext) -> Result<Sampler, VoiceError> {
        if !context.is_open() {
            return Err(VoiceError::AudioContextClosed);
        }

        if let Some(tap) = self.taps.get(id) {
            if tap.is_live(context) {
                log::debug!("[Analysis] {} already tapped (stream {})", id, tap.stream_id);
                return Ok(tap.sampler.clone());
            }
        }
        self.release(id);

        let analyser = Arc::new(Mutex::new(AnalyserNode::new(self.config.clone())));
        let sink: Arc<dyn FrameSink> = Arc::new(TapSink {
            analyser: analyser.clone(),
            context: context.clone(),
        });

        let connections = stream
            .tracks()
            .iter()
            .map(|track| (track.clone(), track.connect(sink.clone())))
            .collect();

        let sampler = Sampler { analyser };
        self.taps.insert(
            id.to_string(),
            AnalysisTap {
                stream_id: stream.id().to_string(),
                context: context.clone(),
                sampler: sampler.clone(),
                connections,
            },
        );

        Ok(sampler)
    }

    /// Disconnect and forget one tap
    pub fn release(&mut self, id: &str) -> bool {
        match self.taps.remove(id) {
            Some(tap) => {
                tap.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&mut self) {
        for (_, tap) in self.taps.drain() {
            tap.disconnect();
        }
    }

    /// Current amplitude for `id`, if tapped
    pub fn sample(&self, id: &str) -> Option<f32> {
        self.taps.get(id).map(|tap| tap.sampler.sample())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.taps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }
}
