//! Audio tracks and streams shared between capture, peers and analysis.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

/// One block of audio travelling through a track
#[derive(Clone, Debug)]
pub struct AudioFrame {
    /// Interleaved PCM samples (-1.0 .. 1.0)
    pub pcm: Arc<[f32]>,
    /// Codec payload for the same audio, when the producer already encoded it
    pub encoded: Option<Bytes>,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration: Duration,
}

impl AudioFrame {
    /// Frame carrying PCM only; duration derived from the sample count
    pub fn pcm(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        let per_channel = samples.len() / channels.max(1) as usize;
        let duration = Duration::from_secs_f64(per_channel as f64 / sample_rate.max(1) as f64);
        Self {
            pcm: samples.into(),
            encoded: None,
            sample_rate,
            channels,
            duration,
        }
    }

    pub fn with_encoded(mut self, payload: Bytes) -> Self {
        self.encoded = Some(payload);
        self
    }

    /// Same shape, all samples zero, no payload
    pub fn silenced(&self) -> Self {
        Self {
            pcm: vec![0.0f32; self.pcm.len()].into(),
            encoded: None,
            sample_rate: self.sample_rate,
            channels: self.channels,
            duration: self.duration,
        }
    }

    /// Samples of the first channel
    pub fn mono(&self) -> impl Iterator<Item = f32> + '_ {
        self.pcm.iter().step_by(self.channels.max(1) as usize).copied()
    }
}

/// Consumer of frames published on a track
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &AudioFrame);
}

/// Handle returned by [`MediaTrack::connect`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// A single audio track.
///
/// Disabling a track keeps it live but replaces its audio with silence;
/// stopping it is final and disconnects every sink.
pub struct MediaTrack {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    next_sink: AtomicU64,
    sinks: Mutex<Vec<(SinkId, Arc<dyn FrameSink>)>>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            next_sink: AtomicU64::new(1),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Attach a consumer. Frames published after this call reach it.
    pub fn connect(&self, sink: Arc<dyn FrameSink>) -> SinkId {
        let id = SinkId(self.next_sink.fetch_add(1, Ordering::Relaxed));
        if !self.is_stopped() {
            self.sinks.lock().push((id, sink));
        }
        id
    }

    pub fn disconnect(&self, id: SinkId) {
        self.sinks.lock().retain(|(sink_id, _)| *sink_id != id);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Deliver a frame to every connected sink
    pub fn publish(&self, frame: &AudioFrame) {
        if self.is_stopped() {
            return;
        }

        // Snapshot so sinks may connect/disconnect from inside on_frame
        let sinks: Vec<Arc<dyn FrameSink>> = self.sinks.lock().iter().map(|(_, s)| s.clone()).collect();

        if self.is_enabled() {
            for sink in &sinks {
                sink.on_frame(frame);
            }
        } else {
            let silent = frame.silenced();
            for sink in &sinks {
                sink.on_frame(&silent);
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Stop the track. Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.sinks.lock().clear();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A group of tracks from one source (microphone or remote peer)
#[derive(Clone, Debug)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { id: id.into(), tracks }
    }

    /// Stream with a single fresh audio track and random ids
    pub fn single_track() -> Self {
        let track = Arc::new(MediaTrack::new(Uuid::new_v4().to_string()));
        Self::new(Uuid::new_v4().to_string(), vec![track])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    /// Stop every track; returns how many were still live
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| !t.is_stopped()).count()
    }
}
