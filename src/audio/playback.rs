//! Playback sinks: one audible output element per remote participant.
//!
//! Playback connects to the inbound tracks separately from analysis, so
//! either can fail or be released without affecting the other.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::VoiceError;
use crate::media::{AudioFrame, FrameSink, MediaStream, MediaTrack, SinkId};

/// A native audio output element supplied by the host
pub trait AudioOutput: Send + Sync {
    fn render(&self, frame: &AudioFrame);

    fn set_muted(&self, muted: bool);

    /// Stop output; the element will not be used again
    fn pause(&self);
}

/// Creates output elements on demand
pub trait AudioOutputFactory: Send + Sync {
    fn create(&self, remote_id: &str) -> Result<Arc<dyn AudioOutput>, VoiceError>;
}

struct OutputSink {
    output: Arc<dyn AudioOutput>,
}

impl FrameSink for OutputSink {
    fn on_frame(&self, frame: &AudioFrame) {
        self.output.render(frame);
    }
}

struct PlaybackElement {
    output: Arc<dyn AudioOutput>,
    stream_id: String,
    connections: Vec<(Arc<MediaTrack>, SinkId)>,
    /// Muted for this participant only, on top of the global flag
    locally_muted: bool,
}

impl PlaybackElement {
    fn connect(&mut self, stream: &MediaStream) {
        let sink: Arc<dyn FrameSink> = Arc::new(OutputSink { output: self.output.clone() });
        self.stream_id = stream.id().to_string();
        self.connections = stream
            .tracks()
            .iter()
            .map(|track| (track.clone(), track.connect(sink.clone())))
            .collect();
    }

    fn disconnect(&mut self) {
        for (track, sink) in self.connections.drain(..) {
            track.disconnect(sink);
        }
    }
}

pub struct PlaybackSinks {
    factory: Arc<dyn AudioOutputFactory>,
    elements: HashMap<String, PlaybackElement>,
    muted: bool,
}

impl PlaybackSinks {
    pub fn new(factory: Arc<dyn AudioOutputFactory>) -> Self {
        Self {
            factory,
            elements: HashMap::new(),
            muted: false,
        }
    }

    /// Route `stream` to the element for `remote_id`, creating it on first use.
    /// A different stream re-binds the existing element.
    pub fn bind(&mut self, remote_id: &str, stream: &MediaStream) -> Result<(), VoiceError> {
        if let Some(element) = self.elements.get_mut(remote_id) {
            if element.stream_id == stream.id() {
                return Ok(());
            }
            log::debug!("[Playback] Re-binding {} to stream {}", remote_id, stream.id());
            element.disconnect();
            element.connect(stream);
            return Ok(());
        }

        let output = self.factory.create(remote_id)?;
        output.set_muted(self.muted);

        let mut element = PlaybackElement {
            output,
            stream_id: String::new(),
            connections: Vec::new(),
            locally_muted: false,
        };
        element.connect(stream);
        self.elements.insert(remote_id.to_string(), element);
        Ok(())
    }

    /// Mute or unmute every element, now and for elements created later
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        for element in self.elements.values() {
            element.output.set_muted(muted || element.locally_muted);
        }
    }

    /// Mute one participant without touching the others.
    /// Returns false if no element exists for `remote_id`.
    pub fn set_locally_muted(&mut self, remote_id: &str, muted: bool) -> bool {
        match self.elements.get_mut(remote_id) {
            Some(element) => {
                element.locally_muted = muted;
                element.output.set_muted(self.muted || muted);
                true
            }
            None => false,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Pause and detach one element
    pub fn release(&mut self, remote_id: &str) -> bool {
        match self.elements.remove(remote_id) {
            Some(mut element) => {
                element.output.pause();
                element.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&mut self) {
        for (_, mut element) in self.elements.drain() {
            element.output.pause();
            element.disconnect();
        }
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.elements.contains_key(remote_id)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeOutputs;

    fn frame() -> AudioFrame {
        AudioFrame::pcm(vec![0.25; 480], 48000, 1)
    }

    #[test]
    fn test_bind_creates_once_and_plays() {
        let outputs = Arc::new(FakeOutputs::default());
        let mut sinks = PlaybackSinks::new(outputs.clone());
        let stream = MediaStream::single_track();

        sinks.bind("b", &stream).unwrap();
        sinks.bind("b", &stream).unwrap();
        assert_eq!(outputs.created(), 1);

        stream.tracks()[0].publish(&frame());
        assert_eq!(outputs.get("b").unwrap().frames(), 1);
    }

    #[test]
    fn test_rebind_in_place() {
        let outputs = Arc::new(FakeOutputs::default());
        let mut sinks = PlaybackSinks::new(outputs.clone());
        let first = MediaStream::single_track();
        let second = MediaStream::single_track();

        sinks.bind("b", &first).unwrap();
        sinks.bind("b", &second).unwrap();
        assert_eq!(outputs.created(), 1);
        assert_eq!(first.tracks()[0].sink_count(), 0);
        assert_eq!(second.tracks()[0].sink_count(), 1);
    }

    #[test]
    fn test_mute_applies_to_existing_and_future() {
        let outputs = Arc::new(FakeOutputs::default());
        let mut sinks = PlaybackSinks::new(outputs.clone());

        sinks.bind("b", &MediaStream::single_track()).unwrap();
        sinks.set_muted(true);
        sinks.bind("c", &MediaStream::single_track()).unwrap();

        assert!(outputs.get("b").unwrap().is_muted());
        assert!(outputs.get("c").unwrap().is_muted());
    }

    #[test]
    fn test_local_mute_survives_global_unmute() {
        let outputs = Arc::new(FakeOutputs::default());
        let mut sinks = PlaybackSinks::new(outputs.clone());
        sinks.bind("b", &MediaStream::single_track()).unwrap();
        sinks.bind("c", &MediaStream::single_track()).unwrap();

        assert!(sinks.set_locally_muted("b", true));
        sinks.set_muted(true);
        sinks.set_muted(false);

        assert!(outputs.get("b").unwrap().is_muted());
        assert!(!outputs.get("c").unwrap().is_muted());
        assert!(!sinks.set_locally_muted("zzz", true));
    }

    #[test]
    fn test_release_pauses_and_detaches() {
        let outputs = Arc::new(FakeOutputs::default());
        let mut sinks = PlaybackSinks::new(outputs.clone());
        let stream = MediaStream::single_track();
        sinks.bind("b", &stream).unwrap();

        assert!(sinks.release("b"));
        assert!(outputs.get("b").unwrap().is_paused());
        assert_eq!(stream.tracks()[0].sink_count(), 0);
        assert!(!sinks.release("b"));
    }

    #[test]
    fn test_factory_failure_propagates() {
        let outputs = Arc::new(FakeOutputs::failing());
        let mut sinks = PlaybackSinks::new(outputs);
        assert!(sinks.bind("b", &MediaStream::single_track()).is_err());
        assert!(sinks.is_empty());
    }
}
