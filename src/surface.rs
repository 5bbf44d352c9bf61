//! What the user sees: two video surfaces, a transcript pane, and a stream of
//! [`CallEvent`]s for whatever front end is attached.

use crate::media::LocalStream;
use crate::peer::types::RemoteTrackInfo;
use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    LocalVideo { stream_id: String, source: String },
    RemoteTrack(RemoteTrackInfo),
    SurfacesCleared,
    Transcript(String),
    ChannelReady,
    Connected,
    Disconnected,
    RoomNotice(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct TranscriptLine {
    pub at: DateTime<Local>,
    pub text: String,
}

impl fmt::Display for TranscriptLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.at.format("%H:%M:%S"), self.text)
    }
}

#[derive(Debug, Default)]
pub struct Transcript {
    lines: Vec<TranscriptLine>,
}

impl Transcript {
    pub fn push(&mut self, text: impl Into<String>) -> &TranscriptLine {
        self.lines.push(TranscriptLine {
            at: Local::now(),
            text: text.into(),
        });
        &self.lines[self.lines.len() - 1]
    }

    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    /// Line texts without timestamps
    pub fn texts(&self) -> Vec<&str> {
        self.lines.iter().map(|l| l.text.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct CallSurface {
    events: Option<mpsc::UnboundedSender<CallEvent>>,
    transcript: Transcript,
    local_video: Option<String>,
    remote_tracks: Vec<RemoteTrackInfo>,
}

impl CallSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any earlier subscriber
    pub fn subscribe_events(&mut self) -> mpsc::UnboundedReceiver<CallEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn notify(&self, event: CallEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                debug!("Call event subscriber is gone");
            }
        }
    }

    pub fn append(&mut self, text: impl Into<String>) {
        let text = self.transcript.push(text).text.clone();
        self.notify(CallEvent::Transcript(text));
    }

    pub fn show_local(&mut self, stream: &LocalStream) {
        self.local_video = Some(stream.id.clone());
        self.notify(CallEvent::LocalVideo {
            stream_id: stream.id.clone(),
            source: stream.source.clone(),
        });
    }

    pub fn show_remote(&mut self, track: RemoteTrackInfo) {
        self.remote_tracks.push(track.clone());
        self.notify(CallEvent::RemoteTrack(track));
    }

    /// Detach both video surfaces
    pub fn clear_videos(&mut self) {
        if self.local_video.is_none() && self.remote_tracks.is_empty() {
            return;
        }
        self.local_video = None;
        self.remote_tracks.clear();
        self.notify(CallEvent::SurfacesCleared);
    }

    pub fn local_video(&self) -> Option<&str> {
        self.local_video.as_deref()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrackInfo] {
        &self.remote_tracks
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, MediaKind};

    #[test]
    fn transcript_lines_are_timestamped() {
        let mut transcript = Transcript::default();
        let line = transcript.push("ME: hi").to_string();
        assert!(line.starts_with('['));
        assert!(line.ends_with("] ME: hi"));
        assert_eq!(transcript.texts(), vec!["ME: hi"]);
    }

    #[test]
    fn surface_reports_video_changes() {
        let mut surface = CallSurface::new();
        let mut events = surface.subscribe_events();
        let stream = LocalStream::new("camera", vec![LocalTrack::new(MediaKind::Video)]);

        surface.show_local(&stream);
        surface.show_remote(RemoteTrackInfo {
            id: "t1".into(),
            stream_id: "s1".into(),
            kind: MediaKind::Video,
        });
        surface.clear_videos();
        surface.clear_videos();

        assert!(matches!(events.try_recv(), Ok(CallEvent::LocalVideo { .. })));
        assert!(matches!(events.try_recv(), Ok(CallEvent::RemoteTrack(_))));
        assert_eq!(events.try_recv().unwrap(), CallEvent::SurfacesCleared);
        assert!(events.try_recv().is_err());
        assert!(surface.local_video().is_none());
    }
}
