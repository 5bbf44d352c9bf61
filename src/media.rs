//! Local media acquisition.
//!
//! Capture devices are external; each one is a [`MediaSource`] and the
//! [`MediaAcquirer`] tries them in order (camera first, then screen-share).
//! The first stream produced wins and every failure is folded into one
//! [`Error::MediaAcquisition`].

use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::utils::random_id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            id: random_id(),
            kind,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Stopped local {:?} track {}", self.kind, self.id);
        }
    }

    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

/// Stream produced by one capture source
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    /// Name of the source that produced it
    pub source: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(source: &str, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: random_id(),
            source: source.to_string(),
            tracks,
        }
    }

    /// Stop every track; repeated calls are no-ops
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(LocalTrack::is_live)
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    fn name(&self) -> &str;

    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream>;
}

/// Stand-in for a capture device whose availability is known up front
pub struct SimulatedDevice {
    name: String,
    available: bool,
}

impl SimulatedDevice {
    pub fn new(name: &str, available: bool) -> Self {
        Self {
            name: name.to_string(),
            available,
        }
    }
}

#[async_trait]
impl MediaSource for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream> {
        if !self.available {
            return Err(Error::MediaAcquisition(format!(
                "{}: device not available",
                self.name
            )));
        }

        let mut tracks = Vec::new();
        if constraints.video {
            tracks.push(LocalTrack::new(MediaKind::Video));
        }
        if constraints.audio {
            tracks.push(LocalTrack::new(MediaKind::Audio));
        }
        if tracks.is_empty() {
            return Err(Error::MediaAcquisition(format!(
                "{}: constraints request neither audio nor video",
                self.name
            )));
        }

        Ok(LocalStream::new(&self.name, tracks))
    }
}

pub struct MediaAcquirer {
    constraints: MediaConstraints,
    sources: Vec<Box<dyn MediaSource>>,
}

impl MediaAcquirer {
    pub fn new(constraints: MediaConstraints) -> Self {
        Self {
            constraints,
            sources: Vec::new(),
        }
    }

    /// Camera, then screen-share, as configured
    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(config.constraints)
            .with_source(SimulatedDevice::new("camera", config.camera))
            .with_source(SimulatedDevice::new("screen", config.screen))
    }

    pub fn with_source(mut self, source: impl MediaSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub async fn acquire(&self) -> Result<LocalStream> {
        info!("Getting user media with constraints {:?}", self.constraints);

        let mut failures = Vec::new();
        for source in &self.sources {
            match source.acquire(&self.constraints).await {
                Ok(stream) => {
                    info!(
                        "Acquired local stream {} from {} ({} tracks)",
                        stream.id,
                        source.name(),
                        stream.tracks.len()
                    );
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("Media source {} failed: {}", source.name(), e);
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            failures.push("no media sources configured".to_string());
        }
        Err(Error::MediaAcquisition(failures.join("; ")))
    }
}
