//! Playback pipeline for castmedia
//!
//! This module contains the media pipeline coordinator and its
//! collaborators:
//! - `MediaPipeline` drives the backend lifecycle, flush and clock updates
//! - `AudioPipeline` / `VideoPipeline` move coded frames into the decoders
//! - `BufferingController` pauses playback while streams are starved
//! - `FrameProvider` is the source of coded frames for one stream

mod av_pipeline;
mod audio_pipeline;
mod video_pipeline;
pub mod buffering;
pub mod frame_provider;
pub mod media_pipeline;

pub use audio_pipeline::AudioPipeline;
pub use av_pipeline::AvPipelineState;
pub use buffering::{BufferingConfig, BufferingController, BufferingLevel, BufferingState};
pub use frame_provider::{CodedFrame, FrameProvider, LifecycleLog, QueueFrameProvider, QueueFrameProviderHandle, ReadCallback};
pub use media_pipeline::MediaPipeline;
pub use video_pipeline::VideoPipeline;

use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::backend::Size;
use crate::utils::error::PipelineError;

/// How the media is being loaded; selects the buffering watermarks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadType {
    /// Progressive download of a URL
    Url,

    /// Source buffers fed by the application (MSE)
    MediaSource,

    /// Anything else; runs without a buffering controller
    Other,
}

/// Backend lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendState {
    Uninitialized,
    Initialized,
    Playing,
    Paused,
}

impl BackendState {
    /// Whether `self -> next` is an allowed lifecycle edge
    pub fn can_transition_to(self, next: BackendState) -> bool {
        use BackendState::*;
        match (self, next) {
            (_, Uninitialized) => true,
            (Uninitialized, Initialized) => true,
            (Initialized, Playing) => true,
            (Playing, Paused) | (Paused, Playing) => true,
            (Playing, Initialized) | (Paused, Initialized) => true,
            _ => false,
        }
    }

    /// Whether the backend has been started and not flushed or stopped
    pub fn is_started(self) -> bool {
        matches!(self, BackendState::Playing | BackendState::Paused)
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendState::Uninitialized => "uninitialized",
            BackendState::Initialized => "initialized",
            BackendState::Playing => "playing",
            BackendState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Coarse buffering status reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferingStatus {
    HaveNothing,
    HaveEnough,
}

/// Stream a sub-pipeline carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    /// Name the stream is registered under in the buffering controller
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
        }
    }
}

/// Coordinator-level client callbacks
pub struct MediaPipelineClient {
    /// Fatal pipeline error
    pub error_cb: Box<dyn Fn(PipelineError)>,

    /// Buffering edge; only `HaveEnough` unless configured otherwise
    pub buffering_state_cb: Box<dyn Fn(BufferingStatus)>,

    /// (media time, max rendering time, wall clock sample)
    pub time_update_cb: Box<dyn Fn(Duration, Duration, tokio::time::Instant)>,

    /// Fired synchronously from `MediaPipeline::initialize`
    pub pipeline_backend_created_cb: Box<dyn Fn()>,

    /// Fired once the backend has been destroyed
    pub pipeline_backend_destroyed_cb: Box<dyn Fn()>,
}

impl Default for MediaPipelineClient {
    fn default() -> Self {
        Self {
            error_cb: Box::new(|_| {}),
            buffering_state_cb: Box::new(|_| {}),
            time_update_cb: Box::new(|_, _, _| {}),
            pipeline_backend_created_cb: Box::new(|| {}),
            pipeline_backend_destroyed_cb: Box::new(|| {}),
        }
    }
}

/// Per-stream client callbacks
pub struct AvPipelineClient {
    /// The end-of-stream buffer has been rendered
    pub eos_cb: Box<dyn Fn()>,

    /// An encrypted frame is waiting for a decryption context
    pub wait_for_key_cb: Box<dyn Fn()>,

    /// Statistics accumulated since the previous report
    pub statistics_cb: Box<dyn Fn(PipelineStatistics)>,
}

impl Default for AvPipelineClient {
    fn default() -> Self {
        Self {
            eos_cb: Box::new(|| {}),
            wait_for_key_cb: Box::new(|| {}),
            statistics_cb: Box::new(|_| {}),
        }
    }
}

/// Video client callbacks
#[derive(Default)]
pub struct VideoPipelineClient {
    pub av_pipeline_client: AvPipelineClient,

    /// Decoded frame size changed
    pub natural_size_changed_cb: Option<Box<dyn Fn(Size)>>,
}

/// Decoding statistics delta
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatistics {
    pub audio_bytes_decoded: u64,
    pub video_bytes_decoded: u64,
    pub video_frames_decoded: u64,
    pub video_frames_dropped: u64,
}

impl PipelineStatistics {
    /// Accumulate another delta
    pub fn merge(&mut self, other: &PipelineStatistics) {
        self.audio_bytes_decoded += other.audio_bytes_decoded;
        self.video_bytes_decoded += other.video_bytes_decoded;
        self.video_frames_decoded += other.video_frames_decoded;
        self.video_frames_dropped += other.video_frames_dropped;
    }
}
