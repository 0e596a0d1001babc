//! Decoder backend contract for castmedia
//!
//! The backend is the hardware-proximate media context the pipeline drives:
//! one audio decoder, one video decoder and a presentation clock. This
//! module defines the traits the coordinator and sub-pipelines call into,
//! the stream configurations and coded buffers they exchange, the software
//! fallback wrapper for audio, and a scriptable in-process backend.

mod buffer;
mod config;
pub mod fake;
pub mod software;

pub use buffer::{CdmHandle, DecoderBuffer, DecryptConfig};
pub use config::{AudioCodec, AudioConfig, SampleFormat, Size, StreamConfig, VideoCodec, VideoConfig};
pub use software::{AudioDecoderSoftwareWrapper, SoftwareAudioDecoder, SoftwareDecoderFactory};

use std::cell::RefCell;
use std::rc::Rc;

/// Sentinel returned by [`MediaPipelineBackend::current_pts`] while the
/// backend has no presentation timestamp yet
pub const NO_TIMESTAMP: i64 = i64::MIN;

/// Outcome of pushing a buffer into a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Buffer accepted; the caller may push the next one
    Success,

    /// Buffer accepted but the decoder is full; wait for
    /// [`DecoderEvent::PushBufferComplete`]
    Pending,

    /// Buffer rejected
    Failed,
}

/// Events a decoder reports back to its delegate
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    /// A previously pending push finished
    PushBufferComplete(BufferStatus),

    /// The end-of-stream buffer has been rendered
    EndOfStream,

    /// Unrecoverable decoder failure
    DecoderError,

    /// The decoded video resolution changed
    VideoResolutionChanged(Size),
}

/// Receiver for decoder events
///
/// Decoders may call it synchronously from inside `push_buffer`; delegates
/// installed by the pipeline only post tasks.
pub type DecoderDelegate = Rc<dyn Fn(DecoderEvent)>;

/// Cumulative decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStatistics {
    pub decoded_bytes: u64,
    pub decoded_frames: u64,
    pub dropped_frames: u64,
}

impl DecoderStatistics {
    /// Counters accumulated since `earlier`
    pub fn since(&self, earlier: &DecoderStatistics) -> DecoderStatistics {
        DecoderStatistics {
            decoded_bytes: self.decoded_bytes.saturating_sub(earlier.decoded_bytes),
            decoded_frames: self.decoded_frames.saturating_sub(earlier.decoded_frames),
            dropped_frames: self.dropped_frames.saturating_sub(earlier.dropped_frames),
        }
    }
}

/// Operations common to audio and video decoders
pub trait Decoder {
    /// Install the event receiver
    fn set_delegate(&mut self, delegate: DecoderDelegate);

    /// Push one coded buffer
    fn push_buffer(&mut self, buffer: DecoderBuffer) -> BufferStatus;

    /// Cumulative statistics since creation
    fn statistics(&self) -> DecoderStatistics;
}

/// Backend audio decoder
pub trait AudioDecoder: Decoder {
    /// Apply a stream configuration; false if unsupported
    fn set_config(&mut self, config: &AudioConfig) -> bool;

    /// Set the output volume multiplier
    fn set_volume(&mut self, multiplier: f32) -> bool;
}

/// Backend video decoder
pub trait VideoDecoder: Decoder {
    /// Apply a stream configuration; false if unsupported
    fn set_config(&mut self, config: &VideoConfig) -> bool;
}

/// Audio decoder owned by a backend
pub type SharedAudioDecoder = Rc<RefCell<dyn AudioDecoder>>;

/// Video decoder owned by a backend
pub type SharedVideoDecoder = Rc<RefCell<dyn VideoDecoder>>;

/// Hardware-proximate media backend
///
/// The backend owns its decoders. The handles it returns stay valid until
/// the backend is dropped; the pipeline only keeps weak references.
#[cfg_attr(test, mockall::automock)]
pub trait MediaPipelineBackend {
    /// Create the audio decoder, `None` on failure
    fn create_audio_decoder(&mut self) -> Option<SharedAudioDecoder>;

    /// Create the video decoder, `None` on failure
    fn create_video_decoder(&mut self) -> Option<SharedVideoDecoder>;

    /// Acquire backend resources
    fn initialize(&mut self) -> bool;

    /// Start rendering from `start_pts` (microseconds)
    fn start(&mut self, start_pts: i64) -> bool;

    /// Stop rendering and drop queued data
    fn stop(&mut self) -> bool;

    fn pause(&mut self) -> bool;

    fn resume(&mut self) -> bool;

    fn set_playback_rate(&mut self, rate: f32) -> bool;

    /// Current presentation timestamp in microseconds, or [`NO_TIMESTAMP`]
    fn current_pts(&self) -> i64;
}
