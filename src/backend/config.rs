//! Stream configurations presented to backend decoders

use serde::{Deserialize, Serialize};

/// Audio codecs the pipeline can describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Unknown,
    Aac,
    Mp3,
    Opus,
    Vorbis,
    Flac,
    Ac3,
    Eac3,
    Pcm,
}

/// Sample layout of decoded or PCM audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    Unknown,
    S16,
    S32,
    F32,
    PlanarF32,
}

impl SampleFormat {
    /// Bytes per sample per channel
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Unknown => 0,
            SampleFormat::S16 => 2,
            SampleFormat::S32 | SampleFormat::F32 | SampleFormat::PlanarF32 => 4,
        }
    }
}

/// Audio stream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Codec of the coded frames
    pub codec: AudioCodec,

    /// Sample format
    pub sample_format: SampleFormat,

    /// Number of channels
    pub channels: u16,

    /// Sample rate in Hz
    pub samples_per_second: u32,

    /// Codec-specific extra data
    pub extra_data: Vec<u8>,

    /// Whether frames of this stream carry decryption metadata
    pub encrypted: bool,
}

impl AudioConfig {
    /// Clear (unencrypted) configuration with no extra data
    pub fn new(codec: AudioCodec, sample_format: SampleFormat, channels: u16, samples_per_second: u32) -> Self {
        Self {
            codec,
            sample_format,
            channels,
            samples_per_second,
            extra_data: Vec::new(),
            encrypted: false,
        }
    }

    /// Whether the configuration describes a decodable stream
    pub fn is_valid(&self) -> bool {
        self.codec != AudioCodec::Unknown
            && self.sample_format != SampleFormat::Unknown
            && self.channels > 0
            && self.samples_per_second > 0
    }
}

/// Video codecs the pipeline can describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    Unknown,
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Video stream configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    /// Codec of the coded frames
    pub codec: VideoCodec,

    /// Coded frame size
    pub coded_size: Size,

    /// Codec-specific extra data
    pub extra_data: Vec<u8>,

    /// Whether frames of this stream carry decryption metadata
    pub encrypted: bool,

    /// Second view of a multi-view stream, if any
    pub additional_config: Option<Box<VideoConfig>>,
}

impl VideoConfig {
    /// Clear (unencrypted) single-view configuration
    pub fn new(codec: VideoCodec, coded_size: Size) -> Self {
        Self {
            codec,
            coded_size,
            extra_data: Vec::new(),
            encrypted: false,
            additional_config: None,
        }
    }

    /// Whether the configuration describes a decodable stream
    pub fn is_valid(&self) -> bool {
        self.codec != VideoCodec::Unknown
            && !self.coded_size.is_empty()
            && self.additional_config.as_ref().map_or(true, |c| c.is_valid())
    }
}

/// Either kind of stream configuration, as carried by coded frames
#[derive(Debug, Clone, PartialEq)]
pub enum StreamConfig {
    Audio(AudioConfig),
    Video(VideoConfig),
}
