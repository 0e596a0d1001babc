//! Software fallback for backend audio decoders
//!
//! Backends frequently support only a handful of compressed audio codecs.
//! `AudioDecoderSoftwareWrapper` sits between the audio sub-pipeline and the
//! backend decoder: configurations the backend accepts pass straight
//! through, otherwise a software decoder (if a factory can provide one)
//! converts buffers to PCM and the backend is reconfigured for PCM.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use log::{info, warn};
use crate::backend::{
    AudioCodec, AudioConfig, AudioDecoder, BufferStatus, Decoder, DecoderBuffer, DecoderDelegate,
    DecoderStatistics, SharedAudioDecoder,
};
use crate::utils::error::Result;

/// Software audio decoder producing PCM buffers
pub trait SoftwareAudioDecoder {
    /// Decode one coded buffer into one PCM buffer with the same timing
    fn decode(&mut self, buffer: &DecoderBuffer) -> Result<DecoderBuffer>;

    /// PCM configuration of the decoded output
    fn output_config(&self) -> AudioConfig;
}

/// Creates software decoders for codecs the backend rejects
pub trait SoftwareDecoderFactory {
    /// Software decoder for `config`, `None` if the codec is unsupported
    fn create(&self, config: &AudioConfig) -> Option<Box<dyn SoftwareAudioDecoder>>;
}

/// Audio decoder adapter with optional software decoding
pub struct AudioDecoderSoftwareWrapper {
    /// Decoder owned by the backend
    backend_decoder: Weak<RefCell<dyn AudioDecoder>>,

    /// Source of software decoders
    factory: Option<Rc<dyn SoftwareDecoderFactory>>,

    /// Active software decoder, when the backend rejected the stream codec
    software_decoder: Option<Box<dyn SoftwareAudioDecoder>>,
}

impl AudioDecoderSoftwareWrapper {
    /// Wrap a backend decoder without taking ownership of it
    pub fn new(backend_decoder: &SharedAudioDecoder, factory: Option<Rc<dyn SoftwareDecoderFactory>>) -> Self {
        Self {
            backend_decoder: Rc::downgrade(backend_decoder),
            factory,
            software_decoder: None,
        }
    }

    /// Whether buffers currently go through the software decoder
    pub fn is_using_software_decoder(&self) -> bool {
        self.software_decoder.is_some()
    }

    /// Whether the backend decoder is still alive
    pub fn is_alive(&self) -> bool {
        self.backend_decoder.strong_count() > 0
    }

    fn create_software_decoder(&mut self, config: &AudioConfig) -> Option<Box<dyn SoftwareAudioDecoder>> {
        if config.encrypted || config.codec == AudioCodec::Pcm {
            return None;
        }
        self.factory.as_ref()?.create(config)
    }
}

impl Decoder for AudioDecoderSoftwareWrapper {
    fn set_delegate(&mut self, delegate: DecoderDelegate) {
        if let Some(decoder) = self.backend_decoder.upgrade() {
            decoder.borrow_mut().set_delegate(delegate);
        }
    }

    fn push_buffer(&mut self, buffer: DecoderBuffer) -> BufferStatus {
        let Some(decoder) = self.backend_decoder.upgrade() else {
            warn!("Audio push after backend decoder was destroyed");
            return BufferStatus::Failed;
        };

        let buffer = match self.software_decoder.as_mut() {
            Some(software) if !buffer.end_of_stream => match software.decode(&buffer) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Software audio decode failed at {:?}: {}", buffer.timestamp, e);
                    return BufferStatus::Failed;
                }
            },
            _ => buffer,
        };

        let status = decoder.borrow_mut().push_buffer(buffer);
        status
    }

    fn statistics(&self) -> DecoderStatistics {
        self.backend_decoder
            .upgrade()
            .map(|decoder| decoder.borrow().statistics())
            .unwrap_or_default()
    }
}

impl AudioDecoder for AudioDecoderSoftwareWrapper {
    fn set_config(&mut self, config: &AudioConfig) -> bool {
        let Some(decoder) = self.backend_decoder.upgrade() else {
            return false;
        };

        if decoder.borrow_mut().set_config(config) {
            self.software_decoder = None;
            return true;
        }

        let Some(software) = self.create_software_decoder(config) else {
            warn!("Backend rejected audio config {:?} and no software decoder is available", config.codec);
            return false;
        };

        let pcm_config = software.output_config();
        if !decoder.borrow_mut().set_config(&pcm_config) {
            warn!("Backend rejected PCM output of software {:?} decoder", config.codec);
            return false;
        }

        info!(
            "Decoding {:?} in software ({} ch @ {} Hz PCM to backend)",
            config.codec, pcm_config.channels, pcm_config.samples_per_second
        );
        self.software_decoder = Some(software);
        true
    }

    fn set_volume(&mut self, multiplier: f32) -> bool {
        self.backend_decoder
            .upgrade()
            .map_or(false, |decoder| decoder.borrow_mut().set_volume(multiplier))
    }
}
