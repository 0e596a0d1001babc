//! Audio sub-pipeline

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;
use log::warn;
use crate::backend::{
    AudioConfig, AudioDecoder, AudioDecoderSoftwareWrapper, BufferStatus, CdmHandle, Decoder, DecoderBuffer,
    DecoderDelegate, DecoderStatistics, StreamConfig,
};
use crate::pipeline::av_pipeline::{AvPipeline, AvPipelineState, StreamDecoder};
use crate::pipeline::{AvPipelineClient, BufferingState, FrameProvider, StreamKind};
use crate::runner::TaskRunner;
use crate::utils::error::{PipelineError, Result};

/// Weak view of the coordinator-owned audio decoder wrapper
pub(crate) struct AudioStreamDecoder {
    decoder: Weak<RefCell<AudioDecoderSoftwareWrapper>>,
}

impl AudioStreamDecoder {
    pub(crate) fn new(decoder: &Rc<RefCell<AudioDecoderSoftwareWrapper>>) -> Self {
        Self {
            decoder: Rc::downgrade(decoder),
        }
    }
}

impl StreamDecoder for AudioStreamDecoder {
    fn is_alive(&self) -> bool {
        self.decoder.upgrade().map_or(false, |decoder| decoder.borrow().is_alive())
    }

    fn set_delegate(&self, delegate: DecoderDelegate) {
        if let Some(decoder) = self.decoder.upgrade() {
            decoder.borrow_mut().set_delegate(delegate);
        }
    }

    fn set_config(&self, config: &StreamConfig) -> bool {
        let StreamConfig::Audio(config) = config else {
            return false;
        };
        self.decoder
            .upgrade()
            .map_or(false, |decoder| decoder.borrow_mut().set_config(config))
    }

    fn push_buffer(&self, buffer: DecoderBuffer) -> Option<BufferStatus> {
        let decoder = self.decoder.upgrade()?;
        let status = decoder.borrow_mut().push_buffer(buffer);
        Some(status)
    }

    fn statistics(&self) -> Option<DecoderStatistics> {
        let decoder = self.decoder.upgrade()?;
        let statistics = decoder.borrow().statistics();
        Some(statistics)
    }
}

/// Feeds the audio stream into the backend audio decoder
pub struct AudioPipeline {
    av: AvPipeline,
    decoder: Weak<RefCell<AudioDecoderSoftwareWrapper>>,
}

impl AudioPipeline {
    pub(crate) fn new(
        runner: TaskRunner,
        decoder: &Rc<RefCell<AudioDecoderSoftwareWrapper>>,
        client: AvPipelineClient,
        error_sink: Rc<dyn Fn(PipelineError)>,
    ) -> Self {
        let av = AvPipeline::new(
            StreamKind::Audio,
            runner,
            Box::new(AudioStreamDecoder::new(decoder)),
            client,
            None,
            error_sink,
        );
        Self {
            av,
            decoder: Rc::downgrade(decoder),
        }
    }

    pub fn initialize(&self, config: AudioConfig, frame_provider: Box<dyn FrameProvider>) -> Result<()> {
        if !config.is_valid() {
            return Err(PipelineError::InitializationFailed(format!("invalid audio config {:?}", config.codec)));
        }
        self.av.initialize(StreamConfig::Audio(config), frame_provider)
    }

    pub fn start_playing_from(&self, timestamp: Duration, buffering_state: Weak<BufferingState>) -> Result<()> {
        self.av.start_playing_from(timestamp, buffering_state)
    }

    pub fn flush(&self, done: Box<dyn FnOnce()>) -> Result<()> {
        self.av.flush(done)
    }

    pub fn stop(&self) {
        self.av.stop();
    }

    pub fn update_statistics(&self) {
        self.av.update_statistics();
    }

    pub fn set_cdm(&self, cdm: CdmHandle) {
        self.av.set_cdm(cdm);
    }

    pub fn state(&self) -> AvPipelineState {
        self.av.state()
    }

    /// Set the output volume multiplier
    pub fn set_volume(&self, volume: f32) {
        self.av.check_on_runner();
        let applied = self
            .decoder
            .upgrade()
            .map_or(false, |decoder| decoder.borrow_mut().set_volume(volume));
        if !applied {
            warn!("Audio decoder did not accept volume {}", volume);
        }
    }

    /// Whether the stream is decoded in software before reaching the backend
    pub fn is_using_software_decoder(&self) -> bool {
        self.av.check_on_runner();
        self.decoder
            .upgrade()
            .map_or(false, |decoder| decoder.borrow().is_using_software_decoder())
    }
}
