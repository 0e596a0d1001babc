//! Video sub-pipeline

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;
use crate::backend::{
    BufferStatus, CdmHandle, DecoderBuffer, DecoderDelegate, DecoderStatistics, SharedVideoDecoder, StreamConfig,
    VideoConfig, VideoDecoder,
};
use crate::pipeline::av_pipeline::{AvPipeline, AvPipelineState, StreamDecoder};
use crate::pipeline::{BufferingState, FrameProvider, StreamKind, VideoPipelineClient};
use crate::runner::TaskRunner;
use crate::utils::error::{PipelineError, Result};

/// Weak view of the backend-owned video decoder
pub(crate) struct VideoStreamDecoder {
    decoder: Weak<RefCell<dyn VideoDecoder>>,
}

impl VideoStreamDecoder {
    pub(crate) fn new(decoder: &SharedVideoDecoder) -> Self {
        Self {
            decoder: Rc::downgrade(decoder),
        }
    }
}

impl StreamDecoder for VideoStreamDecoder {
    fn is_alive(&self) -> bool {
        self.decoder.strong_count() > 0
    }

    fn set_delegate(&self, delegate: DecoderDelegate) {
        if let Some(decoder) = self.decoder.upgrade() {
            decoder.borrow_mut().set_delegate(delegate);
        }
    }

    fn set_config(&self, config: &StreamConfig) -> bool {
        let StreamConfig::Video(config) = config else {
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

/// Feeds the video stream into the backend video decoder
pub struct VideoPipeline {
    av: AvPipeline,
}

impl VideoPipeline {
    pub(crate) fn new(
        runner: TaskRunner,
        decoder: &SharedVideoDecoder,
        client: VideoPipelineClient,
        error_sink: Rc<dyn Fn(PipelineError)>,
    ) -> Self {
        let VideoPipelineClient {
            av_pipeline_client,
            natural_size_changed_cb,
        } = client;

        let av = AvPipeline::new(
            StreamKind::Video,
            runner,
            Box::new(VideoStreamDecoder::new(decoder)),
            av_pipeline_client,
            natural_size_changed_cb,
            error_sink,
        );
        Self { av }
    }

    /// Configure the decoder from one config, or two for a multi-view
    /// stream where the second describes the additional view
    pub fn initialize(&self, configs: Vec<VideoConfig>, frame_provider: Box<dyn FrameProvider>) -> Result<()> {
        if configs.is_empty() || configs.len() > 2 {
            return Err(PipelineError::InitializationFailed(format!(
                "expected 1 or 2 video configs, got {}",
                configs.len()
            )));
        }

        let mut configs = configs.into_iter();
        let (Some(mut config), additional) = (configs.next(), configs.next()) else {
            return Err(PipelineError::InitializationFailed("missing video config".to_string()));
        };
        config.additional_config = additional.map(Box::new);

        if !config.is_valid() {
            return Err(PipelineError::InitializationFailed(format!("invalid video config {:?}", config.codec)));
        }
        self.av.initialize(StreamConfig::Video(config), frame_provider)
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
}
