//! Stream-independent half of the audio and video sub-pipelines
//!
//! An `AvPipeline` pulls coded frames from its frame provider and pushes
//! them into one backend decoder, one at a time:
//!
//! ```text
//!   provider.read ──► on_new_frame ──► decoder.push_buffer
//!        ▲                                   │
//!        └──── Success / PushBufferComplete ─┘
//! ```
//!
//! There is never more than one outstanding read and one pending push.
//! Read completions and decoder events are posted back onto the media task
//! runner through weak handles, so a destroyed sub-pipeline silently drops
//! them. Frames requested before a flush are recognised by their read epoch
//! and discarded.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;
use log::{debug, error, info, trace, warn};
use crate::backend::{
    BufferStatus, CdmHandle, DecoderBuffer, DecoderDelegate, DecoderEvent, DecoderStatistics, Size,
    StreamConfig,
};
use crate::pipeline::{AvPipelineClient, BufferingState, CodedFrame, FrameProvider, PipelineStatistics, StreamKind};
use crate::runner::TaskRunner;
use crate::utils::error::{PipelineError, Result};
use crate::utils::format_timestamp;

/// Non-owning access to the backend decoder of one stream
pub(crate) trait StreamDecoder {
    /// Whether the backend decoder still exists
    fn is_alive(&self) -> bool;

    fn set_delegate(&self, delegate: DecoderDelegate);

    /// Apply a configuration; false if rejected or of the wrong kind
    fn set_config(&self, config: &StreamConfig) -> bool;

    /// `None` once the backend decoder is gone
    fn push_buffer(&self, buffer: DecoderBuffer) -> Option<BufferStatus>;

    /// `None` once the backend decoder is gone
    fn statistics(&self) -> Option<DecoderStatistics>;
}

/// Sub-pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvPipelineState {
    /// Not yet configured
    Uninitialized,

    /// Configured and drained; ready to start
    Flushed,

    /// Feeding frames into the decoder
    Playing,

    /// Feeding halted; a flush may follow
    Stopped,

    /// Waiting for the frame provider to drain
    Flushing,

    /// A decoder or configuration failure was reported
    Error,
}

struct AvPipelineCore {
    kind: StreamKind,
    runner: TaskRunner,
    decoder: Box<dyn StreamDecoder>,
    client: Rc<AvPipelineClient>,
    natural_size_changed: Option<Rc<dyn Fn(Size)>>,
    error_sink: Rc<dyn Fn(PipelineError)>,
    state: AvPipelineState,
    frame_provider: Option<Box<dyn FrameProvider>>,
    buffering_state: Weak<BufferingState>,
    enable_feeding: bool,
    pending_read: bool,
    pending_push: bool,

    /// Frame held back until a decryption context arrives
    pending_buffer: Option<DecoderBuffer>,
    waiting_for_key: bool,
    eos_pushed: bool,

    /// Bumped on stop and flush; reads from older epochs are discarded
    read_epoch: u64,
    cdm: Option<CdmHandle>,
    previous_stats: DecoderStatistics,
    weak_self: Weak<RefCell<AvPipelineCore>>,
}

/// Frame pump shared by [`AudioPipeline`](crate::pipeline::AudioPipeline)
/// and [`VideoPipeline`](crate::pipeline::VideoPipeline)
pub(crate) struct AvPipeline {
    core: Rc<RefCell<AvPipelineCore>>,
    runner: TaskRunner,
}

impl AvPipeline {
    pub(crate) fn new(
        kind: StreamKind,
        runner: TaskRunner,
        decoder: Box<dyn StreamDecoder>,
        client: AvPipelineClient,
        natural_size_changed: Option<Box<dyn Fn(Size)>>,
        error_sink: Rc<dyn Fn(PipelineError)>,
    ) -> Self {
        let core = Rc::new_cyclic(|weak_self| {
            RefCell::new(AvPipelineCore {
                kind,
                runner: runner.clone(),
                decoder,
                client: Rc::new(client),
                natural_size_changed: natural_size_changed.map(Rc::from),
                error_sink,
                state: AvPipelineState::Uninitialized,
                frame_provider: None,
                buffering_state: Weak::new(),
                enable_feeding: false,
                pending_read: false,
                pending_push: false,
                pending_buffer: None,
                waiting_for_key: false,
                eos_pushed: false,
                read_epoch: 0,
                cdm: None,
                previous_stats: DecoderStatistics::default(),
                weak_self: weak_self.clone(),
            })
        });

        Self { core, runner }
    }

    pub(crate) fn state(&self) -> AvPipelineState {
        self.runner.check_on_runner();
        self.core.borrow().state
    }

    #[track_caller]
    pub(crate) fn check_on_runner(&self) {
        self.runner.check_on_runner();
    }

    /// Configure the decoder and take ownership of the frame provider
    pub(crate) fn initialize(&self, config: StreamConfig, frame_provider: Box<dyn FrameProvider>) -> Result<()> {
        self.runner.check_on_runner();
        let mut core = self.core.borrow_mut();
        if core.state != AvPipelineState::Uninitialized {
            return Err(PipelineError::invalid_state(format!("{} pipeline already initialized", core.kind.name())));
        }

        let delegate = core.decoder_delegate();
        core.decoder.set_delegate(delegate);

        if !core.decoder.set_config(&config) {
            warn!("{} decoder rejected initial configuration", core.kind.name());
            return Err(PipelineError::InitializationFailed(format!(
                "{} decoder rejected configuration",
                core.kind.name()
            )));
        }

        core.frame_provider = Some(frame_provider);
        core.set_state(AvPipelineState::Flushed);
        Ok(())
    }

    /// Begin feeding frames, reporting progress into `buffering_state`
    pub(crate) fn start_playing_from(&self, timestamp: Duration, buffering_state: Weak<BufferingState>) -> Result<()> {
        self.runner.check_on_runner();
        let mut core = self.core.borrow_mut();
        if core.state != AvPipelineState::Flushed {
            return Err(PipelineError::invalid_state(format!(
                "{} pipeline cannot start from {:?}",
                core.kind.name(),
                core.state
            )));
        }

        if !core.decoder.is_alive() {
            error!("{} decoder is gone, cannot start", core.kind.name());
            return Err(PipelineError::Abort);
        }

        info!("{} pipeline starting at {}", core.kind.name(), format_timestamp(timestamp));
        core.buffering_state = buffering_state;
        core.enable_feeding = true;
        core.eos_pushed = false;
        core.set_state(AvPipelineState::Playing);
        core.fetch_buffer();
        Ok(())
    }

    /// Halt frame pushing; idempotent
    pub(crate) fn stop(&self) {
        self.runner.check_on_runner();
        let mut core = self.core.borrow_mut();
        core.enable_feeding = false;
        core.pending_read = false;
        core.read_epoch += 1;

        if matches!(core.state, AvPipelineState::Playing | AvPipelineState::Error) {
            core.set_state(AvPipelineState::Stopped);
        }
    }

    /// Drain the frame provider and drop un-pushed frames
    ///
    /// `done` runs exactly once, on a later task, unless the sub-pipeline
    /// is destroyed first.
    pub(crate) fn flush(&self, done: Box<dyn FnOnce()>) -> Result<()> {
        self.runner.check_on_runner();
        let mut core = self.core.borrow_mut();
        if core.state != AvPipelineState::Stopped {
            return Err(PipelineError::invalid_state(format!(
                "{} pipeline cannot flush from {:?}",
                core.kind.name(),
                core.state
            )));
        }

        core.set_state(AvPipelineState::Flushing);
        core.read_epoch += 1;
        core.pending_read = false;
        core.pending_push = false;
        core.pending_buffer = None;
        core.waiting_for_key = false;
        core.eos_pushed = false;
        core.buffering_state = Weak::new();

        let runner = core.runner.clone();
        let weak_core = core.weak_self.clone();
        let on_flushed: Box<dyn FnOnce()> = Box::new(move || {
            runner.post_weak(weak_core, move |core| {
                core.borrow_mut().on_flush_complete();
                done();
            });
        });

        match core.frame_provider.as_mut() {
            Some(provider) => provider.flush(on_flushed),
            None => on_flushed(),
        }
        Ok(())
    }

    /// Report decoder statistics accumulated since the last report
    pub(crate) fn update_statistics(&self) {
        self.runner.check_on_runner();
        let mut core = self.core.borrow_mut();
        let Some(stats) = core.decoder.statistics() else {
            return;
        };

        let delta = stats.since(&core.previous_stats);
        core.previous_stats = stats;

        let statistics = match core.kind {
            StreamKind::Audio => PipelineStatistics {
                audio_bytes_decoded: delta.decoded_bytes,
                ..Default::default()
            },
            StreamKind::Video => PipelineStatistics {
                video_bytes_decoded: delta.decoded_bytes,
                video_frames_decoded: delta.decoded_frames,
                video_frames_dropped: delta.dropped_frames,
                ..Default::default()
            },
        };
        core.post_client(move |client| (client.statistics_cb)(statistics));
    }

    /// Install the decryption context; resumes a stream waiting for a key
    pub(crate) fn set_cdm(&self, cdm: CdmHandle) {
        self.runner.check_on_runner();
        let mut core = self.core.borrow_mut();
        debug!("{} pipeline using CDM {}", core.kind.name(), cdm.id());
        core.cdm = Some(cdm);

        if core.waiting_for_key {
            core.waiting_for_key = false;
            core.fetch_buffer();
        }
    }
}

impl AvPipelineCore {
    fn set_state(&mut self, state: AvPipelineState) {
        if self.state != state {
            debug!("{} pipeline: {:?} -> {:?}", self.kind.name(), self.state, state);
            self.state = state;
        }
    }

    fn decoder_delegate(&self) -> DecoderDelegate {
        let runner = self.runner.clone();
        let weak_core = self.weak_self.clone();
        Rc::new(move |event: DecoderEvent| {
            runner.post_weak(weak_core.clone(), move |core| {
                core.borrow_mut().on_decoder_event(event);
            });
        })
    }

    /// Run a client callback on a later task, if this sub-pipeline still exists
    fn post_client(&self, f: impl FnOnce(&AvPipelineClient) + 'static) {
        self.runner.post_weak(self.weak_self.clone(), move |core| {
            let client = Rc::clone(&core.borrow().client);
            f(&client);
        });
    }

    fn fetch_buffer(&mut self) {
        if !self.enable_feeding || self.pending_read || self.pending_push || self.waiting_for_key {
            return;
        }

        if let Some(mut buffer) = self.pending_buffer.take() {
            buffer.decrypt_context = self.cdm.clone();
            self.push_buffer(buffer);
            return;
        }

        if self.eos_pushed {
            return;
        }

        let runner = self.runner.clone();
        let weak_core = self.weak_self.clone();
        let epoch = self.read_epoch;
        let Some(provider) = self.frame_provider.as_mut() else {
            return;
        };

        self.pending_read = true;
        provider.read(Box::new(move |frame: CodedFrame| {
            runner.post_weak(weak_core, move |core| {
                core.borrow_mut().on_new_frame(epoch, frame);
            });
        }));
    }

    fn on_new_frame(&mut self, epoch: u64, frame: CodedFrame) {
        if epoch != self.read_epoch || self.state != AvPipelineState::Playing {
            trace!("{} pipeline dropping frame from read epoch {}", self.kind.name(), epoch);
            return;
        }
        self.pending_read = false;

        let CodedFrame { mut buffer, config } = frame;
        if let Some(config) = config {
            if !self.decoder.set_config(&config) {
                error!("{} decoder rejected mid-stream configuration change", self.kind.name());
                self.fail(PipelineError::Abort);
                return;
            }
            debug!("{} pipeline applied configuration change", self.kind.name());
        }

        if let Some(buffering_state) = self.buffering_state.upgrade() {
            if buffer.end_of_stream {
                buffering_state.notify_eos();
            } else {
                buffering_state.set_buffered_time(buffer.end_time());
            }
        }

        if buffer.is_encrypted() {
            match &self.cdm {
                Some(cdm) => buffer.decrypt_context = Some(cdm.clone()),
                None => {
                    info!("{} pipeline waiting for decryption key", self.kind.name());
                    self.waiting_for_key = true;
                    self.pending_buffer = Some(buffer);
                    self.post_client(|client| (client.wait_for_key_cb)());
                    return;
                }
            }
        }

        self.push_buffer(buffer);
    }

    fn push_buffer(&mut self, buffer: DecoderBuffer) {
        let end_of_stream = buffer.end_of_stream;
        match self.decoder.push_buffer(buffer) {
            Some(BufferStatus::Success) => {
                self.eos_pushed |= end_of_stream;
                self.fetch_buffer();
            }
            Some(BufferStatus::Pending) => {
                self.eos_pushed |= end_of_stream;
                self.pending_push = true;
            }
            Some(BufferStatus::Failed) => {
                error!("{} decoder rejected a buffer", self.kind.name());
                self.fail(PipelineError::Abort);
            }
            None => {
                error!("{} decoder is gone", self.kind.name());
                self.fail(PipelineError::Abort);
            }
        }
    }

    fn on_decoder_event(&mut self, event: DecoderEvent) {
        match event {
            DecoderEvent::PushBufferComplete(status) => {
                if !self.pending_push {
                    return;
                }
                self.pending_push = false;
                if self.state != AvPipelineState::Playing {
                    return;
                }
                match status {
                    BufferStatus::Failed => self.fail(PipelineError::Abort),
                    _ => self.fetch_buffer(),
                }
            }
            DecoderEvent::EndOfStream => {
                if self.state == AvPipelineState::Playing {
                    info!("{} pipeline reached end of stream", self.kind.name());
                    self.post_client(|client| (client.eos_cb)());
                }
            }
            DecoderEvent::DecoderError => {
                if self.state == AvPipelineState::Playing {
                    self.fail(PipelineError::Abort);
                } else {
                    warn!("{} decoder error ignored in {:?}", self.kind.name(), self.state);
                }
            }
            DecoderEvent::VideoResolutionChanged(size) => {
                debug!("{} natural size {}x{}", self.kind.name(), size.width, size.height);
                if let Some(callback) = self.natural_size_changed.clone() {
                    self.runner.post_weak(self.weak_self.clone(), move |_| callback(size));
                }
            }
        }
    }

    fn on_flush_complete(&mut self) {
        if self.state == AvPipelineState::Flushing {
            info!("{} pipeline flushed", self.kind.name());
            self.set_state(AvPipelineState::Flushed);
        }
    }

    fn fail(&mut self, err: PipelineError) {
        if self.state == AvPipelineState::Error {
            return;
        }
        error!("{} pipeline failed: {}", self.kind.name(), err);
        self.enable_feeding = false;
        self.set_state(AvPipelineState::Error);
        (self.error_sink)(err);
    }
}
