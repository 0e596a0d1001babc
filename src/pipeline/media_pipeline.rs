//! Media pipeline coordinator
//!
//! `MediaPipeline` owns the decoder backend, the audio and video
//! sub-pipelines and the buffering controller. It drives the backend through
//! its lifecycle:
//!
//! ```text
//! Uninitialized ──initialize──► Initialized ──start──► Playing ◄──► Paused
//!       ▲                            ▲                    │           │
//!       │                            └────── flush ───────┴───────────┘
//!       └──────────────────────────── stop (from any state)
//! ```
//!
//! and publishes the media clock to the client every
//! `time_update_interval`. Buffering edges reported by the controller pause
//! and resume the backend.
//!
//! Everything runs on one [`TaskRunner`]. Work that has to happen later
//! (clock ticks, buffering edges, flush completion, sub-pipeline errors) is
//! posted with a weak handle to the coordinator and dropped if the
//! coordinator is gone by then. Client callbacks other than
//! `pipeline_backend_created` are always posted.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;
use log::{debug, error, info, warn};
use crate::backend::{
    AudioConfig, AudioDecoderSoftwareWrapper, CdmHandle, MediaPipelineBackend, SoftwareDecoderFactory,
    VideoConfig, NO_TIMESTAMP,
};
use crate::pipeline::{
    AudioPipeline, AvPipelineClient, BackendState, BufferingController, BufferingStatus, FrameProvider,
    LoadType, MediaPipelineClient, StreamKind, VideoPipeline, VideoPipelineClient,
};
use crate::runner::TaskRunner;
use crate::utils::config::PipelineConfig;
use crate::utils::error::{PipelineError, Result};
use crate::utils::format_timestamp;

/// Outstanding flush; completes once both streams report back
struct FlushTask {
    audio_flushed: bool,
    video_flushed: bool,
    done: Box<dyn FnOnce()>,
}

impl FlushTask {
    fn is_complete(&self) -> bool {
        self.audio_flushed && self.video_flushed
    }
}

struct PipelineInner {
    runner: TaskRunner,
    config: PipelineConfig,
    client: Rc<MediaPipelineClient>,
    load_type: Option<LoadType>,
    backend: Option<Box<dyn MediaPipelineBackend>>,
    backend_state: BackendState,

    /// Owned here; the audio sub-pipeline only holds a weak reference
    audio_decoder: Option<Rc<RefCell<AudioDecoderSoftwareWrapper>>>,
    audio_pipeline: Option<AudioPipeline>,
    video_pipeline: Option<VideoPipeline>,
    buffering_controller: Option<BufferingController>,
    software_decoder_factory: Option<Rc<dyn SoftwareDecoderFactory>>,
    playback_rate: f32,
    last_media_time: Duration,
    pending_time_update_task: bool,
    statistics_rolling_counter: u32,
    cdm: Option<CdmHandle>,
    pending_flush: Option<FlushTask>,
    weak_self: Weak<RefCell<PipelineInner>>,
}

/// Media pipeline coordinator
pub struct MediaPipeline {
    inner: Rc<RefCell<PipelineInner>>,
    runner: TaskRunner,
}

impl MediaPipeline {
    /// Create a coordinator bound to `runner`
    pub fn new(runner: TaskRunner, config: PipelineConfig) -> Self {
        runner.check_on_runner();
        let inner = Rc::new_cyclic(|weak_self| {
            RefCell::new(PipelineInner {
                runner: runner.clone(),
                config,
                client: Rc::new(MediaPipelineClient::default()),
                load_type: None,
                backend: None,
                backend_state: BackendState::Uninitialized,
                audio_decoder: None,
                audio_pipeline: None,
                video_pipeline: None,
                buffering_controller: None,
                software_decoder_factory: None,
                playback_rate: 1.0,
                last_media_time: Duration::ZERO,
                pending_time_update_task: false,
                statistics_rolling_counter: 0,
                cdm: None,
                pending_flush: None,
                weak_self: weak_self.clone(),
            })
        });

        Self { inner, runner }
    }

    /// Install the client callbacks
    pub fn set_client(&self, client: MediaPipelineClient) {
        self.runner.check_on_runner();
        self.inner.borrow_mut().client = Rc::new(client);
    }

    /// Install the software decoder factory used for audio codecs the
    /// backend cannot decode. Applies to audio streams initialized later.
    pub fn set_software_decoder_factory(&self, factory: Rc<dyn SoftwareDecoderFactory>) {
        self.runner.check_on_runner();
        self.inner.borrow_mut().software_decoder_factory = Some(factory);
    }

    /// Install the backend
    ///
    /// `pipeline_backend_created` fires before this returns. The backend
    /// itself is initialized lazily by the first `start_playing_from`.
    pub fn initialize(&self, load_type: LoadType, backend: Box<dyn MediaPipelineBackend>) -> Result<()> {
        self.runner.check_on_runner();
        let client = {
            let mut inner = self.inner.borrow_mut();
            if inner.backend.is_some() {
                return Err(PipelineError::invalid_state("backend already installed"));
            }

            info!("Initializing media pipeline for {:?} load", load_type);
            inner.backend = Some(backend);
            inner.load_type = Some(load_type);
            let controller = inner
                .config
                .buffering_for(load_type)
                .map(|config| BufferingController::new(inner.runner.clone(), config, inner.buffering_notifier()));
            inner.buffering_controller = controller;

            Rc::clone(&inner.client)
        };

        (client.pipeline_backend_created_cb)();
        Ok(())
    }

    /// Create the audio sub-pipeline
    ///
    /// Returns the sub-pipeline's initialization result; on error nothing is
    /// retained.
    pub fn initialize_audio(
        &self,
        config: AudioConfig,
        client: AvPipelineClient,
        frame_provider: Box<dyn FrameProvider>,
    ) -> Result<()> {
        self.runner.check_on_runner();
        let mut inner = self.inner.borrow_mut();
        if inner.audio_pipeline.is_some() {
            return Err(PipelineError::invalid_state("audio already initialized"));
        }

        let Some(decoder) = inner.backend.as_deref_mut().map(|backend| backend.create_audio_decoder()) else {
            return Err(PipelineError::invalid_state("no backend installed"));
        };
        let Some(decoder) = decoder else {
            error!("Backend failed to create an audio decoder");
            return Err(PipelineError::Abort);
        };

        let wrapper = Rc::new(RefCell::new(AudioDecoderSoftwareWrapper::new(
            &decoder,
            inner.software_decoder_factory.clone(),
        )));
        let pipeline = AudioPipeline::new(inner.runner.clone(), &wrapper, client, inner.pipeline_error_sink());
        if let Some(cdm) = &inner.cdm {
            pipeline.set_cdm(cdm.clone());
        }

        pipeline.initialize(config, frame_provider)?;
        info!(
            "Audio pipeline initialized{}",
            if pipeline.is_using_software_decoder() { " (software decoding)" } else { "" }
        );

        inner.audio_decoder = Some(wrapper);
        inner.audio_pipeline = Some(pipeline);
        Ok(())
    }

    /// Create the video sub-pipeline from one or two configs
    pub fn initialize_video(
        &self,
        configs: Vec<VideoConfig>,
        client: VideoPipelineClient,
        frame_provider: Box<dyn FrameProvider>,
    ) -> Result<()> {
        self.runner.check_on_runner();
        let mut inner = self.inner.borrow_mut();
        if inner.video_pipeline.is_some() {
            return Err(PipelineError::invalid_state("video already initialized"));
        }

        let Some(decoder) = inner.backend.as_deref_mut().map(|backend| backend.create_video_decoder()) else {
            return Err(PipelineError::invalid_state("no backend installed"));
        };
        let Some(decoder) = decoder else {
            error!("Backend failed to create a video decoder");
            return Err(PipelineError::Abort);
        };

        let pipeline = VideoPipeline::new(inner.runner.clone(), &decoder, client, inner.pipeline_error_sink());
        if let Some(cdm) = &inner.cdm {
            pipeline.set_cdm(cdm.clone());
        }

        pipeline.initialize(configs, frame_provider)?;
        info!("Video pipeline initialized");

        inner.video_pipeline = Some(pipeline);
        Ok(())
    }

    /// Record the decryption context and hand it to both sub-pipelines
    pub fn set_cdm(&self, cdm: CdmHandle) {
        self.runner.check_on_runner();
        let mut inner = self.inner.borrow_mut();
        if let Some(audio) = &inner.audio_pipeline {
            audio.set_cdm(cdm.clone());
        }
        if let Some(video) = &inner.video_pipeline {
            video.set_cdm(cdm.clone());
        }
        inner.cdm = Some(cdm);
    }

    /// Look up a CDM by id. There is no CDM registry.
    pub fn set_cdm_by_id(&self, cdm_id: i32) -> Result<()> {
        self.runner.check_on_runner();
        warn!("set_cdm_by_id({}) is not supported", cdm_id);
        Err(PipelineError::NotImplemented("set_cdm_by_id"))
    }

    /// Start the backend and both sub-pipelines at `time`
    pub fn start_playing_from(&self, time: Duration) -> Result<()> {
        self.runner.check_on_runner();
        self.inner.borrow_mut().start_playing_from(time)
    }

    /// Drop all un-presented frames and return the backend to Initialized
    ///
    /// `done` is posted once both streams have drained. A `stop` before
    /// then discards it without running it.
    pub fn flush(&self, done: impl FnOnce() + 'static) -> Result<()> {
        self.runner.check_on_runner();
        self.inner.borrow_mut().flush(Box::new(done))
    }

    /// Tear down sub-pipelines and backend
    pub fn stop(&self) {
        self.runner.check_on_runner();
        self.inner.borrow_mut().teardown();
    }

    pub fn set_playback_rate(&self, rate: f32) {
        self.runner.check_on_runner();
        let mut inner = self.inner.borrow_mut();
        debug!("Playback rate {} -> {}", inner.playback_rate, rate);
        inner.playback_rate = rate;

        let buffering = inner
            .buffering_controller
            .as_ref()
            .map_or(false, |controller| controller.is_buffering());
        if buffering {
            debug!("Buffering; rate {} applies once buffering ends", rate);
            return;
        }
        inner.apply_playback_rate();
    }

    pub fn set_volume(&self, volume: f32) {
        self.runner.check_on_runner();
        if let Some(audio) = &self.inner.borrow().audio_pipeline {
            audio.set_volume(volume);
        }
    }

    /// Latest media time published to the client
    pub fn media_time(&self) -> Duration {
        self.runner.check_on_runner();
        self.inner.borrow().last_media_time
    }

    pub fn has_audio(&self) -> bool {
        self.runner.check_on_runner();
        self.inner.borrow().audio_pipeline.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.runner.check_on_runner();
        self.inner.borrow().video_pipeline.is_some()
    }

    pub fn backend_state(&self) -> BackendState {
        self.runner.check_on_runner();
        self.inner.borrow().backend_state
    }

    pub fn playback_rate(&self) -> f32 {
        self.runner.check_on_runner();
        self.inner.borrow().playback_rate
    }

    /// Whether the buffering controller currently holds playback
    pub fn is_buffering(&self) -> bool {
        self.runner.check_on_runner();
        self.inner
            .borrow()
            .buffering_controller
            .as_ref()
            .map_or(false, |controller| controller.is_buffering())
    }

    /// `(audio_flushed, video_flushed)` of the outstanding flush, if any
    pub fn pending_flush(&self) -> Option<(bool, bool)> {
        self.runner.check_on_runner();
        self.inner
            .borrow()
            .pending_flush
            .as_ref()
            .map(|task| (task.audio_flushed, task.video_flushed))
    }
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.teardown();
        }
    }
}

impl PipelineInner {
    fn set_backend_state(&mut self, state: BackendState) {
        debug_assert!(
            self.backend_state.can_transition_to(state),
            "illegal backend transition {} -> {}",
            self.backend_state,
            state
        );
        if self.backend_state != state {
            info!("Backend state: {} -> {}", self.backend_state, state);
            self.backend_state = state;
        }
    }

    fn with_backend<R>(&mut self, f: impl FnOnce(&mut (dyn MediaPipelineBackend + 'static)) -> R) -> Option<R> {
        self.backend.as_deref_mut().map(f)
    }

    /// Run a client callback on a later task
    fn post_client(&self, f: impl FnOnce(&MediaPipelineClient) + 'static) {
        let client = Rc::clone(&self.client);
        self.runner.post_task(move || f(&client));
    }

    fn report_error(&self, err: PipelineError) {
        error!("Media pipeline error: {}", err);
        self.post_client(move |client| (client.error_cb)(err));
    }

    /// Controller notify callback: posts the edge back to this coordinator
    fn buffering_notifier(&self) -> impl Fn(bool) + 'static {
        let runner = self.runner.clone();
        let weak_self = self.weak_self.clone();
        move |is_buffering| {
            runner.post_weak(weak_self.clone(), move |inner| {
                inner.borrow_mut().on_buffering_notification(is_buffering);
            });
        }
    }

    /// Error sink for sub-pipelines: runtime failures become a pipeline abort
    fn pipeline_error_sink(&self) -> Rc<dyn Fn(PipelineError)> {
        let runner = self.runner.clone();
        let weak_self = self.weak_self.clone();
        Rc::new(move |err: PipelineError| {
            runner.post_weak(weak_self.clone(), move |inner| {
                let inner = inner.borrow();
                warn!("Sub-pipeline failure: {}", err);
                inner.report_error(PipelineError::Abort);
            });
        })
    }

    fn flush_done_callback(&self, is_audio: bool) -> Box<dyn FnOnce()> {
        let runner = self.runner.clone();
        let weak_self = self.weak_self.clone();
        Box::new(move || {
            runner.post_weak(weak_self, move |inner| {
                inner.borrow_mut().on_flush_done(is_audio);
            });
        })
    }

    fn start_playing_from(&mut self, time: Duration) -> Result<()> {
        if self.audio_pipeline.is_none() && self.video_pipeline.is_none() {
            return Err(PipelineError::invalid_state("no audio or video stream initialized"));
        }
        if self.pending_flush.is_some() {
            return Err(PipelineError::invalid_state("flush in progress"));
        }
        if self.backend.is_none() {
            return Err(PipelineError::invalid_state("no backend installed"));
        }
        if self.backend_state.is_started() {
            return Err(PipelineError::invalid_state(format!("backend already {}", self.backend_state)));
        }

        info!("Start playing from {}", format_timestamp(time));

        if self.backend_state == BackendState::Uninitialized {
            if self.with_backend(|backend| backend.initialize()) != Some(true) {
                self.report_error(PipelineError::Abort);
                return Err(PipelineError::Abort);
            }
            self.set_backend_state(BackendState::Initialized);
        }

        let start_pts = time.as_micros() as i64;
        if self.with_backend(|backend| backend.start(start_pts)) != Some(true) {
            self.report_error(PipelineError::Abort);
            return Err(PipelineError::Abort);
        }
        self.set_backend_state(BackendState::Playing);

        self.statistics_rolling_counter = 0;
        self.last_media_time = time;
        if self.playback_rate != 1.0 {
            self.apply_playback_rate();
        }
        self.schedule_time_update(Duration::ZERO);

        if let Some(controller) = &self.buffering_controller {
            controller.set_media_time(time);
        }

        for kind in [StreamKind::Audio, StreamKind::Video] {
            let buffering_state = self
                .buffering_controller
                .as_ref()
                .map(|controller| Rc::downgrade(&controller.add_stream(kind.name())))
                .unwrap_or_default();

            let started = match kind {
                StreamKind::Audio => self.audio_pipeline.as_ref().map(|p| p.start_playing_from(time, buffering_state)),
                StreamKind::Video => self.video_pipeline.as_ref().map(|p| p.start_playing_from(time, buffering_state)),
            };

            if let Some(Err(e)) = started {
                error!("Failed to start {} pipeline: {}", kind.name(), e);
                self.report_error(PipelineError::Abort);
                return Err(PipelineError::Abort);
            }
        }

        Ok(())
    }

    fn flush(&mut self, done: Box<dyn FnOnce()>) -> Result<()> {
        if !self.backend_state.is_started() {
            return Err(PipelineError::invalid_state(format!("cannot flush while {}", self.backend_state)));
        }
        if self.pending_flush.is_some() {
            return Err(PipelineError::invalid_state("flush already in progress"));
        }

        info!("Flushing at {}", format_timestamp(self.last_media_time));
        if let Some(controller) = &self.buffering_controller {
            controller.reset();
        }

        if let Some(audio) = &self.audio_pipeline {
            audio.stop();
        }
        if let Some(video) = &self.video_pipeline {
            video.stop();
        }

        if self.with_backend(|backend| backend.stop()) != Some(true) {
            // Frames are already gone from the sub-pipelines; finish the flush anyway
            error!("Backend stop failed during flush");
            self.report_error(PipelineError::Abort);
        }
        self.set_backend_state(BackendState::Initialized);

        self.pending_flush = Some(FlushTask {
            audio_flushed: self.audio_pipeline.is_none(),
            video_flushed: self.video_pipeline.is_none(),
            done,
        });

        if let Some(audio) = &self.audio_pipeline {
            let on_done = self.flush_done_callback(true);
            if let Err(e) = audio.flush(on_done) {
                warn!("Audio flush refused: {}", e);
                self.flush_done_callback(true)();
            }
        }
        if let Some(video) = &self.video_pipeline {
            let on_done = self.flush_done_callback(false);
            if let Err(e) = video.flush(on_done) {
                warn!("Video flush refused: {}", e);
                self.flush_done_callback(false)();
            }
        }

        Ok(())
    }

    fn on_flush_done(&mut self, is_audio: bool) {
        let Some(task) = self.pending_flush.as_mut() else {
            return;
        };

        if is_audio {
            task.audio_flushed = true;
        } else {
            task.video_flushed = true;
        }
        debug!(
            "{} flush done (audio {}, video {})",
            if is_audio { "Audio" } else { "Video" },
            task.audio_flushed,
            task.video_flushed
        );

        if task.is_complete() {
            if let Some(task) = self.pending_flush.take() {
                info!("Flush complete");
                self.runner.post_task(task.done);
            }
        }
    }

    /// Stop and release everything: sub-pipelines, then the audio decoder
    /// wrapper, then the backend
    fn teardown(&mut self) {
        if self.pending_flush.take().is_some() {
            info!("Discarding pending flush");
        }

        if let Some(audio) = &self.audio_pipeline {
            audio.stop();
        }
        if let Some(video) = &self.video_pipeline {
            video.stop();
        }
        self.audio_pipeline = None;
        self.video_pipeline = None;
        self.audio_decoder = None;

        if let Some(controller) = self.buffering_controller.take() {
            controller.reset();
        }

        if self.backend.take().is_some() {
            info!("Backend destroyed");
            self.post_client(|client| (client.pipeline_backend_destroyed_cb)());
        }
        self.load_type = None;
        self.set_backend_state(BackendState::Uninitialized);
    }

    /// Drive the backend at `playback_rate`; rate 0 means paused
    fn apply_playback_rate(&mut self) {
        if !self.backend_state.is_started() {
            return;
        }

        let rate = self.playback_rate;
        if rate != 0.0 {
            if self.with_backend(|backend| backend.set_playback_rate(rate)) != Some(true) {
                warn!("Backend rejected playback rate {}", rate);
            }
            if self.backend_state == BackendState::Paused {
                if self.with_backend(|backend| backend.resume()) == Some(true) {
                    self.set_backend_state(BackendState::Playing);
                } else {
                    self.report_error(PipelineError::Abort);
                }
            }
        } else if self.backend_state == BackendState::Playing {
            self.pause_backend();
        }
    }

    fn pause_backend(&mut self) {
        if self.with_backend(|backend| backend.pause()) == Some(true) {
            self.set_backend_state(BackendState::Paused);
        } else {
            self.report_error(PipelineError::Abort);
        }
    }

    fn on_buffering_notification(&mut self, is_buffering: bool) {
        let Some(controller) = &self.buffering_controller else {
            return;
        };
        if !self.backend_state.is_started() {
            return;
        }
        if controller.is_buffering() != is_buffering {
            debug!("Ignoring stale buffering edge {}", is_buffering);
            return;
        }

        if !is_buffering {
            self.post_client(|client| (client.buffering_state_cb)(BufferingStatus::HaveEnough));
        } else if self.config.report_buffering_started {
            self.post_client(|client| (client.buffering_state_cb)(BufferingStatus::HaveNothing));
        }

        match (is_buffering, self.backend_state) {
            (true, BackendState::Playing) => {
                info!("Pausing backend to buffer at {}", format_timestamp(self.last_media_time));
                self.pause_backend();
            }
            (false, BackendState::Paused) => {
                info!("Buffering done; resuming at rate {}", self.playback_rate);
                self.apply_playback_rate();
            }
            _ => {}
        }
    }

    fn schedule_time_update(&mut self, delay: Duration) {
        if self.pending_time_update_task {
            return;
        }
        self.pending_time_update_task = true;
        self.runner.post_delayed_weak(delay, self.weak_self.clone(), |inner| {
            inner.borrow_mut().update_media_time();
        });
    }

    fn update_media_time(&mut self) {
        self.pending_time_update_task = false;
        if !self.backend_state.is_started() {
            return;
        }

        if self.statistics_rolling_counter == 0 {
            if let Some(audio) = &self.audio_pipeline {
                audio.update_statistics();
            }
            if let Some(video) = &self.video_pipeline {
                video.update_statistics();
            }
        }
        self.statistics_rolling_counter =
            (self.statistics_rolling_counter + 1) % self.config.statistics_interval_ticks.max(1);

        let interval = self.config.time_update_interval();
        let pts = self.with_backend(|backend| backend.current_pts()).unwrap_or(NO_TIMESTAMP);
        if pts == NO_TIMESTAMP {
            self.schedule_time_update(interval);
            return;
        }

        let sample = Duration::from_micros(pts.max(0) as u64);
        let media_time = if sample < self.last_media_time {
            debug!(
                "Backend clock went back from {} to {}",
                format_timestamp(self.last_media_time),
                format_timestamp(sample)
            );
            self.last_media_time
        } else {
            sample
        };

        if let Some(controller) = &self.buffering_controller {
            controller.set_media_time(media_time);
        }

        let max_rendering_time = if media_time == self.last_media_time {
            media_time
        } else {
            let buffered = self
                .buffering_controller
                .as_ref()
                .and_then(|controller| controller.max_rendering_time())
                .unwrap_or(media_time);
            buffered.min(media_time + interval * 2)
        };

        self.last_media_time = media_time;
        let wall_clock = tokio::time::Instant::now();
        self.post_client(move |client| (client.time_update_cb)(media_time, max_rendering_time, wall_clock));

        self.schedule_time_update(interval);
    }
}
