//! Scriptable in-process backend
//!
//! `FakeBackend` implements [`MediaPipelineBackend`] without touching any
//! hardware. Each backend comes with a [`FakeBackendHandle`] that stays with
//! the caller after the backend itself has been handed to the pipeline; the
//! handle scripts results, feeds presentation timestamps and records every
//! call the pipeline makes.
//!
//! Two clock modes are available: a scripted queue of PTS samples (one per
//! `current_pts` call, the last sample repeats) and a clock that advances
//! with tokio time at the current playback rate.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;
use log::debug;
use tokio::time::Instant;
use crate::backend::{
    AudioCodec, AudioConfig, AudioDecoder, BufferStatus, Decoder, DecoderBuffer, DecoderDelegate,
    DecoderEvent, DecoderStatistics, MediaPipelineBackend, SampleFormat, SharedAudioDecoder,
    SharedVideoDecoder, Size, SoftwareAudioDecoder, SoftwareDecoderFactory, VideoConfig,
    VideoDecoder, NO_TIMESTAMP,
};
use crate::utils::error::{PipelineError, Result};

pub use crate::pipeline::LifecycleLog;

/// Config acceptance predicate for fake decoders
pub type ConfigFilter<C> = Rc<dyn Fn(&C) -> bool>;

/// Backend call, as recorded by the fake
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Initialize,
    Start(i64),
    Stop,
    Pause,
    Resume,
    SetPlaybackRate(f32),
}

/// How a fake decoder answers `push_buffer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Accept immediately
    Accept,

    /// Accept, then hold the push until [`FakeDecoder::complete_pending_push`]
    Hold,

    /// Reject every push
    Reject,
}

/// Fake decoder for either stream kind
pub struct FakeDecoder<C> {
    config: Option<C>,
    config_filter: Option<ConfigFilter<C>>,
    delegate: Option<DecoderDelegate>,
    pushed: Vec<DecoderBuffer>,
    push_mode: PushMode,
    pending_push: bool,
    stats: DecoderStatistics,
    volume: f32,
}

pub type FakeAudioDecoder = FakeDecoder<AudioConfig>;
pub type FakeVideoDecoder = FakeDecoder<VideoConfig>;

impl<C: Clone> FakeDecoder<C> {
    pub fn new() -> Self {
        Self {
            config: None,
            config_filter: None,
            delegate: None,
            pushed: Vec::new(),
            push_mode: PushMode::Accept,
            pending_push: false,
            stats: DecoderStatistics::default(),
            volume: 1.0,
        }
    }

    /// Only accept configurations matching `filter`
    pub fn set_config_filter(&mut self, filter: ConfigFilter<C>) {
        self.config_filter = Some(filter);
    }

    pub fn set_push_mode(&mut self, mode: PushMode) {
        self.push_mode = mode;
    }

    /// Last accepted configuration
    pub fn config(&self) -> Option<&C> {
        self.config.as_ref()
    }

    /// Every buffer pushed so far, including rejected ones
    pub fn pushed_buffers(&self) -> &[DecoderBuffer] {
        &self.pushed
    }

    /// Number of pushed non-EOS buffers
    pub fn pushed_frame_count(&self) -> usize {
        self.pushed.iter().filter(|b| !b.end_of_stream).count()
    }

    pub fn has_pending_push(&self) -> bool {
        self.pending_push
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Finish a held push and notify the delegate
    pub fn complete_pending_push(&mut self) {
        if !self.pending_push {
            return;
        }
        self.pending_push = false;
        self.notify(DecoderEvent::PushBufferComplete(BufferStatus::Success));
    }

    /// Report an unrecoverable decoder failure
    pub fn signal_error(&self) {
        self.notify(DecoderEvent::DecoderError);
    }

    /// Report a new decoded frame size
    pub fn signal_resolution_change(&self, size: Size) {
        self.notify(DecoderEvent::VideoResolutionChanged(size));
    }

    /// Account a dropped frame in the statistics
    pub fn drop_frames(&mut self, count: u64) {
        self.stats.dropped_frames += count;
    }

    fn notify(&self, event: DecoderEvent) {
        if let Some(delegate) = &self.delegate {
            delegate(event);
        }
    }

    fn accept_config(&mut self, config: &C) -> bool {
        if let Some(filter) = &self.config_filter {
            if !filter(config) {
                return false;
            }
        }
        self.config = Some(config.clone());
        true
    }
}

impl<C: Clone> Default for FakeDecoder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clone> Decoder for FakeDecoder<C> {
    fn set_delegate(&mut self, delegate: DecoderDelegate) {
        self.delegate = Some(delegate);
    }

    fn push_buffer(&mut self, buffer: DecoderBuffer) -> BufferStatus {
        let end_of_stream = buffer.end_of_stream;
        let bytes = buffer.data.len() as u64;
        self.pushed.push(buffer);

        if self.push_mode == PushMode::Reject {
            return BufferStatus::Failed;
        }

        if end_of_stream {
            // Rendering is instantaneous here: EOS is reached as soon as it is queued
            self.notify(DecoderEvent::EndOfStream);
        } else {
            self.stats.decoded_bytes += bytes;
            self.stats.decoded_frames += 1;
        }

        match self.push_mode {
            PushMode::Hold => {
                self.pending_push = true;
                BufferStatus::Pending
            }
            _ => BufferStatus::Success,
        }
    }

    fn statistics(&self) -> DecoderStatistics {
        self.stats
    }
}

impl AudioDecoder for FakeAudioDecoder {
    fn set_config(&mut self, config: &AudioConfig) -> bool {
        self.accept_config(config)
    }

    fn set_volume(&mut self, multiplier: f32) -> bool {
        self.volume = multiplier;
        true
    }
}

impl VideoDecoder for FakeVideoDecoder {
    fn set_config(&mut self, config: &VideoConfig) -> bool {
        self.accept_config(config)
    }
}

/// Source of `current_pts` samples
enum PtsSource {
    Scripted {
        samples: VecDeque<i64>,
        last: i64,
    },
    Clock {
        /// PTS at `anchor`, `None` until started
        base_us: Option<i64>,
        anchor: Instant,
        running: bool,
        rate: f32,
    },
}

impl PtsSource {
    fn sample(&mut self) -> i64 {
        match self {
            PtsSource::Scripted { samples, last } => {
                if let Some(next) = samples.pop_front() {
                    *last = next;
                }
                *last
            }
            PtsSource::Clock { base_us, anchor, running, rate } => match base_us {
                None => NO_TIMESTAMP,
                Some(base) if *running => {
                    let elapsed = anchor.elapsed().as_micros() as f64 * *rate as f64;
                    *base + elapsed as i64
                }
                Some(base) => *base,
            },
        }
    }

    /// Re-anchor the clock at the current position
    fn rebase(&mut self) {
        if matches!(self, PtsSource::Scripted { .. }) {
            return;
        }
        let now = self.sample();
        if let PtsSource::Clock { base_us: Some(base), anchor, .. } = self {
            *base = now;
            *anchor = Instant::now();
        }
    }
}

struct FakeBackendState {
    initialize_result: bool,
    start_result: bool,
    stop_result: bool,
    pause_result: bool,
    resume_result: bool,
    fail_audio_decoder: bool,
    fail_video_decoder: bool,
    audio_config_filter: Option<ConfigFilter<AudioConfig>>,
    video_config_filter: Option<ConfigFilter<VideoConfig>>,
    pts: PtsSource,
    calls: Vec<BackendCall>,
    lifecycle: LifecycleLog,
    audio_decoder: Weak<RefCell<FakeAudioDecoder>>,
    video_decoder: Weak<RefCell<FakeVideoDecoder>>,
    alive: bool,
}

/// In-process backend
pub struct FakeBackend {
    state: Rc<RefCell<FakeBackendState>>,

    /// The backend owns its decoders; the state only keeps weak references
    audio_decoder: Option<Rc<RefCell<FakeAudioDecoder>>>,
    video_decoder: Option<Rc<RefCell<FakeVideoDecoder>>>,
}

/// Caller-side control of a [`FakeBackend`]
#[derive(Clone)]
pub struct FakeBackendHandle {
    state: Rc<RefCell<FakeBackendState>>,
}

impl FakeBackend {
    /// Backend with a fresh lifecycle log
    pub fn new() -> (FakeBackend, FakeBackendHandle) {
        Self::with_lifecycle(Rc::new(RefCell::new(Vec::new())))
    }

    /// Backend recording its destruction into `lifecycle`
    pub fn with_lifecycle(lifecycle: LifecycleLog) -> (FakeBackend, FakeBackendHandle) {
        let state = Rc::new(RefCell::new(FakeBackendState {
            initialize_result: true,
            start_result: true,
            stop_result: true,
            pause_result: true,
            resume_result: true,
            fail_audio_decoder: false,
            fail_video_decoder: false,
            audio_config_filter: None,
            video_config_filter: None,
            pts: PtsSource::Scripted {
                samples: VecDeque::new(),
                last: NO_TIMESTAMP,
            },
            calls: Vec::new(),
            lifecycle,
            audio_decoder: Weak::new(),
            video_decoder: Weak::new(),
            alive: true,
        }));

        let backend = FakeBackend {
            state: Rc::clone(&state),
            audio_decoder: None,
            video_decoder: None,
        };
        (backend, FakeBackendHandle { state })
    }

    fn record(&self, call: BackendCall) {
        debug!("Fake backend: {:?}", call);
        self.state.borrow_mut().calls.push(call);
    }
}

impl MediaPipelineBackend for FakeBackend {
    fn create_audio_decoder(&mut self) -> Option<SharedAudioDecoder> {
        let mut state = self.state.borrow_mut();
        if state.fail_audio_decoder {
            return None;
        }

        let decoder = self.audio_decoder.get_or_insert_with(|| {
            let mut decoder = FakeAudioDecoder::new();
            if let Some(filter) = &state.audio_config_filter {
                decoder.set_config_filter(Rc::clone(filter));
            }
            Rc::new(RefCell::new(decoder))
        });
        state.audio_decoder = Rc::downgrade(decoder);

        let shared: SharedAudioDecoder = decoder.clone();
        Some(shared)
    }

    fn create_video_decoder(&mut self) -> Option<SharedVideoDecoder> {
        let mut state = self.state.borrow_mut();
        if state.fail_video_decoder {
            return None;
        }

        let decoder = self.video_decoder.get_or_insert_with(|| {
            let mut decoder = FakeVideoDecoder::new();
            if let Some(filter) = &state.video_config_filter {
                decoder.set_config_filter(Rc::clone(filter));
            }
            Rc::new(RefCell::new(decoder))
        });
        state.video_decoder = Rc::downgrade(decoder);

        let shared: SharedVideoDecoder = decoder.clone();
        Some(shared)
    }

    fn initialize(&mut self) -> bool {
        self.record(BackendCall::Initialize);
        self.state.borrow().initialize_result
    }

    fn start(&mut self, start_pts: i64) -> bool {
        self.record(BackendCall::Start(start_pts));
        let mut state = self.state.borrow_mut();
        if !state.start_result {
            return false;
        }
        if let PtsSource::Clock { base_us, anchor, running, .. } = &mut state.pts {
            *base_us = Some(start_pts);
            *anchor = Instant::now();
            *running = true;
        }
        true
    }

    fn stop(&mut self) -> bool {
        self.record(BackendCall::Stop);
        let mut state = self.state.borrow_mut();
        if let PtsSource::Clock { base_us, running, .. } = &mut state.pts {
            *base_us = None;
            *running = false;
        }
        state.stop_result
    }

    fn pause(&mut self) -> bool {
        self.record(BackendCall::Pause);
        let mut state = self.state.borrow_mut();
        if !state.pause_result {
            return false;
        }
        state.pts.rebase();
        if let PtsSource::Clock { running, .. } = &mut state.pts {
            *running = false;
        }
        true
    }

    fn resume(&mut self) -> bool {
        self.record(BackendCall::Resume);
        let mut state = self.state.borrow_mut();
        if !state.resume_result {
            return false;
        }
        if let PtsSource::Clock { anchor, running, .. } = &mut state.pts {
            *anchor = Instant::now();
            *running = true;
        }
        true
    }

    fn set_playback_rate(&mut self, rate: f32) -> bool {
        self.record(BackendCall::SetPlaybackRate(rate));
        let mut state = self.state.borrow_mut();
        state.pts.rebase();
        if let PtsSource::Clock { rate: current, .. } = &mut state.pts {
            *current = rate;
        }
        true
    }

    fn current_pts(&self) -> i64 {
        self.state.borrow_mut().pts.sample()
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.alive = false;
        state.lifecycle.borrow_mut().push("backend".to_string());
    }
}

impl FakeBackendHandle {
    pub fn set_initialize_result(&self, result: bool) {
        self.state.borrow_mut().initialize_result = result;
    }

    pub fn set_start_result(&self, result: bool) {
        self.state.borrow_mut().start_result = result;
    }

    pub fn set_stop_result(&self, result: bool) {
        self.state.borrow_mut().stop_result = result;
    }

    pub fn set_pause_result(&self, result: bool) {
        self.state.borrow_mut().pause_result = result;
    }

    pub fn set_resume_result(&self, result: bool) {
        self.state.borrow_mut().resume_result = result;
    }

    /// Make `create_audio_decoder` return `None`
    pub fn fail_audio_decoder_creation(&self) {
        self.state.borrow_mut().fail_audio_decoder = true;
    }

    /// Make `create_video_decoder` return `None`
    pub fn fail_video_decoder_creation(&self) {
        self.state.borrow_mut().fail_video_decoder = true;
    }

    /// Filter installed on audio decoders created after this call
    pub fn set_audio_config_filter(&self, filter: impl Fn(&AudioConfig) -> bool + 'static) {
        self.state.borrow_mut().audio_config_filter = Some(Rc::new(filter));
    }

    /// Filter installed on video decoders created after this call
    pub fn set_video_config_filter(&self, filter: impl Fn(&VideoConfig) -> bool + 'static) {
        self.state.borrow_mut().video_config_filter = Some(Rc::new(filter));
    }

    /// Queue PTS samples in microseconds
    pub fn script_pts<I: IntoIterator<Item = i64>>(&self, samples: I) {
        let mut state = self.state.borrow_mut();
        match &mut state.pts {
            PtsSource::Scripted { samples: queue, .. } => queue.extend(samples),
            clock => {
                *clock = PtsSource::Scripted {
                    samples: samples.into_iter().collect(),
                    last: NO_TIMESTAMP,
                }
            }
        }
    }

    /// Queue one PTS sample given as a media time
    pub fn push_media_time(&self, time: Duration) {
        self.script_pts([time.as_micros() as i64]);
    }

    /// Derive PTS from tokio time at the current playback rate
    pub fn use_clock(&self) {
        self.state.borrow_mut().pts = PtsSource::Clock {
            base_us: None,
            anchor: Instant::now(),
            running: false,
            rate: 1.0,
        };
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn audio_decoder(&self) -> Option<Rc<RefCell<FakeAudioDecoder>>> {
        self.state.borrow().audio_decoder.upgrade()
    }

    pub fn video_decoder(&self) -> Option<Rc<RefCell<FakeVideoDecoder>>> {
        self.state.borrow().video_decoder.upgrade()
    }

    pub fn lifecycle(&self) -> LifecycleLog {
        Rc::clone(&self.state.borrow().lifecycle)
    }

    /// Whether the backend has not been dropped yet
    pub fn is_alive(&self) -> bool {
        self.state.borrow().alive
    }
}

/// Software "decoder" widening every coded byte into one S16 sample
///
/// Bytes are treated as unsigned 8-bit PCM centered on 128.
pub struct FakePcmDecoder {
    output: AudioConfig,
}

impl SoftwareAudioDecoder for FakePcmDecoder {
    fn decode(&mut self, buffer: &DecoderBuffer) -> Result<DecoderBuffer> {
        if buffer.data.is_empty() {
            return Err(PipelineError::Decode(format!("empty buffer at {:?}", buffer.timestamp)));
        }

        let pcm = buffer
            .data
            .iter()
            .flat_map(|b| ((i16::from(*b) - 128) << 8).to_le_bytes())
            .collect();
        let mut decoded = DecoderBuffer::new(buffer.timestamp, buffer.duration, pcm);
        decoded.decrypt_context = buffer.decrypt_context.clone();
        Ok(decoded)
    }

    fn output_config(&self) -> AudioConfig {
        self.output.clone()
    }
}

/// Factory producing [`FakePcmDecoder`]s for every compressed codec
pub struct FakePcmDecoderFactory;

impl SoftwareDecoderFactory for FakePcmDecoderFactory {
    fn create(&self, config: &AudioConfig) -> Option<Box<dyn SoftwareAudioDecoder>> {
        if config.codec == AudioCodec::Pcm || config.codec == AudioCodec::Unknown {
            return None;
        }
        let output = AudioConfig::new(AudioCodec::Pcm, SampleFormat::S16, config.channels, config.samples_per_second);
        Some(Box::new(FakePcmDecoder { output }))
    }
}
