//! Integration test utilities for castmedia
//!
//! This module provides the pieces the end-to-end tests share:
//! - A recording client that captures every coordinator callback
//! - A harness wiring a coordinator to the in-process backend and two
//!   queue-fed streams
//! - Helpers to feed frames and let posted tasks run

use anyhow::Result;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use castmedia::backend::fake::{FakeBackend, FakeBackendHandle, LifecycleLog};
use castmedia::backend::{AudioCodec, AudioConfig, DecoderBuffer, SampleFormat, Size, VideoCodec, VideoConfig};
use castmedia::pipeline::{
    AvPipelineClient, BufferingStatus, LoadType, MediaPipeline, MediaPipelineClient, PipelineStatistics,
    QueueFrameProvider, QueueFrameProviderHandle, VideoPipelineClient,
};
use castmedia::runner::TaskRunner;
use castmedia::utils::{PipelineConfig, PipelineError};

pub const AUDIO_FRAME: Duration = Duration::from_millis(20);
pub const VIDEO_FRAME: Duration = Duration::from_millis(40);

/// One coordinator callback as seen by the client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Error(String),
    Buffering(BufferingStatus),
    TimeUpdate {
        media_time: Duration,
        max_rendering_time: Duration,
    },
    BackendCreated,
    BackendDestroyed,
}

/// Client that records every callback in arrival order
#[derive(Clone, Default)]
pub struct RecordingClient {
    events: Rc<RefCell<Vec<ClientEvent>>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback bundle feeding this recorder
    pub fn client(&self) -> MediaPipelineClient {
        let (error, buffering, time, created, destroyed) = (
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
        );

        MediaPipelineClient {
            error_cb: Box::new(move |err: PipelineError| error.record(ClientEvent::Error(err.to_string()))),
            buffering_state_cb: Box::new(move |status: BufferingStatus| {
                buffering.record(ClientEvent::Buffering(status))
            }),
            time_update_cb: Box::new(
                move |media_time: Duration, max_rendering_time: Duration, _wall_clock: tokio::time::Instant| {
                    time.record(ClientEvent::TimeUpdate {
                        media_time,
                        max_rendering_time,
                    })
                },
            ),
            pipeline_backend_created_cb: Box::new(move || created.record(ClientEvent::BackendCreated)),
            pipeline_backend_destroyed_cb: Box::new(move || destroyed.record(ClientEvent::BackendDestroyed)),
        }
    }

    fn record(&self, event: ClientEvent) {
        self.events.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.borrow().clone()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    /// `(media_time, max_rendering_time)` of every time update
    pub fn time_updates(&self) -> Vec<(Duration, Duration)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ClientEvent::TimeUpdate {
                    media_time,
                    max_rendering_time,
                } => Some((*media_time, *max_rendering_time)),
                _ => None,
            })
            .collect()
    }

    pub fn buffering_events(&self) -> Vec<BufferingStatus> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ClientEvent::Buffering(status) => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ClientEvent::Error(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &ClientEvent) -> usize {
        self.events.borrow().iter().filter(|event| *event == wanted).count()
    }
}

/// Per-stream callbacks folded into counters
#[derive(Clone, Default)]
pub struct StreamRecorder {
    pub eos: Rc<Cell<u32>>,
    pub waiting_for_key: Rc<Cell<u32>>,
    pub statistics: Rc<RefCell<PipelineStatistics>>,
}

impl StreamRecorder {
    pub fn client(&self) -> AvPipelineClient {
        let (eos, key, statistics) = (
            Rc::clone(&self.eos),
            Rc::clone(&self.waiting_for_key),
            Rc::clone(&self.statistics),
        );
        AvPipelineClient {
            eos_cb: Box::new(move || eos.set(eos.get() + 1)),
            wait_for_key_cb: Box::new(move || key.set(key.get() + 1)),
            statistics_cb: Box::new(move |delta: PipelineStatistics| statistics.borrow_mut().merge(&delta)),
        }
    }
}

/// Coordinator wired to a fake backend and two queue-fed streams
pub struct Harness {
    pub pipeline: MediaPipeline,
    pub backend: FakeBackendHandle,
    pub client: RecordingClient,
    pub audio: QueueFrameProviderHandle,
    pub video: QueueFrameProviderHandle,
    pub audio_stream: StreamRecorder,
    pub video_stream: StreamRecorder,

    /// Drop order of providers and backend
    pub lifecycle: LifecycleLog,
}

impl Harness {
    /// Audio and video streams on the default configuration
    pub fn new(load_type: LoadType) -> Result<Self> {
        Self::with_config(load_type, PipelineConfig::default())
    }

    /// Audio and video streams; must run inside a `LocalSet`
    pub fn with_config(load_type: LoadType, config: PipelineConfig) -> Result<Self> {
        let pipeline = MediaPipeline::new(TaskRunner::current(), config);
        let client = RecordingClient::new();
        pipeline.set_client(client.client());

        let lifecycle: LifecycleLog = Rc::new(RefCell::new(Vec::new()));
        let (backend, backend_handle) = FakeBackend::with_lifecycle(Rc::clone(&lifecycle));
        pipeline.initialize(load_type, Box::new(backend))?;

        let audio_stream = StreamRecorder::default();
        let video_stream = StreamRecorder::default();
        let (audio, video) = initialize_streams(&pipeline, &lifecycle, &audio_stream, &video_stream)?;

        Ok(Self {
            pipeline,
            backend: backend_handle,
            client,
            audio,
            video,
            audio_stream,
            video_stream,
            lifecycle,
        })
    }

    /// Install a fresh backend and streams after `stop`
    pub fn reinitialize(&mut self, load_type: LoadType) -> Result<()> {
        let (backend, backend_handle) = FakeBackend::with_lifecycle(Rc::clone(&self.lifecycle));
        self.pipeline.initialize(load_type, Box::new(backend))?;
        self.backend = backend_handle;

        let (audio, video) = initialize_streams(&self.pipeline, &self.lifecycle, &self.audio_stream, &self.video_stream)?;
        self.audio = audio;
        self.video = video;
        Ok(())
    }

    /// Queue audio and video frames covering `[from, until)`
    pub fn feed(&self, from: Duration, until: Duration) {
        feed(&self.audio, from, until, AUDIO_FRAME);
        feed(&self.video, from, until, VIDEO_FRAME);
    }

    /// Queue end of stream on both streams
    pub fn end_of_stream(&self) {
        self.audio.push_end_of_stream();
        self.video.push_end_of_stream();
    }
}

/// Create both sub-pipelines with fresh providers, returning the feeds
fn initialize_streams(
    pipeline: &MediaPipeline,
    lifecycle: &LifecycleLog,
    audio_stream: &StreamRecorder,
    video_stream: &StreamRecorder,
) -> Result<(QueueFrameProviderHandle, QueueFrameProviderHandle)> {
    let (audio_provider, audio) = QueueFrameProvider::new();
    pipeline.initialize_audio(
        AudioConfig::new(AudioCodec::Aac, SampleFormat::S16, 2, 48000),
        audio_stream.client(),
        Box::new(audio_provider.with_lifecycle(Rc::clone(lifecycle), "audio provider")),
    )?;

    let (video_provider, video) = QueueFrameProvider::new();
    pipeline.initialize_video(
        vec![VideoConfig::new(VideoCodec::H264, Size::new(1280, 720))],
        VideoPipelineClient {
            av_pipeline_client: video_stream.client(),
            natural_size_changed_cb: None,
        },
        Box::new(video_provider.with_lifecycle(Rc::clone(lifecycle), "video provider")),
    )?;

    Ok((audio, video))
}

/// Queue frames of `frame` length covering `[from, until)`
pub fn feed(handle: &QueueFrameProviderHandle, from: Duration, until: Duration, frame: Duration) {
    let mut timestamp = from;
    while timestamp < until {
        handle.push_buffer(DecoderBuffer::new(timestamp, frame, vec![0u8; 16]));
        timestamp += frame;
    }
}

/// Flush callback that counts its invocations
pub fn counting_done() -> (Rc<Cell<u32>>, impl FnOnce() + 'static) {
    let count = Rc::new(Cell::new(0));
    let sink = Rc::clone(&count);
    (count, move || sink.set(sink.get() + 1))
}

/// Let every posted task run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
