use anyhow::{Context, Result};
use env_logger::Env;
use log::{info, warn, error};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use castmedia::backend::fake::FakeBackend;
use castmedia::backend::{AudioCodec, AudioConfig, DecoderBuffer, SampleFormat, Size, VideoCodec, VideoConfig};
use castmedia::pipeline::{
    AvPipelineClient, BufferingStatus, LoadType, MediaPipeline, MediaPipelineClient, PipelineStatistics,
    QueueFrameProvider, QueueFrameProviderHandle, VideoPipelineClient,
};
use castmedia::runner::TaskRunner;
use castmedia::utils::{format_timestamp, PipelineConfig, PipelineError};

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);

/// Extra media queued past the end of the run so buffering can finish
const PREROLL: Duration = Duration::from_secs(10);

/// castmedia demo - drives the pipeline against the in-process backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// How the media is loaded; selects the buffering watermarks
    #[arg(short, long, value_enum, default_value = "url")]
    load_type: LoadTypeArg,

    /// How long to play, in milliseconds
    #[arg(long, default_value = "3000")]
    duration_ms: u64,

    /// Playback rate (0 pauses)
    #[arg(short, long, default_value = "1.0")]
    rate: f32,

    /// Flush and restart at this point of the run, in milliseconds
    #[arg(long, value_name = "MS")]
    flush_at_ms: Option<u64>,

    /// Pipeline config file (TOML); defaults to the user config
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LoadTypeArg {
    Url,
    MediaSource,
    Other,
}

impl From<LoadTypeArg> for LoadType {
    fn from(arg: LoadTypeArg) -> Self {
        match arg {
            LoadTypeArg::Url => LoadType::Url,
            LoadTypeArg::MediaSource => LoadType::MediaSource,
            LoadTypeArg::Other => LoadType::Other,
        }
    }
}

/// What the client observed during the run
#[derive(Debug, Default, Serialize)]
struct RunSummary {
    time_updates: u64,
    last_media_time_ms: u64,
    buffering_have_enough: u32,
    buffering_have_nothing: u32,
    audio_eos: bool,
    video_eos: bool,
    errors: Vec<String>,
    statistics: PipelineStatistics,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("Starting castmedia demo v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => PipelineConfig::load()?,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("Failed to build media runtime")?;

    let local = tokio::task::LocalSet::new();
    let summary = local.block_on(&runtime, run(&args, config))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            "Done: {} time updates, media time {}ms, {} errors",
            summary.time_updates,
            summary.last_media_time_ms,
            summary.errors.len()
        );
    }

    Ok(())
}

async fn run(args: &Args, config: PipelineConfig) -> Result<RunSummary> {
    let runner = TaskRunner::current();
    let summary = Rc::new(RefCell::new(RunSummary::default()));

    let (backend, backend_handle) = FakeBackend::new();
    backend_handle.use_clock();

    let pipeline = MediaPipeline::new(runner, config);
    pipeline.set_client(media_client(&summary));
    pipeline.initialize(args.load_type.into(), Box::new(backend))?;

    let run_length = Duration::from_millis(args.duration_ms);

    let (audio_provider, audio_feed) = QueueFrameProvider::new();
    pipeline.initialize_audio(
        AudioConfig::new(AudioCodec::Aac, SampleFormat::S16, 2, 48000),
        stream_client(&summary, true),
        Box::new(audio_provider),
    )?;

    let (video_provider, video_feed) = QueueFrameProvider::new();
    pipeline.initialize_video(
        vec![VideoConfig::new(VideoCodec::H264, Size::new(1280, 720))],
        VideoPipelineClient {
            av_pipeline_client: stream_client(&summary, false),
            natural_size_changed_cb: Some(Box::new(|size: Size| info!("Natural size {}x{}", size.width, size.height))),
        },
        Box::new(video_provider),
    )?;

    let end = run_length + PREROLL;
    feed(&audio_feed, Duration::ZERO, end, AUDIO_FRAME);
    feed(&video_feed, Duration::ZERO, end, VIDEO_FRAME);

    pipeline.set_playback_rate(args.rate);
    pipeline.start_playing_from(Duration::ZERO)?;

    let mut elapsed = Duration::ZERO;
    if let Some(flush_at) = args.flush_at_ms.map(Duration::from_millis) {
        let flush_at = flush_at.min(run_length);
        tokio::time::sleep(flush_at).await;
        elapsed = flush_at;

        let resume_at = pipeline.media_time();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        pipeline.flush(move || {
            let _ = done_tx.send(());
        })?;
        done_rx.await.context("Flush was discarded")?;
        info!("Flushed; restarting at {}", format_timestamp(resume_at));

        feed(&audio_feed, resume_at, resume_at + end, AUDIO_FRAME);
        feed(&video_feed, resume_at, resume_at + end, VIDEO_FRAME);
        pipeline.start_playing_from(resume_at)?;
    }

    tokio::time::sleep(run_length.saturating_sub(elapsed)).await;

    if pipeline.is_buffering() {
        warn!("Run ended while buffering");
    }
    pipeline.stop();

    // Let the posted backend-destroyed notification run
    tokio::time::sleep(Duration::from_millis(1)).await;
    drop(pipeline);

    let summary = summary.replace(RunSummary::default());
    Ok(summary)
}

/// Queue frames covering `[from, until)` followed by end of stream
fn feed(handle: &QueueFrameProviderHandle, from: Duration, until: Duration, frame: Duration) {
    let mut timestamp = from;
    while timestamp < until {
        handle.push_buffer(DecoderBuffer::new(timestamp, frame, vec![0u8; 64]));
        timestamp += frame;
    }
    handle.push_end_of_stream();
}

fn media_client(summary: &Rc<RefCell<RunSummary>>) -> MediaPipelineClient {
    let on_error = Rc::clone(summary);
    let on_buffering = Rc::clone(summary);
    let on_time = Rc::clone(summary);

    MediaPipelineClient {
        error_cb: Box::new(move |err: PipelineError| {
            error!("Pipeline error: {}", err);
            on_error.borrow_mut().errors.push(err.to_string());
        }),
        buffering_state_cb: Box::new(move |status: BufferingStatus| {
            info!("Buffering: {:?}", status);
            let mut summary = on_buffering.borrow_mut();
            match status {
                BufferingStatus::HaveEnough => summary.buffering_have_enough += 1,
                BufferingStatus::HaveNothing => summary.buffering_have_nothing += 1,
            }
        }),
        time_update_cb: Box::new(move |media_time: Duration, max_rendering_time: Duration, _wall_clock: tokio::time::Instant| {
            log::debug!(
                "Media time {} (renderable up to {})",
                format_timestamp(media_time),
                format_timestamp(max_rendering_time)
            );
            let mut summary = on_time.borrow_mut();
            summary.time_updates += 1;
            summary.last_media_time_ms = media_time.as_millis() as u64;
        }),
        pipeline_backend_created_cb: Box::new(|| info!("Backend created")),
        pipeline_backend_destroyed_cb: Box::new(|| info!("Backend destroyed")),
    }
}

fn stream_client(summary: &Rc<RefCell<RunSummary>>, is_audio: bool) -> AvPipelineClient {
    let on_eos = Rc::clone(summary);
    let on_statistics = Rc::clone(summary);
    let stream = if is_audio { "audio" } else { "video" };

    AvPipelineClient {
        eos_cb: Box::new(move || {
            info!("End of {} stream", stream);
            let mut summary = on_eos.borrow_mut();
            if is_audio {
                summary.audio_eos = true;
            } else {
                summary.video_eos = true;
            }
        }),
        wait_for_key_cb: Box::new(move || warn!("{} stream waiting for a key", stream)),
        statistics_cb: Box::new(move |delta: PipelineStatistics| on_statistics.borrow_mut().statistics.merge(&delta)),
    }
}
