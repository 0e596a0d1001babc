//! End-to-end tests for the castmedia pipeline coordinator
//!
//! These tests drive a real coordinator against the in-process backend:
//! - URL and source-buffer playback with buffering edges
//! - Flush, including flushes abandoned by stop
//! - Backend failures and the transient "no timestamp" clock
//! - Media clock monotonicity and extrapolation bounds

use anyhow::Result;
use castmedia::backend::fake::{BackendCall, FakeBackend};
use castmedia::backend::NO_TIMESTAMP;
use castmedia::pipeline::{BackendState, BufferingStatus, LoadType};
use castmedia::runner::TaskRunner;
use castmedia::utils::{PipelineConfig, PipelineError};
use castmedia_integration_tests::{counting_done, ms, settle, ClientEvent, Harness};
use std::time::Duration;
use tokio::task::LocalSet;
use tokio::time::sleep;

/// Default time-update period
const PERIOD: Duration = Duration::from_millis(250);

fn assert_non_decreasing(times: &[(Duration, Duration)]) {
    for pair in times.windows(2) {
        assert!(pair[0].0 <= pair[1].0, "media time went back: {:?} -> {:?}", pair[0].0, pair[1].0);
    }
}

fn assert_extrapolation_capped(times: &[(Duration, Duration)]) {
    for (media_time, max_rendering_time) in times {
        assert!(
            *max_rendering_time <= *media_time + PERIOD * 2,
            "max rendering time {:?} too far past {:?}",
            max_rendering_time,
            media_time
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_url_load_happy_path() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Url)?;
            assert_eq!(harness.client.events(), vec![ClientEvent::BackendCreated]);
            assert!(harness.pipeline.has_audio());
            assert!(harness.pipeline.has_video());

            // Below the 6 s high watermark
            harness.feed(ms(0), ms(5000));
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            assert_eq!(
                harness.backend.calls()[..2],
                [BackendCall::Initialize, BackendCall::Start(0)]
            );
            settle().await;

            assert!(harness.pipeline.is_buffering());
            assert_eq!(harness.pipeline.backend_state(), BackendState::Paused);
            assert!(harness.client.buffering_events().is_empty());

            harness.feed(ms(5000), ms(7000));
            settle().await;

            assert!(!harness.pipeline.is_buffering());
            assert_eq!(harness.pipeline.backend_state(), BackendState::Playing);
            assert_eq!(harness.client.buffering_events(), vec![BufferingStatus::HaveEnough]);

            harness.backend.script_pts([0, 250_000, 500_000, 750_000]);
            sleep(ms(1000)).await;

            let media_times: Vec<Duration> = harness.client.time_updates().iter().map(|(media, _)| *media).collect();
            assert!(media_times.len() >= 4);
            assert_eq!(media_times[..4], [ms(0), ms(250), ms(500), ms(750)]);
            assert_extrapolation_capped(&harness.client.time_updates());

            harness.pipeline.stop();
            assert_eq!(harness.pipeline.backend_state(), BackendState::Uninitialized);
            assert!(!harness.backend.is_alive());
            settle().await;
            assert_eq!(harness.client.count(&ClientEvent::BackendDestroyed), 1);
            assert!(harness.client.errors().is_empty());
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_source_buffer_pause_resume() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::MediaSource)?;
            harness.backend.use_clock();
            harness.feed(ms(0), ms(10_000));

            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;
            assert!(!harness.pipeline.is_buffering());
            assert_eq!(harness.pipeline.backend_state(), BackendState::Playing);
            assert_eq!(harness.client.buffering_events(), vec![BufferingStatus::HaveEnough]);

            sleep(ms(500)).await;
            harness.pipeline.set_playback_rate(0.0);
            assert_eq!(harness.pipeline.backend_state(), BackendState::Paused);

            // Let the clock task observe the paused position
            sleep(PERIOD * 2).await;
            let paused_at = harness.pipeline.media_time();
            assert!(paused_at >= ms(400), "paused at {:?}", paused_at);
            sleep(PERIOD * 2).await;
            assert_eq!(harness.pipeline.media_time(), paused_at);

            harness.pipeline.set_playback_rate(1.0);
            assert_eq!(harness.pipeline.backend_state(), BackendState::Playing);
            sleep(PERIOD * 3).await;
            assert!(harness.pipeline.media_time() > paused_at);

            let calls = harness.backend.calls();
            assert!(calls.contains(&BackendCall::Pause));
            assert!(calls.contains(&BackendCall::Resume));

            let updates = harness.client.time_updates();
            assert_non_decreasing(&updates);
            assert_extrapolation_capped(&updates);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_flush_during_playback() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Url)?;
            harness.feed(ms(0), ms(8000));
            harness.end_of_stream();
            harness.backend.script_pts([1_200_000]);

            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;
            assert_eq!(harness.pipeline.backend_state(), BackendState::Playing);
            assert_eq!(harness.pipeline.media_time(), ms(1200));

            harness.audio.set_hold_flush(true);
            harness.video.set_hold_flush(true);
            harness.backend.clear_calls();

            let (done, on_done) = counting_done();
            harness.pipeline.flush(on_done)?;
            assert_eq!(harness.backend.calls(), vec![BackendCall::Stop]);
            assert_eq!(harness.pipeline.backend_state(), BackendState::Initialized);
            assert_eq!(harness.pipeline.pending_flush(), Some((false, false)));

            assert!(harness.audio.complete_flush());
            settle().await;
            assert_eq!(harness.pipeline.pending_flush(), Some((true, false)));
            assert_eq!(done.get(), 0);

            assert!(harness.video.complete_flush());
            settle().await;
            assert_eq!(harness.pipeline.pending_flush(), None);
            assert_eq!(done.get(), 1);

            // Playback restarts where it left off
            harness.feed(ms(1200), ms(8000));
            harness.end_of_stream();
            harness.pipeline.start_playing_from(ms(1200))?;
            settle().await;
            assert_eq!(harness.pipeline.backend_state(), BackendState::Playing);
            assert!(harness.backend.calls().contains(&BackendCall::Start(1_200_000)));

            sleep(PERIOD * 2).await;
            assert_eq!(done.get(), 1);
            assert!(harness.client.errors().is_empty());
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_backend_start_failure() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Url)?;
            harness.backend.set_start_result(false);

            let result = harness.pipeline.start_playing_from(Duration::ZERO);
            assert!(matches!(result, Err(PipelineError::Abort)));
            assert_eq!(harness.pipeline.backend_state(), BackendState::Initialized);
            settle().await;
            assert_eq!(harness.client.errors(), vec!["Pipeline abort".to_string()]);

            harness.pipeline.stop();
            settle().await;
            assert_eq!(harness.pipeline.backend_state(), BackendState::Uninitialized);
            assert_eq!(harness.client.count(&ClientEvent::BackendDestroyed), 1);
            assert!(!harness.backend.is_alive());
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_transient_no_timestamp() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Other)?;
            harness
                .backend
                .script_pts([NO_TIMESTAMP, NO_TIMESTAMP, NO_TIMESTAMP, 1_000_000]);

            harness.pipeline.start_playing_from(Duration::ZERO)?;

            // Ticks at 0, 250 and 500 ms see no timestamp
            sleep(ms(600)).await;
            assert!(harness.client.time_updates().is_empty());
            assert_eq!(harness.pipeline.media_time(), Duration::ZERO);

            sleep(ms(200)).await;
            let updates = harness.client.time_updates();
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0].0, ms(1000));
            assert_eq!(harness.pipeline.media_time(), ms(1000));
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_pending_flush() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let mut harness = Harness::new(LoadType::Other)?;
            harness.feed(ms(0), ms(2000));
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;

            harness.video.set_hold_flush(true);
            let (done, on_done) = counting_done();
            harness.pipeline.flush(on_done)?;
            settle().await;
            assert_eq!(harness.pipeline.pending_flush(), Some((true, false)));

            harness.pipeline.stop();
            assert_eq!(harness.pipeline.pending_flush(), None);
            assert_eq!(harness.pipeline.backend_state(), BackendState::Uninitialized);
            assert!(!harness.backend.is_alive());

            // The provider's completion arrives after its pipeline is gone
            assert!(harness.video.complete_flush());
            sleep(PERIOD).await;
            assert_eq!(done.get(), 0);
            assert_eq!(harness.client.count(&ClientEvent::BackendDestroyed), 1);

            harness.reinitialize(LoadType::Other)?;
            assert_eq!(harness.client.count(&ClientEvent::BackendCreated), 2);
            harness.feed(ms(0), ms(2000));
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;
            assert_eq!(harness.pipeline.backend_state(), BackendState::Playing);
            assert_eq!(done.get(), 0);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_destruction_order_without_stop() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Url)?;
            harness.feed(ms(0), ms(1000));
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;

            let lifecycle = harness.lifecycle.clone();
            let client = harness.client.clone();
            drop(harness);

            assert_eq!(
                *lifecycle.borrow(),
                vec![
                    "audio provider".to_string(),
                    "video provider".to_string(),
                    "backend".to_string()
                ]
            );
            settle().await;
            assert_eq!(client.count(&ClientEvent::BackendDestroyed), 1);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_single_flush_at_a_time() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Other)?;
            harness.feed(ms(0), ms(1000));
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;

            harness.audio.set_hold_flush(true);
            let (first, on_first) = counting_done();
            harness.pipeline.flush(on_first)?;

            let (second, on_second) = counting_done();
            assert!(matches!(
                harness.pipeline.flush(on_second),
                Err(PipelineError::InvalidState(_))
            ));
            assert!(matches!(
                harness.pipeline.start_playing_from(Duration::ZERO),
                Err(PipelineError::InvalidState(_))
            ));

            harness.audio.complete_flush();
            sleep(PERIOD).await;
            assert_eq!(first.get(), 1);
            assert_eq!(second.get(), 0);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_media_time_never_goes_back() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Url)?;
            harness.feed(ms(0), ms(8000));
            harness.end_of_stream();
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;

            harness.backend.script_pts([500_000, 300_000, 800_000, 2_000_000]);
            sleep(ms(1000)).await;

            let updates = harness.client.time_updates();
            let media_times: Vec<Duration> = updates.iter().map(|(media, _)| *media).collect();
            assert_eq!(media_times[..4], [ms(500), ms(500), ms(800), ms(2000)]);

            // An unmoved clock does not extrapolate
            assert_eq!(updates[1].1, ms(500));
            assert_non_decreasing(&updates);
            assert_extrapolation_capped(&updates);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_buffering_end_keeps_zero_rate_paused() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Url)?;
            harness.feed(ms(0), ms(1000));
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;
            assert!(harness.pipeline.is_buffering());
            assert_eq!(harness.pipeline.backend_state(), BackendState::Paused);

            harness.pipeline.set_playback_rate(0.0);
            harness.backend.clear_calls();

            harness.feed(ms(1000), ms(8000));
            settle().await;
            assert!(!harness.pipeline.is_buffering());
            assert_eq!(harness.client.buffering_events(), vec![BufferingStatus::HaveEnough]);
            assert_eq!(harness.pipeline.backend_state(), BackendState::Paused);
            assert!(!harness.backend.calls().contains(&BackendCall::Resume));

            harness.pipeline.set_playback_rate(1.0);
            assert_eq!(harness.pipeline.backend_state(), BackendState::Playing);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_buffering_started_edge_reported_when_enabled() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let config = PipelineConfig {
                report_buffering_started: true,
                ..PipelineConfig::default()
            };
            let harness = Harness::with_config(LoadType::Url, config)?;
            harness.feed(ms(0), ms(1000));
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;
            assert_eq!(harness.client.buffering_events(), vec![BufferingStatus::HaveNothing]);

            harness.feed(ms(1000), ms(8000));
            settle().await;
            assert_eq!(
                harness.client.buffering_events(),
                vec![BufferingStatus::HaveNothing, BufferingStatus::HaveEnough]
            );
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_statistics_reported_every_few_ticks() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Other)?;
            harness.feed(ms(0), ms(400));
            harness.pipeline.start_playing_from(Duration::ZERO)?;

            // Statistics are pulled on the first tick and again four ticks later
            sleep(PERIOD * 4 + ms(1)).await;

            // 20 audio frames and 10 video frames of 16 bytes each
            let audio = *harness.audio_stream.statistics.borrow();
            let video = *harness.video_stream.statistics.borrow();
            assert_eq!(audio.audio_bytes_decoded, 320);
            assert_eq!(video.video_frames_decoded, 10);
            assert_eq!(video.video_bytes_decoded, 160);

            harness.feed(ms(400), ms(800));
            sleep(PERIOD * 4).await;
            assert_eq!(harness.video_stream.statistics.borrow().video_frames_decoded, 20);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_end_of_stream_reported() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Url)?;
            harness.feed(ms(0), ms(500));
            harness.end_of_stream();
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;

            assert_eq!(harness.audio_stream.eos.get(), 1);
            assert_eq!(harness.video_stream.eos.get(), 1);

            // Both streams at end of stream: nothing left to wait for
            assert!(!harness.pipeline.is_buffering());
            assert_eq!(harness.pipeline.backend_state(), BackendState::Playing);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_decoder_creation_failure() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let pipeline = castmedia::MediaPipeline::new(TaskRunner::current(), PipelineConfig::default());
            let (backend, handle) = FakeBackend::new();
            handle.fail_video_decoder_creation();
            pipeline.initialize(LoadType::Url, Box::new(backend))?;

            let (provider, _feed) = castmedia::pipeline::QueueFrameProvider::new();
            let result = pipeline.initialize_video(
                vec![castmedia::backend::VideoConfig::new(
                    castmedia::backend::VideoCodec::Vp9,
                    castmedia::backend::Size::new(640, 360),
                )],
                Default::default(),
                Box::new(provider),
            );
            assert!(matches!(result, Err(PipelineError::Abort)));
            assert!(!pipeline.has_video());
            anyhow::Ok(())
        })
        .await
}

#[test]
fn test_off_runner_access_is_rejected() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let runner = LocalSet::new().block_on(&runtime, async { TaskRunner::current() });
    let outcome = std::thread::spawn(move || runner.check_on_runner()).join();
    assert!(outcome.is_err());
}
