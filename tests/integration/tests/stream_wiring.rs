//! Coordinator settings that have to reach the sub-pipelines
//!
//! Decryption contexts, volume and the software decoder factory are all
//! set on the coordinator and only observable at the backend decoders.

use anyhow::Result;
use castmedia::backend::fake::{FakeBackend, FakePcmDecoderFactory};
use castmedia::backend::{AudioCodec, AudioConfig, CdmHandle, DecoderBuffer, DecryptConfig, SampleFormat};
use castmedia::pipeline::{AvPipelineClient, LoadType, MediaPipeline, QueueFrameProvider};
use castmedia::runner::TaskRunner;
use castmedia::utils::{PipelineConfig, PipelineError};
use castmedia_integration_tests::{ms, settle, Harness, RecordingClient, AUDIO_FRAME, VIDEO_FRAME};
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;
use tokio::time::sleep;

fn encrypted(timestamp: Duration, duration: Duration) -> DecoderBuffer {
    DecoderBuffer::new(timestamp, duration, vec![1u8; 16]).with_decrypt_config(DecryptConfig {
        key_id: vec![7],
        iv: vec![0; 16],
    })
}

#[tokio::test(start_paused = true)]
async fn test_cdm_set_before_streams_is_installed_on_creation() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let mut harness = Harness::new(LoadType::Other)?;
            harness.pipeline.stop();
            settle().await;

            // Streams created after this pick the context up
            harness.pipeline.set_cdm(CdmHandle::new(7));
            harness.reinitialize(LoadType::Other)?;

            harness.audio.push_buffer(encrypted(Duration::ZERO, AUDIO_FRAME));
            harness.video.push_buffer(encrypted(Duration::ZERO, VIDEO_FRAME));
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;

            let audio = harness.backend.audio_decoder().expect("audio decoder");
            let video = harness.backend.video_decoder().expect("video decoder");
            assert_eq!(audio.borrow().pushed_buffers()[0].decrypt_context, Some(CdmHandle::new(7)));
            assert_eq!(video.borrow().pushed_buffers()[0].decrypt_context, Some(CdmHandle::new(7)));
            assert_eq!(harness.audio_stream.waiting_for_key.get(), 0);
            assert_eq!(harness.video_stream.waiting_for_key.get(), 0);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_cdm_reaches_running_streams_waiting_for_key() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Other)?;
            harness.audio.push_buffer(encrypted(Duration::ZERO, AUDIO_FRAME));
            harness.video.push_buffer(encrypted(Duration::ZERO, VIDEO_FRAME));
            harness.pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;

            let audio = harness.backend.audio_decoder().expect("audio decoder");
            let video = harness.backend.video_decoder().expect("video decoder");
            assert_eq!(harness.audio_stream.waiting_for_key.get(), 1);
            assert_eq!(harness.video_stream.waiting_for_key.get(), 1);
            assert_eq!(audio.borrow().pushed_frame_count(), 0);
            assert_eq!(video.borrow().pushed_frame_count(), 0);

            harness.pipeline.set_cdm(CdmHandle::new(3));
            settle().await;

            assert_eq!(audio.borrow().pushed_buffers()[0].decrypt_context, Some(CdmHandle::new(3)));
            assert_eq!(video.borrow().pushed_buffers()[0].decrypt_context, Some(CdmHandle::new(3)));
            assert!(harness.client.errors().is_empty());
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_volume_forwarded_to_audio_decoder() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::new(LoadType::Url)?;
            let audio = harness.backend.audio_decoder().expect("audio decoder");
            assert_eq!(audio.borrow().volume(), 1.0);

            harness.pipeline.set_volume(0.5);
            assert_eq!(audio.borrow().volume(), 0.5);

            // No audio stream: nothing to forward to
            harness.pipeline.stop();
            harness.pipeline.set_volume(0.1);
            assert_eq!(audio.borrow().volume(), 0.5);
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_software_factory_reaches_audio_stream() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            let opus = AudioConfig::new(AudioCodec::Opus, SampleFormat::F32, 2, 48000);

            // Without a factory the backend's PCM-only decoder refuses Opus
            let pipeline = MediaPipeline::new(TaskRunner::current(), PipelineConfig::default());
            let (backend, handle) = FakeBackend::new();
            handle.set_audio_config_filter(|config: &AudioConfig| config.codec == AudioCodec::Pcm);
            pipeline.initialize(LoadType::Other, Box::new(backend))?;
            let (provider, _feed) = QueueFrameProvider::new();
            let result = pipeline.initialize_audio(opus.clone(), AvPipelineClient::default(), Box::new(provider));
            assert!(matches!(result, Err(PipelineError::InitializationFailed(_))));
            assert!(!pipeline.has_audio());
            drop(pipeline);

            let client = RecordingClient::new();
            let pipeline = MediaPipeline::new(TaskRunner::current(), PipelineConfig::default());
            pipeline.set_client(client.client());
            pipeline.set_software_decoder_factory(Rc::new(FakePcmDecoderFactory));
            let (backend, handle) = FakeBackend::new();
            handle.set_audio_config_filter(|config: &AudioConfig| config.codec == AudioCodec::Pcm);
            pipeline.initialize(LoadType::Other, Box::new(backend))?;

            let (provider, feed) = QueueFrameProvider::new();
            pipeline.initialize_audio(opus, AvPipelineClient::default(), Box::new(provider))?;
            assert!(pipeline.has_audio());

            feed.push_buffer(DecoderBuffer::new(Duration::ZERO, AUDIO_FRAME, vec![200u8; 4]));
            pipeline.start_playing_from(Duration::ZERO)?;
            settle().await;

            let decoder = handle.audio_decoder().expect("audio decoder");
            let decoder = decoder.borrow();
            assert_eq!(decoder.config().map(|config| config.codec), Some(AudioCodec::Pcm));
            assert_eq!(decoder.pushed_buffers()[0].data.len(), 8);
            assert!(client.errors().is_empty());
            anyhow::Ok(())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_zero_time_update_interval_is_clamped() -> Result<()> {
    LocalSet::new()
        .run_until(async {
            // Bypasses validate(); the coordinator must not spin
            let config = PipelineConfig {
                time_update_interval_ms: 0,
                ..PipelineConfig::default()
            };
            let harness = Harness::with_config(LoadType::Other, config)?;
            harness.backend.script_pts([0]);
            harness.pipeline.start_playing_from(Duration::ZERO)?;

            sleep(ms(10)).await;
            let updates = harness.client.time_updates().len();
            assert!((5..=12).contains(&updates), "{} time updates in 10ms", updates);
            anyhow::Ok(())
        })
        .await
}
