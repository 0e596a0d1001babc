//! castmedia - playback pipeline coordinator for hardware media backends
//!
//! The crate drives a [`backend::MediaPipelineBackend`] through its
//! lifecycle, feeds it coded audio and video frames, pauses playback while
//! streams are starved and publishes the media clock to a client.
//!
//! All pipeline objects live on a single [`runner::TaskRunner`]: a tokio
//! `LocalSet` on a current-thread runtime.

pub mod backend;
pub mod pipeline;
pub mod runner;
pub mod utils;

pub use pipeline::{LoadType, MediaPipeline, MediaPipelineClient};
pub use utils::{PipelineConfig, PipelineError, Result};
