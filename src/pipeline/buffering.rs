//! Buffering controller
//!
//! Each started stream registers a [`BufferingState`] with the controller.
//! Sub-pipelines report how far their stream has been buffered; the
//! coordinator feeds in the media clock. The controller combines both into a
//! single buffering flag with hysteresis:
//!
//! - not buffering → buffering once any stream has less than
//!   `low_threshold` of data past the media time
//! - buffering → not buffering once every stream has at least
//!   `high_threshold` of data past the media time, or has reached end of
//!   stream
//!
//! Every edge is reported exactly once through the notify callback.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;
use log::{debug, info};
use tokio::time::Instant;
use crate::runner::TaskRunner;
use crate::utils::format_timestamp;

/// Buffered-duration watermarks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingConfig {
    low_threshold: Duration,
    high_threshold: Duration,
}

impl BufferingConfig {
    pub fn new(low_threshold: Duration, high_threshold: Duration) -> Self {
        Self {
            low_threshold,
            high_threshold,
        }
    }

    pub fn low_threshold(&self) -> Duration {
        self.low_threshold
    }

    pub fn high_threshold(&self) -> Duration {
        self.high_threshold
    }
}

/// How much data a stream has relative to the watermarks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferingLevel {
    /// Below the low watermark
    Low,

    /// Between the watermarks
    Medium,

    /// At or above the high watermark
    High,

    /// The whole stream has been buffered
    EndOfStream,
}

#[derive(Debug, Default)]
struct StreamProgress {
    media_time: Duration,
    buffered_time: Option<Duration>,
    eos: bool,
}

/// Buffering progress of one stream
///
/// Owned by the controller; the stream's sub-pipeline holds a `Weak` and
/// loses access when the controller is reset.
pub struct BufferingState {
    name: String,
    config: BufferingConfig,
    progress: RefCell<StreamProgress>,
    on_change: Box<dyn Fn()>,
}

impl BufferingState {
    fn new(name: &str, config: BufferingConfig, media_time: Duration, on_change: Box<dyn Fn()>) -> Self {
        Self {
            name: name.to_string(),
            config,
            progress: RefCell::new(StreamProgress {
                media_time,
                ..Default::default()
            }),
            on_change,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Timestamp up to which the stream has been buffered
    pub fn buffered_time(&self) -> Option<Duration> {
        self.progress.borrow().buffered_time
    }

    pub fn is_eos(&self) -> bool {
        self.progress.borrow().eos
    }

    pub fn level(&self) -> BufferingLevel {
        let progress = self.progress.borrow();
        if progress.eos {
            return BufferingLevel::EndOfStream;
        }

        let Some(buffered) = progress.buffered_time else {
            return BufferingLevel::Low;
        };

        if buffered < progress.media_time + self.config.low_threshold {
            BufferingLevel::Low
        } else if buffered >= progress.media_time + self.config.high_threshold {
            BufferingLevel::High
        } else {
            BufferingLevel::Medium
        }
    }

    /// Record that data up to `time` has been handed to the decoder
    pub fn set_buffered_time(&self, time: Duration) {
        self.update(|progress| {
            let buffered = progress.buffered_time.map_or(time, |current| current.max(time));
            progress.buffered_time = Some(buffered);
        });
    }

    /// Record that the end-of-stream buffer has been handed to the decoder
    pub fn notify_eos(&self) {
        self.update(|progress| progress.eos = true);
    }

    /// Latest timestamp the stream can render without new data
    ///
    /// `None` until the first frame arrives; unbounded at end of stream.
    pub fn max_rendering_time(&self) -> Option<Duration> {
        let progress = self.progress.borrow();
        if progress.eos {
            return Some(Duration::MAX);
        }
        progress.buffered_time
    }

    fn set_media_time(&self, time: Duration) {
        self.progress.borrow_mut().media_time = time;
    }

    fn update(&self, f: impl FnOnce(&mut StreamProgress)) {
        let before = self.level();
        f(&mut self.progress.borrow_mut());
        let after = self.level();

        if before != after {
            debug!("Stream {} buffering level {:?} -> {:?}", self.name, before, after);
            (self.on_change)();
        }
    }
}

struct ControllerCore {
    config: BufferingConfig,
    streams: Vec<Rc<BufferingState>>,
    is_buffering: bool,
    media_time: Duration,
    notify: Rc<dyn Fn(bool)>,
    buffering_since: Option<Instant>,
}

impl ControllerCore {
    /// Apply the hysteresis rule; returns the edge to report, if any
    fn next_edge(&mut self) -> Option<bool> {
        if !self.is_buffering {
            let starved = self
                .streams
                .iter()
                .find(|stream| stream.level() == BufferingLevel::Low)?;

            info!(
                "Buffering started at {}: stream {} is starved",
                format_timestamp(self.media_time),
                starved.name()
            );
            self.is_buffering = true;
            self.buffering_since = Some(Instant::now());
            return Some(true);
        }

        let ready = self
            .streams
            .iter()
            .all(|stream| matches!(stream.level(), BufferingLevel::High | BufferingLevel::EndOfStream));
        if !ready {
            return None;
        }

        let elapsed = self.buffering_since.take().map(|since| since.elapsed()).unwrap_or_default();
        info!(
            "Buffering finished at {} after {:?}",
            format_timestamp(self.media_time),
            elapsed
        );
        self.is_buffering = false;
        Some(false)
    }
}

fn evaluate(core: &RefCell<ControllerCore>) {
    let (notify, edge) = {
        let mut core = core.borrow_mut();
        match core.next_edge() {
            Some(edge) => (Rc::clone(&core.notify), edge),
            None => return,
        }
    };
    notify(edge);
}

/// Buffering controller shared by all streams of one pipeline
pub struct BufferingController {
    core: Rc<RefCell<ControllerCore>>,
    runner: TaskRunner,
}

impl BufferingController {
    /// Create a controller reporting edges through `notify`
    pub fn new(runner: TaskRunner, config: BufferingConfig, notify: impl Fn(bool) + 'static) -> Self {
        debug!(
            "Buffering controller: low {:?}, high {:?}",
            config.low_threshold(),
            config.high_threshold()
        );
        Self {
            core: Rc::new(RefCell::new(ControllerCore {
                config,
                streams: Vec::new(),
                is_buffering: false,
                media_time: Duration::ZERO,
                notify: Rc::new(notify),
                buffering_since: None,
            })),
            runner,
        }
    }

    pub fn config(&self) -> BufferingConfig {
        self.core.borrow().config
    }

    /// Register a stream, replacing any stream with the same name
    ///
    /// A stream starts with no data, so the first stream of a session puts
    /// the controller into buffering.
    pub fn add_stream(&self, name: &str) -> Rc<BufferingState> {
        self.runner.check_on_runner();

        let runner = self.runner.clone();
        let weak_core: Weak<RefCell<ControllerCore>> = Rc::downgrade(&self.core);
        let on_change = Box::new(move || {
            runner.post_weak(weak_core.clone(), |core| evaluate(&core));
        });

        let state = {
            let mut core = self.core.borrow_mut();
            let state = Rc::new(BufferingState::new(name, core.config, core.media_time, on_change));
            core.streams.retain(|stream| stream.name() != name);
            core.streams.push(Rc::clone(&state));
            state
        };

        evaluate(&self.core);
        state
    }

    /// Feed the current media time to every stream and re-evaluate
    pub fn set_media_time(&self, time: Duration) {
        self.runner.check_on_runner();
        {
            let mut core = self.core.borrow_mut();
            core.media_time = time;
            for stream in &core.streams {
                stream.set_media_time(time);
            }
        }
        evaluate(&self.core);
    }

    /// Minimum over all streams of the latest renderable timestamp
    pub fn max_rendering_time(&self) -> Option<Duration> {
        self.runner.check_on_runner();
        let core = self.core.borrow();
        if core.streams.is_empty() {
            return None;
        }

        core.streams
            .iter()
            .map(|stream| stream.max_rendering_time())
            .try_fold(Duration::MAX, |min, time| time.map(|time| min.min(time)))
    }

    pub fn is_buffering(&self) -> bool {
        self.runner.check_on_runner();
        self.core.borrow().is_buffering
    }

    /// Drop every stream and leave buffering without notifying
    pub fn reset(&self) {
        self.runner.check_on_runner();
        let mut core = self.core.borrow_mut();
        core.streams.clear();
        core.is_buffering = false;
        core.buffering_since = None;
    }
}
