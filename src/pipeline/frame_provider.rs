//! Frame providers
//!
//! A frame provider is the demuxer-side source of coded frames for one
//! stream. Sub-pipelines pull from it one frame at a time and flush it when
//! playback seeks.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use crate::backend::{DecoderBuffer, StreamConfig};

/// One coded frame, optionally preceded by a new stream configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CodedFrame {
    pub buffer: DecoderBuffer,

    /// Configuration that applies from this frame on
    pub config: Option<StreamConfig>,
}

impl CodedFrame {
    pub fn new(buffer: DecoderBuffer) -> Self {
        Self { buffer, config: None }
    }

    pub fn with_config(buffer: DecoderBuffer, config: StreamConfig) -> Self {
        Self {
            buffer,
            config: Some(config),
        }
    }

    pub fn end_of_stream() -> Self {
        Self::new(DecoderBuffer::end_of_stream())
    }
}

/// Shared record of component destruction, in order
pub type LifecycleLog = Rc<RefCell<Vec<String>>>;

/// Completion of a read; may run synchronously inside `read`
pub type ReadCallback = Box<dyn FnOnce(CodedFrame)>;

/// Ordered source of coded frames
pub trait FrameProvider {
    /// Request the next frame
    ///
    /// At most one read is outstanding at a time.
    fn read(&mut self, callback: ReadCallback);

    /// Drop every buffered frame and any outstanding read, then run `done`
    fn flush(&mut self, done: Box<dyn FnOnce()>);
}

#[derive(Default)]
struct FrameQueue {
    frames: VecDeque<CodedFrame>,
    pending_read: Option<ReadCallback>,
    flush_count: usize,

    /// Hold flush completions until `complete_flush`
    hold_flush: bool,
    pending_flush: Option<Box<dyn FnOnce()>>,
    alive: bool,
}

/// In-memory frame provider fed through a [`QueueFrameProviderHandle`]
pub struct QueueFrameProvider {
    queue: Rc<RefCell<FrameQueue>>,
    lifecycle: Option<(LifecycleLog, String)>,
}

/// Feeding side of a [`QueueFrameProvider`]
#[derive(Clone)]
pub struct QueueFrameProviderHandle {
    queue: Rc<RefCell<FrameQueue>>,
}

impl QueueFrameProvider {
    pub fn new() -> (QueueFrameProvider, QueueFrameProviderHandle) {
        let queue = Rc::new(RefCell::new(FrameQueue {
            alive: true,
            ..Default::default()
        }));
        let provider = QueueFrameProvider {
            queue: Rc::clone(&queue),
            lifecycle: None,
        };
        (provider, QueueFrameProviderHandle { queue })
    }

    /// Record `label` into `lifecycle` when the provider is dropped
    pub fn with_lifecycle(mut self, lifecycle: LifecycleLog, label: &str) -> Self {
        self.lifecycle = Some((lifecycle, label.to_string()));
        self
    }
}

impl FrameProvider for QueueFrameProvider {
    fn read(&mut self, callback: ReadCallback) {
        let frame = {
            let mut queue = self.queue.borrow_mut();
            match queue.frames.pop_front() {
                Some(frame) => frame,
                None => {
                    queue.pending_read = Some(callback);
                    return;
                }
            }
        };
        callback(frame);
    }

    fn flush(&mut self, done: Box<dyn FnOnce()>) {
        {
            let mut queue = self.queue.borrow_mut();
            queue.frames.clear();
            queue.pending_read = None;
            queue.flush_count += 1;
            if queue.hold_flush {
                queue.pending_flush = Some(done);
                return;
            }
        }
        done();
    }
}

impl Drop for QueueFrameProvider {
    fn drop(&mut self) {
        self.queue.borrow_mut().alive = false;
        if let Some((lifecycle, label)) = self.lifecycle.take() {
            lifecycle.borrow_mut().push(label);
        }
    }
}

impl QueueFrameProviderHandle {
    /// Deliver a frame, satisfying an outstanding read if there is one
    pub fn push_frame(&self, frame: CodedFrame) {
        let reader = {
            let mut queue = self.queue.borrow_mut();
            match queue.pending_read.take() {
                Some(reader) => reader,
                None => {
                    queue.frames.push_back(frame);
                    return;
                }
            }
        };
        reader(frame);
    }

    pub fn push_buffer(&self, buffer: DecoderBuffer) {
        self.push_frame(CodedFrame::new(buffer));
    }

    pub fn push_end_of_stream(&self) {
        self.push_frame(CodedFrame::end_of_stream());
    }

    /// Defer flush completion until [`complete_flush`](Self::complete_flush)
    pub fn set_hold_flush(&self, hold: bool) {
        self.queue.borrow_mut().hold_flush = hold;
    }

    /// Finish a held flush; false if none is outstanding
    pub fn complete_flush(&self) -> bool {
        let done = self.queue.borrow_mut().pending_flush.take();
        match done {
            Some(done) => {
                done();
                true
            }
            None => false,
        }
    }

    pub fn has_pending_flush(&self) -> bool {
        self.queue.borrow().pending_flush.is_some()
    }

    /// Frames delivered but not yet read
    pub fn queued_frames(&self) -> usize {
        self.queue.borrow().frames.len()
    }

    pub fn has_pending_read(&self) -> bool {
        self.queue.borrow().pending_read.is_some()
    }

    pub fn flush_count(&self) -> usize {
        self.queue.borrow().flush_count
    }

    /// Whether the provider has not been dropped yet
    pub fn is_alive(&self) -> bool {
        self.queue.borrow().alive
    }
}
