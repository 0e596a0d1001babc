//! Media task runner
//!
//! Everything in the pipeline is affined to one cooperative scheduler: a
//! tokio `LocalSet` on a current-thread runtime. `TaskRunner` is the handle
//! the pipeline components hold. It records the owning thread so public
//! entry points can assert affinity, and posts closures (optionally after a
//! delay) onto the local set.
//!
//! Posted closures never hold strong references to pipeline components.
//! They capture a `Weak` and re-validate it when they run, see
//! [`TaskRunner::post_weak`].

use std::rc::{Rc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::sync::mpsc;
use log::trace;

type RemoteTask = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the media task runner
#[derive(Clone, Debug)]
pub struct TaskRunner {
    /// Thread that owns the local set
    thread: ThreadId,

    /// Entry point for tasks posted from other threads
    remote_tx: mpsc::UnboundedSender<RemoteTask>,
}

/// Send-able handle for posting onto the media runner from other threads
#[derive(Clone, Debug)]
pub struct RemoteTaskRunner {
    thread: ThreadId,
    remote_tx: mpsc::UnboundedSender<RemoteTask>,
}

impl TaskRunner {
    /// Bind a runner to the current thread and start its remote-task pump
    ///
    /// # Panics
    ///
    /// Panics when called outside of a `tokio::task::LocalSet`.
    pub fn current() -> Self {
        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel::<RemoteTask>();

        tokio::task::spawn_local(async move {
            while let Some(task) = remote_rx.recv().await {
                task();
            }
            trace!("Remote task pump finished");
        });

        Self {
            thread: thread::current().id(),
            remote_tx,
        }
    }

    /// Whether the caller is running on the media runner's thread
    pub fn belongs_to_current_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Thread-affinity assertion placed at every public pipeline entry point
    #[track_caller]
    pub fn check_on_runner(&self) {
        assert!(
            self.belongs_to_current_thread(),
            "media pipeline accessed off its task runner (owner {:?}, caller {:?})",
            self.thread,
            thread::current().id()
        );
    }

    /// Post a task to run after the current one returns
    pub fn post_task<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.check_on_runner();
        tokio::task::spawn_local(async move {
            task();
        });
    }

    /// Post a task to run once `delay` has elapsed
    pub fn post_delayed_task<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.check_on_runner();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }

    /// Post a task bound to a weak target; it is dropped unrun if the
    /// target has been destroyed by the time it executes
    pub fn post_weak<T, F>(&self, target: Weak<T>, task: F)
    where
        T: ?Sized + 'static,
        F: FnOnce(Rc<T>) + 'static,
    {
        self.post_task(move || {
            if let Some(target) = target.upgrade() {
                task(target);
            }
        });
    }

    /// Delayed variant of [`TaskRunner::post_weak`]
    pub fn post_delayed_weak<T, F>(&self, delay: Duration, target: Weak<T>, task: F)
    where
        T: ?Sized + 'static,
        F: FnOnce(Rc<T>) + 'static,
    {
        self.post_delayed_task(delay, move || {
            if let Some(target) = target.upgrade() {
                task(target);
            }
        });
    }

    /// Handle other threads can use to post onto this runner
    pub fn remote(&self) -> RemoteTaskRunner {
        RemoteTaskRunner {
            thread: self.thread,
            remote_tx: self.remote_tx.clone(),
        }
    }
}

impl RemoteTaskRunner {
    /// Post a task onto the media runner. Returns false if the runner is gone.
    pub fn post_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.remote_tx.send(Box::new(task)).is_ok()
    }

    /// Whether the caller is already on the media runner's thread
    pub fn belongs_to_current_thread(&self) -> bool {
        thread::current().id() == self.thread
    }
}
