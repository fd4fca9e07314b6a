//! Completion handles for long-running hardware operations.
//!
//! A [`Status`] is what a device hands back from `set`, `trigger`, `kickoff`
//! or `complete`. The operation itself runs as a tokio task; the status lets a
//! synchronous orchestrator ask whether it is `done`, whether it succeeded,
//! register completion callbacks and progress watchers, or simply `.await` it.
//!
//! # Completion rules
//!
//! - The outcome is recorded exactly once. Whichever of task result, task panic
//!   or [`Status::cancel`] happens first wins; later ones are ignored.
//! - Every callback added with [`Status::add_callback`] runs exactly once,
//!   immediately if the status is already done.
//! - A cancelled status is done and unsuccessful, its outcome is
//!   [`FlyError::Cancelled`].
//!
//! # Example
//!
//! ```rust,ignore
//! let status = motor.set(0.55, None);
//! status.watch(|update| println!("{} at {}", update.name, update.current));
//! status.add_callback(|s| println!("finished, success={:?}", s.success()));
//! status.await?;
//! ```

use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::{FlyError, FlyResult};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Progress watchers
// =============================================================================

/// Progress report sent to watchers while an operation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchUpdate {
    /// Name of the device reporting progress
    pub name: String,
    /// Current value (position, elapsed exposure, completed points)
    pub current: f64,
    /// Value when the operation started
    pub initial: f64,
    /// Value the operation is heading for
    pub target: f64,
    /// Engineering units of the values
    pub unit: String,
    /// Display precision
    pub precision: u32,
    /// Seconds since the operation started
    pub time_elapsed: f64,
    /// Fraction complete, when the device can work it out
    pub fraction: Option<f64>,
}

/// A progress watcher callback.
pub type Watcher = Arc<dyn Fn(&WatchUpdate) + Send + Sync>;

/// Shared, ordered list of progress watchers.
#[derive(Clone, Default)]
pub struct Watchers {
    inner: Arc<Mutex<Vec<Watcher>>>,
}

impl fmt::Debug for Watchers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchers").field("count", &self.len()).finish()
    }
}

impl Watchers {
    /// Create an empty watcher list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a watcher.
    pub fn add(&self, watcher: Watcher) {
        lock(&self.inner).push(watcher);
    }

    /// Call every watcher, in registration order.
    pub fn notify(&self, update: &WatchUpdate) {
        // Snapshot so a watcher may register another watcher without deadlocking
        let watchers: Vec<Watcher> = lock(&self.inner).clone();
        for watcher in watchers {
            watcher(update);
        }
    }

    /// Number of registered watchers.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    /// True if nobody is watching.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Status
// =============================================================================

type StatusCallback = Box<dyn FnOnce(&Status) + Send + 'static>;

#[derive(Default)]
struct StatusState {
    outcome: Option<FlyResult<()>>,
    callbacks: Vec<StatusCallback>,
}

struct StatusInner {
    state: Mutex<StatusState>,
    done_tx: watch::Sender<bool>,
    abort: Mutex<Option<AbortHandle>>,
    watchers: Option<Watchers>,
}

/// Handle on an asynchronous operation, in the shape a scan orchestrator expects.
#[derive(Clone)]
pub struct Status {
    inner: Arc<StatusInner>,
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("done", &self.done())
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl Status {
    fn with_watchers(watchers: Option<Watchers>) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(StatusInner {
                state: Mutex::new(StatusState::default()),
                done_tx,
                abort: Mutex::new(None),
                watchers,
            }),
        }
    }

    /// Run `operation` on the tokio runtime and track its completion.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(operation: F) -> Self
    where
        F: Future<Output = FlyResult<()>> + Send + 'static,
    {
        Self::start(operation, None)
    }

    /// Like [`Status::spawn`], but progress reported to `watchers` reaches
    /// anyone who calls [`Status::watch`].
    pub fn spawn_watched<F>(operation: F, watchers: Watchers) -> Self
    where
        F: Future<Output = FlyResult<()>> + Send + 'static,
    {
        Self::start(operation, Some(watchers))
    }

    fn start<F>(operation: F, watchers: Option<Watchers>) -> Self
    where
        F: Future<Output = FlyResult<()>> + Send + 'static,
    {
        let status = Self::with_watchers(watchers);
        let task = tokio::spawn(operation);
        *lock(&status.inner.abort) = Some(task.abort_handle());

        let monitor = status.clone();
        tokio::spawn(async move {
            let outcome = match task.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Err(FlyError::Cancelled),
                Err(err) => Err(FlyError::Device(format!("operation panicked: {err}"))),
            };
            monitor.finish(outcome);
        });
        status
    }

    /// A status that is already complete with `outcome`.
    pub fn finished(outcome: FlyResult<()>) -> Self {
        let status = Self::with_watchers(None);
        status.finish(outcome);
        status
    }

    /// Record the outcome if nothing has been recorded yet, then run callbacks.
    fn finish(&self, outcome: FlyResult<()>) {
        let callbacks = {
            let mut state = lock(&self.inner.state);
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.callbacks)
        };
        self.inner.done_tx.send_replace(true);
        for callback in callbacks {
            callback(self);
        }
    }

    /// Has the operation finished (successfully or not)?
    pub fn done(&self) -> bool {
        lock(&self.inner.state).outcome.is_some()
    }

    /// Did the operation succeed? Errors with [`FlyError::NotDone`] while running.
    pub fn success(&self) -> FlyResult<bool> {
        match &lock(&self.inner.state).outcome {
            None => Err(FlyError::NotDone),
            Some(Ok(())) => Ok(true),
            Some(Err(err)) => {
                tracing::debug!(error = %err, "Failed status");
                Ok(false)
            }
        }
    }

    /// The recorded outcome, if done.
    pub fn outcome(&self) -> Option<FlyResult<()>> {
        lock(&self.inner.state).outcome.clone()
    }

    /// Run `callback` once the operation finishes (now, if it already has).
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Status) + Send + 'static,
    {
        {
            let mut state = lock(&self.inner.state);
            if state.outcome.is_none() {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Register a progress watcher. Ignored if the operation reports no progress.
    pub fn watch<W>(&self, watcher: W)
    where
        W: Fn(&WatchUpdate) + Send + Sync + 'static,
    {
        if let Some(watchers) = &self.inner.watchers {
            watchers.add(Arc::new(watcher));
        }
    }

    /// Abort the underlying task. Returns true if this call decided the outcome.
    pub fn cancel(&self) -> bool {
        if self.done() {
            return false;
        }
        if let Some(handle) = lock(&self.inner.abort).take() {
            handle.abort();
        }
        let decided = !self.done();
        self.finish(Err(FlyError::Cancelled));
        decided
    }

    /// Wait for the operation to finish and return its outcome.
    pub async fn wait(&self) -> FlyResult<()> {
        let mut done_rx = self.inner.done_tx.subscribe();
        // The sender lives in `inner`, which `self` keeps alive
        done_rx
            .wait_for(|done| *done)
            .await
            .map_err(|_| FlyError::Cancelled)?;
        self.outcome().unwrap_or(Err(FlyError::NotDone))
    }
}

impl IntoFuture for Status {
    type Output = FlyResult<()>;
    type IntoFuture = BoxFuture<'static, FlyResult<()>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}
