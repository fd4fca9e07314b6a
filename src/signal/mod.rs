//! Asynchronous signals
//!
//! A signal is a single externally sourced value: a process variable on a
//! control system, a register on a motion controller, a counter in a detector
//! driver. Devices are built as plain structs of typed signals and the logic
//! functions talk to hardware only through these traits.
//!
//! - [`SignalR`] can be read and observed. Observing yields the current value
//!   first, then every update.
//! - [`SignalW`] can be put to.
//! - [`SignalRW`] is both.
//! - [`SignalX`] can be executed (a "process" or "go" button).
//!
//! Signals are shared as `Arc<dyn ...>` (see the [`ReadSignal`] family of
//! aliases) so several devices and logic tasks can hold the same one.
//!
//! A [`SignalProvider`] makes the signals for a device given its prefix. The
//! only provider in this crate is the simulated one in [`sim`].

pub mod sim;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::{FlyError, FlyResult};
use crate::status::Status;

/// Bound shared by every value a signal can carry.
pub trait SignalValue: Clone + Debug + Default + Send + Sync + 'static {}

impl<T> SignalValue for T where T: Clone + Debug + Default + Send + Sync + 'static {}

/// Common behaviour of all signals.
#[async_trait]
pub trait Signal: Send + Sync {
    /// Where the value comes from, like `BLxxI-MO-TABLE-01:X.readback`
    fn source(&self) -> &str;

    /// Has the connection to the control system been made?
    async fn connected(&self) -> bool;
}

/// Ties a signal to the type of value it carries.
pub trait TypedSignal: Signal {
    /// Value carried by the signal
    type Value: SignalValue;
}

/// Signal that can be read from and monitored.
#[async_trait]
pub trait SignalR<T: SignalValue>: TypedSignal<Value = T> {
    /// The current value
    async fn get(&self) -> FlyResult<T>;

    /// Changes to the value. The first item is the current value.
    fn observe(&self) -> BoxStream<'static, T>;
}

/// Signal that can be put to.
#[async_trait]
pub trait SignalW<T: SignalValue>: TypedSignal<Value = T> {
    /// Send the value, returning when the control system has processed it
    async fn put(&self, value: T) -> FlyResult<()>;
}

/// Signal that can be read from, monitored and put to.
pub trait SignalRW<T: SignalValue>: SignalR<T> + SignalW<T> {}

impl<T, S> SignalRW<T> for S
where
    T: SignalValue,
    S: SignalR<T> + SignalW<T> + ?Sized,
{
}

/// Signal that can be executed.
#[async_trait]
pub trait SignalX: Signal {
    /// Execute, returning when the action has finished
    async fn execute(&self) -> FlyResult<()>;
}

/// Shared read-only signal.
pub type ReadSignal<T> = Arc<dyn SignalR<T>>;
/// Shared write-only signal.
pub type WriteSignal<T> = Arc<dyn SignalW<T>>;
/// Shared read/write signal.
pub type ReadWriteSignal<T> = Arc<dyn SignalRW<T>>;
/// Shared executable signal.
pub type ExecSignal = Arc<dyn SignalX>;

/// Put `value` to `signal` in the background, returning a [`Status`].
pub fn set<T, S>(signal: &Arc<S>, value: T) -> Status
where
    T: SignalValue,
    S: SignalW<T> + ?Sized + 'static,
{
    let signal = Arc::clone(signal);
    Status::spawn(async move { signal.put(value).await })
}

/// Observe `signal` until `predicate` accepts a value, or `timeout` passes.
pub async fn wait_for_value<T, S, P>(signal: &S, mut predicate: P, timeout: Duration) -> FlyResult<T>
where
    T: SignalValue,
    S: SignalR<T> + ?Sized,
    P: FnMut(&T) -> bool,
{
    let mut updates = signal.observe();
    let found = tokio::time::timeout(timeout, async {
        while let Some(value) = updates.next().await {
            if predicate(&value) {
                return Some(value);
            }
        }
        None
    })
    .await
    .map_err(|_| FlyError::Timeout(timeout))?;
    found.ok_or_else(|| FlyError::NotConnected(signal.source().to_string()))
}

/// Source string for signal `name` of the device at `prefix`.
pub fn signal_source(prefix: &str, name: &str) -> String {
    format!("{prefix}.{name}")
}

/// Makes the signals of a device.
///
/// Implementations decide the transport; device constructors only name the
/// signals they need and the value types they carry.
pub trait SignalProvider: Send + Sync {
    /// Read-only signal `name` under `prefix`
    fn signal_r<T: SignalValue>(&self, prefix: &str, name: &str) -> ReadSignal<T>;

    /// Write-only signal `name` under `prefix`
    fn signal_w<T: SignalValue>(&self, prefix: &str, name: &str) -> WriteSignal<T>;

    /// Read/write signal `name` under `prefix`
    fn signal_rw<T: SignalValue>(&self, prefix: &str, name: &str) -> ReadWriteSignal<T>;

    /// Executable signal `name` under `prefix`
    fn signal_x(&self, prefix: &str, name: &str) -> ExecSignal;
}
