//! Motor record and a settable device wrapping it.
//!
//! [`MotorRecord`] is the raw signal tree of a motor; [`MotorDevice`] adds
//! the step scan behaviour (trigger/read/set/stop) and progress reporting for
//! moves.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;

use crate::device::{DataKey, Description, Device, Movable, Readable, Reading, Readings};
use crate::error::{FlyError, FlyResult};
use crate::signal::{ExecSignal, ReadSignal, ReadWriteSignal, SignalProvider};
use crate::status::{lock, Status, WatchUpdate, Watchers};

/// Signals of a motor record.
#[derive(Clone)]
pub struct MotorRecord {
    /// Demand position; a put completes when the move does
    pub demand: ReadWriteSignal<f64>,
    /// Readback position
    pub readback: ReadSignal<f64>,
    /// False while moving
    pub done_move: ReadSignal<bool>,
    /// Seconds to reach velocity
    pub acceleration_time: ReadWriteSignal<f64>,
    /// Move velocity in units per second
    pub velocity: ReadWriteSignal<f64>,
    /// Velocity limit
    pub max_velocity: ReadWriteSignal<f64>,
    // Writable on the record, but not from scanning code
    /// Units per step
    pub resolution: ReadSignal<f64>,
    /// User offset
    pub offset: ReadSignal<f64>,
    /// Engineering units
    pub egu: ReadSignal<String>,
    /// Display precision
    pub precision: ReadSignal<u32>,
    /// Stop the motor
    pub stop: ExecSignal,
}

impl MotorRecord {
    /// Signals of the motor record at `prefix`.
    pub fn new(provider: &impl SignalProvider, prefix: &str) -> Self {
        Self {
            demand: provider.signal_rw(prefix, "demand"),
            readback: provider.signal_r(prefix, "readback"),
            done_move: provider.signal_r(prefix, "done_move"),
            acceleration_time: provider.signal_rw(prefix, "acceleration_time"),
            velocity: provider.signal_rw(prefix, "velocity"),
            max_velocity: provider.signal_rw(prefix, "max_velocity"),
            resolution: provider.signal_r(prefix, "resolution"),
            offset: provider.signal_r(prefix, "offset"),
            egu: provider.signal_r(prefix, "egu"),
            precision: provider.signal_r(prefix, "precision"),
            stop: provider.signal_x(prefix, "stop"),
        }
    }
}

#[derive(Default)]
struct MotorState {
    last_reading: Option<Reading>,
    set_success: bool,
}

struct MotorInner {
    name: String,
    motor: MotorRecord,
    state: Mutex<MotorState>,
}

/// Step scannable motor.
#[derive(Clone)]
pub struct MotorDevice {
    inner: Arc<MotorInner>,
}

impl std::fmt::Debug for MotorDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotorDevice")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl MotorDevice {
    /// Motor called `name` driving `motor`.
    pub fn new(name: impl Into<String>, motor: MotorRecord) -> Self {
        Self {
            inner: Arc::new(MotorInner {
                name: name.into(),
                motor,
                state: Mutex::new(MotorState {
                    last_reading: None,
                    set_success: true,
                }),
            }),
        }
    }

    /// The underlying signals.
    pub fn motor(&self) -> &MotorRecord {
        &self.inner.motor
    }
}

impl MotorInner {
    async fn do_set(&self, target: f64, watchers: Watchers) -> FlyResult<()> {
        let start = Instant::now();
        let initial = self.motor.demand.get().await?;
        let (unit, precision) =
            tokio::try_join!(self.motor.egu.get(), self.motor.precision.get())?;

        let mut updates = self.motor.readback.observe();
        let put = self.motor.demand.put(target);
        tokio::pin!(put);
        loop {
            tokio::select! {
                // Drain readbacks before noticing the move finished
                biased;
                Some(current) = updates.next() => {
                    let fraction = if target == initial {
                        1.0
                    } else {
                        ((current - initial) / (target - initial)).abs()
                    };
                    watchers.notify(&WatchUpdate {
                        name: self.name.clone(),
                        current,
                        initial,
                        target,
                        unit: unit.clone(),
                        precision,
                        time_elapsed: start.elapsed().as_secs_f64(),
                        fraction: Some(fraction),
                    });
                }
                result = &mut put => {
                    result?;
                    break;
                }
            }
        }

        if lock(&self.state).set_success {
            Ok(())
        } else {
            Err(FlyError::MotorStopped)
        }
    }
}

impl Device for MotorDevice {
    type Config = ();

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn configure(&self, _config: ()) -> FlyResult<(Readings, Readings)> {
        Ok((Readings::new(), Readings::new()))
    }

    fn read_configuration(&self) -> Readings {
        Readings::new()
    }

    fn describe_configuration(&self) -> Description {
        Description::new()
    }
}

impl Readable for MotorDevice {
    fn trigger(&self) -> Status {
        let inner = self.inner.clone();
        Status::spawn(async move {
            let value = inner.motor.readback.get().await?;
            lock(&inner.state).last_reading = Some(Reading::new(value));
            Ok(())
        })
    }

    fn read(&self) -> FlyResult<Readings> {
        let reading = lock(&self.inner.state)
            .last_reading
            .clone()
            .ok_or_else(|| FlyError::InvalidState("trigger() not called".into()))?;
        Ok(Readings::from([(self.inner.name.clone(), reading)]))
    }

    fn describe(&self) -> FlyResult<Description> {
        Ok(Description::from([(
            self.inner.name.clone(),
            DataKey::number(self.inner.motor.readback.source()),
        )]))
    }
}

impl Movable for MotorDevice {
    fn set(&self, position: f64, timeout: Option<Duration>) -> Status {
        lock(&self.inner.state).set_success = true;
        let inner = self.inner.clone();
        let watchers = Watchers::new();
        let reporting = watchers.clone();
        Status::spawn_watched(
            async move {
                tracing::debug!(motor = %inner.name, position, "Moving");
                let move_ = inner.do_set(position, reporting);
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, move_)
                        .await
                        .map_err(|_| FlyError::Timeout(limit))?,
                    None => move_.await,
                }
            },
            watchers,
        )
    }

    fn stop(&self, success: bool) -> Status {
        lock(&self.inner.state).set_success = success;
        let stop = self.inner.motor.stop.clone();
        tracing::info!(motor = %self.inner.name, "Stopping");
        Status::spawn(async move { stop.execute().await })
    }
}
