//! Simulated motor record.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::config::SimConfig;
use crate::error::{FlyError, FlyResult};
use crate::motor::MotorRecord;
use crate::signal::sim::SimProvider;
use crate::status::lock;

/// How the simulated motor behaves.
#[derive(Debug, Clone, PartialEq)]
pub struct SimMotorSettings {
    /// Units per second
    pub velocity: f64,
    /// Display precision
    pub precision: u32,
    /// Engineering units
    pub units: String,
    /// Time between readback updates
    pub update_interval: Duration,
}

impl Default for SimMotorSettings {
    fn default() -> Self {
        Self {
            velocity: 1.0,
            precision: 3,
            units: "mm".into(),
            update_interval: Duration::from_millis(100),
        }
    }
}

impl From<&SimConfig> for SimMotorSettings {
    fn from(config: &SimConfig) -> Self {
        Self {
            velocity: config.motor_velocity,
            precision: config.motor_precision,
            units: config.motor_units.clone(),
            update_interval: Duration::from_secs_f64(config.motor_update_interval_secs),
        }
    }
}

/// Make `motor` move at constant velocity when its demand is put to.
///
/// The readback steps towards the demand every `update_interval` and lands
/// exactly on it at the end. Executing `stop` abandons the move where it is.
pub fn sim_motor_logic(
    p: &SimProvider,
    motor: &MotorRecord,
    settings: &SimMotorSettings,
) -> FlyResult<()> {
    p.set_value(&*motor.velocity, settings.velocity)?;
    p.set_value(&*motor.max_velocity, settings.velocity)?;
    p.set_value(&*motor.precision, settings.precision)?;
    p.set_value(&*motor.egu, settings.units.clone())?;
    p.set_value(&*motor.done_move, true)?;

    let moving: Arc<Mutex<Option<AbortHandle>>> = Arc::default();

    let (provider, record, handle, interval) =
        (p.clone(), motor.clone(), moving.clone(), settings.update_interval);
    p.on_set(&*motor.demand, move |target: f64| {
        let (p, m, moving) = (provider.clone(), record.clone(), handle.clone());
        async move {
            let task = tokio::spawn(move_at_velocity(p, m, target, interval));
            *lock(&moving) = Some(task.abort_handle());
            match task.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Ok(()),
                Err(err) => Err(FlyError::Device(format!("sim motor move failed: {err}"))),
            }
        }
    })?;

    let (provider, record) = (p.clone(), motor.clone());
    p.on_call(&*motor.stop, move || {
        if let Some(task) = lock(&moving).take() {
            task.abort();
        }
        let result = provider.set_value(&*record.done_move, true).map(|_| ());
        async move { result }
    })?;
    Ok(())
}

async fn move_at_velocity(
    p: SimProvider,
    m: MotorRecord,
    target: f64,
    interval: Duration,
) -> FlyResult<()> {
    p.set_value(&*m.done_move, false)?;
    let start = p.get_value(&*m.readback)?;
    let velocity = p.get_value(&*m.velocity)?;
    if velocity <= 0.0 {
        return Err(FlyError::Device(format!(
            "sim motor velocity must be positive, got {velocity}"
        )));
    }

    // Don't try to be clever, just move at a constant velocity
    let distance = target - start;
    let move_time = distance.abs() / velocity;
    let steps = (move_time / interval.as_secs_f64()) as usize;
    let step = distance.signum() * velocity * interval.as_secs_f64();
    for i in 0..steps {
        p.set_value(&*m.readback, start + i as f64 * step)?;
        tokio::time::sleep(interval).await;
    }
    p.set_value(&*m.readback, target)?;
    p.set_value(&*m.done_move, true)?;
    Ok(())
}
