//! Simulated PMAC
//!
//! Just enough of a controller to make `points_scanned` tick at the right
//! rate, with raw motor readbacks following the profile positions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{FlyError, FlyResult};
use crate::pmac::{PmacCoord, PmacRawMotor, PmacTrajectory, CS_AXES};
use crate::signal::sim::SimProvider;
use crate::status::lock;

fn check_letters(motors: &BTreeMap<String, PmacRawMotor>) -> FlyResult<()> {
    for letter in motors.keys() {
        if letter.len() != 1 || !CS_AXES.contains(letter.as_str()) {
            return Err(FlyError::Device(format!(
                "{letter} should be one of {CS_AXES}"
            )));
        }
    }
    Ok(())
}

/// Put `motors`, keyed by axis letter, into co-ordinate system `port`.
///
/// Demands move the raw motor readbacks straight to the demanded position.
/// While `defer_moves` is set, demands are held and applied together when it
/// is cleared.
pub fn sim_coord_logic(
    p: &SimProvider,
    cs: &PmacCoord,
    port: &str,
    motors: &BTreeMap<String, PmacRawMotor>,
) -> FlyResult<()> {
    check_letters(motors)?;
    p.set_value(&*cs.port, port.to_string())?;
    for (letter, motor) in motors {
        p.set_value(&*motor.cs_port, port.to_string())?;
        p.set_value(&*motor.cs_axis, letter.clone())?;
    }

    #[derive(Default)]
    struct Deferred {
        deferring: bool,
        demands: BTreeMap<String, f64>,
    }
    let deferred: Arc<Mutex<Deferred>> = Arc::default();

    let apply = {
        let (p, motors) = (p.clone(), motors.clone());
        move |demands: BTreeMap<String, f64>| -> FlyResult<()> {
            for (letter, value) in demands {
                let motor = motors.get(&letter).ok_or_else(|| {
                    FlyError::Device(format!("no motor on axis {letter}"))
                })?;
                p.set_value(&*motor.axis.demand, value)?;
                p.set_value(&*motor.axis.readback, value)?;
            }
            Ok(())
        }
    };
    let apply = Arc::new(apply);

    let (state, apply_now) = (deferred.clone(), apply.clone());
    p.on_set(&*cs.defer_moves, move |defer: bool| {
        let result = {
            let mut state = lock(&state);
            state.deferring = defer;
            if defer {
                Ok(())
            } else {
                (*apply_now)(std::mem::take(&mut state.demands))
            }
        };
        async move { result }
    })?;

    p.on_set(&*cs.demands, move |demands: BTreeMap<String, f64>| {
        let result = {
            let mut state = lock(&deferred);
            if state.deferring {
                state.demands.extend(demands);
                Ok(())
            } else {
                (*apply)(demands)
            }
        };
        async move { result }
    })?;
    Ok(())
}

#[derive(Default)]
struct Profile {
    times: Vec<f64>,
    positions: BTreeMap<String, Vec<f64>>,
}

impl Profile {
    fn extend(&mut self, times: Vec<f64>, positions: BTreeMap<String, Vec<f64>>) {
        self.times.extend(times);
        for (letter, values) in positions {
            self.positions.entry(letter).or_default().extend(values);
        }
    }

    fn clear(&mut self) {
        self.times.clear();
        self.positions.clear();
    }
}

/// Run trajectory profiles written to `traj`, moving `motors` keyed by axis letter.
pub fn sim_trajectory_logic(
    p: &SimProvider,
    traj: &PmacTrajectory,
    motors: &BTreeMap<String, PmacRawMotor>,
) -> FlyResult<()> {
    check_letters(motors)?;
    for (letter, motor) in motors {
        p.set_value(&*motor.cs_axis, letter.clone())?;
    }
    p.set_value(&*traj.program_version, 2.0)?;

    let profile: Arc<Mutex<Profile>> = Arc::default();
    let stopping = Arc::new(watch::channel(false).0);

    let (state, stop) = (profile.clone(), stopping.clone());
    p.on_call(&*traj.abort, move || {
        stop.send_replace(true);
        lock(&state).clear();
        async { Ok(()) }
    })?;

    let (provider, t, state) = (p.clone(), traj.clone(), profile.clone());
    p.on_call(&*traj.build, move || {
        let result = (|| -> FlyResult<()> {
            let times = provider.get_value(&*t.times)?;
            let positions = provider.get_value(&*t.positions)?;
            let mut profile = lock(&state);
            profile.clear();
            profile.extend(times, positions);
            provider.set_value(&*t.points_scanned, 0)?;
            provider.set_value(&*t.build_status, "Success".to_string())?;
            provider.set_value(&*t.build_message, String::new())?;
            Ok(())
        })();
        async move { result }
    })?;

    let (provider, t, state) = (p.clone(), traj.clone(), profile.clone());
    p.on_call(&*traj.append, move || {
        let result = (|| -> FlyResult<()> {
            let times = provider.get_value(&*t.times)?;
            let positions = provider.get_value(&*t.positions)?;
            lock(&state).extend(times, positions);
            provider.set_value(&*t.append_status, "Success".to_string())?;
            provider.set_value(&*t.append_message, String::new())?;
            Ok(())
        })();
        async move { result }
    })?;

    let (provider, t, motors) = (p.clone(), traj.clone(), motors.clone());
    p.on_call(&*traj.execute, move || {
        let (p, t, motors, profile, stopping) = (
            provider.clone(),
            t.clone(),
            motors.clone(),
            profile.clone(),
            stopping.clone(),
        );
        async move {
            // Do a fake scan that takes the right time
            stopping.send_replace(false);
            let mut stop = stopping.subscribe();
            let use_axes = p.get_value(&*t.use_axes)?;
            let mut aborted = false;
            let mut i = 0;
            loop {
                // Appends may grow the profile while it runs
                let (time, positions) = {
                    let profile = lock(&profile);
                    let Some(time) = profile.times.get(i).copied() else {
                        break;
                    };
                    let positions: Vec<(String, f64)> = profile
                        .positions
                        .iter()
                        .filter_map(|(letter, values)| {
                            values.get(i).map(|value| (letter.clone(), *value))
                        })
                        .collect();
                    (time, positions)
                };
                for (letter, value) in positions {
                    if use_axes.get(&letter).copied().unwrap_or(false) {
                        if let Some(motor) = motors.get(&letter) {
                            p.set_value(&*motor.axis.readback, value)?;
                        }
                    }
                }
                let stopped = tokio::time::timeout(
                    Duration::from_secs_f64(time.max(0.0)),
                    stop.wait_for(|stopping| *stopping),
                )
                .await
                .is_ok();
                if stopped {
                    aborted = true;
                    break;
                }
                p.set_value(&*t.points_scanned, i + 1)?;
                i += 1;
            }
            lock(&profile).clear();
            let (status, message) = if aborted {
                ("Aborted", "Aborted")
            } else {
                ("Success", "")
            };
            tracing::debug!(points = i, status, "Sim trajectory finished");
            p.set_value(&*t.execute_message, message.to_string())?;
            p.set_value(&*t.execute_status, status.to_string())?;
            Ok(())
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::{CompoundGenerator, LineGenerator, RemainingPoints};
    use crate::pmac::{
        build_initial_trajectory, keep_filling_trajectory, move_to_start, stop_trajectory,
        PmacMotor,
    };

    struct Rig {
        p: SimProvider,
        motors: BTreeMap<String, PmacMotor>,
        raw: BTreeMap<String, PmacRawMotor>,
        cs: PmacCoord,
        traj: PmacTrajectory,
    }

    fn rig() -> Rig {
        let p = SimProvider::new();
        let x = PmacRawMotor::new(&p, "T1.X");
        let y = PmacRawMotor::new(&p, "T1.Y");
        let raw = BTreeMap::from([("X".to_string(), x.clone()), ("Y".to_string(), y.clone())]);
        let cs = PmacCoord::new(&p, "PMAC1.CS1");
        let traj = PmacTrajectory::new(&p, "PMAC1.TRAJ");
        sim_coord_logic(&p, &cs, "CS1", &raw).unwrap();
        sim_trajectory_logic(&p, &traj, &raw).unwrap();
        let motors = BTreeMap::from([
            ("t1x".to_string(), PmacMotor::from(x)),
            ("t1y".to_string(), PmacMotor::from(y)),
        ]);
        Rig {
            p,
            motors,
            raw,
            cs,
            traj,
        }
    }

    fn points() -> RemainingPoints {
        RemainingPoints::new(
            Arc::new(CompoundGenerator::new(
                vec![
                    LineGenerator::new("t1y", "mm", 0.0, 1.0, 2),
                    LineGenerator::new("t1x", "mm", 1.0, 2.0, 3),
                ],
                0.5,
            )),
            0,
        )
    }

    #[test]
    fn test_rejects_unknown_axis_letter() {
        let p = SimProvider::new();
        let traj = PmacTrajectory::new(&p, "PMAC1.TRAJ");
        let motors = BTreeMap::from([("Q".to_string(), PmacRawMotor::new(&p, "T1.Q"))]);
        assert!(sim_trajectory_logic(&p, &traj, &motors).is_err());
    }

    #[tokio::test]
    async fn test_deferred_moves_apply_together() {
        let rig = rig();
        move_to_start(&rig.motors, &[rig.cs.clone()], &points())
            .await
            .unwrap();
        assert_eq!(rig.raw["X"].axis.readback.get().await.unwrap(), 1.0);
        assert_eq!(rig.raw["Y"].axis.readback.get().await.unwrap(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trajectory_runs_in_batches() {
        let rig = rig();
        let points = points();
        let mut tracker = build_initial_trajectory(&rig.motors, &rig.traj, &points, 4)
            .await
            .unwrap();
        assert_eq!(tracker.completed, 4);

        let start = tokio::time::Instant::now();
        let mut steps = Vec::new();
        keep_filling_trajectory(&rig.traj, &mut tracker, |step| steps.push(step))
            .await
            .unwrap();
        assert!(!tracker.incomplete());
        assert_eq!(steps.first(), Some(&0));
        assert_eq!(steps.last(), Some(&6));
        assert!((start.elapsed().as_secs_f64() - 3.0).abs() < 0.01);
        assert_eq!(rig.raw["X"].axis.readback.get().await.unwrap(), 2.0);
        assert_eq!(rig.raw["Y"].axis.readback.get().await.unwrap(), 1.0);
        assert_eq!(
            rig.p.get_value(&*rig.traj.execute_status).unwrap(),
            "Success"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_fails_execute() {
        let rig = rig();
        let points = points();
        let mut tracker = build_initial_trajectory(&rig.motors, &rig.traj, &points, 100)
            .await
            .unwrap();
        let traj = rig.traj.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            stop_trajectory(&traj).await
        });
        let err = keep_filling_trajectory(&rig.traj, &mut tracker, |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Trajectory error: Execute failed: Aborted");
        assert_eq!(rig.traj.points_scanned.get().await.unwrap(), 2);
    }
}
