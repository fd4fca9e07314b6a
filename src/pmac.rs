//! PMAC trajectory scanning
//!
//! Signal trees for a Delta Tau PMAC and the logic to run a trajectory scan on
//! it. The interface covers what a real controller needs; the maths is cut
//! down to sending each scan point's position and duration.
//!
//! # Signal trees
//!
//! ```text
//! PMAC
//!   CS (PmacCoord): demandA..Z, move_time, defer_moves
//!     PmacCoordMotor: demand, readback, ...
//!   PmacRawMotor: demand, readback, cs_port, cs_axis, ...
//!   PmacTrajectory: positionA..Z, times, build, append, execute, abort
//! ```
//!
//! # Scanning
//!
//! 1. [`build_initial_trajectory`] writes the first batch of points and
//!    builds the profile, while [`move_to_start`] takes the motors to the
//!    first point.
//! 2. [`keep_filling_trajectory`] executes the profile, appending a new batch
//!    whenever fewer than a batch of points remain ahead of the scan.
//! 3. [`stop_trajectory`] aborts a running profile.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::StreamExt;

use crate::error::{FlyError, FlyResult};
use crate::points::{CompoundGenerator, RemainingPoints};
use crate::signal::{ExecSignal, ReadSignal, SignalProvider, WriteSignal};

/// The 9 axes of a PMAC co-ordinate system.
pub const CS_AXES: &str = "ABCUVWXYZ";

/// Points sent to the controller per build or append.
pub const DEFAULT_BATCH_SIZE: usize = 100;

fn cs_axes() -> impl Iterator<Item = String> {
    CS_AXES.chars().map(String::from)
}

/// Signals common to raw and co-ordinate system motors.
#[derive(Clone)]
pub struct PmacAxis {
    /// Demand position
    pub demand: WriteSignal<f64>,
    /// Readback position
    pub readback: ReadSignal<f64>,
    /// True when stationary
    pub done_moving: ReadSignal<bool>,
    // The following are writable on the controller, but never from scanning code
    /// Seconds to reach velocity
    pub acceleration_time: ReadSignal<f64>,
    /// Velocity limit
    pub max_velocity: ReadSignal<f64>,
    /// Units per count
    pub resolution: ReadSignal<f64>,
    /// User offset
    pub offset: ReadSignal<f64>,
    /// Engineering units
    pub units: ReadSignal<String>,
    /// Input link of the record
    pub inp: ReadSignal<String>,
}

impl PmacAxis {
    fn new(provider: &impl SignalProvider, prefix: &str) -> Self {
        Self {
            demand: provider.signal_w(prefix, "demand"),
            readback: provider.signal_r(prefix, "readback"),
            done_moving: provider.signal_r(prefix, "done_moving"),
            acceleration_time: provider.signal_r(prefix, "acceleration_time"),
            max_velocity: provider.signal_r(prefix, "max_velocity"),
            resolution: provider.signal_r(prefix, "resolution"),
            offset: provider.signal_r(prefix, "offset"),
            units: provider.signal_r(prefix, "units"),
            inp: provider.signal_r(prefix, "inp"),
        }
    }
}

/// Motor driven directly by a PMAC axis, assigned to a co-ordinate system.
#[derive(Clone)]
pub struct PmacRawMotor {
    /// Common motor signals
    pub axis: PmacAxis,
    /// Port of the co-ordinate system the motor is in
    pub cs_port: ReadSignal<String>,
    /// Axis letter within that co-ordinate system
    pub cs_axis: ReadSignal<String>,
}

impl PmacRawMotor {
    /// Signals of the raw motor at `prefix`.
    pub fn new(provider: &impl SignalProvider, prefix: &str) -> Self {
        Self {
            axis: PmacAxis::new(provider, prefix),
            cs_port: provider.signal_r(prefix, "cs_port"),
            cs_axis: provider.signal_r(prefix, "cs_axis"),
        }
    }
}

/// Virtual motor defined by co-ordinate system kinematics.
#[derive(Clone)]
pub struct PmacCoordMotor {
    /// Common motor signals
    pub axis: PmacAxis,
}

impl PmacCoordMotor {
    /// Signals of the co-ordinate system motor at `prefix`.
    pub fn new(provider: &impl SignalProvider, prefix: &str) -> Self {
        Self {
            axis: PmacAxis::new(provider, prefix),
        }
    }
}

/// Either kind of PMAC motor.
#[derive(Clone)]
pub enum PmacMotor {
    /// Raw axis
    Raw(PmacRawMotor),
    /// Co-ordinate system axis
    Coord(PmacCoordMotor),
}

impl PmacMotor {
    /// Signals shared by both kinds.
    pub fn axis(&self) -> &PmacAxis {
        match self {
            PmacMotor::Raw(motor) => &motor.axis,
            PmacMotor::Coord(motor) => &motor.axis,
        }
    }

    fn as_raw(&self) -> FlyResult<&PmacRawMotor> {
        match self {
            PmacMotor::Raw(motor) => Ok(motor),
            PmacMotor::Coord(_) => Err(FlyError::Trajectory(
                "co-ordinate system motors are not supported in trajectory scans".into(),
            )),
        }
    }
}

impl From<PmacRawMotor> for PmacMotor {
    fn from(motor: PmacRawMotor) -> Self {
        PmacMotor::Raw(motor)
    }
}

impl From<PmacCoordMotor> for PmacMotor {
    fn from(motor: PmacCoordMotor) -> Self {
        PmacMotor::Coord(motor)
    }
}

impl std::fmt::Debug for PmacRawMotor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmacRawMotor")
            .field("readback", &self.axis.readback.source())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PmacTrajectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmacTrajectory")
            .field("execute", &self.execute.source())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PmacCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmacCoord")
            .field("port", &self.port.source())
            .finish_non_exhaustive()
    }
}

/// A PMAC co-ordinate system.
#[derive(Clone)]
pub struct PmacCoord {
    /// Asyn port name
    pub port: ReadSignal<String>,
    /// Demand per axis letter, each one its own record
    pub demands: WriteSignal<BTreeMap<String, f64>>,
    /// Time for the next move
    pub move_time: WriteSignal<f64>,
    /// While true, demands are held until released together
    pub defer_moves: WriteSignal<bool>,
}

impl PmacCoord {
    /// Signals of the co-ordinate system at `prefix`.
    pub fn new(provider: &impl SignalProvider, prefix: &str) -> Self {
        Self {
            port: provider.signal_r(prefix, "port"),
            demands: provider.signal_w(prefix, "demands"),
            move_time: provider.signal_w(prefix, "move_time"),
            defer_moves: provider.signal_w(prefix, "defer_moves"),
        }
    }
}

/// Trajectory scan profile of a PMAC.
#[derive(Clone)]
pub struct PmacTrajectory {
    /// Duration of each point
    pub times: WriteSignal<Vec<f64>>,
    /// Velocity mode of each point
    pub velocity_modes: WriteSignal<Vec<f64>>,
    /// User program run at each point
    pub user_programs: WriteSignal<Vec<i32>>,
    /// Positions per axis letter
    pub positions: WriteSignal<BTreeMap<String, Vec<f64>>>,
    /// Which axis letters take part
    pub use_axes: WriteSignal<BTreeMap<String, bool>>,
    /// Co-ordinate system port to run in
    pub cs: WriteSignal<String>,
    /// Build a new profile from the written points
    pub build: ExecSignal,
    /// Message from the last build
    pub build_message: ReadSignal<String>,
    /// `Success` if the last build worked
    pub build_status: ReadSignal<String>,
    /// Number of points written
    pub points_to_build: WriteSignal<usize>,
    /// Append the written points to the profile
    pub append: ExecSignal,
    /// Message from the last append
    pub append_message: ReadSignal<String>,
    /// `Success` if the last append worked
    pub append_status: ReadSignal<String>,
    /// Run the profile, returning when it ends
    pub execute: ExecSignal,
    /// Message from the last execute
    pub execute_message: ReadSignal<String>,
    /// `Success` if the last execute ran to the end
    pub execute_status: ReadSignal<String>,
    /// Points scanned by the running profile
    pub points_scanned: ReadSignal<usize>,
    /// Abort the running profile
    pub abort: ExecSignal,
    /// Version of the motion program
    pub program_version: ReadSignal<f64>,
}

impl PmacTrajectory {
    /// Signals of the trajectory scan at `prefix`.
    pub fn new(provider: &impl SignalProvider, prefix: &str) -> Self {
        Self {
            times: provider.signal_w(prefix, "times"),
            velocity_modes: provider.signal_w(prefix, "velocity_modes"),
            user_programs: provider.signal_w(prefix, "user_programs"),
            positions: provider.signal_w(prefix, "positions"),
            use_axes: provider.signal_w(prefix, "use"),
            cs: provider.signal_w(prefix, "cs"),
            build: provider.signal_x(prefix, "build"),
            build_message: provider.signal_r(prefix, "build_message"),
            build_status: provider.signal_r(prefix, "build_status"),
            points_to_build: provider.signal_w(prefix, "points_to_build"),
            append: provider.signal_x(prefix, "append"),
            append_message: provider.signal_r(prefix, "append_message"),
            append_status: provider.signal_r(prefix, "append_status"),
            execute: provider.signal_x(prefix, "execute"),
            execute_message: provider.signal_r(prefix, "execute_message"),
            execute_status: provider.signal_r(prefix, "execute_status"),
            points_scanned: provider.signal_r(prefix, "points_scanned"),
            abort: provider.signal_x(prefix, "abort"),
            program_version: provider.signal_r(prefix, "program_version"),
        }
    }

    async fn write_batch(&self, batch: &TrajectoryBatch) -> FlyResult<()> {
        tokio::try_join!(
            self.times.put(batch.times.clone()),
            self.user_programs.put(batch.user_programs.clone()),
            self.velocity_modes.put(batch.velocity_modes.clone()),
            self.positions.put(batch.positions.clone()),
            self.points_to_build.put(batch.len()),
        )?;
        Ok(())
    }
}

/// Points ready to write to a [`PmacTrajectory`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrajectoryBatch {
    /// Duration of each point
    pub times: Vec<f64>,
    /// Velocity mode of each point
    pub velocity_modes: Vec<f64>,
    /// User program of each point
    pub user_programs: Vec<i32>,
    /// Positions keyed by co-ordinate system axis letter
    pub positions: BTreeMap<String, Vec<f64>>,
}

impl TrajectoryBatch {
    /// Number of points.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// True if there are no points.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Tracks how much of a scan has been sent to the controller.
#[derive(Debug, Clone)]
pub struct TrajectoryTracker {
    generator: Arc<CompoundGenerator>,
    cs_axis: BTreeMap<String, String>,
    /// Points sent so far, counted from the start of the scan
    pub completed: usize,
    /// Scan point at which the profile started
    pub offset: usize,
    /// Points per batch
    pub batch_size: usize,
}

impl TrajectoryTracker {
    /// Tracker for `generator` whose profile starts at point `completed`.
    pub fn new(
        generator: Arc<CompoundGenerator>,
        cs_axis: BTreeMap<String, String>,
        completed: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            generator,
            cs_axis,
            completed,
            offset: completed,
            batch_size: batch_size.max(1),
        }
    }

    /// Are there points still to send?
    pub fn incomplete(&self) -> bool {
        self.completed < self.generator.size()
    }

    /// The next batch of points, marking them as sent.
    pub fn get_next_batch(&mut self) -> FlyResult<TrajectoryBatch> {
        let end = (self.completed + self.batch_size).min(self.generator.size());
        let points = self.generator.get_points(self.completed, end)?;
        self.completed = end;
        let mut positions = BTreeMap::new();
        for (axis, values) in points.positions {
            let letter = self.cs_axis.get(&axis).ok_or_else(|| {
                FlyError::Trajectory(format!("no co-ordinate system axis for '{axis}'"))
            })?;
            positions.insert(letter.clone(), values);
        }
        Ok(TrajectoryBatch {
            velocity_modes: vec![0.0; points.duration.len()],
            user_programs: vec![0; points.duration.len()],
            times: points.duration,
            positions,
        })
    }
}

/// The co-ordinate system port every motor is in.
pub async fn get_cs(motors: &BTreeMap<String, PmacMotor>) -> FlyResult<String> {
    let mut ports = BTreeSet::new();
    for motor in motors.values() {
        ports.insert(motor.as_raw()?.cs_port.get().await?);
    }
    let mut ports = ports.into_iter();
    match (ports.next(), ports.next()) {
        (Some(port), None) => Ok(port),
        (first, second) => {
            let found: Vec<String> = first.into_iter().chain(second).chain(ports).collect();
            Err(FlyError::Trajectory(format!(
                "Expected one CS, got {found:?}"
            )))
        }
    }
}

async fn cs_axis_letters(
    motors: &BTreeMap<String, PmacMotor>,
) -> FlyResult<BTreeMap<String, String>> {
    let mut letters = BTreeMap::new();
    for (name, motor) in motors {
        letters.insert(name.clone(), motor.as_raw()?.cs_axis.get().await?);
    }
    Ok(letters)
}

/// Move `motors` together to the next point of `points`.
pub async fn move_to_start(
    motors: &BTreeMap<String, PmacMotor>,
    cs_list: &[PmacCoord],
    points: &RemainingPoints,
) -> FlyResult<()> {
    let cs_port = get_cs(motors).await?;
    let mut cs = None;
    for candidate in cs_list {
        if candidate.port.get().await? == cs_port {
            cs = Some(candidate);
            break;
        }
    }
    let cs = cs.ok_or_else(|| FlyError::Trajectory(format!("No CS given for {cs_port}")))?;

    let first = points.peek_point()?;
    let letters = cs_axis_letters(motors).await?;
    // TODO: run-up distance from each axis velocity and acceleration time
    let mut demands = BTreeMap::new();
    for (axis, value) in first.positions {
        let letter = letters.get(&axis).ok_or_else(|| {
            FlyError::Trajectory(format!("no motor given for scan axis '{axis}'"))
        })?;
        demands.insert(letter.clone(), value);
    }
    tracing::debug!(cs = %cs_port, ?demands, "Moving to start");
    cs.defer_moves.put(true).await?;
    cs.demands.put(demands).await?;
    cs.defer_moves.put(false).await
}

/// Write the first batch of `points` to `traj` and build the profile.
pub async fn build_initial_trajectory(
    motors: &BTreeMap<String, PmacMotor>,
    traj: &PmacTrajectory,
    points: &RemainingPoints,
    batch_size: usize,
) -> FlyResult<TrajectoryTracker> {
    let cs_port = get_cs(motors).await?;
    traj.cs.put(cs_port).await?;
    let letters = cs_axis_letters(motors).await?;
    let mut tracker = TrajectoryTracker::new(
        points.generator().clone(),
        letters,
        points.completed(),
        batch_size,
    );
    let batch = tracker.get_next_batch()?;
    let use_axes = cs_axes()
        .map(|letter| {
            let used = batch.positions.contains_key(&letter);
            (letter, used)
        })
        .collect();
    tokio::try_join!(traj.write_batch(&batch), traj.use_axes.put(use_axes))?;
    traj.build.execute().await?;
    check_status(&traj.build_status, &traj.build_message, "Build").await?;
    tracing::debug!(points = batch.len(), "Built trajectory");
    Ok(tracker)
}

async fn check_status(
    status: &ReadSignal<String>,
    message: &ReadSignal<String>,
    action: &str,
) -> FlyResult<()> {
    if status.get().await? == "Success" {
        Ok(())
    } else {
        let message = message.get().await?;
        Err(FlyError::Trajectory(format!("{action} failed: {message}")))
    }
}

/// Execute the profile in `traj`, topping it up from `tracker` as it runs.
///
/// `on_step` is called with the scan point reached, counted from the start of
/// the scan, each time the controller reports progress.
pub async fn keep_filling_trajectory<F>(
    traj: &PmacTrajectory,
    tracker: &mut TrajectoryTracker,
    mut on_step: F,
) -> FlyResult<()>
where
    F: FnMut(usize),
{
    let mut scanned = traj.points_scanned.observe();
    let execute = traj.execute.clone();
    let mut task = tokio::spawn(async move { execute.execute().await });
    let mut finished = false;

    while !finished {
        let num = tokio::select! {
            biased;
            Some(num) = scanned.next() => num,
            result = &mut task => {
                result.map_err(|err| FlyError::Trajectory(format!("execute failed: {err}")))??;
                finished = true;
                // The last count may have landed with the end of the execute
                traj.points_scanned.get().await?
            }
        };
        let step = num + tracker.offset;
        on_step(step);
        if !finished && tracker.incomplete() && tracker.completed < step + tracker.batch_size {
            let batch = tracker.get_next_batch()?;
            traj.write_batch(&batch).await?;
            traj.append.execute().await?;
            check_status(&traj.append_status, &traj.append_message, "Append").await?;
            tracing::debug!(
                points = batch.len(),
                completed = tracker.completed,
                "Appended trajectory"
            );
        }
    }
    check_status(&traj.execute_status, &traj.execute_message, "Execute").await
}

/// Abort the running profile.
pub async fn stop_trajectory(traj: &PmacTrajectory) -> FlyResult<()> {
    tracing::info!(source = traj.abort.source(), "Aborting trajectory");
    traj.abort.execute().await
}
