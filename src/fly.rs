//! Fly scanning
//!
//! [`FlyDevice`] speaks the flyer protocol (kickoff / complete / collect) to
//! a scan orchestrator and delegates the hardware choreography to a
//! [`FlyLogic`]. The logic reports every frame each detector produces; the
//! device turns a scan point into data only once every detector has a frame
//! for it, so a pause never leaves half a point behind.
//!
//! # Pause and resume
//!
//! Pausing cancels the running completion and stops the hardware where it is.
//! Frames that arrived for points not yet seen by every detector are thrown
//! away. Resuming starts a new completion from the first incomplete point,
//! writing it at the same place in each file.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::detector::{
    arm_detectors_triggered, close_detectors, collect_detectors, open_detectors, stop_detectors,
    DatumFactory, DetectorDevice, DetectorProgress, IndexedEvent,
};
use crate::device::{
    now, AssetDoc, DataKey, Description, Device, Event, FileDetails, FilenameScheme, Flyable,
    Hints, Reading, Readings,
};
use crate::error::{FlyError, FlyResult};
use crate::pmac::{
    build_initial_trajectory, keep_filling_trajectory, move_to_start, stop_trajectory, PmacCoord,
    PmacMotor, PmacTrajectory,
};
use crate::points::{CompoundGenerator, RemainingPoints};
use crate::status::{lock, Status, WatchUpdate, Watchers};

/// Hardware choreography of a fly scan.
#[async_trait]
pub trait FlyLogic: Send + Sync {
    /// Scan `points`, writing frames from `offset` in each detector's file.
    /// Every frame is reported on `progress` as it arrives.
    async fn scan(
        &self,
        detectors: &[DetectorDevice],
        points: RemainingPoints,
        offset: usize,
        progress: mpsc::UnboundedSender<DetectorProgress>,
    ) -> FlyResult<()>;

    /// Stop where you are, without retracing or closing files.
    async fn stop(&self, detectors: &[DetectorDevice]) -> FlyResult<()>;
}

struct FlyState {
    generator: Arc<CompoundGenerator>,
    when_configured: f64,
    when_triggered: Instant,
    /// Frames already in the files from earlier kickoffs of this stage
    start_offset: usize,
    completed_steps: usize,
    total_steps: usize,
    factories: BTreeMap<String, DatumFactory>,
    watchers: Watchers,
    complete_status: Option<Status>,
    pause_status: Option<Status>,
    paused: bool,
}

struct FlyInner {
    name: String,
    detectors: Vec<DetectorDevice>,
    logic: Arc<dyn FlyLogic>,
    scheme: Arc<FilenameScheme>,
    collect_timeout: Duration,
    state: Mutex<FlyState>,
}

/// Generic fly scan device wrapping a [`FlyLogic`].
#[derive(Clone)]
pub struct FlyDevice {
    inner: Arc<FlyInner>,
}

impl std::fmt::Debug for FlyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlyDevice")
            .field("name", &self.inner.name)
            .field("detectors", &self.inner.detectors)
            .finish_non_exhaustive()
    }
}

impl FlyDevice {
    /// Fly device called `name` scanning `detectors` with `logic`.
    ///
    /// A detector may fall `collect_timeout` plus one point duration behind
    /// before the scan fails.
    pub fn new(
        name: impl Into<String>,
        detectors: Vec<DetectorDevice>,
        logic: Arc<dyn FlyLogic>,
        scheme: Arc<FilenameScheme>,
        collect_timeout: Duration,
    ) -> FlyResult<Self> {
        if detectors.is_empty() {
            return Err(FlyError::InvalidState("Need at least one detector".into()));
        }
        Ok(Self {
            inner: Arc::new(FlyInner {
                name: name.into(),
                detectors,
                logic,
                scheme,
                collect_timeout,
                state: Mutex::new(FlyState {
                    generator: Arc::new(CompoundGenerator::default()),
                    when_configured: now(),
                    when_triggered: Instant::now(),
                    start_offset: 0,
                    completed_steps: 0,
                    total_steps: 0,
                    factories: BTreeMap::new(),
                    watchers: Watchers::new(),
                    complete_status: None,
                    pause_status: None,
                    paused: false,
                }),
            }),
        })
    }

    /// The detectors being scanned.
    pub fn detectors(&self) -> &[DetectorDevice] {
        &self.inner.detectors
    }

    /// Points every detector has produced since kickoff.
    pub fn completed_steps(&self) -> usize {
        lock(&self.inner.state).completed_steps
    }

    fn start_completion(&self) -> Status {
        let watchers = lock(&self.inner.state).watchers.clone();
        let inner = self.inner.clone();
        let status = Status::spawn_watched(async move { inner.do_complete().await }, watchers);
        lock(&self.inner.state).complete_status = Some(status.clone());
        status
    }
}

impl FlyInner {
    async fn do_kickoff(&self) -> FlyResult<()> {
        let (generator, opened) = {
            let mut state = lock(&self.state);
            state.generator.validate()?;
            state.completed_steps = 0;
            state.total_steps = state.generator.size();
            state.when_triggered = Instant::now();
            state.watchers = Watchers::new();
            state.paused = false;
            (state.generator.clone(), !state.factories.is_empty())
        };
        tracing::info!(
            device = %self.name,
            points = generator.size(),
            axes = ?generator.axes(),
            "Kickoff"
        );
        if opened {
            return Ok(());
        }

        // Beginning of the scan, open the files
        let prefix = self.scheme.current_prefix().await?;
        let files: Vec<(DetectorDevice, FileDetails)> = self
            .detectors
            .iter()
            .map(|det| (det.clone(), FileDetails::new(prefix.clone(), det.name())))
            .collect();
        let datasets = open_detectors(&files).await?;
        let mut state = lock(&self.state);
        state.start_offset = 0;
        for ((det, details), datasets) in files.iter().zip(datasets) {
            state.factories.insert(
                det.name().to_string(),
                DatumFactory::new(det.name(), details, datasets),
            );
        }
        Ok(())
    }

    async fn do_complete(&self) -> FlyResult<()> {
        let (generator, completed_at_start, total, offset, watchers, triggered) = {
            let state = lock(&self.state);
            (
                state.generator.clone(),
                state.completed_steps,
                state.total_steps,
                state.start_offset + state.completed_steps,
                state.watchers.clone(),
                state.when_triggered,
            )
        };
        let duration = generator.duration.unwrap_or(0.0);
        let points = RemainingPoints::new(generator, completed_at_start);
        let (progress, reports) = mpsc::unbounded_channel();

        tracing::info!(
            device = %self.name,
            from = completed_at_start,
            total,
            offset,
            "Complete"
        );
        tokio::try_join!(
            self.logic.scan(&self.detectors, points, offset, progress),
            self.track_progress(reports, completed_at_start, total, duration, &watchers, triggered),
        )?;

        lock(&self.state).start_offset += total;
        tracing::info!(device = %self.name, points = total, "Fly scan complete");
        Ok(())
    }

    /// Register points as soon as every detector has a frame for them.
    async fn track_progress(
        &self,
        mut reports: mpsc::UnboundedReceiver<DetectorProgress>,
        completed_at_start: usize,
        total: usize,
        duration: f64,
        watchers: &Watchers,
        triggered: Instant,
    ) -> FlyResult<()> {
        let mut pending: BTreeMap<String, Vec<f64>> = self
            .detectors
            .iter()
            .map(|det| (det.name().to_string(), Vec::new()))
            .collect();
        let mut last_updated: BTreeMap<String, Instant> = pending
            .keys()
            .map(|name| (name.clone(), Instant::now()))
            .collect();
        let mut completed = completed_at_start;
        let allowed = self.collect_timeout + Duration::from_secs_f64(duration.max(0.0));

        while completed < total {
            // The oldest detector may be this far behind
            let oldest = last_updated
                .values()
                .min()
                .map(Instant::elapsed)
                .unwrap_or_default();
            let timeout = allowed.saturating_sub(oldest);
            let report = tokio::time::timeout(timeout, reports.recv())
                .await
                .map_err(|_| FlyError::Timeout(allowed))?
                .ok_or_else(|| {
                    FlyError::Detector(format!(
                        "Frames stopped arriving after {completed} of {total} points"
                    ))
                })?;
            let Some(values) = pending.get_mut(&report.detector) else {
                tracing::warn!(detector = %report.detector, "Frame from unknown detector");
                continue;
            };
            values.push(report.value);
            last_updated.insert(report.detector, Instant::now());

            let ready = pending.values().map(Vec::len).min().unwrap_or(0);
            if ready == 0 {
                continue;
            }
            {
                let mut state = lock(&self.state);
                if state.paused {
                    return Err(FlyError::Cancelled);
                }
                for (name, values) in &mut pending {
                    let values: Vec<f64> = values.drain(..ready).collect();
                    if let Some(factory) = state.factories.get_mut(name) {
                        factory.register_collections(completed, &values);
                    }
                }
                completed += ready;
                state.completed_steps = completed;
            }
            tracing::debug!(device = %self.name, completed, total, "Points collected");
            watchers.notify(&WatchUpdate {
                name: self.name.clone(),
                current: completed as f64,
                initial: 0.0,
                target: total as f64,
                unit: String::new(),
                precision: 0,
                time_elapsed: triggered.elapsed().as_secs_f64(),
                fraction: Some(completed as f64 / total as f64),
            });
        }
        Ok(())
    }
}

impl Device for FlyDevice {
    type Config = CompoundGenerator;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn configure(&self, generator: CompoundGenerator) -> FlyResult<(Readings, Readings)> {
        generator.validate()?;
        let old = self.read_configuration();
        {
            let mut state = lock(&self.inner.state);
            state.when_configured = now();
            state.generator = Arc::new(generator);
        }
        Ok((old, self.read_configuration()))
    }

    fn read_configuration(&self) -> Readings {
        let state = lock(&self.inner.state);
        let value = state.generator.to_json().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Could not serialize generator");
            String::new()
        });
        Readings::from([(
            "generator".to_string(),
            Reading {
                value: value.into(),
                timestamp: state.when_configured,
            },
        )])
    }

    fn describe_configuration(&self) -> Description {
        Description::from([(
            "generator".to_string(),
            DataKey::string("user supplied parameter"),
        )])
    }

    fn stage(&self) -> FlyResult<()> {
        lock(&self.inner.state).factories.clear();
        Ok(())
    }

    fn unstage(&self) -> Status {
        let inner = self.inner.clone();
        Status::spawn(async move {
            tokio::try_join!(
                inner.scheme.done_using_prefix(),
                close_detectors(&inner.detectors)
            )?;
            Ok(())
        })
    }

    fn hints(&self) -> FlyResult<Hints> {
        let state = lock(&self.inner.state);
        Ok(Hints {
            fields: state
                .factories
                .values()
                .map(DatumFactory::summary_name)
                .collect(),
        })
    }
}

impl Flyable for FlyDevice {
    fn kickoff(&self) -> Status {
        let inner = self.inner.clone();
        Status::spawn(async move { inner.do_kickoff().await })
    }

    fn complete(&self) -> Status {
        self.start_completion()
    }

    fn collect(&self) -> FlyResult<Vec<Event>> {
        let mut state = lock(&self.inner.state);
        let generator = state.generator.clone();
        let mut events = Vec::new();
        for factory in state.factories.values_mut() {
            for IndexedEvent { index, mut event } in factory.collect_events() {
                let point = generator.get_point(index)?;
                let timestamp = now();
                for (axis, value) in point.positions {
                    event.insert(axis, value, timestamp);
                }
                events.push(event);
            }
        }
        Ok(events)
    }

    fn describe_collect(&self) -> FlyResult<BTreeMap<String, Description>> {
        let state = lock(&self.inner.state);
        let mut description = Description::new();
        for factory in state.factories.values() {
            description.extend(factory.describe());
        }
        for axis in state.generator.axes() {
            description.insert(axis.clone(), DataKey::number(axis));
        }
        Ok(BTreeMap::from([("primary".to_string(), description)]))
    }

    fn collect_asset_docs(&self) -> Vec<AssetDoc> {
        lock(&self.inner.state)
            .factories
            .values_mut()
            .flat_map(DatumFactory::collect_asset_docs)
            .collect()
    }

    fn pause(&self) -> FlyResult<Status> {
        let (complete, completed) = {
            let mut state = lock(&self.inner.state);
            let complete = state
                .complete_status
                .clone()
                .ok_or_else(|| FlyError::InvalidState("Complete not called".into()))?;
            state.paused = true;
            (complete, state.completed_steps)
        };
        complete.cancel();
        tracing::info!(device = %self.inner.name, completed, "Pausing");
        let inner = self.inner.clone();
        let status = Status::spawn(async move { inner.logic.stop(&inner.detectors).await });
        lock(&self.inner.state).pause_status = Some(status.clone());
        Ok(status)
    }

    fn resume(&self) -> FlyResult<Status> {
        {
            let mut state = lock(&self.inner.state);
            if !state.paused {
                return Err(FlyError::InvalidState("You didn't call pause".into()));
            }
            let pause = state
                .pause_status
                .as_ref()
                .ok_or_else(|| FlyError::InvalidState("You didn't call pause".into()))?;
            if !pause.done() {
                return Err(FlyError::InvalidState(
                    "You didn't wait for pause to finish".into(),
                ));
            }
            if let Some(Err(err)) = pause.outcome() {
                tracing::warn!(error = %err, "Resuming after a failed stop");
            }
            state.paused = false;
            if state.completed_steps >= state.total_steps {
                let status = Status::finished(Ok(()));
                state.complete_status = Some(status.clone());
                return Ok(status);
            }
            tracing::info!(
                device = %self.inner.name,
                from = state.completed_steps,
                "Resuming"
            );
        }
        Ok(self.start_completion())
    }
}

/// Fly scan where the motion controller runs the trajectory and the
/// detectors are triggered by it.
pub struct PmacMasterFlyLogic {
    trajectory: PmacTrajectory,
    motors: BTreeMap<String, PmacMotor>,
    cs_list: Vec<PmacCoord>,
    batch_size: usize,
    collect_timeout: Duration,
}

impl PmacMasterFlyLogic {
    /// Logic driving `motors`, keyed by scan axis name, through `trajectory`.
    pub fn new(
        trajectory: PmacTrajectory,
        motors: BTreeMap<String, PmacMotor>,
        cs_list: Vec<PmacCoord>,
        batch_size: usize,
        collect_timeout: Duration,
    ) -> Self {
        Self {
            trajectory,
            motors,
            cs_list,
            batch_size,
            collect_timeout,
        }
    }
}

#[async_trait]
impl FlyLogic for PmacMasterFlyLogic {
    async fn scan(
        &self,
        detectors: &[DetectorDevice],
        points: RemainingPoints,
        offset: usize,
        progress: mpsc::UnboundedSender<DetectorProgress>,
    ) -> FlyResult<()> {
        let period = points.constant_duration()?;
        let num = points.remaining();

        // Prepare the motors and arm detectors
        let (mut tracker, (), ()) = tokio::try_join!(
            build_initial_trajectory(&self.motors, &self.trajectory, &points, self.batch_size),
            move_to_start(&self.motors, &self.cs_list, &points),
            arm_detectors_triggered(detectors, num, offset, period),
        )?;

        // Kick off the trajectory, then follow the detectors
        let timeout = self.collect_timeout + Duration::from_secs_f64(period);
        tokio::try_join!(
            keep_filling_trajectory(&self.trajectory, &mut tracker, |step| {
                tracing::trace!(step, "Trajectory progress");
            }),
            collect_detectors(detectors, num, offset, timeout, progress),
        )?;
        Ok(())
    }

    async fn stop(&self, detectors: &[DetectorDevice]) -> FlyResult<()> {
        tokio::try_join!(stop_detectors(detectors), stop_trajectory(&self.trajectory))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{CollectTimings, DetectorLogic, DetectorMode};
    use crate::device::{DatasetDetails, PrefixGenerator};
    use crate::points::LineGenerator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct Fixed;

    #[async_trait]
    impl PrefixGenerator for Fixed {
        async fn generate_prefix(&self) -> FlyResult<String> {
            Ok("/data/fly/".into())
        }
    }

    #[derive(Default)]
    struct Files {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl DetectorLogic for Files {
        async fn open(&self, _file: &FileDetails) -> FlyResult<DatasetDetails> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(DatasetDetails::new(vec![2, 2]))
        }

        async fn trigger(&self, _: usize, _: usize, _: DetectorMode, _: f64) -> FlyResult<()> {
            Ok(())
        }

        async fn collect(
            &self,
            _: usize,
            _: usize,
            _: Duration,
            _: mpsc::UnboundedSender<f64>,
        ) -> FlyResult<()> {
            Ok(())
        }

        async fn get_deadtime(&self, _exposure: f64) -> FlyResult<f64> {
            Ok(0.0)
        }

        async fn stop(&self) -> FlyResult<()> {
            Ok(())
        }

        async fn close(&self) -> FlyResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Every `period`, detector "a" produces a frame, then "b" does after `lag`.
    struct Scripted {
        period: Duration,
        lag: Duration,
        offsets: Mutex<Vec<(usize, usize)>>,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl FlyLogic for Scripted {
        async fn scan(
            &self,
            _detectors: &[DetectorDevice],
            points: RemainingPoints,
            offset: usize,
            progress: mpsc::UnboundedSender<DetectorProgress>,
        ) -> FlyResult<()> {
            lock(&self.offsets).push((points.completed(), offset));
            for i in 0..points.remaining() {
                let value = (offset + i) as f64;
                sleep(self.period).await;
                let _ = progress.send(DetectorProgress {
                    detector: "a".into(),
                    value,
                });
                sleep(self.lag).await;
                let _ = progress.send(DetectorProgress {
                    detector: "b".into(),
                    value,
                });
            }
            Ok(())
        }

        async fn stop(&self, _detectors: &[DetectorDevice]) -> FlyResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Rig {
        fly: FlyDevice,
        logic: Arc<Scripted>,
        files: Arc<Files>,
    }

    fn rig(lag: Duration) -> Rig {
        let scheme = Arc::new(FilenameScheme::new(Fixed));
        let files = Arc::new(Files::default());
        let detectors = ["a", "b"]
            .into_iter()
            .map(|name| {
                DetectorDevice::new(name, files.clone(), scheme.clone(), CollectTimings::default())
            })
            .collect();
        let logic = Arc::new(Scripted {
            period: Duration::from_millis(100),
            lag,
            offsets: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        });
        let fly = FlyDevice::new(
            "fly",
            detectors,
            logic.clone(),
            scheme,
            Duration::from_secs(60),
        )
        .unwrap();
        fly.configure(CompoundGenerator::new(
            vec![LineGenerator::new("x", "mm", 0.0, 3.0, 4)],
            0.1,
        ))
        .unwrap();
        Rig { fly, logic, files }
    }

    #[test]
    fn test_needs_a_detector() {
        let scheme = Arc::new(FilenameScheme::new(Fixed));
        let logic = Arc::new(Scripted {
            period: Duration::ZERO,
            lag: Duration::ZERO,
            offsets: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        });
        assert!(FlyDevice::new("fly", vec![], logic, scheme, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_kickoff_needs_configured_generator() {
        let files = Arc::new(Files::default());
        let scheme = Arc::new(FilenameScheme::new(Fixed));
        let det = DetectorDevice::new("a", files.clone(), scheme.clone(), CollectTimings::default());
        let logic = Arc::new(Scripted {
            period: Duration::ZERO,
            lag: Duration::ZERO,
            offsets: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        });
        let fly = FlyDevice::new("fly", vec![det], logic.clone(), scheme, Duration::from_secs(1))
            .unwrap();
        fly.stage().unwrap();
        assert!(matches!(fly.kickoff().await, Err(FlyError::Points(_))));
        assert!(lock(&logic.offsets).is_empty());
        assert_eq!(files.opened.load(Ordering::SeqCst), 0);
        assert!(fly
            .configure(CompoundGenerator::new(vec![], 0.1))
            .is_err());
    }

    #[tokio::test]
    async fn test_configuration() {
        let rig = rig(Duration::ZERO);
        let config = rig.fly.read_configuration();
        let json = config["generator"].value.as_str().unwrap().to_string();
        let generator: CompoundGenerator = serde_json::from_str(&json).unwrap();
        assert_eq!(generator.size(), 4);
        assert_eq!(
            rig.fly.describe_configuration()["generator"].dtype,
            "string"
        );
        let bad = CompoundGenerator::new(vec![LineGenerator::new("x", "mm", 0.0, 1.0, 0)], 0.1);
        assert!(rig.fly.configure(bad).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_points_wait_for_every_detector() {
        let rig = rig(Duration::from_millis(50));
        rig.fly.stage().unwrap();
        rig.fly.kickoff().await.unwrap();
        assert_eq!(rig.files.opened.load(Ordering::SeqCst), 2);
        let docs = rig.fly.collect_asset_docs();
        assert_eq!(docs.len(), 2);

        let status = rig.fly.complete();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let u = updates.clone();
        status.watch(move |update| lock(&u).push(update.clone()));

        sleep(Duration::from_millis(120)).await;
        // "a" has point 0 but "b" does not yet
        assert!(rig.fly.collect().unwrap().is_empty());
        assert_eq!(rig.fly.completed_steps(), 0);

        sleep(Duration::from_millis(50)).await;
        let events = rig.fly.collect().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.data["x"] == 0.0));
        assert!(events.iter().any(|e| e.data.contains_key("a_sum")));
        assert!(events.iter().any(|e| e.data.contains_key("b_sum")));
        assert!(events[0].filled["x"]);

        status.wait().await.unwrap();
        assert_eq!(rig.fly.collect().unwrap().len(), 6);
        // A datum per frame per detector
        assert_eq!(rig.fly.collect_asset_docs().len(), 8);

        let updates = lock(&updates).clone();
        assert_eq!(updates.len(), 4);
        let last = updates.last().unwrap();
        assert_eq!(last.name, "fly");
        assert_eq!(last.current, 4.0);
        assert_eq!(last.target, 4.0);
        assert_eq!(last.fraction, Some(1.0));
        assert!((last.time_elapsed - 0.6).abs() < 0.01);

        let description = rig.fly.describe_collect().unwrap();
        let primary = &description["primary"];
        assert_eq!(primary["x"].source, "x");
        assert_eq!(primary["a"].external.as_deref(), Some("FILESTORE:"));
        assert_eq!(primary["b_sum"].dtype, "number");
        assert_eq!(rig.fly.hints().unwrap().fields, vec!["a_sum", "b_sum"]);

        rig.fly.unstage().await.unwrap();
        assert_eq!(rig.files.closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_kickoff_appends_to_files() {
        let rig = rig(Duration::ZERO);
        rig.fly.stage().unwrap();
        rig.fly.kickoff().await.unwrap();
        rig.fly.complete().await.unwrap();
        rig.fly.kickoff().await.unwrap();
        rig.fly.complete().await.unwrap();
        assert_eq!(rig.files.opened.load(Ordering::SeqCst), 2);
        assert_eq!(*lock(&rig.logic.offsets), vec![(0, 0), (0, 4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let rig = rig(Duration::ZERO);
        assert!(matches!(rig.fly.pause(), Err(FlyError::InvalidState(_))));
        assert!(matches!(rig.fly.resume(), Err(FlyError::InvalidState(_))));

        rig.fly.stage().unwrap();
        rig.fly.kickoff().await.unwrap();
        let status = rig.fly.complete();
        sleep(Duration::from_millis(250)).await;
        assert_eq!(rig.fly.completed_steps(), 2);

        let pause = rig.fly.pause().unwrap();
        assert!(status.done());
        assert!(!status.success().unwrap());
        pause.wait().await.unwrap();
        assert_eq!(rig.logic.stops.load(Ordering::SeqCst), 1);

        let resumed = rig.fly.resume().unwrap();
        resumed.wait().await.unwrap();
        assert_eq!(*lock(&rig.logic.offsets), vec![(0, 0), (2, 2)]);

        let mut indexes: Vec<f64> = rig
            .fly
            .collect()
            .unwrap()
            .iter()
            .filter(|e| e.data.contains_key("a_sum"))
            .filter_map(|e| e.data["x"].as_f64())
            .collect();
        indexes.sort_by(f64::total_cmp);
        assert_eq!(indexes, vec![0.0, 1.0, 2.0, 3.0]);

        // Nothing left to resume once complete
        let pause = rig.fly.pause().unwrap();
        pause.wait().await.unwrap();
        assert!(rig.fly.resume().unwrap().success().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_needs_finished_pause() {
        struct SlowStop(Scripted);

        #[async_trait]
        impl FlyLogic for SlowStop {
            async fn scan(
                &self,
                detectors: &[DetectorDevice],
                points: RemainingPoints,
                offset: usize,
                progress: mpsc::UnboundedSender<DetectorProgress>,
            ) -> FlyResult<()> {
                self.0.scan(detectors, points, offset, progress).await
            }

            async fn stop(&self, _detectors: &[DetectorDevice]) -> FlyResult<()> {
                sleep(Duration::from_secs(1)).await;
                Ok(())
            }
        }

        let scheme = Arc::new(FilenameScheme::new(Fixed));
        let det = DetectorDevice::new(
            "a",
            Arc::new(Files::default()),
            scheme.clone(),
            CollectTimings::default(),
        );
        let logic = Arc::new(SlowStop(Scripted {
            period: Duration::from_millis(100),
            lag: Duration::ZERO,
            offsets: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        }));
        let fly = FlyDevice::new("fly", vec![det], logic, scheme, Duration::from_secs(60)).unwrap();
        fly.configure(CompoundGenerator::new(
            vec![LineGenerator::new("x", "mm", 0.0, 1.0, 2)],
            0.1,
        ))
        .unwrap();
        fly.kickoff().await.unwrap();
        let _status = fly.complete();
        let pause = fly.pause().unwrap();
        assert!(matches!(fly.resume(), Err(FlyError::InvalidState(_))));
        pause.wait().await.unwrap();
        fly.resume().unwrap().await.unwrap();
    }
}
