//! Detectors
//!
//! A detector is split into hardware specific [`DetectorLogic`] and a generic
//! [`DetectorDevice`] that turns the frames the logic reports into readings
//! and asset documents with a [`DatumFactory`].
//!
//! The free functions at the bottom drive many detectors at once for fly
//! scans; each runs the same step on every detector concurrently.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::device::{
    now, AssetDoc, DataKey, DatasetDetails, Datum, Description, Device, Event, FileDetails,
    FilenameScheme, HdfResource, Hints, Readable, Reading, Readings, Resource,
};
use crate::error::{FlyError, FlyResult};
use crate::status::{lock, Status, WatchUpdate, Watchers};

/// How frames are triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorMode {
    /// Internally, one exposure per trigger call
    Software,
    /// By external rising edges
    Triggered,
    /// For as long as an external gate is high
    Gated,
}

/// Hardware specific part of a detector.
#[async_trait]
pub trait DetectorLogic: Send + Sync {
    /// Open files for writing.
    async fn open(&self, file: &FileDetails) -> FlyResult<DatasetDetails>;

    /// Arm for `num` frames, written at `offset` into the file. Exposure is
    /// not used in gated mode.
    async fn trigger(
        &self,
        num: usize,
        offset: usize,
        mode: DetectorMode,
        exposure: f64,
    ) -> FlyResult<()>;

    /// Wait for the frames armed by [`DetectorLogic::trigger`], sending the
    /// summary value of each one to `frames` in order.
    async fn collect(
        &self,
        num: usize,
        offset: usize,
        timeout: Duration,
        frames: mpsc::UnboundedSender<f64>,
    ) -> FlyResult<()>;

    /// Time to add to an exposure before the next trigger.
    async fn get_deadtime(&self, exposure: f64) -> FlyResult<f64>;

    /// Stop where you are, without closing files.
    async fn stop(&self) -> FlyResult<()>;

    /// Close any files.
    async fn close(&self) -> FlyResult<()>;
}

/// Progress and timeout settings for detector collection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollectTimings {
    /// Time between progress reports
    pub progress_interval: Duration,
    /// How long past the expected time to wait for a frame
    pub collect_timeout: Duration,
}

impl Default for CollectTimings {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(100),
            collect_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ScanConfig> for CollectTimings {
    fn from(config: &ScanConfig) -> Self {
        Self {
            progress_interval: Duration::from_secs_f64(config.progress_interval_secs),
            collect_timeout: Duration::from_secs_f64(config.collect_timeout_secs),
        }
    }
}

/// Event produced by a [`DatumFactory`], with the scan point it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedEvent {
    /// Index of the point in the scan
    pub index: usize,
    /// The event
    pub event: Event,
}

/// Makes resource, datum and event documents for frames written to one file.
#[derive(Debug)]
pub struct DatumFactory {
    name: String,
    datasets: DatasetDetails,
    resource_uid: String,
    point_number: usize,
    events: Vec<IndexedEvent>,
    last_event: Option<Event>,
    asset_docs: Vec<AssetDoc>,
}

impl DatumFactory {
    /// Factory for the file described by `details`. Queues its resource document.
    pub fn new(name: impl Into<String>, details: &FileDetails, datasets: DatasetDetails) -> Self {
        let hdf = HdfResource::area_detector(details);
        let resource = Resource {
            uid: Uuid::new_v4().to_string(),
            spec: hdf.spec,
            root: details.file_path.clone(),
            resource_path: details.relative_path(),
            resource_kwargs: BTreeMap::from([("frame_per_point".to_string(), Value::from(1))]),
            path_semantics: "posix".into(),
        };
        Self {
            name: name.into(),
            datasets,
            resource_uid: resource.uid.clone(),
            point_number: 0,
            events: Vec::new(),
            last_event: None,
            asset_docs: vec![AssetDoc::Resource(resource)],
        }
    }

    /// Field holding the datum id of each frame.
    pub fn data_name(&self) -> String {
        format!("{}{}", self.name, self.datasets.data_suffix)
    }

    /// Field holding the summary value of each frame.
    pub fn summary_name(&self) -> String {
        format!("{}{}", self.name, self.datasets.summary_suffix)
    }

    /// Frames registered so far, which is also the next frame's index in the file.
    pub fn point_number(&self) -> usize {
        self.point_number
    }

    /// Register frames with summary `values`, for scan points from `first_index`.
    pub fn register_collections(&mut self, first_index: usize, values: &[f64]) {
        let (data_name, summary_name) = (self.data_name(), self.summary_name());
        for (i, value) in values.iter().enumerate() {
            let datum = Datum {
                datum_id: format!("{}/{}", self.resource_uid, self.point_number),
                resource: self.resource_uid.clone(),
                datum_kwargs: BTreeMap::from([(
                    "point_number".to_string(),
                    Value::from(self.point_number),
                )]),
            };
            let time = now();
            let mut event = Event {
                time,
                ..Event::default()
            };
            event.insert(summary_name.clone(), *value, time);
            event.insert(data_name.clone(), datum.datum_id.clone(), time);
            event.filled.insert(data_name.clone(), false);

            self.asset_docs.push(AssetDoc::Datum(datum));
            self.last_event = Some(event.clone());
            self.events.push(IndexedEvent {
                index: first_index + i,
                event,
            });
            self.point_number += 1;
        }
    }

    /// Events registered since the last call.
    pub fn collect_events(&mut self) -> Vec<IndexedEvent> {
        std::mem::take(&mut self.events)
    }

    /// Asset documents made since the last call.
    pub fn collect_asset_docs(&mut self) -> Vec<AssetDoc> {
        std::mem::take(&mut self.asset_docs)
    }

    /// Description of the frame and summary fields.
    pub fn describe(&self) -> Description {
        // Leading 1 keeps the shape compatible with area detector frames
        let mut shape = vec![1];
        shape.extend(&self.datasets.data_shape);
        Description::from([
            (
                self.data_name(),
                DataKey {
                    source: "an HDF file".into(),
                    dtype: "array".into(),
                    shape,
                    external: Some("FILESTORE:".into()),
                    precision: None,
                },
            ),
            (
                self.summary_name(),
                DataKey {
                    precision: Some(0),
                    ..DataKey::number("an HDF file")
                },
            ),
        ])
    }

    /// Readings from the last registered frame.
    pub fn read(&self) -> FlyResult<Readings> {
        let event = self
            .last_event
            .as_ref()
            .ok_or_else(|| FlyError::InvalidState("no frames collected yet".into()))?;
        Ok(event
            .data
            .iter()
            .map(|(key, value)| {
                let timestamp = event.timestamps.get(key).copied().unwrap_or(event.time);
                (
                    key.clone(),
                    Reading {
                        value: value.clone(),
                        timestamp,
                    },
                )
            })
            .collect())
    }
}

/// Settings of a [`DetectorDevice`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    /// Exposure time in seconds
    pub exposure: f64,
}

struct DetectorState {
    exposure: f64,
    when_configured: f64,
    factory: Option<DatumFactory>,
}

struct DetectorInner {
    name: String,
    logic: Arc<dyn DetectorLogic>,
    scheme: Arc<FilenameScheme>,
    timings: CollectTimings,
    state: Mutex<DetectorState>,
}

/// Detector usable in step scans, and by fly scan logic through [`DetectorDevice::logic`].
#[derive(Clone)]
pub struct DetectorDevice {
    inner: Arc<DetectorInner>,
}

impl std::fmt::Debug for DetectorDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorDevice")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl DetectorDevice {
    /// Detector called `name`, writing files named by `scheme`.
    pub fn new(
        name: impl Into<String>,
        logic: Arc<dyn DetectorLogic>,
        scheme: Arc<FilenameScheme>,
        timings: CollectTimings,
    ) -> Self {
        Self {
            inner: Arc::new(DetectorInner {
                name: name.into(),
                logic,
                scheme,
                timings,
                state: Mutex::new(DetectorState {
                    exposure: 0.1,
                    when_configured: now(),
                    factory: None,
                }),
            }),
        }
    }

    /// The hardware specific logic.
    pub fn logic(&self) -> &Arc<dyn DetectorLogic> {
        &self.inner.logic
    }

    fn with_factory<T>(&self, f: impl FnOnce(&DatumFactory) -> FlyResult<T>) -> FlyResult<T> {
        let state = lock(&self.inner.state);
        let factory = state
            .factory
            .as_ref()
            .ok_or_else(|| FlyError::InvalidState("Not triggered yet".into()))?;
        f(factory)
    }
}

/// Progress reporting task, stopped however the trigger ends.
struct Ticker(JoinHandle<()>);

impl Drop for Ticker {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl DetectorInner {
    async fn do_trigger(&self, watchers: Watchers) -> FlyResult<()> {
        let start = Instant::now();
        let (exposure, opened) = {
            let state = lock(&self.state);
            (state.exposure, state.factory.is_some())
        };

        if !opened {
            // Beginning of the scan, open the file
            let prefix = self.scheme.current_prefix().await?;
            let details = FileDetails::new(prefix, self.name.clone());
            let datasets = self.logic.open(&details).await?;
            tracing::info!(detector = %self.name, path = %details.full_path(), "Opened file");
            lock(&self.state).factory = Some(DatumFactory::new(&self.name, &details, datasets));
        }
        let offset = lock(&self.state)
            .factory
            .as_ref()
            .map(DatumFactory::point_number)
            .unwrap_or_default();

        self.logic
            .trigger(1, offset, DetectorMode::Software, exposure)
            .await?;

        let _progress = {
            let (name, interval) = (self.name.clone(), self.timings.progress_interval);
            Ticker(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let elapsed = start.elapsed().as_secs_f64();
                    watchers.notify(&WatchUpdate {
                        name: name.clone(),
                        current: elapsed,
                        initial: 0.0,
                        target: exposure,
                        unit: "s".into(),
                        precision: 3,
                        time_elapsed: elapsed,
                        fraction: Some(if exposure > 0.0 { elapsed / exposure } else { 1.0 }),
                    });
                }
            }))
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let timeout = Duration::from_secs_f64(exposure.max(0.0)) + self.timings.collect_timeout;
        self.logic.collect(1, offset, timeout, tx).await?;

        let mut values = Vec::new();
        while let Ok(value) = rx.try_recv() {
            values.push(value);
        }
        if let Some(factory) = lock(&self.state).factory.as_mut() {
            let index = factory.point_number();
            factory.register_collections(index, &values);
        }
        Ok(())
    }
}

impl Device for DetectorDevice {
    type Config = DetectorConfig;

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn configure(&self, config: DetectorConfig) -> FlyResult<(Readings, Readings)> {
        if config.exposure.is_nan() || config.exposure <= 0.0 {
            return Err(FlyError::InvalidState(format!(
                "exposure must be positive, got {}",
                config.exposure
            )));
        }
        let old = self.read_configuration();
        {
            let mut state = lock(&self.inner.state);
            state.when_configured = now();
            state.exposure = config.exposure;
        }
        Ok((old, self.read_configuration()))
    }

    fn read_configuration(&self) -> Readings {
        let state = lock(&self.inner.state);
        Readings::from([(
            "exposure".to_string(),
            Reading {
                value: Value::from(state.exposure),
                timestamp: state.when_configured,
            },
        )])
    }

    fn describe_configuration(&self) -> Description {
        Description::from([(
            "exposure".to_string(),
            DataKey::number("user supplied parameter"),
        )])
    }

    fn stage(&self) -> FlyResult<()> {
        lock(&self.inner.state).factory = None;
        Ok(())
    }

    fn unstage(&self) -> Status {
        let inner = self.inner.clone();
        Status::spawn(async move {
            tokio::try_join!(inner.logic.close(), inner.scheme.done_using_prefix())?;
            Ok(())
        })
    }

    fn hints(&self) -> FlyResult<Hints> {
        self.with_factory(|factory| {
            Ok(Hints {
                fields: vec![factory.summary_name()],
            })
        })
    }
}

impl Readable for DetectorDevice {
    fn trigger(&self) -> Status {
        let inner = self.inner.clone();
        let watchers = Watchers::new();
        let reporting = watchers.clone();
        Status::spawn_watched(async move { inner.do_trigger(reporting).await }, watchers)
    }

    fn read(&self) -> FlyResult<Readings> {
        self.with_factory(DatumFactory::read)
    }

    fn describe(&self) -> FlyResult<Description> {
        self.with_factory(|factory| Ok(factory.describe()))
    }
}

impl DetectorDevice {
    /// Resource and datum documents made since the last call.
    pub fn collect_asset_docs(&self) -> Vec<AssetDoc> {
        lock(&self.inner.state)
            .factory
            .as_mut()
            .map(DatumFactory::collect_asset_docs)
            .unwrap_or_default()
    }
}

// =============================================================================
// Driving many detectors
// =============================================================================

/// A frame reported by one detector during a fly scan.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorProgress {
    /// Name of the detector
    pub detector: String,
    /// Summary value of the frame
    pub value: f64,
}

/// Open a file on every detector.
pub async fn open_detectors(
    detectors: &[(DetectorDevice, FileDetails)],
) -> FlyResult<Vec<DatasetDetails>> {
    try_join_all(
        detectors
            .iter()
            .map(|(det, details)| async move { det.logic().open(details).await }),
    )
    .await
}

/// Arm every detector for `num` externally triggered frames `period` apart.
pub async fn arm_detectors_triggered(
    detectors: &[DetectorDevice],
    num: usize,
    offset: usize,
    period: f64,
) -> FlyResult<()> {
    try_join_all(detectors.iter().map(|det| async move {
        let exposure = period - det.logic().get_deadtime(period).await?;
        det.logic()
            .trigger(num, offset, DetectorMode::Triggered, exposure)
            .await
    }))
    .await?;
    Ok(())
}

/// Wait for `num` frames from every detector, reporting each as it arrives.
pub async fn collect_detectors(
    detectors: &[DetectorDevice],
    num: usize,
    offset: usize,
    timeout: Duration,
    progress: mpsc::UnboundedSender<DetectorProgress>,
) -> FlyResult<()> {
    try_join_all(detectors.iter().map(|det| {
        let progress = progress.clone();
        async move {
            let (frames, mut values) = mpsc::unbounded_channel();
            let forward = async {
                while let Some(value) = values.recv().await {
                    let report = DetectorProgress {
                        detector: det.name().to_string(),
                        value,
                    };
                    if progress.send(report).is_err() {
                        break;
                    }
                }
            };
            let collecting = det.logic().collect(num, offset, timeout, frames);
            let (collected, ()) = tokio::join!(collecting, forward);
            collected
        }
    }))
    .await?;
    Ok(())
}

/// Stop every detector.
pub async fn stop_detectors(detectors: &[DetectorDevice]) -> FlyResult<()> {
    try_join_all(detectors.iter().map(|det| det.logic().stop())).await?;
    Ok(())
}

/// Close every detector's file.
pub async fn close_detectors(detectors: &[DetectorDevice]) -> FlyResult<()> {
    try_join_all(detectors.iter().map(|det| det.logic().close())).await?;
    Ok(())
}
