//! Device protocol shared by motors, detectors and fly scan devices.
//!
//! These traits mirror the calls a scan orchestrator makes on hardware. Every
//! call is synchronous: anything long-running hands back a [`Status`] and does
//! its work on the tokio runtime. Devices are cheap handles (`Clone`, backed by
//! an `Arc`), so the orchestrator and background tasks can share them.
//!
//! # Documents
//!
//! - [`Reading`] / [`DataKey`]: one value and how to describe it
//! - [`Event`]: one row of collected fly scan data
//! - [`AssetDoc`]: resource and datum documents pointing at externally
//!   written frames
//!
//! # File naming
//!
//! Detectors that write files ask a shared [`FilenameScheme`] for a prefix.
//! The prefix stays the same for every detector in a scan, then moves on once
//! someone reports being done with it.

use std::collections::BTreeMap;
use std::path::{PathBuf, MAIN_SEPARATOR};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::FlyResult;
use crate::status::Status;

/// Seconds since the Unix epoch, as used for document timestamps.
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

// =============================================================================
// Documents
// =============================================================================

/// A value with the time it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// The value
    pub value: Value,
    /// Seconds since the epoch
    pub timestamp: f64,
}

impl Reading {
    /// Reading of `value` taken now.
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            timestamp: now(),
        }
    }
}

/// Description of one field of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Where the data came from
    pub source: String,
    /// `number`, `string` or `array`
    pub dtype: String,
    /// Array dimensions, empty for scalars
    pub shape: Vec<usize>,
    /// Set when the data is stored outside the event, e.g. `FILESTORE:`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    /// Display precision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
}

impl DataKey {
    /// Scalar number from `source`.
    pub fn number(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dtype: "number".into(),
            shape: Vec::new(),
            external: None,
            precision: None,
        }
    }

    /// Scalar string from `source`.
    pub fn string(source: impl Into<String>) -> Self {
        Self {
            dtype: "string".into(),
            ..Self::number(source)
        }
    }
}

/// Readings keyed by field name.
pub type Readings = BTreeMap<String, Reading>;

/// Data keys keyed by field name.
pub type Description = BTreeMap<String, DataKey>;

/// One row of data produced by a flyer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    /// Field values, or datum ids for external data
    pub data: BTreeMap<String, Value>,
    /// Per-field timestamps
    pub timestamps: BTreeMap<String, f64>,
    /// Time of the event
    pub time: f64,
    /// False for fields whose value is a datum id still to be loaded
    pub filled: BTreeMap<String, bool>,
}

impl Event {
    /// Add a filled field with its timestamp.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>, timestamp: f64) {
        let key = key.into();
        self.data.insert(key.clone(), value.into());
        self.timestamps.insert(key.clone(), timestamp);
        self.filled.insert(key, true);
    }
}

/// Fields worth plotting.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Hints {
    /// Field names
    pub fields: Vec<String>,
}

/// Points to a file written outside the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique id, referenced by every datum
    pub uid: String,
    /// File format handler name
    pub spec: String,
    /// Root directory, may be remapped by consumers
    pub root: String,
    /// Path of the file relative to `root`
    pub resource_path: String,
    /// Handler arguments
    pub resource_kwargs: BTreeMap<String, Value>,
    /// Path flavour
    pub path_semantics: String,
}

/// Points to one frame within a [`Resource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    /// `"{resource}/{n}"`
    pub datum_id: String,
    /// Uid of the owning resource
    pub resource: String,
    /// Handler arguments locating the frame
    pub datum_kwargs: BTreeMap<String, Value>,
}

/// Asset document, as emitted by `collect_asset_docs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "doc", rename_all = "lowercase")]
pub enum AssetDoc {
    /// A new file
    Resource(Resource),
    /// A frame in a file
    Datum(Datum),
}

// =============================================================================
// Device traits
// =============================================================================

/// Behaviour shared by every device.
pub trait Device: Send + Sync {
    /// Settings accepted by [`Device::configure`]
    type Config;

    /// Name used as the prefix of every field the device produces
    fn name(&self) -> &str;

    /// Apply new settings, returning the configuration before and after.
    fn configure(&self, config: Self::Config) -> FlyResult<(Readings, Readings)>;

    /// Current settings
    fn read_configuration(&self) -> Readings;

    /// Description of the settings
    fn describe_configuration(&self) -> Description;

    /// Prepare for a scan
    fn stage(&self) -> FlyResult<()> {
        Ok(())
    }

    /// Tidy up after a scan
    fn unstage(&self) -> Status {
        Status::finished(Ok(()))
    }

    /// Fields worth plotting
    fn hints(&self) -> FlyResult<Hints> {
        Ok(Hints::default())
    }
}

/// A device that can be triggered and read in a step scan.
pub trait Readable: Device {
    /// Acquire a new reading
    fn trigger(&self) -> Status;

    /// The reading acquired by the last trigger
    fn read(&self) -> FlyResult<Readings>;

    /// Description of the fields [`Readable::read`] returns
    fn describe(&self) -> FlyResult<Description>;
}

/// A device that can be moved to a position.
pub trait Movable: Readable {
    /// Move to `position`, failing if it takes longer than `timeout`.
    fn set(&self, position: f64, timeout: Option<std::time::Duration>) -> Status;

    /// Stop moving. An in-flight set fails unless `success` is true.
    fn stop(&self, success: bool) -> Status;
}

/// A device that runs a whole scan itself.
pub trait Flyable: Device {
    /// Prepare to fly. Done when ready to start.
    fn kickoff(&self) -> Status;

    /// Fly. Done when every point has been collected.
    fn complete(&self) -> Status;

    /// Events for the points collected since the last call
    fn collect(&self) -> FlyResult<Vec<Event>>;

    /// Description of collected events, per stream
    fn describe_collect(&self) -> FlyResult<BTreeMap<String, Description>>;

    /// Resource and datum documents produced since the last call
    fn collect_asset_docs(&self) -> Vec<AssetDoc>;

    /// Stop flying, keeping what has been collected. Returns the stop status.
    fn pause(&self) -> FlyResult<Status>;

    /// Carry on from the last collected point. Returns the new completion status.
    fn resume(&self) -> FlyResult<Status>;
}

// =============================================================================
// Files
// =============================================================================

/// Where a detector should write its file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDetails {
    /// Directory, with trailing separator
    pub file_path: String,
    /// File name without extension
    pub file_name: String,
    /// printf style template taking path then name
    pub file_template: String,
}

impl FileDetails {
    /// HDF5 file `file_name` under `file_path`.
    pub fn new(file_path: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            file_name: file_name.into(),
            file_template: "%s%s.h5".into(),
        }
    }

    /// The template with path and name filled in.
    pub fn full_path(&self) -> String {
        let mut args = [self.file_path.as_str(), self.file_name.as_str()].into_iter();
        let mut parts = self.file_template.split("%s");
        let mut out = parts.next().unwrap_or_default().to_string();
        for part in parts {
            out.push_str(args.next().unwrap_or_default());
            out.push_str(part);
        }
        out
    }

    /// Path of the file relative to `file_path`.
    pub fn relative_path(&self) -> String {
        let full = self.full_path();
        full.strip_prefix(&self.file_path)
            .map(str::to_string)
            .unwrap_or(full)
    }
}

/// Shape and naming of the datasets a detector writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDetails {
    /// Shape of one frame, slowest dimension first
    pub data_shape: Vec<usize>,
    /// Appended to the detector name for the frame field
    pub data_suffix: String,
    /// Appended to the detector name for the summary field
    pub summary_suffix: String,
}

impl DatasetDetails {
    /// Frames of `data_shape` with the usual field suffixes.
    pub fn new(data_shape: Vec<usize>) -> Self {
        Self {
            data_shape,
            data_suffix: String::new(),
            summary_suffix: "_sum".into(),
        }
    }
}

/// A dataset of interest within an HDF file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HdfDatasetResource {
    /// Field name suffix
    pub name: String,
    /// Path inside the file
    pub dataset_path: String,
}

/// Path, handler and datasets of an HDF file written by an area detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HdfResource {
    /// Frame datasets
    pub data: Vec<HdfDatasetResource>,
    /// Per-frame summary dataset
    pub summary: HdfDatasetResource,
    /// Full path of the file
    pub file_path: String,
    /// `AD_HDF5` requires the primary dataset at `/entry/data/data`
    pub spec: String,
}

impl HdfResource {
    /// Standard area detector layout for the file described by `details`.
    pub fn area_detector(details: &FileDetails) -> Self {
        Self {
            data: vec![HdfDatasetResource {
                name: "data".into(),
                dataset_path: "/entry/data/data".into(),
            }],
            summary: HdfDatasetResource {
                name: "sum".into(),
                dataset_path: "/entry/sum".into(),
            },
            file_path: details.full_path(),
            spec: "AD_HDF5".into(),
        }
    }
}

/// Makes a fresh file prefix for a scan.
#[async_trait]
pub trait PrefixGenerator: Send + Sync {
    /// A new prefix, typically a directory with trailing separator
    async fn generate_prefix(&self) -> FlyResult<String>;
}

/// Creates a new uniquely named directory for every prefix.
#[derive(Debug, Clone, Default)]
pub struct TmpPrefixGenerator {
    root: Option<PathBuf>,
}

impl TmpPrefixGenerator {
    /// Directories under `root`, or the system temp dir if `None`.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }
}

#[async_trait]
impl PrefixGenerator for TmpPrefixGenerator {
    async fn generate_prefix(&self) -> FlyResult<String> {
        let root = self.root.clone().unwrap_or_else(std::env::temp_dir);
        tokio::fs::create_dir_all(&root).await?;
        // Kept on disk, the files outlive the scan
        let dir = tempfile::Builder::new()
            .prefix("bluefly-")
            .tempdir_in(&root)?
            .keep();
        Ok(format!("{}{}", dir.display(), MAIN_SEPARATOR))
    }
}

#[derive(Debug, Default)]
struct PrefixState {
    current: Option<String>,
    in_use: bool,
}

/// File prefix shared by every detector in a scan.
pub struct FilenameScheme {
    generator: Box<dyn PrefixGenerator>,
    state: Mutex<PrefixState>,
}

impl std::fmt::Debug for FilenameScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilenameScheme").finish_non_exhaustive()
    }
}

impl FilenameScheme {
    /// Scheme handing out prefixes made by `generator`.
    pub fn new(generator: impl PrefixGenerator + 'static) -> Self {
        Self {
            generator: Box::new(generator),
            state: Mutex::new(PrefixState::default()),
        }
    }

    /// Temporary directory per scan, under `root` if given.
    pub fn tmp(root: Option<PathBuf>) -> Self {
        Self::new(TmpPrefixGenerator::new(root))
    }

    /// The prefix for the current scan, marking it as in use.
    pub async fn current_prefix(&self) -> FlyResult<String> {
        let mut state = self.state.lock().await;
        state.in_use = true;
        match &state.current {
            Some(prefix) => Ok(prefix.clone()),
            None => {
                let prefix = self.generator.generate_prefix().await?;
                tracing::debug!(%prefix, "Generated file prefix");
                state.current = Some(prefix.clone());
                Ok(prefix)
            }
        }
    }

    /// Report being done with the current prefix. The first report after it
    /// was used moves on to a new prefix, later ones do nothing.
    pub async fn done_using_prefix(&self) -> FlyResult<()> {
        let mut state = self.state.lock().await;
        if state.in_use {
            state.current = Some(self.generator.generate_prefix().await?);
            state.in_use = false;
        }
        Ok(())
    }
}
