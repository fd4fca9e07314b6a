//! areaDetector driver and HDF writer plugin.
//!
//! [`AndorLogic`] implements [`DetectorLogic`] on top of a [`DetectorDriver`]
//! and an [`HdfWriter`]. The writer's per-frame summary dataset is exposed as
//! a read signal, so frames are reported from that rather than by reading the
//! file back.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::DetectorSettings;
use crate::detector::{DetectorLogic, DetectorMode};
use crate::device::{DatasetDetails, FileDetails};
use crate::error::{FlyError, FlyResult};
use crate::signal::{wait_for_value, ExecSignal, ReadSignal, ReadWriteSignal, SignalProvider};
use crate::status::lock;

/// Signals of an areaDetector driver.
#[derive(Clone)]
pub struct DetectorDriver {
    /// `Single`, `Multiple` or `Continuous`
    pub image_mode: ReadWriteSignal<String>,
    /// Frames to take in `Multiple` mode
    pub num_images: ReadWriteSignal<usize>,
    /// Driver specific trigger mode name
    pub trigger_mode: ReadWriteSignal<String>,
    /// Start acquiring, completes when acquisition stops
    pub start: ExecSignal,
    /// Stop acquiring
    pub stop: ExecSignal,
    /// True while acquiring
    pub acquiring: ReadSignal<bool>,
    /// Unique id of the last frame, the next one gets this plus one
    pub array_counter: ReadWriteSignal<i64>,
    /// Exposure in seconds
    pub acquire_time: ReadWriteSignal<f64>,
    /// Time between frames
    pub acquire_period: ReadWriteSignal<f64>,
    /// Frame width
    pub array_size_x: ReadSignal<usize>,
    /// Frame height
    pub array_size_y: ReadSignal<usize>,
}

impl DetectorDriver {
    /// Signals of the driver at `prefix`.
    pub fn new(provider: &impl SignalProvider, prefix: &str) -> Self {
        Self {
            image_mode: provider.signal_rw(prefix, "image_mode"),
            num_images: provider.signal_rw(prefix, "num_images"),
            trigger_mode: provider.signal_rw(prefix, "trigger_mode"),
            start: provider.signal_x(prefix, "start"),
            stop: provider.signal_x(prefix, "stop"),
            acquiring: provider.signal_r(prefix, "acquiring"),
            array_counter: provider.signal_rw(prefix, "array_counter"),
            acquire_time: provider.signal_rw(prefix, "acquire_time"),
            acquire_period: provider.signal_rw(prefix, "acquire_period"),
            array_size_x: provider.signal_r(prefix, "array_size_x"),
            array_size_y: provider.signal_r(prefix, "array_size_y"),
        }
    }
}

/// Signals of an HDF5 file writer plugin.
#[derive(Clone)]
pub struct HdfWriter {
    /// `Stream` or `Single`
    pub file_write_mode: ReadWriteSignal<String>,
    /// Single writer multiple reader
    pub swmr_mode: ReadWriteSignal<bool>,
    /// Open the file on the first frame
    pub lazy_open: ReadWriteSignal<bool>,
    /// Frames to capture, 0 for forever
    pub num_capture: ReadWriteSignal<usize>,
    /// Directory
    pub file_path: ReadWriteSignal<String>,
    /// Name without extension
    pub file_name: ReadWriteSignal<String>,
    /// printf style template taking path then name
    pub file_template: ReadWriteSignal<String>,
    /// Attribute giving the frame's position in the file
    pub pos_name_dim_n: ReadWriteSignal<String>,
    /// Start capturing, completes when the file is closed
    pub start: ExecSignal,
    /// Close the file
    pub stop: ExecSignal,
    /// Make written frames visible to readers
    pub flush_now: ExecSignal,
    /// Frames written since last zeroed
    pub array_counter: ReadWriteSignal<i64>,
    /// Flushed contents of the summary dataset, -1 where no frame has landed
    pub summary: ReadSignal<Vec<f64>>,
}

impl HdfWriter {
    /// Signals of the plugin at `prefix`.
    pub fn new(provider: &impl SignalProvider, prefix: &str) -> Self {
        Self {
            file_write_mode: provider.signal_rw(prefix, "file_write_mode"),
            swmr_mode: provider.signal_rw(prefix, "swmr_mode"),
            lazy_open: provider.signal_rw(prefix, "lazy_open"),
            num_capture: provider.signal_rw(prefix, "num_capture"),
            file_path: provider.signal_rw(prefix, "file_path"),
            file_name: provider.signal_rw(prefix, "file_name"),
            file_template: provider.signal_rw(prefix, "file_template"),
            pos_name_dim_n: provider.signal_rw(prefix, "pos_name_dim_n"),
            start: provider.signal_x(prefix, "start"),
            stop: provider.signal_x(prefix, "stop"),
            flush_now: provider.signal_x(prefix, "flush_now"),
            array_counter: provider.signal_rw(prefix, "array_counter"),
            summary: provider.signal_r(prefix, "summary"),
        }
    }
}

/// Set up the file name and start capturing. The returned task finishes when
/// the writer closes the file.
pub async fn open_hdf_file(
    hdf: &HdfWriter,
    file: &FileDetails,
) -> FlyResult<JoinHandle<FlyResult<()>>> {
    tokio::try_join!(
        hdf.file_template.put(file.file_template.clone()),
        hdf.file_path.put(file.file_path.clone()),
        hdf.file_name.put(file.file_name.clone()),
        hdf.file_write_mode.put("Stream".into()),
        // Capture forever
        hdf.num_capture.put(0),
        // Frames go where their unique id says, so a rewind overwrites
        hdf.pos_name_dim_n.put("NDUniqueID".into()),
        hdf.swmr_mode.put(true),
        hdf.lazy_open.put(true),
    )?;
    let start = hdf.start.clone();
    Ok(tokio::spawn(async move { start.execute().await }))
}

/// Reports frame indices as the writer counts them, flushing periodically so
/// readers can see the data.
pub struct HdfFrameObserver {
    counter: BoxStream<'static, i64>,
    num: usize,
    next: usize,
    written: usize,
    timeout: Duration,
    flush_now: ExecSignal,
    flusher: JoinHandle<()>,
}

impl HdfFrameObserver {
    /// Watch for `num` frames, failing if the count stalls for `timeout`.
    pub fn start(hdf: &HdfWriter, num: usize, timeout: Duration, flush_interval: Duration) -> Self {
        let flush_now = hdf.flush_now.clone();
        let flusher = {
            let flush_now = flush_now.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(flush_interval).await;
                    if let Err(err) = flush_now.execute().await {
                        tracing::warn!(error = %err, "Periodic HDF flush failed");
                    }
                }
            })
        };
        Self {
            counter: hdf.array_counter.observe(),
            num,
            next: 0,
            written: 0,
            timeout,
            flush_now,
            flusher,
        }
    }

    /// Index of the next written frame, or `None` once `num` have been seen.
    ///
    /// Frames the counter jumped over are still reported, in order.
    pub async fn next_frame(&mut self) -> FlyResult<Option<usize>> {
        while self.next >= self.written {
            if self.next >= self.num {
                return Ok(None);
            }
            let count = tokio::time::timeout(self.timeout, self.counter.next())
                .await
                .map_err(|_| FlyError::Timeout(self.timeout))?
                .ok_or_else(|| FlyError::NotConnected(self.flush_now.source().to_string()))?;
            // The counter starts from 1 while frame indices start from 0
            self.written = self.written.max(usize::try_from(count).unwrap_or(0));
        }
        if self.next >= self.num {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;
        Ok(Some(index))
    }

    /// Stop periodic flushing and flush one last time.
    pub async fn finish(self) -> FlyResult<()> {
        self.flusher.abort();
        self.flush_now.execute().await
    }
}

impl Drop for HdfFrameObserver {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

/// Set the driver and writer up for `num` frames written from `offset`.
pub async fn setup_n_frames(
    driver: &DetectorDriver,
    hdf: &HdfWriter,
    num: usize,
    offset: usize,
    exposure: f64,
) -> FlyResult<()> {
    let image_mode = if num == 1 { "Single" } else { "Multiple" };
    let counter = i64::try_from(offset)
        .map_err(|_| FlyError::Detector(format!("frame offset {offset} out of range")))?;
    tokio::try_join!(
        driver.image_mode.put(image_mode.into()),
        driver.num_images.put(num),
        driver.acquire_time.put(exposure),
        driver.array_counter.put(counter - 1),
        // Zero so we can see when frames arrive
        hdf.array_counter.put(0),
    )?;
    Ok(())
}

/// Time to leave between trigger edges beyond `exposure`, given the readout
/// time and crystal frequency accuracy in parts per million.
pub fn calc_deadtime(exposure: f64, readout_time: f64, frequency_accuracy_ppm: f64) -> f64 {
    let mut period = exposure + readout_time;
    period += frequency_accuracy_ppm * period / 1_000_000.0;
    period - exposure
}

/// Andor camera writing through an HDF plugin.
pub struct AndorLogic {
    driver: DetectorDriver,
    hdf: HdfWriter,
    readout_time: f64,
    frequency_accuracy_ppm: f64,
    flush_interval: Duration,
    hdf_start: Mutex<Option<JoinHandle<FlyResult<()>>>>,
}

impl std::fmt::Debug for AndorLogic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AndorLogic")
            .field("driver", &self.driver.start.source())
            .field("readout_time", &self.readout_time)
            .finish_non_exhaustive()
    }
}

impl AndorLogic {
    /// Logic for `driver` and `hdf` with timings from `settings`.
    pub fn new(driver: DetectorDriver, hdf: HdfWriter, settings: &DetectorSettings) -> Self {
        Self {
            driver,
            hdf,
            readout_time: settings.readout_time_secs,
            frequency_accuracy_ppm: settings.frequency_accuracy_ppm,
            flush_interval: Duration::from_secs_f64(settings.flush_interval_secs),
            hdf_start: Mutex::new(None),
        }
    }

    async fn wait_for_summary(&self, index: usize, timeout: Duration) -> FlyResult<f64> {
        let summary = wait_for_value(
            &*self.hdf.summary,
            |values: &Vec<f64>| values.get(index).is_some_and(|v| *v >= 0.0),
            timeout,
        )
        .await?;
        summary
            .get(index)
            .copied()
            .ok_or_else(|| FlyError::Detector(format!("no summary for frame {index}")))
    }
}

#[async_trait]
impl DetectorLogic for AndorLogic {
    async fn open(&self, file: &FileDetails) -> FlyResult<DatasetDetails> {
        let handle = open_hdf_file(&self.hdf, file).await?;
        if let Some(previous) = lock(&self.hdf_start).replace(handle) {
            tracing::warn!("HDF writer reopened before the last file was closed");
            previous.abort();
        }
        let (height, width) =
            tokio::try_join!(self.driver.array_size_y.get(), self.driver.array_size_x.get())?;
        Ok(DatasetDetails::new(vec![height, width]))
    }

    async fn trigger(
        &self,
        num: usize,
        offset: usize,
        mode: DetectorMode,
        exposure: f64,
    ) -> FlyResult<()> {
        let trigger_mode = match mode {
            DetectorMode::Software => "Software",
            DetectorMode::Triggered => "External",
            DetectorMode::Gated => "Gate",
        };
        self.driver.trigger_mode.put(trigger_mode.into()).await?;
        setup_n_frames(&self.driver, &self.hdf, num, offset, exposure).await?;
        // This driver needs the period written explicitly
        let period = exposure + self.get_deadtime(exposure).await?;
        self.driver.acquire_period.put(period).await?;
        tracing::debug!(num, offset, trigger_mode, exposure, period, "Armed Andor");

        let start = self.driver.start.clone();
        tokio::spawn(async move {
            if let Err(err) = start.execute().await {
                tracing::warn!(error = %err, "Andor acquisition failed");
            }
        });
        Ok(())
    }

    async fn collect(
        &self,
        num: usize,
        offset: usize,
        timeout: Duration,
        frames: mpsc::UnboundedSender<f64>,
    ) -> FlyResult<()> {
        let mut observer = HdfFrameObserver::start(&self.hdf, num, timeout, self.flush_interval);
        let collected = async {
            while let Some(i) = observer.next_frame().await? {
                let value = self.wait_for_summary(i + offset, timeout).await?;
                // Nobody listening is fine, the frames are still in the file
                let _ = frames.send(value);
            }
            Ok::<(), FlyError>(())
        }
        .await;
        let flushed = observer.finish().await;
        collected.and(flushed)
    }

    async fn get_deadtime(&self, exposure: f64) -> FlyResult<f64> {
        Ok(calc_deadtime(
            exposure,
            self.readout_time,
            self.frequency_accuracy_ppm,
        ))
    }

    async fn stop(&self) -> FlyResult<()> {
        self.driver.stop.execute().await
    }

    async fn close(&self) -> FlyResult<()> {
        self.hdf.stop.execute().await?;
        let handle = lock(&self.hdf_start).take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|err| FlyError::Detector(format!("HDF capture failed: {err}")))??;
        }
        Ok(())
    }
}
