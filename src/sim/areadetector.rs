//! Simulated area detector.
//!
//! Frames are a gaussian blob scaled by a pattern evaluated at two motor
//! positions, so a 2D scan over those motors paints a picture in the summary
//! values. Only the summary of each frame is kept; no file is written.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::areadetector::{DetectorDriver, HdfWriter};
use crate::device::FileDetails;
use crate::error::{FlyError, FlyResult};
use crate::signal::sim::SimProvider;
use crate::signal::ReadSignal;
use crate::status::lock;

fn linspace(n: usize) -> impl Iterator<Item = f64> {
    let step = if n > 1 { 2.0 / (n - 1) as f64 } else { 0.0 };
    (0..n).map(move |i| -1.0 + i as f64 * step)
}

/// Gaussian blob of `height` rows of `width` values in 0..1, peaking in the middle.
pub fn make_gaussian_blob(width: usize, height: usize) -> Vec<f64> {
    let xs: Vec<f64> = linspace(width).collect();
    linspace(height)
        .flat_map(|y| xs.iter().map(move |x| (-(x * x + y * y)).exp()))
        .collect()
}

/// Something that varies interestingly for `x` and `y` in -10..10, in 0..1.5.
pub fn interesting_pattern(x: f64, y: f64) -> f64 {
    0.5 + (x.sin().powi(10) + (10.0 + y * x).cos() * x.cos()) / 2.0
}

/// Pixel value as an 8 bit camera stores it, wrapping above 255.
fn to_pixel(value: f64) -> u8 {
    value as u32 as u8
}

#[derive(Default)]
struct SimFile {
    path: Option<String>,
    sums: Vec<f64>,
}

/// Simulate `driver` and `hdf`, with frame intensity following the `x` and
/// `y` readbacks.
pub fn sim_detector_logic(
    p: &SimProvider,
    driver: &DetectorDriver,
    hdf: &HdfWriter,
    x: ReadSignal<f64>,
    y: ReadSignal<f64>,
    width: usize,
    height: usize,
) -> FlyResult<()> {
    p.set_value(&*driver.array_size_x, width)?;
    p.set_value(&*driver.array_size_y, height)?;

    // The image each frame scales, 0..255
    let blob: Arc<Vec<f64>> = Arc::new(
        make_gaussian_blob(width, height)
            .into_iter()
            .map(|v| v * 255.0)
            .collect(),
    );
    let file: Arc<Mutex<SimFile>> = Arc::default();
    let stopping = Arc::new(watch::channel(false).0);

    let (provider, h, state) = (p.clone(), hdf.clone(), file.clone());
    p.on_call(&*hdf.start, move || {
        let result = (|| -> FlyResult<()> {
            let details = FileDetails {
                file_path: provider.get_value(&*h.file_path)?,
                file_name: provider.get_value(&*h.file_name)?,
                file_template: provider.get_value(&*h.file_template)?,
            };
            let path = details.full_path();
            tracing::debug!(%path, "Sim HDF file opened");
            *lock(&state) = SimFile {
                path: Some(path),
                sums: Vec::new(),
            };
            provider.set_value(&*h.summary, Vec::new())?;
            Ok(())
        })();
        async move { result }
    })?;

    let (provider, h, state) = (p.clone(), hdf.clone(), file.clone());
    p.on_call(&*hdf.flush_now, move || {
        let sums = lock(&state).sums.clone();
        let result = provider.set_value(&*h.summary, sums).map(|_| ());
        async move { result }
    })?;

    let state = file.clone();
    p.on_call(&*hdf.stop, move || {
        if let Some(path) = lock(&state).path.take() {
            tracing::debug!(%path, "Sim HDF file closed");
        }
        async { Ok(()) }
    })?;

    let stop = stopping.clone();
    p.on_call(&*driver.stop, move || {
        stop.send_replace(true);
        async { Ok(()) }
    })?;

    let (provider, d, h) = (p.clone(), driver.clone(), hdf.clone());
    p.on_call(&*driver.start, move || {
        let (p, d, h, x, y) = (provider.clone(), d.clone(), h.clone(), x.clone(), y.clone());
        let (blob, file, stopping) = (blob.clone(), file.clone(), stopping.clone());
        async move {
            stopping.send_replace(false);
            let mut stop = stopping.subscribe();
            // Drivers number frames from array_counter + 1
            let offset = p.get_value(&*d.array_counter)? + 1;
            let exposure = p.get_value(&*d.acquire_time)?;
            let period = p.get_value(&*d.acquire_period)?;
            let num = p.get_value(&*d.num_images)?;
            if period <= 0.0 {
                return Err(FlyError::Detector(format!(
                    "acquire period must be positive, got {period}"
                )));
            }
            p.set_value(&*d.acquiring, true)?;

            let mut result = Ok(());
            for i in 0..num {
                let stopped = tokio::time::timeout(
                    Duration::from_secs_f64(period),
                    stop.wait_for(|stopping| *stopping),
                )
                .await
                .is_ok();
                if stopped {
                    break;
                }
                let uid = offset + i as i64;
                let Ok(index) = usize::try_from(uid) else {
                    result = Err(FlyError::Detector(format!("negative frame id {uid}")));
                    break;
                };
                let intensity =
                    interesting_pattern(p.get_value(&*x)?, p.get_value(&*y)?) * exposure / period;
                let sum: f64 = blob
                    .iter()
                    .map(|v| f64::from(to_pixel(v * intensity)))
                    .sum();
                {
                    let mut file = lock(&file);
                    if file.path.is_none() {
                        result = Err(FlyError::Detector("HDF file is not open".into()));
                        break;
                    }
                    if file.sums.len() <= index {
                        file.sums.resize(index + 1, -1.0);
                    }
                    file.sums[index] = sum;
                }
                p.set_value(&*d.array_counter, uid)?;
                let written = p.get_value(&*h.array_counter)?;
                p.set_value(&*h.array_counter, written + 1)?;
            }
            p.set_value(&*d.acquiring, false)?;
            result
        }
    })?;
    Ok(())
}
