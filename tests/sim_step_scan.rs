//! Step scanning the simulated motor and camera.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bluefly::config::FlyConfig;
use bluefly::detector::DetectorConfig;
use bluefly::device::{AssetDoc, Device, Movable, Readable};
use bluefly::error::FlyError;
use bluefly::sim::SimBeamline;
use tempfile::TempDir;

fn beamline(dir: &TempDir) -> SimBeamline {
    let mut config = FlyConfig::default();
    config.detector.width = 8;
    config.detector.height = 6;
    config.sim.motor_velocity = 2.0;
    config.storage.data_dir = Some(dir.path().to_path_buf());
    SimBeamline::new(&config).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_motor_moves_and_reports_progress() {
    let dir = TempDir::new().unwrap();
    let beamline = beamline(&dir);
    let phi = &beamline.phi;

    let updates = Arc::new(Mutex::new(Vec::new()));
    let status = phi.set(1.0, None);
    let seen = updates.clone();
    status.watch(move |update| seen.lock().unwrap().push(update.clone()));
    status.await.unwrap();

    let updates = updates.lock().unwrap();
    assert!(updates.len() > 1);
    let last = updates.last().unwrap();
    assert_eq!(last.current, 1.0);
    assert_eq!(last.unit, "mm");
    assert_eq!(last.fraction, Some(1.0));

    phi.trigger().await.unwrap();
    let reading = phi.read().unwrap();
    assert_eq!(reading["phi"].value.as_f64(), Some(1.0));
    assert_eq!(
        phi.describe().unwrap()["phi"].source,
        "BLxxI-MO-STAGE-01:PHI.readback"
    );
}

#[tokio::test(start_paused = true)]
async fn test_motor_stop_fails_the_move() {
    let dir = TempDir::new().unwrap();
    let beamline = beamline(&dir);
    let phi = &beamline.phi;

    let status = phi.set(10.0, None);
    tokio::time::sleep(Duration::from_millis(500)).await;
    phi.stop(false).await.unwrap();
    let err = status.await.unwrap_err();
    assert!(matches!(err, FlyError::MotorStopped));

    phi.trigger().await.unwrap();
    let position = phi.read().unwrap()["phi"].value.as_f64().unwrap();
    assert!(position > 0.0 && position < 10.0, "stopped at {position}");
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_move_stops_reporting() {
    let dir = TempDir::new().unwrap();
    let beamline = beamline(&dir);

    let updates = Arc::new(AtomicUsize::new(0));
    let status = beamline.phi.set(10.0, None);
    let seen = updates.clone();
    status.watch(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(status.cancel());
    assert!(status.done());
    let at_cancel = updates.load(Ordering::SeqCst);
    assert!(at_cancel > 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(updates.load(Ordering::SeqCst), at_cancel);
    assert!(matches!(status.await, Err(FlyError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn test_motor_move_times_out() {
    let dir = TempDir::new().unwrap();
    let beamline = beamline(&dir);
    let err = beamline
        .phi
        .set(100.0, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, FlyError::Timeout(_)));
}

#[tokio::test(start_paused = true)]
async fn test_camera_step_scan() {
    let dir = TempDir::new().unwrap();
    let beamline = beamline(&dir);
    let andor = &beamline.andor;

    andor.configure(DetectorConfig { exposure: 0.05 }).unwrap();
    andor.stage().unwrap();
    for _ in 0..3 {
        andor.trigger().await.unwrap();
    }
    assert_eq!(andor.hints().unwrap().fields, vec!["andor_sum".to_string()]);

    let reading = andor.read().unwrap();
    assert!(reading["andor_sum"].value.as_f64().unwrap() >= 0.0);
    let datum_id = reading["andor"].value.as_str().unwrap();
    assert!(datum_id.ends_with("/2"), "{datum_id}");
    assert_eq!(andor.describe().unwrap()["andor"].shape, vec![1, 6, 8]);

    let docs = andor.collect_asset_docs();
    assert_eq!(docs.len(), 4);
    let AssetDoc::Resource(resource) = &docs[0] else {
        panic!("resource should come first, got {:?}", docs[0]);
    };
    assert_eq!(resource.resource_path, "andor.h5");

    andor.unstage().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_camera_read_before_trigger() {
    let dir = TempDir::new().unwrap();
    let beamline = beamline(&dir);
    beamline.andor.stage().unwrap();
    assert!(beamline.andor.read().is_err());
    assert!(beamline
        .andor
        .configure(DetectorConfig { exposure: 0.0 })
        .is_err());
}
