//! Fly scans on the simulated beamline, end to end.

use std::collections::BTreeSet;
use std::time::Duration;

use bluefly::config::FlyConfig;
use bluefly::device::{AssetDoc, Device, Event, Flyable};
use bluefly::points::{CompoundGenerator, LineGenerator};
use bluefly::sim::SimBeamline;
use tempfile::TempDir;

fn small_config(dir: &TempDir) -> FlyConfig {
    let mut config = FlyConfig::default();
    config.detector.width = 16;
    config.detector.height = 12;
    config.storage.data_dir = Some(dir.path().to_path_buf());
    config
}

fn grid(ny: usize, nx: usize) -> CompoundGenerator {
    CompoundGenerator::new(
        vec![
            LineGenerator::new("t1y", "mm", -1.0, 1.0, ny),
            LineGenerator::new("t1x", "mm", 0.0, 2.0, nx).alternating(),
        ],
        0.1,
    )
}

fn datum_points(docs: &[AssetDoc]) -> Vec<u64> {
    docs.iter()
        .filter_map(|doc| match doc {
            AssetDoc::Datum(datum) => datum.datum_kwargs["point_number"].as_u64(),
            AssetDoc::Resource(_) => None,
        })
        .collect()
}

fn check_positions(events: &[Event], generator: &CompoundGenerator) {
    for (i, event) in events.iter().enumerate() {
        let point = generator.get_point(i).unwrap();
        for (axis, value) in point.positions {
            assert_eq!(event.data[&axis].as_f64(), Some(value), "{axis} at point {i}");
        }
        assert!(!event.filled["andor"]);
        assert!(event.data["andor_sum"].as_f64().unwrap() >= 0.0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_fly_scan_collects_every_point() {
    let dir = TempDir::new().unwrap();
    let beamline = SimBeamline::new(&small_config(&dir)).unwrap();
    let fly = &beamline.fly;
    let generator = grid(2, 3);

    fly.configure(generator.clone()).unwrap();
    fly.stage().unwrap();
    fly.kickoff().await.unwrap();
    fly.complete().await.unwrap();
    assert_eq!(fly.completed_steps(), 6);
    assert_eq!(fly.hints().unwrap().fields, vec!["andor_sum".to_string()]);

    let docs = fly.collect_asset_docs();
    let resources: Vec<_> = docs
        .iter()
        .filter_map(|doc| match doc {
            AssetDoc::Resource(resource) => Some(resource),
            AssetDoc::Datum(_) => None,
        })
        .collect();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].spec, "AD_HDF5");
    assert!(resources[0].root.starts_with(&*dir.path().to_string_lossy()));
    assert_eq!(datum_points(&docs), vec![0, 1, 2, 3, 4, 5]);

    let events = fly.collect().unwrap();
    assert_eq!(events.len(), 6);
    check_positions(&events, &generator);

    // The trajectory left the fast axis at the end of the snake's last row
    let x = beamline.motors["t1x"].axis.readback.get().await.unwrap();
    assert_eq!(x, 0.0);

    let described = fly.describe_collect().unwrap();
    let primary = &described["primary"];
    assert_eq!(primary["andor"].shape, vec![1, 12, 16]);
    assert!(primary.contains_key("t1y"));

    fly.unstage().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fly_scan_pause_and_resume() {
    let dir = TempDir::new().unwrap();
    let beamline = SimBeamline::new(&small_config(&dir)).unwrap();
    let fly = &beamline.fly;
    let generator = grid(4, 5);

    fly.configure(generator.clone()).unwrap();
    fly.stage().unwrap();
    fly.kickoff().await.unwrap();
    let complete = fly.complete();
    while fly.completed_steps() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fly.pause().unwrap().await.unwrap();
    assert!(complete.done());
    assert!(!complete.success().unwrap());
    let paused_at = fly.completed_steps();
    assert!(paused_at > 0 && paused_at < 20, "paused at {paused_at}");

    let mut events = fly.collect().unwrap();
    let mut docs = fly.collect_asset_docs();
    assert_eq!(events.len(), paused_at);

    fly.resume().unwrap().await.unwrap();
    assert_eq!(fly.completed_steps(), 20);
    events.extend(fly.collect().unwrap());
    docs.extend(fly.collect_asset_docs());

    // No gaps or repeats either side of the pause
    assert_eq!(events.len(), 20);
    check_positions(&events, &generator);
    let points = datum_points(&docs);
    assert_eq!(points, (0..20).collect::<Vec<u64>>());
    let ids: BTreeSet<_> = events
        .iter()
        .map(|event| event.data["andor"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 20);

    fly.unstage().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_second_kickoff_appends_to_files() {
    let dir = TempDir::new().unwrap();
    let beamline = SimBeamline::new(&small_config(&dir)).unwrap();
    let fly = &beamline.fly;

    fly.configure(grid(1, 3)).unwrap();
    fly.stage().unwrap();
    fly.kickoff().await.unwrap();
    fly.complete().await.unwrap();
    let first = datum_points(&fly.collect_asset_docs());

    fly.kickoff().await.unwrap();
    fly.complete().await.unwrap();
    let docs = fly.collect_asset_docs();
    // Same file, so no new resource
    assert!(docs.iter().all(|doc| matches!(doc, AssetDoc::Datum(_))));
    assert_eq!(first, vec![0, 1, 2]);
    assert_eq!(datum_points(&docs), vec![3, 4, 5]);
    assert_eq!(fly.collect().unwrap().len(), 6);

    fly.unstage().await.unwrap();
}

#[tokio::test]
async fn test_empty_axis_rejected_at_configure() {
    let dir = TempDir::new().unwrap();
    let beamline = SimBeamline::new(&small_config(&dir)).unwrap();
    assert!(beamline.fly.configure(grid(2, 0)).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_variable_duration_fails_complete() {
    let dir = TempDir::new().unwrap();
    let beamline = SimBeamline::new(&small_config(&dir)).unwrap();
    let fly = &beamline.fly;
    let mut generator = grid(2, 2);
    generator.duration = None;

    fly.configure(generator).unwrap();
    fly.stage().unwrap();
    fly.kickoff().await.unwrap();
    assert!(fly.complete().await.is_err());
    assert_eq!(fly.completed_steps(), 0);
    fly.unstage().await.unwrap();
}
