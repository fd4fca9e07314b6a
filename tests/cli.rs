//! The bluefly binary, run as a subprocess.

use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

fn run_scan(dir: &TempDir) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_bluefly"))
        .args(["--config", concat!(env!("CARGO_MANIFEST_DIR"), "/config/bluefly.toml")])
        .args(["scan", "--y", "0", "0", "1", "--x", "0", "0.2", "2", "--duration", "0.05"])
        .env("BLUEFLY_STORAGE__DATA_DIR", dir.path())
        .env("BLUEFLY_DETECTOR__WIDTH", "8")
        .env("BLUEFLY_DETECTOR__HEIGHT", "6")
        .env("RUST_LOG", "info")
        .output()
        .unwrap()
}

#[test]
fn test_scan_prints_only_documents_on_stdout() {
    let dir = TempDir::new().unwrap();
    let output = run_scan(&dir);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "{stderr}");
    assert!(stderr.contains("Kicked off"), "{stderr}");

    let stdout = String::from_utf8(output.stdout).unwrap();
    let docs: Vec<Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap_or_else(|e| panic!("{e}: {line}")))
        .collect();
    assert!(!docs.is_empty());

    let events = docs.iter().filter(|doc| doc.get("event").is_some()).count();
    assert_eq!(events, 2);
}

#[test]
fn test_scan_descriptor_includes_detector_keys() {
    let dir = TempDir::new().unwrap();
    let output = run_scan(&dir);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout).unwrap();
    let first: Value = serde_json::from_str(stdout.lines().next().unwrap()).unwrap();
    assert_eq!(first["descriptor"], "primary");
    let keys = first["data_keys"].as_object().unwrap();
    for key in ["t1x", "t1y", "andor", "andor_sum"] {
        assert!(keys.contains_key(key), "missing {key} in {keys:?}");
    }
}
