//! Tests for the command-line entry point.

use std::process::Command;

use tempfile::TempDir;

#[test]
fn test_fatal_error_is_reported_and_exits_nonzero() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let output = Command::new(env!("CARGO_BIN_EXE_serp-wayback-archiver"))
        .current_dir(temp_dir.path())
        .env("RUST_LOG", "info")
        .env_remove("LOG_FORMAT")
        .env_remove("INPUT_PATH")
        .env_remove("COMPLETED_PATH")
        .env_remove("JOB_IDS_PATH")
        .arg("--input")
        .arg(temp_dir.path().join("missing.csv"))
        .arg("--completed")
        .arg(temp_dir.path().join("out/wayback_urls.csv"))
        .arg("--job-ids")
        .arg(temp_dir.path().join("out/job_ids.csv"))
        .output()
        .expect("Failed to run binary");

    assert_eq!(output.status.code(), Some(1));
    let printed = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(printed.contains("Fatal error"), "nothing reported: {printed}");
    assert!(printed.contains("Failed to open candidate list"));
}
