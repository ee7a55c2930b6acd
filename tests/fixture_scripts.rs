use std::path::PathBuf;
#[cfg(unix)]
use std::process::Command;

#[test]
fn fixture_script_exists() {
    let agent = PathBuf::from("tests/fixtures/mock-agent.sh");
    assert!(agent.exists());
}

#[cfg(unix)]
#[test]
fn fixture_script_reports_expected_version() {
    let agent = Command::new("bash")
        .arg("tests/fixtures/mock-agent.sh")
        .arg("--version")
        .output()
        .expect("run agent fixture");
    assert!(agent.status.success());
    assert_eq!(
        String::from_utf8_lossy(&agent.stdout).trim(),
        "mock-agent 0.1.0"
    );
}

#[cfg(unix)]
#[test]
fn fixture_script_emits_expected_lines() {
    let agent = Command::new("bash")
        .arg("tests/fixtures/mock-agent.sh")
        .output()
        .expect("run agent fixture");
    assert!(agent.status.success());
    let out = String::from_utf8_lossy(&agent.stdout);
    assert_eq!(out.trim(), "a\nb\nc");
}
