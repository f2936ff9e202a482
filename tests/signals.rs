#![cfg(unix)]

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use pinning_bypass_lab::db::Database;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut permissions = fs::metadata(path).expect("metadata").permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions).expect("chmod");
}

fn wait_for(mut done: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    done()
}

/// Starts `pinlab run` and returns once it is blocked inside the metadata tool.
fn start_blocked_run(root: &Path) -> (std::process::Child, std::path::PathBuf) {
    let marker = root.join("aapt-started");
    let aapt = root.join("aapt");
    write_script(
        &aapt,
        &format!("#!/usr/bin/env bash\ntouch '{}'\nexec sleep 30\n", marker.display()),
    );
    let script = root.join("unpin.js");
    fs::write(&script, "// unpinning").expect("script");
    let config = root.join("lab.yaml");
    fs::write(
        &config,
        format!("aaptPath: {}\nunpinningScript: {}\n", aapt.display(), script.display()),
    )
    .expect("config");
    let apps = root.join("apps");
    fs::create_dir_all(&apps).expect("apps");
    fs::write(apps.join("com.example.apk"), b"PK").expect("apk");
    let db_path = root.join("results.db");

    let child = Command::new(env!("CARGO_BIN_EXE_pinlab"))
        .arg("--config")
        .arg(&config)
        .arg("--log-dir")
        .arg(root.join("logs"))
        .arg("run")
        .arg(&apps)
        .arg("--db")
        .arg(&db_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn pinlab");

    assert!(
        wait_for(|| marker.exists(), Duration::from_secs(20)),
        "pinlab never reached the metadata tool"
    );
    (child, db_path)
}

fn wait_exit(child: &mut std::process::Child) -> ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("pinlab did not exit after the signal");
        }
        sleep(Duration::from_millis(50));
    }
}

fn assert_exit_code_for(signal: Signal, expected: i32) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut child, db_path) = start_blocked_run(dir.path());

    kill(Pid::from_raw(child.id() as i32), signal).expect("send signal");
    let status = wait_exit(&mut child);
    assert_eq!(status.code(), Some(expected));

    let db = Database::new(&db_path).expect("store reopens after the signal");
    assert!(db.list_runs().expect("runs").is_empty());
}

#[test]
fn sigterm_exits_with_143_and_leaves_a_usable_store() {
    assert_exit_code_for(Signal::SIGTERM, 143);
}

#[test]
fn sigint_exits_with_130() {
    assert_exit_code_for(Signal::SIGINT, 130);
}

#[test]
fn sighup_exits_with_129() {
    assert_exit_code_for(Signal::SIGHUP, 129);
}
