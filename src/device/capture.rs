use crate::adapters::ValidatedCommand;
use crate::errors::{AppError, AppResult};
use crate::models::{TlsFailureEvent, TrafficCapture};
use crate::process::TrackedProcess;
use crate::settings::LabSettings;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use uuid::Uuid;

const TLS_EVENTS_ADDON: &str = include_str!("tls_events.py");
const ADDON_FILE_NAME: &str = "pinlab_tls_events.py";
const PROXY_READY_TIMEOUT: Duration = Duration::from_secs(30);
const PROXY_READY_POLL: Duration = Duration::from_millis(250);

/// A running `mitmdump` that dumps a HAR file and TLS failure events for one app.
pub struct MitmCapture {
    process: TrackedProcess,
    har_path: PathBuf,
    events_path: PathBuf,
}

impl MitmCapture {
    pub async fn start(settings: &LabSettings, work_dir: &Path, app_id: &str) -> AppResult<Self> {
        fs::create_dir_all(work_dir)?;
        let addon_path = work_dir.join(ADDON_FILE_NAME);
        fs::write(&addon_path, TLS_EVENTS_ADDON)?;

        let capture_id = Uuid::new_v4();
        let har_path = work_dir.join(format!("{}-{}.har", app_id, capture_id));
        let events_path = work_dir.join(format!("{}-{}.tls.jsonl", app_id, capture_id));

        if port_accepts(settings.proxy_port).await {
            return Err(AppError::Device(format!(
                "port {} is already in use; is an earlier proxy still running?",
                settings.proxy_port
            )));
        }

        let command = mitmdump_command(settings, &addon_path, &har_path, &events_path);
        let mut process = TrackedProcess::spawn(&command, "mitmdump")?;
        wait_for_listener(&mut process, settings.proxy_port).await?;
        tracing::debug!(app_id = %app_id, har = %har_path.display(), "traffic collection started");

        Ok(Self {
            process,
            har_path,
            events_path,
        })
    }

    /// Stops the proxy and reads what it recorded. The HAR is only written on a clean
    /// shutdown, so the proxy gets the full grace period.
    pub async fn stop(self, grace: Duration) -> AppResult<TrafficCapture> {
        let termination = self.process.terminate_then_kill(grace).await?;
        let capture = read_capture(&self.har_path, &self.events_path);
        remove_quietly(&self.har_path);
        remove_quietly(&self.events_path);
        let capture = capture?;
        tracing::debug!(termination = ?termination, requests = capture.request_count(), "traffic collection stopped");
        Ok(capture)
    }

    pub async fn abort(self, grace: Duration) -> AppResult<()> {
        let result = self.process.terminate_then_kill(grace).await.map(|_| ());
        remove_quietly(&self.har_path);
        remove_quietly(&self.events_path);
        result
    }
}

fn mitmdump_command(settings: &LabSettings, addon: &Path, har: &Path, events: &Path) -> ValidatedCommand {
    ValidatedCommand::new(
        settings.mitmdump_path.clone(),
        vec![
            "--listen-port".to_string(),
            settings.proxy_port.to_string(),
            "--set".to_string(),
            "termlog_verbosity=warn".to_string(),
            "-s".to_string(),
            addon.to_string_lossy().into_owned(),
            "--set".to_string(),
            format!("tls_events_path={}", events.display()),
            "--set".to_string(),
            format!("hardump={}", har.display()),
        ],
    )
}

async fn port_accepts(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

/// Polls until the proxy accepts connections, failing as soon as the proxy process dies.
async fn wait_for_listener(process: &mut TrackedProcess, port: u16) -> AppResult<()> {
    let deadline = Instant::now() + PROXY_READY_TIMEOUT;
    loop {
        if let Some(status) = process.exit_status()? {
            return Err(AppError::Device(format!(
                "proxy exited with {} before listening on port {}",
                status, port
            )));
        }
        if port_accepts(port).await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(AppError::Timeout(format!(
                "proxy did not listen on port {} within {}s",
                port,
                PROXY_READY_TIMEOUT.as_secs()
            )));
        }
        tokio::time::sleep(PROXY_READY_POLL).await;
    }
}

pub fn read_capture(har_path: &Path, events_path: &Path) -> AppResult<TrafficCapture> {
    let raw_har = fs::read_to_string(har_path).map_err(|error| {
        AppError::Device(format!("no HAR written to {}: {}", har_path.display(), error))
    })?;
    let har: serde_json::Value = serde_json::from_str(&raw_har)?;

    let events = match fs::read_to_string(events_path) {
        Ok(raw) => parse_events(&raw),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(error) => return Err(error.into()),
    };

    Ok(TrafficCapture { har, events })
}

pub fn parse_events(raw: &str) -> Vec<TlsFailureEvent> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<TlsFailureEvent>(line) {
            Ok(event) => Some(event),
            Err(error) => {
                tracing::warn!(error = %error, "skipping malformed TLS event line");
                None
            }
        })
        .collect()
}

fn remove_quietly(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %error, "could not remove capture file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{mitmdump_command, parse_events, read_capture, MitmCapture};
    use crate::errors::AppError;
    use crate::settings::LabSettings;
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    }

    #[tokio::test]
    async fn refuses_port_held_by_another_listener() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let settings = LabSettings {
            proxy_port: listener.local_addr().expect("addr").port(),
            ..LabSettings::default()
        };
        match MitmCapture::start(&settings, dir.path(), "com.example").await {
            Err(AppError::Device(message)) => assert!(message.contains("already in use")),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("capture started on an occupied port"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn proxy_that_dies_at_startup_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = LabSettings {
            mitmdump_path: "false".to_string(),
            proxy_port: free_port(),
            ..LabSettings::default()
        };
        let started = Instant::now();
        let result = MitmCapture::start(&settings, dir.path(), "com.example").await;
        assert!(matches!(result, Err(AppError::Device(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn parses_event_lines_and_skips_garbage() {
        let raw = concat!(
            r#"{"status":"tlsFailed","timestamp":1.0,"context":{"error":"connection closed early","side":"client"}}"#,
            "\n\nnot json\n",
            r#"{"status":"tlsFailed","context":{"error":"Client and mitmproxy cannot agree on a TLS version to use."}}"#,
            "\n"
        );
        let events = parse_events(raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].context.error, "connection closed early");
        assert!(events[1].timestamp.is_none());
    }

    #[test]
    fn reads_har_and_tolerates_missing_event_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let har = dir.path().join("a.har");
        std::fs::write(&har, r#"{"log":{"entries":[{"request":{}}]}}"#).expect("write har");

        let capture = read_capture(&har, &dir.path().join("missing.jsonl")).expect("capture");
        assert_eq!(capture.request_count(), 1);
        assert!(capture.events.is_empty());

        let missing = read_capture(&dir.path().join("none.har"), &dir.path().join("none.jsonl"));
        assert!(matches!(missing, Err(AppError::Device(_))));
    }

    #[test]
    fn mitmdump_gets_port_addon_and_dump_paths() {
        let settings = LabSettings {
            proxy_port: 8081,
            ..LabSettings::default()
        };
        let command = mitmdump_command(
            &settings,
            Path::new("/tmp/addon.py"),
            Path::new("/tmp/app.har"),
            Path::new("/tmp/app.tls.jsonl"),
        );
        assert_eq!(command.program, "mitmdump");
        assert_eq!(&command.args[..2], &["--listen-port", "8081"]);
        assert!(command.args.contains(&"hardump=/tmp/app.har".to_string()));
        assert!(command.args.contains(&"tls_events_path=/tmp/app.tls.jsonl".to_string()));
        assert!(command.args.contains(&"/tmp/addon.py".to_string()));
    }
}
