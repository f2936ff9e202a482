use super::app_meta::parse_badging;
use super::capture::MitmCapture;
use super::DeviceSession;
use crate::adapters::ValidatedCommand;
use crate::errors::{AppError, AppResult};
use crate::models::{AppMeta, AppPackage, Platform, TrafficCapture};
use crate::process::{run_tool, ToolOutput};
use crate::settings::LabSettings;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

const SHORT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const CLEAR_PROXY: &str = ":0";
const TOLERATED_UNINSTALL_FAILURES: &[&str] = &[
    "Unknown package",
    "not installed",
    "DELETE_FAILED_INTERNAL_ERROR",
];

static RESUMED_ACTIVITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:mResumedActivity|topResumedActivity|ResumedActivity)[:=]\s*ActivityRecord\{[0-9a-f]+ u\d+ ([^/\s]+)/")
        .expect("valid resumed activity regex")
});
static PERMISSION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s+(android\.permission\.[A-Z0-9_]+|[a-z][\w.]*\.permission\.[A-Z0-9_]+)")
        .expect("valid permission regex")
});

/// An Android emulator driven over adb, with mitmproxy on the host as the interception
/// proxy.
pub struct AdbSession {
    settings: LabSettings,
    work_dir: PathBuf,
    capture: Option<MitmCapture>,
}

impl AdbSession {
    pub fn new(settings: LabSettings, work_dir: PathBuf) -> Self {
        Self {
            settings,
            work_dir,
            capture: None,
        }
    }

    fn adb_command<I, S>(&self, args: I) -> ValidatedCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all_args = Vec::new();
        if let Some(serial) = &self.settings.device_serial {
            all_args.push("-s".to_string());
            all_args.push(serial.clone());
        }
        all_args.extend(args.into_iter().map(Into::into));
        ValidatedCommand::new(self.settings.adb_path.clone(), all_args)
    }

    async fn adb<I, S>(&self, args: I, limit: Duration) -> AppResult<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = self.adb_command(args);
        tracing::trace!(command = %command.display(), "adb");
        run_tool(&command, limit).await
    }

    async fn adb_checked<I, S>(&self, args: I, what: &str) -> AppResult<ToolOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.adb(args, SHORT_COMMAND_TIMEOUT)
            .await?
            .into_success(what)
            .map_err(|error| match error {
                AppError::Tool(message) => AppError::Device(message),
                other => other,
            })
    }

    async fn set_global_proxy(&self, value: &str) -> AppResult<()> {
        self.adb_checked(
            ["shell", "settings", "put", "global", "http_proxy", value],
            "setting the device proxy",
        )
        .await?;
        Ok(())
    }

    async fn clear_proxy_quietly(&self) {
        if let Err(error) = self.set_global_proxy(CLEAR_PROXY).await {
            tracing::warn!(error = %error, "could not clear device proxy");
        }
    }

    async fn boot_completed(&self) -> AppResult<bool> {
        let output = self
            .adb(["shell", "getprop", "sys.boot_completed"], SHORT_COMMAND_TIMEOUT)
            .await?;
        Ok(output.success && output.stdout.trim() == "1")
    }
}

impl DeviceSession for AdbSession {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn ensure_device(&mut self) -> AppResult<()> {
        let limit = self.settings.device_ready_timeout();
        let deadline = Instant::now() + limit;
        self.adb(["wait-for-device"], limit)
            .await?
            .into_success("waiting for the device")?;

        while !self.boot_completed().await? {
            if Instant::now() >= deadline {
                return Err(AppError::Device(format!(
                    "device did not finish booting within {}s",
                    limit.as_secs()
                )));
            }
            tokio::time::sleep(BOOT_POLL_INTERVAL).await;
        }
        tracing::info!(serial = ?self.settings.device_serial, "device ready");
        Ok(())
    }

    async fn reset_device(&mut self) -> AppResult<()> {
        let snapshot = self.settings.snapshot_name.clone();
        self.adb_checked(
            ["emu", "avd", "snapshot", "load", snapshot.as_str()],
            "loading the emulator snapshot",
        )
        .await?;
        self.ensure_device().await?;
        tracing::debug!(snapshot = %snapshot, "snapshot restored");
        Ok(())
    }

    async fn read_app_meta(&mut self, package: &AppPackage) -> AppResult<AppMeta> {
        let base = package
            .files
            .first()
            .ok_or_else(|| AppError::NotFound(format!("empty package {}", package.label())))?;
        let command = ValidatedCommand::new(
            self.settings.aapt_path.clone(),
            vec![
                "dump".to_string(),
                "badging".to_string(),
                base.to_string_lossy().into_owned(),
            ],
        );
        let output = run_tool(&command, SHORT_COMMAND_TIMEOUT)
            .await?
            .into_success("reading app metadata")?;
        parse_badging(&output.stdout, Platform::Android).ok_or_else(|| {
            AppError::Tool(format!("no package line in badging output for {}", base.display()))
        })
    }

    async fn install_app(&mut self, package: &AppPackage) -> AppResult<()> {
        let mut args = vec![
            if package.is_split() { "install-multiple" } else { "install" }.to_string(),
            "-r".to_string(),
        ];
        args.extend(package.files.iter().map(|file| file.to_string_lossy().into_owned()));

        let output = self.adb(args, self.settings.tool_timeout()).await?;
        // adb reports some install failures with exit code 0.
        if !output.success || output.stdout.contains("Failure") {
            return Err(AppError::Device(format!(
                "installing {} failed: {}",
                package.label(),
                output.stdout.trim().lines().last().unwrap_or(output.stderr.trim())
            )));
        }
        Ok(())
    }

    async fn uninstall_app(&mut self, app_id: &str) -> AppResult<bool> {
        let output = self.adb(["uninstall", app_id], SHORT_COMMAND_TIMEOUT).await?;
        classify_uninstall_output(app_id, &output)
    }

    async fn grant_permissions(&mut self, app_id: &str) -> AppResult<()> {
        let output = self
            .adb_checked(["shell", "dumpsys", "package", app_id], "reading requested permissions")
            .await?;
        let permissions = parse_requested_permissions(&output.stdout);
        let mut granted = 0;
        for permission in &permissions {
            // Only runtime permissions can be granted; the rest fail and are ignored.
            match self
                .adb(["shell", "pm", "grant", app_id, permission.as_str()], SHORT_COMMAND_TIMEOUT)
                .await
            {
                Ok(output) if output.success => granted += 1,
                Ok(_) => {}
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => tracing::debug!(permission = %permission, error = %error, "grant failed"),
            }
        }
        tracing::debug!(app_id = %app_id, requested = permissions.len(), granted, "permissions granted");
        Ok(())
    }

    async fn start_traffic_collection(&mut self, app_id: &str) -> AppResult<()> {
        if let Some(previous) = self.capture.take() {
            tracing::warn!("discarding traffic collection that was never stopped");
            previous.abort(self.settings.terminate_grace()).await?;
        }
        let capture = MitmCapture::start(&self.settings, &self.work_dir, app_id).await?;
        let proxy = format!("{}:{}", self.settings.proxy_host, self.settings.proxy_port);
        if let Err(error) = self.set_global_proxy(&proxy).await {
            let _ = capture.abort(self.settings.terminate_grace()).await;
            return Err(error);
        }
        self.capture = Some(capture);
        Ok(())
    }

    async fn stop_traffic_collection(&mut self) -> AppResult<TrafficCapture> {
        let capture = self
            .capture
            .take()
            .ok_or_else(|| AppError::Internal("no traffic collection is running".to_string()))?;
        self.clear_proxy_quietly().await;
        capture.stop(self.settings.terminate_grace()).await
    }

    async fn abort_traffic_collection(&mut self) -> AppResult<()> {
        let Some(capture) = self.capture.take() else {
            return Ok(());
        };
        self.clear_proxy_quietly().await;
        capture.abort(self.settings.terminate_grace()).await
    }

    async fn start_app(&mut self, app_id: &str) -> AppResult<()> {
        self.adb_checked(
            ["shell", "monkey", "-p", app_id, "-c", "android.intent.category.LAUNCHER", "1"],
            "launching the app",
        )
        .await?;
        Ok(())
    }

    async fn foreground_app_id(&mut self) -> AppResult<Option<String>> {
        let output = self
            .adb_checked(["shell", "dumpsys", "activity", "activities"], "reading the foreground activity")
            .await?;
        Ok(parse_foreground_app(&output.stdout))
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.abort_traffic_collection().await
    }
}

pub fn classify_uninstall_output(app_id: &str, output: &ToolOutput) -> AppResult<bool> {
    let combined = format!("{}\n{}", output.stdout, output.stderr);
    if output.success && combined.contains("Success") {
        return Ok(true);
    }
    if TOLERATED_UNINSTALL_FAILURES
        .iter()
        .any(|marker| combined.contains(marker))
    {
        tracing::debug!(app_id = %app_id, "nothing to uninstall");
        return Ok(false);
    }
    Err(AppError::Device(format!(
        "uninstalling {} failed: {}",
        app_id,
        combined.trim()
    )))
}

/// Collects the permissions listed under `requested permissions:` in `dumpsys package`.
pub fn parse_requested_permissions(dumpsys: &str) -> Vec<String> {
    let mut permissions = Vec::new();
    let mut in_section = false;
    for line in dumpsys.lines() {
        if line.trim_start().starts_with("requested permissions:") {
            in_section = true;
            continue;
        }
        if !in_section {
            continue;
        }
        match PERMISSION_LINE.captures(line) {
            Some(captures) => {
                let permission = captures[1].to_string();
                if !permissions.contains(&permission) {
                    permissions.push(permission);
                }
            }
            None => in_section = false,
        }
    }
    permissions
}

pub fn parse_foreground_app(dumpsys: &str) -> Option<String> {
    RESUMED_ACTIVITY
        .captures(dumpsys)
        .map(|captures| captures[1].to_string())
}
