use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_OBSERVATION_SECONDS: u64 = 1;
const MAX_OBSERVATION_SECONDS: u64 = 3_600;
const MIN_GRACE_MS: u64 = 100;
const MAX_GRACE_MS: u64 = 120_000;
const MIN_TOOL_TIMEOUT_SECONDS: u64 = 5;
const MAX_TOOL_TIMEOUT_SECONDS: u64 = 10_800;
const MAX_DOWNLOAD_PAUSE_MS: u64 = 60_000;

/// Tool locations and tunables, read from an optional YAML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LabSettings {
    pub adb_path: String,
    pub aapt_path: String,
    pub mitmdump_path: String,
    pub objection_path: String,
    pub frida_path: String,
    pub apkeep_path: String,
    pub googleplay_path: String,
    pub ipatool_path: String,
    /// Frida unpinning script injected by the httptoolkit method.
    pub unpinning_script: PathBuf,
    pub device_serial: Option<String>,
    pub snapshot_name: String,
    /// Address of the analysis host as seen from the device.
    pub proxy_host: String,
    pub proxy_port: u16,
    pub device_ready_timeout_seconds: u64,
    pub observation_window_seconds: Option<u64>,
    pub terminate_grace_ms: u64,
    pub tool_timeout_seconds: u64,
    pub download_pause_ms: Option<u64>,
}

impl Default for LabSettings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            aapt_path: "aapt".to_string(),
            mitmdump_path: "mitmdump".to_string(),
            objection_path: "objection".to_string(),
            frida_path: "frida".to_string(),
            apkeep_path: "apkeep".to_string(),
            googleplay_path: "googleplay".to_string(),
            ipatool_path: "ipatool".to_string(),
            unpinning_script: PathBuf::from("external").join("httptoolkit-script.js"),
            device_serial: None,
            snapshot_name: "clean".to_string(),
            proxy_host: "10.0.2.2".to_string(),
            proxy_port: 8080,
            device_ready_timeout_seconds: 300,
            observation_window_seconds: None,
            terminate_grace_ms: 15_000,
            tool_timeout_seconds: 600,
            download_pause_ms: None,
        }
    }
}

impl LabSettings {
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|error| {
                    AppError::Config(format!("Cannot read settings file {}: {}", path.display(), error))
                })?;
                serde_yaml::from_str::<Self>(&raw)?
            }
            None => Self::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        if let Some(window) = self.observation_window_seconds {
            if !(MIN_OBSERVATION_SECONDS..=MAX_OBSERVATION_SECONDS).contains(&window) {
                return Err(AppError::Config(format!(
                    "Observation window {}s is out of allowed range ({}..={})",
                    window, MIN_OBSERVATION_SECONDS, MAX_OBSERVATION_SECONDS
                )));
            }
        }

        if !(MIN_GRACE_MS..=MAX_GRACE_MS).contains(&self.terminate_grace_ms) {
            return Err(AppError::Config(format!(
                "Termination grace period {}ms is out of allowed range ({}..={})",
                self.terminate_grace_ms, MIN_GRACE_MS, MAX_GRACE_MS
            )));
        }

        if !(MIN_TOOL_TIMEOUT_SECONDS..=MAX_TOOL_TIMEOUT_SECONDS).contains(&self.tool_timeout_seconds) {
            return Err(AppError::Config(format!(
                "Tool timeout {}s is out of allowed range ({}..={})",
                self.tool_timeout_seconds, MIN_TOOL_TIMEOUT_SECONDS, MAX_TOOL_TIMEOUT_SECONDS
            )));
        }

        if !(MIN_TOOL_TIMEOUT_SECONDS..=MAX_TOOL_TIMEOUT_SECONDS).contains(&self.device_ready_timeout_seconds) {
            return Err(AppError::Config(format!(
                "Device ready timeout {}s is out of allowed range ({}..={})",
                self.device_ready_timeout_seconds, MIN_TOOL_TIMEOUT_SECONDS, MAX_TOOL_TIMEOUT_SECONDS
            )));
        }

        if let Some(pause) = self.download_pause_ms {
            if pause > MAX_DOWNLOAD_PAUSE_MS {
                return Err(AppError::Config(format!(
                    "Download pause {}ms exceeds limit {}",
                    pause, MAX_DOWNLOAD_PAUSE_MS
                )));
            }
        }

        if self.proxy_port == 0 {
            return Err(AppError::Config("Proxy port must not be 0".to_string()));
        }

        for (name, value) in [
            ("adbPath", &self.adb_path),
            ("mitmdumpPath", &self.mitmdump_path),
            ("proxyHost", &self.proxy_host),
            ("snapshotName", &self.snapshot_name),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::Config(format!("Setting '{}' must not be empty", name)));
            }
        }

        Ok(())
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }

    pub fn device_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.device_ready_timeout_seconds)
    }
}
