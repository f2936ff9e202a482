use crate::adapters::ValidatedCommand;
use crate::errors::{AppError, AppResult};
use crate::process::run_tool_blocking;
use crate::settings::LabSettings;
use clap::ValueEnum;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

static VERSION_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)version code: (.+)$").expect("valid version code regex"));

const APKEEP_OPTIONS: &str = "device=px_3a,locale=en_DE,include_additional_files=1,split_apk=1";
const LICENSE_EXISTS: &str = "license already exists";

/// External store client used to fetch packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Downloader {
    Apkeep,
    Googleplay,
    Ipatool,
}

impl Downloader {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apkeep => "apkeep",
            Self::Googleplay => "googleplay",
            Self::Ipatool => "ipatool",
        }
    }

    fn program(self, settings: &LabSettings) -> String {
        match self {
            Self::Apkeep => settings.apkeep_path.clone(),
            Self::Googleplay => settings.googleplay_path.clone(),
            Self::Ipatool => settings.ipatool_path.clone(),
        }
    }

    fn default_pause(self) -> Duration {
        match self {
            Self::Apkeep => Duration::from_millis(500),
            Self::Googleplay => Duration::ZERO,
            Self::Ipatool => Duration::from_millis(770),
        }
    }

    fn shuffles(self) -> bool {
        !matches!(self, Self::Googleplay)
    }

    /// Recovers the app id from a file the tool wrote into the output directory.
    pub fn app_id_from_file_name(self, file_name: &str) -> Option<String> {
        let id = match self {
            Self::Apkeep => file_name.strip_suffix(".apk").unwrap_or(file_name),
            Self::Googleplay => file_name.split('-').next().unwrap_or(file_name),
            Self::Ipatool => file_name.split('_').next().unwrap_or(file_name),
        };
        (!id.is_empty()).then(|| id.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct DownloadJob<'a> {
    tool: Downloader,
    settings: &'a LabSettings,
    out_dir: PathBuf,
}

impl<'a> DownloadJob<'a> {
    pub fn new(tool: Downloader, settings: &'a LabSettings, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            settings,
            out_dir: out_dir.into(),
        }
    }

    fn pause(&self) -> Duration {
        self.settings
            .download_pause_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.tool.default_pause())
    }

    pub fn already_downloaded(&self) -> AppResult<HashSet<String>> {
        let mut ids = HashSet::new();
        for entry in fs::read_dir(&self.out_dir)? {
            let name = entry?.file_name();
            if let Some(id) = name.to_str().and_then(|name| self.tool.app_id_from_file_name(name)) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    /// Downloads every id not present yet. Blocks; callers on the async runtime should
    /// move it to a blocking thread.
    pub fn download_all(&self, mut app_ids: Vec<String>) -> AppResult<DownloadSummary> {
        fs::create_dir_all(&self.out_dir)?;
        let existing = self.already_downloaded()?;
        if self.tool.shuffles() {
            app_ids.shuffle(&mut rand::rng());
        }

        let mut summary = DownloadSummary::default();
        for app_id in &app_ids {
            if existing.contains(app_id) {
                tracing::info!(app_id = %app_id, "already downloaded");
                summary.skipped += 1;
                continue;
            }

            match self.download_one(app_id) {
                Ok(()) => {
                    tracing::info!(app_id = %app_id, tool = self.tool.as_str(), "downloaded");
                    summary.downloaded += 1;
                    let pause = self.pause();
                    if !pause.is_zero() {
                        std::thread::sleep(pause);
                    }
                }
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    tracing::error!(app_id = %app_id, error = %error, "failed to download");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    fn command<I, S>(&self, args: I) -> ValidatedCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ValidatedCommand::new(self.tool.program(self.settings), args)
    }

    fn download_one(&self, app_id: &str) -> AppResult<()> {
        let limit = self.settings.tool_timeout();
        match self.tool {
            Downloader::Apkeep => {
                let out_dir = self.out_dir.to_string_lossy().into_owned();
                let command = self.command([
                    "-d",
                    "google-play",
                    "-o",
                    APKEEP_OPTIONS,
                    "-a",
                    app_id,
                    out_dir.as_str(),
                ]);
                run_tool_blocking(&command, limit, true)?.into_success("apkeep")?;
            }
            Downloader::Googleplay => {
                run_tool_blocking(&self.command(["-d", app_id, "-purchase"]), limit, false)?
                    .into_success("googleplay purchase")?;
                let details = run_tool_blocking(&self.command(["-d", app_id]), limit, false)?
                    .into_success("googleplay details")?;
                let version_code = parse_version_code(&details.stdout).ok_or_else(|| {
                    AppError::Tool(format!("no version code in googleplay details for {}", app_id))
                })?;
                let command = self
                    .command(["-d", app_id, "-v", version_code.as_str(), "-s"])
                    .in_dir(&self.out_dir);
                run_tool_blocking(&command, limit, false)?.into_success("googleplay download")?;
            }
            Downloader::Ipatool => {
                let purchase = run_tool_blocking(&self.command(["purchase", "-b", app_id]), limit, false)?;
                if !purchase.success && !purchase.stderr.contains(LICENSE_EXISTS) {
                    purchase.into_success("ipatool purchase")?;
                }
                let command = self.command(["download", "-b", app_id]).in_dir(&self.out_dir);
                run_tool_blocking(&command, limit, false)?.into_success("ipatool download")?;
            }
        }
        Ok(())
    }
}

pub fn parse_version_code(details: &str) -> Option<String> {
    VERSION_CODE
        .captures(details)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
}
