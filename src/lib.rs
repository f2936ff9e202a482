pub mod adapters;
pub mod app_ids;
pub mod cli;
pub mod db;
pub mod device;
pub mod download;
pub mod errors;
pub mod experiment;
pub mod export;
pub mod harness;
pub mod models;
pub mod process;
pub mod report;
pub mod runner;
pub mod settings;

use crate::cli::{Cli, Command};
use crate::db::Database;
use crate::device::android::AdbSession;
use crate::download::{DownloadJob, Downloader};
use crate::errors::{AppError, AppResult};
use crate::experiment::ExperimentVariant;
use crate::models::Platform;
use crate::runner::{ExperimentRunner, FileSink};
use crate::settings::LabSettings;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// JSON lines to a daily rolling file, plus a compact human readable copy on stderr.
pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "pinlab.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

fn capture_work_dir() -> PathBuf {
    std::env::temp_dir().join("pinlab")
}

pub async fn execute(cli: Cli) -> AppResult<()> {
    let mut settings = LabSettings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { app_dir, db } => {
            let plan = ExperimentVariant::CertPinningBypass.plan(Platform::Android, &settings)?;
            let db = Database::new(&db)?;
            tracing::info!(db = %db.path().display(), "opened result store");
            let session = AdbSession::new(settings.clone(), capture_work_dir());
            let mut runner = ExperimentRunner::new(session, &db, &settings, plan);
            let summary = runner.run_dir(&app_dir).await?;
            println!(
                "completed {} / skipped {} / failed {} / unreadable {}",
                summary.completed, summary.skipped, summary.failed, summary.unreadable
            );
        }
        Command::Monkey {
            platform,
            app_dir,
            data_dir,
            proxy_ip,
            variant,
        } => {
            if !variant.is_monkey() {
                return Err(AppError::Config(format!(
                    "{} is not a monkey variant; use the run command",
                    variant.as_str()
                )));
            }
            match (platform, proxy_ip) {
                (Platform::Ios, None) => {
                    return Err(AppError::Config(
                        "On iOS, you need to provide the proxy IP as the last argument.".to_string(),
                    ))
                }
                (Platform::Ios, Some(_)) => {
                    return Err(AppError::Config(
                        "No iOS device session is available; iOS is supported for app ids and downloads only."
                            .to_string(),
                    ))
                }
                (Platform::Android, Some(proxy_ip)) => settings.proxy_host = proxy_ip,
                (Platform::Android, None) => {}
            }
            settings.validate()?;

            let plan = variant.plan(platform, &settings)?;
            let sink = FileSink::new(&data_dir)?;
            let session = AdbSession::new(settings.clone(), capture_work_dir());
            let mut runner = ExperimentRunner::new(session, &sink, &settings, plan);
            let summary = runner.run_dir(&app_dir).await?;
            println!(
                "analyzed {} / already analyzed {} / failed {} / unreadable {}",
                summary.completed, summary.skipped, summary.failed, summary.unreadable
            );
        }
        Command::Download {
            platform,
            app_ids,
            out_dir,
            tool,
        } => {
            let tool = tool.unwrap_or(match platform {
                Platform::Android => Downloader::Apkeep,
                Platform::Ios => Downloader::Ipatool,
            });
            let tool_platform = match tool {
                Downloader::Apkeep | Downloader::Googleplay => Platform::Android,
                Downloader::Ipatool => Platform::Ios,
            };
            if tool_platform != platform {
                return Err(AppError::Config(format!(
                    "{} cannot download {} apps",
                    tool.as_str(),
                    platform.as_str()
                )));
            }

            let ids = app_ids::read_app_ids(&app_ids)?;
            tracing::info!(ids = ids.len(), tool = tool.as_str(), "starting downloads");
            let summary = tokio::task::spawn_blocking(move || {
                DownloadJob::new(tool, &settings, out_dir).download_all(ids)
            })
            .await
            .map_err(|error| AppError::Internal(error.to_string()))??;
            println!(
                "downloaded {} / already present {} / failed {}",
                summary.downloaded, summary.skipped, summary.failed
            );
        }
        Command::AppIds { out, inputs } => {
            let count = app_ids::merge_files(&out, &inputs)?;
            println!("wrote {} app ids to {}", count, out.display());
        }
        Command::Export {
            platform,
            data_dir,
            db,
            dataset,
        } => {
            let db = Database::new(&db)?;
            let summary = export::export_har_dir(&db, platform, &data_dir, &dataset)?;
            println!(
                "exported {} requests from {} HAR files ({} failed)",
                summary.requests, summary.files, summary.failed_files
            );
        }
        Command::Report { db, solved_policy } => {
            if !db.is_file() {
                return Err(AppError::NotFound(format!("no result database at {}", db.display())));
            }
            let db = Database::new(&db)?;
            let report = report::build_report(&db, solved_policy)?;
            print!("{}", report);
        }
    }
    Ok(())
}
