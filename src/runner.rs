use crate::adapters::monkey::exerciser_command;
use crate::adapters::{adapter_for, BypassAdapter};
use crate::db::Database;
use crate::device::app_meta::discover_packages;
use crate::device::DeviceSession;
use crate::errors::{AppError, AppResult};
use crate::experiment::ExperimentPlan;
use crate::models::{AppMeta, AppPackage, BypassMethod, CellOutcome, TlsFailureEvent};
use crate::process::TrackedProcess;
use crate::settings::LabSettings;
use chrono::Utc;
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::timeout;

/// Where finished cells are recorded, and how completed cells are recognized.
pub trait ResultSink {
    fn is_complete(&self, app_id: &str, method: BypassMethod) -> AppResult<bool>;

    fn persist(&self, outcome: &CellOutcome) -> AppResult<()>;
}

impl ResultSink for Database {
    fn is_complete(&self, app_id: &str, method: BypassMethod) -> AppResult<bool> {
        self.has_run(app_id, method)
    }

    fn persist(&self, outcome: &CellOutcome) -> AppResult<()> {
        self.insert_run(&outcome.to_run_record())
    }
}

/// Writes one `<appId>.har` and one `<appId>-meta.json` per app.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CaptureMeta<'a> {
    app: &'a AppMeta,
    mitmproxy_events: &'a [TlsFailureEvent],
    app_crashed: bool,
    app_started_date: String,
    traffic_collection_stopped_date: String,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> AppResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn har_path(&self, app_id: &str) -> PathBuf {
        self.dir.join(format!("{}.har", app_id))
    }

    pub fn meta_path(&self, app_id: &str) -> PathBuf {
        self.dir.join(format!("{}-meta.json", app_id))
    }
}

impl ResultSink for FileSink {
    fn is_complete(&self, app_id: &str, _method: BypassMethod) -> AppResult<bool> {
        Ok(self.har_path(app_id).is_file())
    }

    fn persist(&self, outcome: &CellOutcome) -> AppResult<()> {
        let meta = CaptureMeta {
            app: &outcome.app,
            mitmproxy_events: &outcome.capture.events,
            app_crashed: outcome.app_crashed,
            app_started_date: outcome.app_started_at.to_rfc3339(),
            traffic_collection_stopped_date: outcome.traffic_stopped_at.to_rfc3339(),
        };
        // The HAR marks completion, so it is written last.
        write_pretty(&self.meta_path(&outcome.app.id), &meta)?;
        write_pretty(&self.har_path(&outcome.app.id), &outcome.capture.har)
    }
}

fn write_pretty<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let mut buffer = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;

    let partial = path.with_extension("partial");
    fs::write(&partial, &buffer)?;
    fs::rename(&partial, path)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Pending,
    Installing,
    Instrumenting,
    Observing,
    CapturingStopped,
    Persisted,
    Failed,
}

impl CellState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Instrumenting => "instrumenting",
            Self::Observing => "observing",
            Self::CapturingStopped => "capturing-stopped",
            Self::Persisted => "persisted",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Packages whose metadata could not be read.
    pub unreadable: usize,
}

/// What a cell has set up so far and must tear down if it fails.
#[derive(Default)]
struct CellResources {
    processes: Vec<TrackedProcess>,
    capturing: bool,
    installed: bool,
}

/// Drives every (app, method) cell of an experiment through one device session.
pub struct ExperimentRunner<'a, S: DeviceSession, K: ResultSink> {
    session: S,
    sink: &'a K,
    settings: &'a LabSettings,
    plan: ExperimentPlan,
}

impl<'a, S: DeviceSession, K: ResultSink> ExperimentRunner<'a, S, K> {
    pub fn new(session: S, sink: &'a K, settings: &'a LabSettings, plan: ExperimentPlan) -> Self {
        Self {
            session,
            sink,
            settings,
            plan,
        }
    }

    pub fn into_session(self) -> S {
        self.session
    }

    /// Runs all packages found in `dir`.
    pub async fn run_dir(&mut self, dir: &Path) -> AppResult<RunSummary> {
        let packages = discover_packages(dir, self.session.platform())?;
        tracing::info!(dir = %dir.display(), packages = packages.len(), "discovered packages");
        self.run(packages).await
    }

    pub async fn run(&mut self, mut packages: Vec<AppPackage>) -> AppResult<RunSummary> {
        let adapters = self
            .plan
            .methods
            .iter()
            .map(|method| adapter_for(*method))
            .collect::<Vec<_>>();
        for adapter in &adapters {
            adapter.validate(self.settings)?;
        }
        if self.plan.shuffle {
            packages.shuffle(&mut rand::rng());
        }

        let mut summary = RunSummary::default();
        let result = self.run_packages(&packages, &adapters, &mut summary).await;
        if let Err(error) = self.session.stop().await {
            tracing::warn!(error = %error, "device session did not stop cleanly");
        }
        tracing::info!(
            variant = self.plan.variant.as_str(),
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            unreadable = summary.unreadable,
            "experiment finished"
        );
        result.map(|_| summary)
    }

    async fn run_packages(
        &mut self,
        packages: &[AppPackage],
        adapters: &[Arc<dyn BypassAdapter>],
        summary: &mut RunSummary,
    ) -> AppResult<()> {
        for package in packages {
            let app = match self.session.read_app_meta(package).await {
                Ok(app) => app,
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    tracing::error!(package = %package.label(), error = %error, "skipping unreadable package");
                    summary.unreadable += 1;
                    continue;
                }
            };

            for adapter in adapters {
                let method = adapter.method();
                if self.sink.is_complete(&app.id, method)? {
                    tracing::debug!(app_id = %app.id, method = %method, "already completed");
                    summary.skipped += 1;
                    continue;
                }

                match self.run_cell(package, &app, adapter.as_ref()).await {
                    Ok(()) => summary.completed += 1,
                    Err(error) => {
                        summary.failed += 1;
                        if error.is_fatal() || self.plan.abort_on_failure {
                            tracing::error!(app_id = %app.id, method = %method, error = %error, "aborting experiment");
                            return Err(error);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_cell(&mut self, package: &AppPackage, app: &AppMeta, adapter: &dyn BypassAdapter) -> AppResult<()> {
        let method = adapter.method();
        log_state(app, method, CellState::Pending);

        let mut resources = CellResources::default();
        let result = match self.plan.cell_timeout {
            Some(limit) => match timeout(limit, self.drive_cell(package, app, adapter, &mut resources)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(format!(
                    "{} under {} exceeded {}s",
                    app.id,
                    method,
                    limit.as_secs()
                ))),
            },
            None => self.drive_cell(package, app, adapter, &mut resources).await,
        };

        match result {
            Ok(outcome) => {
                self.sink.persist(&outcome)?;
                log_state(app, method, CellState::Persisted);
                Ok(())
            }
            Err(error) => {
                log_state(app, method, CellState::Failed);
                tracing::error!(app_id = %app.id, method = %method, error = %error, "cell failed");
                self.clean_up_failed_cell(app, resources).await;
                Err(error)
            }
        }
    }

    async fn drive_cell(
        &mut self,
        package: &AppPackage,
        app: &AppMeta,
        adapter: &dyn BypassAdapter,
        resources: &mut CellResources,
    ) -> AppResult<CellOutcome> {
        let method = adapter.method();
        if self.plan.reset_before_cell {
            self.session.reset_device().await?;
        } else {
            self.session.ensure_device().await?;
        }

        log_state(app, method, CellState::Installing);
        if self.plan.uninstall_before_install {
            self.session.uninstall_app(&app.id).await?;
        }
        resources.installed = true;
        self.session.install_app(package).await?;
        self.session.grant_permissions(&app.id).await?;

        self.session.start_traffic_collection(&app.id).await?;
        resources.capturing = true;

        log_state(app, method, CellState::Instrumenting);
        let launch = adapter.build_launch(&app.id, self.settings)?;
        if launch.start_app {
            self.session.start_app(&app.id).await?;
        }
        if let Some(command) = &launch.command {
            resources
                .processes
                .push(TrackedProcess::spawn(command, method.as_str())?);
        }
        let app_started_at = Utc::now();
        if self.plan.exerciser {
            let command = exerciser_command(&app.id, self.settings);
            resources.processes.push(TrackedProcess::spawn(&command, "monkey")?);
        }

        log_state(app, method, CellState::Observing);
        tokio::time::sleep(self.plan.observation_window).await;

        let foreground = self.session.foreground_app_id().await?;
        let app_crashed = foreground.as_deref() != Some(app.id.as_str());
        if app_crashed {
            tracing::info!(app_id = %app.id, method = %method, foreground = ?foreground, "app no longer in foreground");
        }

        let capture = self.session.stop_traffic_collection().await?;
        resources.capturing = false;
        let traffic_stopped_at = Utc::now();
        let grace = self.settings.terminate_grace();
        for process in resources.processes.drain(..) {
            process.terminate_then_kill(grace).await?;
        }
        log_state(app, method, CellState::CapturingStopped);

        if self.plan.uninstall_after {
            self.session.uninstall_app(&app.id).await?;
            resources.installed = false;
        }

        Ok(CellOutcome {
            app: app.clone(),
            method,
            capture,
            app_crashed,
            app_started_at,
            traffic_stopped_at,
        })
    }

    async fn clean_up_failed_cell(&mut self, app: &AppMeta, mut resources: CellResources) {
        let grace = self.settings.terminate_grace();
        for process in resources.processes.drain(..) {
            let label = process.label().to_string();
            if let Err(error) = process.terminate_then_kill(grace).await {
                tracing::warn!(process = %label, error = %error, "could not stop process");
            }
        }
        if resources.capturing {
            if let Err(error) = self.session.abort_traffic_collection().await {
                tracing::warn!(app_id = %app.id, error = %error, "could not abort traffic collection");
            }
        }
        if resources.installed {
            if let Err(error) = self.session.uninstall_app(&app.id).await {
                tracing::warn!(app_id = %app.id, error = %error, "best-effort uninstall failed");
            }
        }
    }
}

fn log_state(app: &AppMeta, method: BypassMethod, state: CellState) {
    tracing::info!(app_id = %app.id, version = app.version_or_unknown(), method = %method, state = state.as_str(), "cell state");
}

#[cfg(test)]
mod tests {
    use super::{write_pretty, CellState, FileSink, ResultSink};
    use crate::models::{AppMeta, BypassMethod, CellOutcome, Platform, TlsFailureEvent, TrafficCapture};
    use chrono::Utc;

    fn outcome() -> CellOutcome {
        CellOutcome {
            app: AppMeta {
                id: "com.example".to_string(),
                version: Some("1.0".to_string()),
                version_code: None,
                name: None,
                platform: Platform::Android,
            },
            method: BypassMethod::Httptoolkit,
            capture: TrafficCapture {
                har: serde_json::json!({ "log": { "entries": [] } }),
                events: vec![TlsFailureEvent::new("connection closed early")],
            },
            app_crashed: true,
            app_started_at: Utc::now(),
            traffic_stopped_at: Utc::now(),
        }
    }

    #[test]
    fn file_sink_completion_follows_har_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileSink::new(dir.path().join("captures")).expect("sink");
        assert!(!sink.is_complete("com.example", BypassMethod::Httptoolkit).expect("check"));

        sink.persist(&outcome()).expect("persist");
        assert!(sink.is_complete("com.example", BypassMethod::Httptoolkit).expect("check"));

        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(sink.meta_path("com.example")).expect("meta"))
                .expect("meta json");
        assert_eq!(meta["app"]["id"], "com.example");
        assert_eq!(meta["appCrashed"], true);
        assert_eq!(meta["mitmproxyEvents"][0]["context"]["error"], "connection closed early");
        assert!(meta["trafficCollectionStoppedDate"].is_string());
    }

    #[test]
    fn pretty_output_uses_four_space_indent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        write_pretty(&path, &serde_json::json!({ "log": { "version": "1.2" } })).expect("write");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\n    \"log\": {\n        \"version\""));
        assert!(!dir.path().join("out.partial").exists());
    }

    #[test]
    fn state_names_are_stable() {
        assert_eq!(CellState::CapturingStopped.as_str(), "capturing-stopped");
        assert_eq!(CellState::Failed.as_str(), "failed");
    }
}
