pub mod baseline;
pub mod httptoolkit;
pub mod monkey;
pub mod objection;

use crate::errors::AppResult;
use crate::models::BypassMethod;
use crate::settings::LabSettings;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl ValidatedCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How the app under test is brought to the foreground for one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    /// Launch through the device session before anything else runs.
    pub start_app: bool,
    /// Instrumentation process that stays alive for the observation window.
    pub command: Option<ValidatedCommand>,
}

pub trait BypassAdapter: Send + Sync {
    fn method(&self) -> BypassMethod;

    /// Checked once before the first cell so that a broken setup fails fast.
    fn validate(&self, _settings: &LabSettings) -> AppResult<()> {
        Ok(())
    }

    fn build_launch(&self, app_id: &str, settings: &LabSettings) -> AppResult<Launch>;
}

pub fn adapter_for(method: BypassMethod) -> Arc<dyn BypassAdapter> {
    match method {
        BypassMethod::None => Arc::new(baseline::BaselineAdapter),
        BypassMethod::Objection => Arc::new(objection::ObjectionAdapter),
        BypassMethod::Httptoolkit => Arc::new(httptoolkit::HttptoolkitAdapter),
    }
}
