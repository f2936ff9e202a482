use super::{BypassAdapter, Launch};
use crate::errors::AppResult;
use crate::models::BypassMethod;
use crate::settings::LabSettings;

/// No interception tooling: the app is only launched.
#[derive(Debug, Default)]
pub struct BaselineAdapter;

impl BypassAdapter for BaselineAdapter {
    fn method(&self) -> BypassMethod {
        BypassMethod::None
    }

    fn build_launch(&self, _app_id: &str, _settings: &LabSettings) -> AppResult<Launch> {
        Ok(Launch {
            start_app: true,
            command: None,
        })
    }
}
