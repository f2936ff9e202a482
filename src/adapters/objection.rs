use super::{BypassAdapter, Launch, ValidatedCommand};
use crate::errors::{AppError, AppResult};
use crate::models::BypassMethod;
use crate::settings::LabSettings;

const STARTUP_COMMAND: &str = "android sslpinning disable";

/// Attaches objection to the app's gadget and disables pinning through its built-in command.
#[derive(Debug, Default)]
pub struct ObjectionAdapter;

impl BypassAdapter for ObjectionAdapter {
    fn method(&self) -> BypassMethod {
        BypassMethod::Objection
    }

    fn validate(&self, settings: &LabSettings) -> AppResult<()> {
        if settings.objection_path.trim().is_empty() {
            return Err(AppError::Config("objectionPath must not be empty".to_string()));
        }
        Ok(())
    }

    fn build_launch(&self, app_id: &str, settings: &LabSettings) -> AppResult<Launch> {
        if app_id.trim().is_empty() {
            return Err(AppError::Internal("cannot attach objection without an app id".to_string()));
        }

        let command = ValidatedCommand::new(
            settings.objection_path.clone(),
            ["--gadget", app_id, "explore", "--startup-command", STARTUP_COMMAND],
        );
        Ok(Launch {
            start_app: false,
            command: Some(command),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectionAdapter;
    use crate::adapters::BypassAdapter;
    use crate::settings::LabSettings;

    #[test]
    fn builds_gadget_explore_command() {
        let launch = ObjectionAdapter
            .build_launch("com.example", &LabSettings::default())
            .expect("launch");
        assert!(!launch.start_app);
        let command = launch.command.expect("command");
        assert_eq!(command.program, "objection");
        assert_eq!(
            command.args,
            vec![
                "--gadget",
                "com.example",
                "explore",
                "--startup-command",
                "android sslpinning disable"
            ]
        );
    }
}
