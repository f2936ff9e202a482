use super::{BypassAdapter, Launch, ValidatedCommand};
use crate::errors::{AppError, AppResult};
use crate::models::BypassMethod;
use crate::settings::LabSettings;

/// Spawns the app through frida with the HTTP Toolkit unpinning script injected.
#[derive(Debug, Default)]
pub struct HttptoolkitAdapter;

impl BypassAdapter for HttptoolkitAdapter {
    fn method(&self) -> BypassMethod {
        BypassMethod::Httptoolkit
    }

    fn validate(&self, settings: &LabSettings) -> AppResult<()> {
        if !settings.unpinning_script.is_file() {
            return Err(AppError::Config(format!(
                "Unpinning script not found at {}",
                settings.unpinning_script.display()
            )));
        }
        Ok(())
    }

    fn build_launch(&self, app_id: &str, settings: &LabSettings) -> AppResult<Launch> {
        let script = settings.unpinning_script.to_string_lossy().into_owned();
        let command = ValidatedCommand::new(
            settings.frida_path.clone(),
            vec!["-U".to_string(), "-f".to_string(), app_id.to_string(), "-l".to_string(), script],
        );
        Ok(Launch {
            start_app: false,
            command: Some(command),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::HttptoolkitAdapter;
    use crate::adapters::BypassAdapter;
    use crate::errors::AppError;
    use crate::settings::LabSettings;

    #[test]
    fn builds_frida_spawn_command() {
        let settings = LabSettings {
            unpinning_script: "/opt/scripts/unpin.js".into(),
            ..LabSettings::default()
        };
        let launch = HttptoolkitAdapter.build_launch("com.example", &settings).expect("launch");
        let command = launch.command.expect("command");
        assert_eq!(command.program, "frida");
        assert_eq!(command.args, vec!["-U", "-f", "com.example", "-l", "/opt/scripts/unpin.js"]);
    }

    #[test]
    fn missing_script_fails_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = LabSettings {
            unpinning_script: dir.path().join("missing.js"),
            ..LabSettings::default()
        };
        assert!(matches!(HttptoolkitAdapter.validate(&settings), Err(AppError::Config(_))));

        let script = dir.path().join("unpin.js");
        std::fs::write(&script, "// script").expect("write script");
        let settings = LabSettings {
            unpinning_script: script,
            ..LabSettings::default()
        };
        HttptoolkitAdapter.validate(&settings).expect("script present");
    }
}
