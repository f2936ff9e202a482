use super::ValidatedCommand;
use crate::settings::LabSettings;

const EVENT_COUNT: &str = "10000000";

/// UI exerciser that keeps sending random events to the app for the whole window.
pub fn exerciser_command(app_id: &str, settings: &LabSettings) -> ValidatedCommand {
    let mut args = Vec::new();
    if let Some(serial) = &settings.device_serial {
        args.push("-s".to_string());
        args.push(serial.clone());
    }
    args.extend(
        ["shell", "monkey", "-p", app_id, "--throttle", "50", "--pct-syskeys", "0", EVENT_COUNT]
            .into_iter()
            .map(ToString::to_string),
    );
    ValidatedCommand::new(settings.adb_path.clone(), args)
}

#[cfg(test)]
mod tests {
    use super::exerciser_command;
    use crate::settings::LabSettings;

    #[test]
    fn targets_device_serial_when_configured() {
        let settings = LabSettings {
            device_serial: Some("emulator-5554".to_string()),
            ..LabSettings::default()
        };
        let command = exerciser_command("com.example", &settings);
        assert_eq!(command.program, "adb");
        assert_eq!(&command.args[..4], &["-s", "emulator-5554", "shell", "monkey"]);
        assert_eq!(command.args.last().map(String::as_str), Some("10000000"));
    }
}
