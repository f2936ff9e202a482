use crate::errors::AppError;

static TOOL_MISSING_PATTERNS: &[&str] = &[
    "not installed",
    "command not found",
    "no such file or directory",
    "is not recognized as an internal or external command",
];

pub fn is_tool_missing_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    TOOL_MISSING_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Maps a spawn failure to an error, singling out binaries that are not on the system.
pub fn spawn_error(program: &str, error: &std::io::Error) -> AppError {
    if error.kind() == std::io::ErrorKind::NotFound || is_tool_missing_line(&error.to_string()) {
        return AppError::ToolMissing(format!(
            "'{}' could not be started ({}). Install it or point the settings file at it.",
            program, error
        ));
    }
    AppError::Tool(format!("failed to spawn '{}': {}", program, error))
}

#[cfg(test)]
mod tests {
    use super::{is_tool_missing_line, spawn_error};
    use crate::errors::AppError;

    #[test]
    fn detects_tool_missing_variants() {
        assert!(is_tool_missing_line("bash: frida: command not found"));
        assert!(is_tool_missing_line("is not recognized as an internal or external command"));
        assert!(!is_tool_missing_line("Spawned `com.example`. Resuming main thread!"));
    }

    #[test]
    fn not_found_spawn_errors_are_tool_missing() {
        let error = std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory (os error 2)");
        assert!(matches!(spawn_error("objection", &error), AppError::ToolMissing(_)));

        let error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "Permission denied");
        assert!(matches!(spawn_error("objection", &error), AppError::Tool(_)));
    }
}
