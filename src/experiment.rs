use crate::errors::{AppError, AppResult};
use crate::models::{BypassMethod, Platform};
use crate::settings::LabSettings;
use clap::ValueEnum;
use std::time::Duration;

/// The experiment families, each a fixed bundle of timing and failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExperimentVariant {
    /// Every app under no bypass, objection and httptoolkit; results go to the database.
    CertPinningBypass,
    /// Randomized UI interaction with a 45 s window.
    #[value(name = "monkey-july-2023")]
    MonkeyJuly2023,
    /// Randomized UI interaction with a 120 s window and a hard per-app timeout.
    #[value(name = "monkey-april-2024")]
    MonkeyApril2024,
}

impl ExperimentVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CertPinningBypass => "cert-pinning-bypass",
            Self::MonkeyJuly2023 => "monkey-july-2023",
            Self::MonkeyApril2024 => "monkey-april-2024",
        }
    }

    fn default_window(self) -> Duration {
        match self {
            Self::CertPinningBypass => Duration::from_secs(30),
            Self::MonkeyJuly2023 => Duration::from_secs(45),
            Self::MonkeyApril2024 => Duration::from_secs(120),
        }
    }

    pub fn is_monkey(self) -> bool {
        !matches!(self, Self::CertPinningBypass)
    }

    pub fn plan(self, platform: Platform, settings: &LabSettings) -> AppResult<ExperimentPlan> {
        if !self.is_monkey() && platform != Platform::Android {
            return Err(AppError::Config(format!(
                "{} runs on Android only",
                self.as_str()
            )));
        }

        let observation_window = settings
            .observation_window_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.default_window());

        let plan = match self {
            Self::CertPinningBypass => ExperimentPlan {
                variant: self,
                methods: BypassMethod::ALL.to_vec(),
                observation_window,
                cell_timeout: None,
                abort_on_failure: false,
                uninstall_before_install: true,
                uninstall_after: true,
                reset_before_cell: false,
                exerciser: false,
                shuffle: false,
            },
            Self::MonkeyJuly2023 | Self::MonkeyApril2024 => {
                let strict = self == Self::MonkeyApril2024;
                ExperimentPlan {
                    variant: self,
                    methods: vec![BypassMethod::Httptoolkit],
                    observation_window,
                    cell_timeout: strict.then(|| observation_window * 2 + Duration::from_secs(60)),
                    abort_on_failure: strict,
                    uninstall_before_install: false,
                    uninstall_after: platform == Platform::Ios,
                    reset_before_cell: platform == Platform::Android,
                    exerciser: platform == Platform::Android,
                    shuffle: true,
                }
            }
        };
        Ok(plan)
    }
}

/// Resolved policy for one experiment invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentPlan {
    pub variant: ExperimentVariant,
    pub methods: Vec<BypassMethod>,
    pub observation_window: Duration,
    /// Hard limit on a whole cell; exceeding it is a failure.
    pub cell_timeout: Option<Duration>,
    /// Stop the whole experiment on the first failed cell.
    pub abort_on_failure: bool,
    pub uninstall_before_install: bool,
    pub uninstall_after: bool,
    pub reset_before_cell: bool,
    pub exerciser: bool,
    pub shuffle: bool,
}

#[cfg(test)]
mod tests {
    use super::ExperimentVariant;
    use crate::models::{BypassMethod, Platform};
    use crate::settings::LabSettings;
    use clap::ValueEnum;
    use std::time::Duration;

    #[test]
    fn cert_variant_runs_all_methods_and_continues_on_failure() {
        let plan = ExperimentVariant::CertPinningBypass
            .plan(Platform::Android, &LabSettings::default())
            .expect("plan");
        assert_eq!(plan.methods, BypassMethod::ALL.to_vec());
        assert_eq!(plan.observation_window, Duration::from_secs(30));
        assert!(plan.cell_timeout.is_none());
        assert!(!plan.abort_on_failure);
        assert!(plan.uninstall_before_install && plan.uninstall_after);
        assert!(ExperimentVariant::CertPinningBypass
            .plan(Platform::Ios, &LabSettings::default())
            .is_err());
    }

    #[test]
    fn strict_monkey_variant_derives_timeout_from_window() {
        let plan = ExperimentVariant::MonkeyApril2024
            .plan(Platform::Android, &LabSettings::default())
            .expect("plan");
        assert_eq!(plan.cell_timeout, Some(Duration::from_secs(300)));
        assert!(plan.abort_on_failure);
        assert!(plan.reset_before_cell && plan.exerciser && !plan.uninstall_after);

        let settings = LabSettings {
            observation_window_seconds: Some(10),
            ..LabSettings::default()
        };
        let plan = ExperimentVariant::MonkeyApril2024
            .plan(Platform::Android, &settings)
            .expect("plan");
        assert_eq!(plan.cell_timeout, Some(Duration::from_secs(80)));
    }

    #[test]
    fn lenient_monkey_variant_uninstalls_on_ios_only() {
        let ios = ExperimentVariant::MonkeyJuly2023
            .plan(Platform::Ios, &LabSettings::default())
            .expect("plan");
        assert!(ios.uninstall_after && !ios.reset_before_cell && !ios.exerciser);
        assert!(ios.cell_timeout.is_none());
        assert_eq!(ios.observation_window, Duration::from_secs(45));
    }

    #[test]
    fn cli_names_match_variant_names() {
        for variant in ExperimentVariant::value_variants() {
            let name = variant.to_possible_value().expect("value");
            assert_eq!(name.get_name(), variant.as_str());
        }
    }
}
