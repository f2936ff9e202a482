use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::errors::{AppError, AppResult};
use crate::report::domains::{domain_from_error_message, is_untrusted_certificate_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
        }
    }

    pub fn package_extension(self) -> &'static str {
        match self {
            Self::Android => "apk",
            Self::Ios => "ipa",
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = AppError;

    fn from_str(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            other => Err(AppError::Config(format!(
                "Unknown platform '{}', expected 'android' or 'ios'.",
                other
            ))),
        }
    }
}

/// Experimental condition applied to a single app run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BypassMethod {
    None,
    Objection,
    Httptoolkit,
}

impl BypassMethod {
    pub const ALL: [BypassMethod; 3] = [Self::None, Self::Objection, Self::Httptoolkit];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Objection => "objection",
            Self::Httptoolkit => "httptoolkit",
        }
    }

    pub fn is_baseline(self) -> bool {
        self == Self::None
    }
}

impl std::str::FromStr for BypassMethod {
    type Err = AppError;

    fn from_str(value: &str) -> AppResult<Self> {
        match value {
            "none" => Ok(Self::None),
            "objection" => Ok(Self::Objection),
            "httptoolkit" => Ok(Self::Httptoolkit),
            other => Err(AppError::Internal(format!("unknown bypass method '{}'", other))),
        }
    }
}

impl std::fmt::Display for BypassMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed TLS handshake as reported by the interception proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsFailureEvent {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
    pub context: TlsFailureContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TlsFailureContext {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

pub const TLS_FAILED_STATUS: &str = "tlsFailed";

impl TlsFailureEvent {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            status: TLS_FAILED_STATUS.to_string(),
            timestamp: None,
            context: TlsFailureContext {
                error: error.into(),
                ..TlsFailureContext::default()
            },
        }
    }

    pub fn is_tls_failure(&self) -> bool {
        self.status == TLS_FAILED_STATUS
    }

    pub fn server_domain(&self) -> Option<&str> {
        domain_from_error_message(&self.context.error)
    }

    pub fn is_untrusted_certificate(&self) -> bool {
        is_untrusted_certificate_error(&self.context.error)
    }
}

/// One row of the `runs` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub app_id: String,
    pub version: String,
    pub method: BypassMethod,
    pub request_count: u64,
    pub tls_errors: Vec<TlsFailureEvent>,
    pub app_crashed: bool,
}

pub const UNKNOWN_VERSION: &str = "unknown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppMeta {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub platform: Platform,
}

impl AppMeta {
    pub fn version_or_unknown(&self) -> &str {
        self.version.as_deref().unwrap_or(UNKNOWN_VERSION)
    }
}

/// An installable unit: a single package file or a set of split APKs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPackage {
    pub files: Vec<PathBuf>,
}

impl AppPackage {
    pub fn single(path: PathBuf) -> Self {
        Self { files: vec![path] }
    }

    pub fn label(&self) -> String {
        match self.files.as_slice() {
            [] => "<empty package>".to_string(),
            [only] => only.display().to_string(),
            [first, ..] => first
                .parent()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|| first.display().to_string()),
        }
    }

    pub fn is_split(&self) -> bool {
        self.files.len() > 1
    }
}

/// What the proxy saw between start and stop of a capture.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrafficCapture {
    pub har: serde_json::Value,
    pub events: Vec<TlsFailureEvent>,
}

impl TrafficCapture {
    pub fn request_count(&self) -> u64 {
        self.har
            .pointer("/log/entries")
            .and_then(|entries| entries.as_array())
            .map(|entries| entries.len() as u64)
            .unwrap_or(0)
    }

    pub fn tls_failures(&self) -> Vec<TlsFailureEvent> {
        self.events
            .iter()
            .filter(|event| event.is_tls_failure())
            .cloned()
            .collect()
    }
}

/// Everything a finished cell hands to its result sink.
#[derive(Debug, Clone)]
pub struct CellOutcome {
    pub app: AppMeta,
    pub method: BypassMethod,
    pub capture: TrafficCapture,
    pub app_crashed: bool,
    pub app_started_at: DateTime<Utc>,
    pub traffic_stopped_at: DateTime<Utc>,
}

impl CellOutcome {
    pub fn to_run_record(&self) -> RunRecord {
        RunRecord {
            app_id: self.app.id.clone(),
            version: self.app.version_or_unknown().to_string(),
            method: self.method,
            request_count: self.capture.request_count(),
            tls_errors: self.capture.tls_failures(),
            app_crashed: self.app_crashed,
        }
    }
}

/// One row of the `requests` table, derived from a HAR entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub id: i64,
    pub dataset: String,
    pub initiator: String,
    pub platform: Platform,
    pub run_type: String,
    pub start_time: String,
    pub method: String,
    pub http_version: Option<String>,
    pub endpoint_url: String,
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub content: Option<String>,
    pub headers: String,
    pub cookies: String,
}
