//! Flattens captured HAR files into rows of the `requests` table.

use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{Platform, RequestRecord, UNKNOWN_VERSION};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_DATASET: &str = "monkey-april-2024";

#[derive(Debug, Deserialize)]
struct Har {
    log: HarLog,
}

#[derive(Debug, Deserialize)]
struct HarLog {
    #[serde(default)]
    entries: Vec<HarEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarEntry {
    started_date_time: String,
    request: HarRequest,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HarRequest {
    method: String,
    url: String,
    #[serde(default)]
    http_version: Option<String>,
    #[serde(default = "empty_array")]
    headers: serde_json::Value,
    #[serde(default = "empty_array")]
    cookies: serde_json::Value,
    #[serde(default)]
    post_data: Option<HarPostData>,
}

#[derive(Debug, Deserialize)]
struct HarPostData {
    #[serde(default)]
    text: Option<String>,
}

fn empty_array() -> serde_json::Value {
    serde_json::Value::Array(Vec::new())
}

#[derive(Debug, Deserialize)]
struct CaptureMeta {
    app: MetaApp,
}

#[derive(Debug, Deserialize)]
struct MetaApp {
    id: String,
    #[serde(default)]
    version: Option<String>,
}

/// The parts of a request URL that end up in their own columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub scheme: String,
    pub hostname: String,
    /// Only set when it differs from the scheme's default port.
    pub port: Option<u16>,
    pub pathname: String,
    pub search: String,
}

impl UrlParts {
    pub fn host(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.hostname, port),
            None => self.hostname.clone(),
        }
    }

    pub fn endpoint_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host(), self.pathname)
    }

    /// Explicit port, falling back to the scheme default.
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| default_port(&self.scheme))
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "ftp" => Some(21),
        _ => None,
    }
}

pub fn parse_url(url: &str) -> AppResult<UrlParts> {
    let parsed = Url::parse(url.trim())
        .map_err(|error| AppError::Internal(format!("invalid URL '{}': {}", url, error)))?;
    let scheme = parsed.scheme().to_string();
    let hostname = parsed.host_str().unwrap_or_default().to_string();
    if hostname.is_empty() && default_port(&scheme).is_some() {
        return Err(AppError::Internal(format!("URL '{}' has no host", url)));
    }

    // `Url::port` is already `None` for the scheme's default port.
    let search = match parsed.query() {
        Some(query) if !query.is_empty() => format!("?{}", query),
        _ => String::new(),
    };

    Ok(UrlParts {
        scheme,
        hostname,
        port: parsed.port(),
        pathname: parsed.path().to_string(),
        search,
    })
}

fn iso_timestamp(raw: &str) -> AppResult<String> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|error| AppError::Internal(format!("invalid startedDateTime '{}': {}", raw, error)))?;
    Ok(parsed
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Converts every entry of a HAR document; ids are left at zero for the caller to assign.
pub fn unhar(
    raw_har: &str,
    initiator: &str,
    platform: Platform,
    dataset: &str,
) -> AppResult<Vec<RequestRecord>> {
    let har: Har = serde_json::from_str(raw_har)?;
    let run_type = match platform {
        Platform::Android => "monkey",
        Platform::Ios => "no-interaction",
    };

    har.log
        .entries
        .into_iter()
        .map(|entry| -> AppResult<RequestRecord> {
            let url = parse_url(&entry.request.url)?;
            Ok(RequestRecord {
                id: 0,
                dataset: dataset.to_string(),
                initiator: initiator.to_string(),
                platform,
                run_type: run_type.to_string(),
                start_time: iso_timestamp(&entry.started_date_time)?,
                method: entry.request.method,
                http_version: entry.request.http_version,
                endpoint_url: url.endpoint_url(),
                scheme: url.scheme.clone(),
                host: url.hostname.clone(),
                port: url.effective_port(),
                path: format!("{}{}", url.pathname, url.search),
                content: entry.request.post_data.and_then(|data| data.text),
                headers: serde_json::to_string(&entry.request.headers)?,
                cookies: serde_json::to_string(&entry.request.cookies)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub files: usize,
    pub requests: usize,
    pub failed_files: usize,
}

pub fn meta_path_for(har_path: &Path) -> PathBuf {
    let stem = har_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    har_path.with_file_name(format!("{}-meta.json", stem))
}

fn find_har_files(dir: &Path, found: &mut Vec<PathBuf>) -> AppResult<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            find_har_files(&path, found)?;
        } else if path.extension().and_then(|value| value.to_str()) == Some("har") {
            found.push(path);
        }
    }
    Ok(())
}

/// Imports all `*.har` files below `data_dir`. Every HAR needs its meta file; a HAR that
/// cannot be converted is skipped without inserting any of its requests.
pub fn export_har_dir(db: &Database, platform: Platform, data_dir: &Path, dataset: &str) -> AppResult<ExportSummary> {
    if !data_dir.is_dir() {
        return Err(AppError::NotFound(format!("{} is not a directory", data_dir.display())));
    }
    let mut har_files = Vec::new();
    find_har_files(data_dir, &mut har_files)?;
    har_files.sort();

    let mut next_id = db.max_request_id(dataset)?;
    let mut summary = ExportSummary::default();
    for har_file in &har_files {
        let meta_file = meta_path_for(har_file);
        if !meta_file.is_file() {
            return Err(AppError::NotFound(format!(
                "Meta file for {} does not exist.",
                har_file.display()
            )));
        }
        let meta: CaptureMeta = serde_json::from_str(&fs::read_to_string(&meta_file)?)?;
        let initiator = format!(
            "{}@{}",
            meta.app.id,
            meta.app.version.as_deref().unwrap_or(UNKNOWN_VERSION)
        );

        let records = fs::read_to_string(har_file)
            .map_err(AppError::from)
            .and_then(|raw| unhar(&raw, &initiator, platform, dataset));
        let records = match records {
            Ok(records) => records,
            Err(error) => {
                tracing::error!(file = %har_file.display(), error = %error, "failed to process HAR");
                summary.failed_files += 1;
                continue;
            }
        };

        for mut record in records {
            next_id += 1;
            record.id = next_id;
            db.insert_request(&record)?;
            summary.requests += 1;
        }
        summary.files += 1;
    }
    tracing::info!(
        dataset = %dataset,
        files = summary.files,
        requests = summary.requests,
        failed = summary.failed_files,
        "export finished"
    );
    Ok(summary)
}
