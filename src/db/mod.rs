use crate::errors::{AppError, AppResult};
use crate::models::{BypassMethod, RequestRecord, RunRecord, TlsFailureEvent};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Result store for experiment runs and exported requests.
///
/// One handle is opened per process by the entry point and handed down by reference;
/// the connection closes when the handle is dropped.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCount {
    pub method: String,
    pub count: u64,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(path = %path.display(), journal_mode = %journal_mode, "write-ahead logging unavailable");
        }
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Completion check for a single experiment cell.
    pub fn has_run(&self, app_id: &str, method: BypassMethod) -> AppResult<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM runs WHERE appId = ?1 AND method = ?2",
                params![app_id, method.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn insert_run(&self, record: &RunRecord) -> AppResult<()> {
        let tls_errors = serde_json::to_string(&record.tls_errors)?;
        let request_count = i64::try_from(record.request_count)
            .map_err(|_| AppError::Internal("request count exceeds storage range".to_string()))?;

        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO runs (appId, version, method, requestCount, tlsErrors, appCrashed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.app_id,
                record.version,
                record.method.as_str(),
                request_count,
                tls_errors,
                i64::from(record.app_crashed),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(error, _)) if error.code == ErrorCode::ConstraintViolation => {
                Err(AppError::Invariant(format!(
                    "result for {} (method: {}) already stored",
                    record.app_id,
                    record.method.as_str()
                )))
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn list_runs(&self) -> AppResult<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT appId, version, method, requestCount, tlsErrors, appCrashed
             FROM runs
             ORDER BY appId, method",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (app_id, version, method, request_count, tls_errors, app_crashed) = row?;
            let tls_errors: Vec<TlsFailureEvent> = serde_json::from_str(&tls_errors)?;
            runs.push(RunRecord {
                app_id,
                version,
                method: method.parse()?,
                request_count: u64::try_from(request_count).unwrap_or(0),
                tls_errors,
                app_crashed: app_crashed != 0,
            });
        }
        Ok(runs)
    }

    /// Apps that lack a result for at least one of the three methods.
    pub fn incomplete_apps(&self) -> AppResult<Vec<String>> {
        let [none, objection, httptoolkit] = BypassMethod::ALL;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT appId FROM runs
             WHERE appId NOT IN (
               SELECT appId FROM runs
               WHERE method IN (?1, ?2, ?3)
               GROUP BY appId
               HAVING COUNT(DISTINCT method) = 3
             )
             ORDER BY appId",
        )?;
        let rows = stmt.query_map(
            params![none.as_str(), objection.as_str(), httptoolkit.as_str()],
            |row| row.get::<_, String>(0),
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn crashes_per_method(&self) -> AppResult<Vec<MethodCount>> {
        self.method_counts(
            "SELECT method, SUM(appCrashed) FROM runs GROUP BY method ORDER BY method",
            None,
        )
    }

    /// Number of distinct apps per method whose TLS failures mention `needle`.
    pub fn apps_with_tls_error(&self, needle: &str) -> AppResult<Vec<MethodCount>> {
        let pattern = format!("%{}%", escape_like(needle));
        self.method_counts(
            "SELECT method, COUNT(DISTINCT appId) FROM runs
             WHERE tlsErrors LIKE ?1 ESCAPE '\\'
             GROUP BY method
             ORDER BY method",
            Some(&pattern),
        )
    }

    pub fn apps_with_any_tls_error(&self) -> AppResult<Vec<MethodCount>> {
        self.method_counts(
            "SELECT method, COUNT(DISTINCT appId) FROM runs
             WHERE json_array_length(tlsErrors) > 0
             GROUP BY method
             ORDER BY method",
            None,
        )
    }

    fn method_counts(&self, sql: &str, param: Option<&str>) -> AppResult<Vec<MethodCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(MethodCount {
                method: row.get(0)?,
                count: u64::try_from(row.get::<_, Option<i64>>(1)?.unwrap_or(0)).unwrap_or(0),
            })
        };
        let rows = match param {
            Some(param) => stmt.query_map([param], map_row)?.collect::<Result<Vec<_>, _>>(),
            None => stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>(),
        };
        rows.map_err(AppError::from)
    }

    pub fn max_request_id(&self, dataset: &str) -> AppResult<i64> {
        let conn = self.conn()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(id) FROM requests WHERE dataset = ?1",
            [dataset],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    pub fn insert_request(&self, request: &RequestRecord) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO requests (
               id, dataset, initiator, platform, runType, startTime, method, httpVersion,
               endpointUrl, scheme, host, port, path, content, headers, cookies
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                request.id,
                request.dataset,
                request.initiator,
                request.platform.as_str(),
                request.run_type,
                request.start_time,
                request.method,
                request.http_version,
                request.endpoint_url,
                request.scheme,
                request.host,
                request.port,
                request.path,
                request.content,
                request.headers,
                request.cookies,
            ],
        )?;
        Ok(())
    }

    pub fn count_requests(&self, dataset: &str) -> AppResult<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM requests WHERE dataset = ?1",
            [dataset],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
