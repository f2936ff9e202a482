//! Newline-separated app id lists.

use crate::errors::{AppError, AppResult};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parses an id list. JSON input may nest arrays of ids arbitrarily deep; anything else
/// is read as one id per line.
pub fn parse_app_ids(raw: &str) -> AppResult<Vec<String>> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|error| AppError::Config(format!("invalid JSON id list: {}", error)))?;
        let mut ids = Vec::new();
        flatten_ids(&value, &mut ids)?;
        return Ok(ids);
    }

    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn flatten_ids(value: &serde_json::Value, ids: &mut Vec<String>) -> AppResult<()> {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                flatten_ids(item, ids)?;
            }
            Ok(())
        }
        serde_json::Value::String(id) => {
            let id = id.trim();
            if !id.is_empty() {
                ids.push(id.to_string());
            }
            Ok(())
        }
        serde_json::Value::Null => Ok(()),
        other => Err(AppError::Config(format!("app id list contains a non-string entry: {}", other))),
    }
}

pub fn read_app_ids(path: &Path) -> AppResult<Vec<String>> {
    let raw = fs::read_to_string(path)
        .map_err(|error| AppError::NotFound(format!("cannot read {}: {}", path.display(), error)))?;
    parse_app_ids(&raw)
}

/// Concatenates lists, keeping the first occurrence of every id.
pub fn merge_app_ids<I>(lists: I) -> Vec<String>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut seen = HashSet::new();
    lists
        .into_iter()
        .flatten()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

pub fn write_app_ids(path: &Path, ids: &[String]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, ids.join("\n"))?;
    Ok(())
}

pub fn merge_files(out: &Path, inputs: &[impl AsRef<Path>]) -> AppResult<usize> {
    let mut lists = Vec::with_capacity(inputs.len());
    for input in inputs {
        lists.push(read_app_ids(input.as_ref())?);
    }
    let merged = merge_app_ids(lists);
    write_app_ids(out, &merged)?;
    tracing::info!(out = %out.display(), inputs = inputs.len(), ids = merged.len(), "wrote app id list");
    Ok(merged.len())
}
