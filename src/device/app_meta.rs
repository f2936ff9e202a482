use crate::errors::{AppError, AppResult};
use crate::models::{AppMeta, AppPackage, Platform};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

static BADGING_PACKAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^package: name='([^']*)'(?:.*?versionCode='([^']*)')?(?:.*?versionName='([^']*)')?")
        .expect("valid badging package regex")
});
static BADGING_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^application-label:'([^']*)'").expect("valid badging label regex"));

/// Lists the installable packages in `dir`, sorted by path.
///
/// A package file directly in `dir` is a single package; a subdirectory holding package
/// files is one split package.
pub fn discover_packages(dir: &Path, platform: Platform) -> AppResult<Vec<AppPackage>> {
    let extension = platform.package_extension();
    let entries = fs::read_dir(dir)
        .map_err(|error| AppError::NotFound(format!("cannot list {}: {}", dir.display(), error)))?;

    let mut packages = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            let mut files = package_files(&path, extension)?;
            if files.is_empty() {
                tracing::debug!(dir = %path.display(), "skipping directory without packages");
                continue;
            }
            files.sort();
            if let Some(base) = choose_base_apk(&path, &files) {
                let index = files.iter().position(|file| file == &base).unwrap_or(0);
                let base = files.remove(index);
                files.insert(0, base);
            }
            packages.push(AppPackage { files });
        } else if has_extension(&path, extension) {
            packages.push(AppPackage::single(path));
        }
    }
    packages.sort_by(|left, right| left.files.cmp(&right.files));
    Ok(packages)
}

fn package_files(dir: &Path, extension: &str) -> AppResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_extension(&path, extension) {
            files.push(path);
        }
    }
    Ok(files)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Picks the base APK of a split set, the one carrying the app's manifest.
pub fn choose_base_apk(dir: &Path, files: &[PathBuf]) -> Option<PathBuf> {
    let stem = |path: &PathBuf| {
        path.file_stem()
            .and_then(|value| value.to_str())
            .map(str::to_string)
            .unwrap_or_default()
    };

    if let Some(base) = files.iter().find(|file| stem(file) == "base") {
        return Some(base.clone());
    }
    if let Some(dir_name) = dir.file_name().and_then(|value| value.to_str()) {
        if let Some(named) = files.iter().find(|file| stem(file) == dir_name) {
            return Some(named.clone());
        }
    }
    files
        .iter()
        .find(|file| {
            let stem = stem(file);
            !stem.starts_with("split_") && !stem.starts_with("config.")
        })
        .cloned()
}

/// Reads app id, version and label from `aapt dump badging` output.
pub fn parse_badging(output: &str, platform: Platform) -> Option<AppMeta> {
    let mut meta: Option<AppMeta> = None;
    let mut label = None;

    for line in output.lines() {
        if meta.is_none() {
            if let Some(captures) = BADGING_PACKAGE.captures(line) {
                let id = captures.get(1)?.as_str().trim();
                if id.is_empty() {
                    return None;
                }
                let non_empty = |index: usize| {
                    captures
                        .get(index)
                        .map(|value| value.as_str().trim())
                        .filter(|value| !value.is_empty())
                        .map(str::to_string)
                };
                meta = Some(AppMeta {
                    id: id.to_string(),
                    version: non_empty(3),
                    version_code: non_empty(2),
                    name: None,
                    platform,
                });
                continue;
            }
        }
        if label.is_none() {
            if let Some(captures) = BADGING_LABEL.captures(line) {
                label = captures
                    .get(1)
                    .map(|value| value.as_str().to_string())
                    .filter(|value| !value.is_empty());
            }
        }
    }

    meta.map(|mut meta| {
        meta.name = label;
        meta
    })
}
