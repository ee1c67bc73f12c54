//! Best-effort removal of interim artifacts.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{SegError, SegResult};
use crate::model::{CleanupFailure, CleanupReport};

/// Name suffixes of interim files: split regions and the segmenter's side outputs.
pub const INTERIM_SUFFIXES: [&str; 4] = [
    "Tumor.nii.gz",
    "mixeltype.nii.gz",
    "_pveseg.nii.gz",
    "_seg.nii.gz",
];

#[must_use]
pub fn is_interim_name(file_name: &str) -> bool {
    INTERIM_SUFFIXES
        .iter()
        .any(|suffix| file_name.ends_with(suffix))
}

/// Interim entries directly inside `dir`, sorted by name.
///
/// Directories are listed too so that [`remove_paths`] reports them.
pub fn interim_files(dir: &Path) -> SegResult<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if is_interim_name(&entry.file_name().to_string_lossy()) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Delete every interim file in `dir`.
///
/// Never fails: an unreadable directory or a failed deletion is recorded
/// and logged at `warn`.
pub fn remove_interim_files(dir: &Path) -> CleanupReport {
    match interim_files(dir) {
        Ok(paths) => remove_paths(&paths),
        Err(error) => {
            let mut report = CleanupReport::default();
            record_failure(&mut report, dir, error.to_string());
            report
        }
    }
}

/// Delete each path in order, continuing past failures.
pub fn remove_paths(paths: &[PathBuf]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Removed interim file");
                report.removed.push(path.clone());
            }
            Err(error) => record_failure(&mut report, path, error.to_string()),
        }
    }
    report
}

fn record_failure(report: &mut CleanupReport, path: &Path, detail: String) {
    let failure = SegError::Cleanup {
        path: path.to_path_buf(),
        detail,
    };
    tracing::warn!(
        path = %path.display(),
        error_code = failure.error_code(),
        "{failure}"
    );
    report.failures.push(CleanupFailure {
        path: path.to_path_buf(),
        error: failure.to_string(),
    });
}
