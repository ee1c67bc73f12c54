use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{SegError, SegResult};

pub const LOCK_FILE_NAME: &str = ".oncoseg.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    created_at_rfc3339: String,
    run_id: String,
}

/// Exclusive claim on one output directory for the duration of a run.
///
/// Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    released: bool,
}

impl RunLock {
    pub fn acquire(output_dir: &Path, run_id: &str) -> SegResult<Self> {
        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(LOCK_FILE_NAME);

        if path.exists() {
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<LockInfo>(&contents) {
                Ok(info) if !pid_is_alive(info.pid) => {
                    discard_abandoned_lock(&path, "stale", &contents)?;
                }
                Ok(info) => {
                    return Err(SegError::RunLocked(format!(
                        "run {} (pid {}) holds {} since {}",
                        info.run_id,
                        info.pid,
                        output_dir.display(),
                        info.created_at_rfc3339
                    )));
                }
                Err(_) => discard_abandoned_lock(&path, "corrupt", &contents)?,
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            created_at_rfc3339: Utc::now().to_rfc3339(),
            run_id: run_id.to_owned(),
        };
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|error| {
                SegError::RunLocked(format!(
                    "failed to create lock {}: {error}",
                    path.display()
                ))
            })?;
        file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
        file.sync_all()?;
        tracing::debug!(lock = %path.display(), run_id, "Acquired output lock");

        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> SegResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> SegResult<()> {
        if self.released {
            return Ok(());
        }
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released && self.path.exists() {
            let _ = fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

/// Remove a lock no live run holds. Its contents survive only in the log.
fn discard_abandoned_lock(path: &Path, reason: &str, contents: &str) -> SegResult<()> {
    tracing::warn!(
        lock = %path.display(),
        reason,
        previous = contents.trim(),
        "Removing abandoned output lock"
    );
    fs::remove_file(path)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}
