use std::path::PathBuf;

use thiserror::Error;

pub type SegResult<T> = Result<T, SegError>;

#[derive(Debug, Error)]
pub enum SegError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("volume codec failure: {0}")]
    Nifti(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("label code {code} not present in label volume `{}`", path.display())]
    LabelNotFound { code: f64, path: PathBuf },

    #[error("region `{class}` has no strictly positive voxel to normalize")]
    EmptyRegion { class: String },

    #[error("volume `{}` is not co-registered with the reference grid: {detail}", path.display())]
    SpatialMismatch { path: PathBuf, detail: String },

    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize, usize),
        found: (usize, usize, usize),
    },

    #[error("missing command `{command}` on PATH")]
    CommandMissing { command: String },

    #[error("command failed: `{command}` (status: {status}){stderr_suffix}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr_suffix: String,
    },

    #[error("command timed out after {timeout_ms}ms: `{command}`{stderr_suffix}")]
    CommandTimedOut {
        command: String,
        timeout_ms: u64,
        stderr_suffix: String,
    },

    #[error("missing expected artifact at `{0}`")]
    MissingArtifact(PathBuf),

    #[error("output directory is locked: {0}")]
    RunLocked(String),

    #[error("failed to remove interim file `{}`: {detail}", path.display())]
    Cleanup { path: PathBuf, detail: String },

    #[error("pipeline cancelled: {0}")]
    Cancelled(String),
}

/// Coarse failure class of a [`SegError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    LabelNotFound,
    EmptyRegion,
    ExternalTool,
    Cleanup,
    Cancelled,
    Io,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::LabelNotFound => "label_not_found",
            Self::EmptyRegion => "empty_region",
            Self::ExternalTool => "external_tool",
            Self::Cleanup => "cleanup",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
        }
    }
}

impl SegError {
    #[must_use]
    pub fn from_command_failure(command: String, status: i32, stderr: String) -> Self {
        Self::CommandFailed {
            command,
            status,
            stderr_suffix: stderr_suffix(&stderr),
        }
    }

    #[must_use]
    pub fn from_command_timeout(command: String, timeout_ms: u64, stderr: String) -> Self {
        Self::CommandTimedOut {
            command,
            timeout_ms,
            stderr_suffix: stderr_suffix(&stderr),
        }
    }

    /// Groups variants into the failure classes callers branch on.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::SpatialMismatch { .. } | Self::RunLocked(_) => {
                ErrorKind::Configuration
            }
            Self::LabelNotFound { .. } => ErrorKind::LabelNotFound,
            Self::EmptyRegion { .. } => ErrorKind::EmptyRegion,
            Self::CommandMissing { .. }
            | Self::CommandFailed { .. }
            | Self::CommandTimedOut { .. }
            | Self::MissingArtifact(_) => ErrorKind::ExternalTool,
            Self::Cleanup { .. } => ErrorKind::Cleanup,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Io(_) | Self::Json(_) | Self::Nifti(_) | Self::ShapeMismatch { .. } => {
                ErrorKind::Io
            }
        }
    }

    /// Stable, unique, machine-readable code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "SEG-IO",
            Self::Json(_) => "SEG-JSON",
            Self::Nifti(_) => "SEG-NIFTI",
            Self::Configuration(_) => "SEG-CONFIG",
            Self::LabelNotFound { .. } => "SEG-LABEL-NOT-FOUND",
            Self::EmptyRegion { .. } => "SEG-EMPTY-REGION",
            Self::SpatialMismatch { .. } => "SEG-SPATIAL-MISMATCH",
            Self::ShapeMismatch { .. } => "SEG-SHAPE-MISMATCH",
            Self::CommandMissing { .. } => "SEG-CMD-MISSING",
            Self::CommandFailed { .. } => "SEG-CMD-FAILED",
            Self::CommandTimedOut { .. } => "SEG-CMD-TIMEOUT",
            Self::MissingArtifact(_) => "SEG-MISSING-ARTIFACT",
            Self::RunLocked(_) => "SEG-RUN-LOCKED",
            Self::Cleanup { .. } => "SEG-CLEANUP",
            Self::Cancelled(_) => "SEG-CANCELLED",
        }
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("; stderr: {trimmed}")
    }
}
