use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SegError, SegResult};
use crate::orchestrator::CancellationToken;
use crate::paths::pve_path;
use crate::process::{command_exists, run_command_cancellable};

const DEFAULT_FAST_BIN: &str = "fast";
const FAST_BIN_ENV: &str = "ONCOSEG_FAST_BIN";
const SEGMENTER_TIMEOUT_ENV: &str = "ONCOSEG_SEGMENTER_TIMEOUT_MS";

/// One joint mixture-model segmentation over co-registered channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub inputs: Vec<PathBuf>,
    pub basename: PathBuf,
    pub classes: usize,
}

impl SegmentRequest {
    pub fn new(inputs: Vec<PathBuf>, basename: PathBuf, classes: usize) -> Self {
        Self {
            inputs,
            basename,
            classes,
        }
    }

    pub fn output_paths(&self) -> Vec<PathBuf> {
        (0..self.classes)
            .map(|i| pve_path(&self.basename, i))
            .collect()
    }

    fn validate(&self) -> SegResult<()> {
        if self.inputs.is_empty() {
            return Err(SegError::Configuration(
                "segmentation needs at least one input volume".to_owned(),
            ));
        }
        if self.classes == 0 {
            return Err(SegError::Configuration(
                "segmentation needs a positive class count".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Contract for the external partial-volume estimator.
///
/// A successful run leaves `classes` probability volumes named
/// `{basename}_pve_{i}.nii.gz`, ordered by ascending mean intensity of the
/// tissue class they describe.
pub trait Segmenter: Send + Sync {
    /// Human-readable tool name.
    fn name(&self) -> &'static str;

    /// Whether the underlying tool can currently be invoked.
    fn is_available(&self) -> bool;

    /// Execute the tool. Implementations do not need to verify outputs.
    fn run(&self, request: &SegmentRequest, token: &CancellationToken) -> SegResult<()>;

    /// Validate, execute and verify every expected output exists.
    fn segment(
        &self,
        request: &SegmentRequest,
        token: &CancellationToken,
    ) -> SegResult<Vec<PathBuf>> {
        request.validate()?;
        token.checkpoint()?;
        tracing::info!(
            segmenter = self.name(),
            channels = request.inputs.len(),
            classes = request.classes,
            basename = %request.basename.display(),
            "Invoking segmenter"
        );
        self.run(request, token)?;
        collect_pve_outputs(&request.basename, request.classes)
    }
}

/// Paths of `{basename}_pve_0..k`, failing on the first one missing.
pub fn collect_pve_outputs(basename: &Path, classes: usize) -> SegResult<Vec<PathBuf>> {
    (0..classes)
        .map(|i| {
            let path = pve_path(basename, i);
            if path.is_file() {
                Ok(path)
            } else {
                Err(SegError::MissingArtifact(path))
            }
        })
        .collect()
}

/// FSL FAST invoked as a subprocess.
#[derive(Debug, Clone)]
pub struct FslFast {
    binary: String,
    hard_timeout: Option<Duration>,
}

impl FslFast {
    pub fn new(binary: impl Into<String>, hard_timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.into(),
            hard_timeout,
        }
    }

    /// Binary from `ONCOSEG_FAST_BIN`, timeout from `ONCOSEG_SEGMENTER_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let binary = std::env::var(FAST_BIN_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FAST_BIN.to_owned());
        let hard_timeout = parse_timeout_ms(std::env::var(SEGMENTER_TIMEOUT_ENV).ok().as_deref());
        Self::new(binary, hard_timeout)
    }

    pub fn with_hard_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hard_timeout = timeout;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub(crate) fn build_args(request: &SegmentRequest) -> Vec<String> {
        let mut args = vec![
            "-v".to_owned(),
            format!("--out={}", request.basename.display()),
            format!("--class={}", request.classes),
            format!("--channels={}", request.inputs.len()),
        ];
        args.extend(request.inputs.iter().map(|p| p.display().to_string()));
        args
    }
}

impl Default for FslFast {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Segmenter for FslFast {
    fn name(&self) -> &'static str {
        "fsl-fast"
    }

    fn is_available(&self) -> bool {
        command_exists(&self.binary)
    }

    fn run(&self, request: &SegmentRequest, token: &CancellationToken) -> SegResult<()> {
        let args = Self::build_args(request);
        let output = run_command_cancellable(&self.binary, &args, None, token, self.hard_timeout)?;
        tracing::debug!(
            segmenter = self.name(),
            stdout_bytes = output.stdout.len(),
            "Segmenter finished"
        );
        Ok(())
    }
}

fn parse_timeout_ms(raw: Option<&str>) -> Option<Duration> {
    raw.and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
