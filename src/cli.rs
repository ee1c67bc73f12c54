use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};

use crate::error::{SegError, SegResult};
use crate::model::{
    ALL_MODES, CompartmentSpec, RunConfig, SegmentationMode, TumorClassMapping, parse_tumor_class,
};
use crate::orchestrator::PipelineRun;
use crate::segmenter::{FslFast, Segmenter};

// ---------------------------------------------------------------------------
// Graceful Ctrl+C shutdown
// ---------------------------------------------------------------------------

/// Global flag indicating that a shutdown signal has been received.
static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

/// Coordinates graceful Ctrl+C shutdown.
///
/// The signal handler sets a global `AtomicBool` that every
/// [`CancellationToken`](crate::orchestrator::CancellationToken) checkpoint
/// consults, so a run stops at the next step boundary and the running
/// segmenter process is killed.
pub struct ShutdownController;

impl ShutdownController {
    /// Install the Ctrl+C signal handler.
    ///
    /// `on_signal` is an optional callback invoked from the signal-handler
    /// context. Errors are non-fatal; callers may log and continue.
    pub fn install(on_signal: Option<Box<dyn Fn() + Send + Sync + 'static>>) -> SegResult<()> {
        ctrlc::set_handler(move || {
            SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
            tracing::info!("shutdown signal received (Ctrl+C)");
            if let Some(ref cb) = on_signal {
                cb();
            }
        })
        .map_err(|e| SegError::Io(std::io::Error::other(format!("ctrlc handler: {e}"))))?;
        Ok(())
    }

    #[must_use]
    pub fn is_shutting_down() -> bool {
        SHUTDOWN_FLAG.load(Ordering::SeqCst)
    }

    /// The exit code the binary should use when exiting due to a signal.
    #[must_use]
    pub const fn signal_exit_code() -> i32 {
        130 // 128 + SIGINT(2)
    }
}

#[derive(Debug, Parser)]
#[command(name = "oncoseg")]
#[command(about = "Mode-driven structural segmentation of brain MRI with tumor compartments")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Segment input modalities into named compartments.
    Run(Box<RunArgs>),
    /// List the recognized segmentation modes.
    Modes,
    /// Report whether the external segmenter can be invoked.
    CheckTools,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Work directory; outputs go to `<work-dir>/structure_segmentation`.
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Co-registered input modality (repeatable, order is kept).
    #[arg(long = "input")]
    pub inputs: Vec<PathBuf>,

    /// Integer-coded tumor label volume.
    #[arg(long)]
    pub tumor_label: Option<PathBuf>,

    /// Segmentation strategy.
    #[arg(long, value_enum)]
    pub mode: Option<SegmentationMode>,

    /// Brain class name, in ascending mean-intensity order (repeatable).
    #[arg(long = "brain-class")]
    pub brain_classes: Vec<String>,

    /// Tumor class as NAME=CODE (repeatable, order is kept).
    #[arg(long = "tumor-class", value_parser = parse_tumor_class)]
    pub tumor_classes: Vec<(String, f64)>,

    /// Keep `-woTumor`/`-withTumor` and segmenter side outputs.
    #[arg(long)]
    pub keep_interim: bool,

    /// Write into `<output>/<run_id>/` so concurrent runs do not collide.
    #[arg(long)]
    pub isolate_run: bool,

    /// Skip the shape/affine consistency check across inputs.
    #[arg(long)]
    pub no_verify_spatial: bool,

    /// Whole-run deadline in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Hard timeout for each segmenter invocation in milliseconds.
    #[arg(long)]
    pub segmenter_timeout_ms: Option<u64>,

    /// JSON run configuration; flags given here take precedence.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the full run report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Merge flags over the config file (if any) into a run configuration.
    pub fn to_config(&self) -> SegResult<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)?,
            None => RunConfig::default(),
        };

        if let Some(dir) = &self.work_dir {
            config.work_dir = Some(dir.clone());
        }
        if !self.inputs.is_empty() {
            config.inputs = self.inputs.clone();
        }
        if let Some(label) = &self.tumor_label {
            config.tumor_label = Some(label.clone());
        }
        if let Some(mode) = self.mode {
            config.mode = Some(mode);
        }
        if !self.brain_classes.is_empty() {
            config.brain_classes = Some(CompartmentSpec::new(self.brain_classes.clone())?);
        }
        if !self.tumor_classes.is_empty() {
            config.tumor_classes = Some(TumorClassMapping::new(self.tumor_classes.clone())?);
        }
        if self.keep_interim {
            config.remove_interim_files = Some(false);
        }
        if self.isolate_run {
            config.isolate_run = Some(true);
        }
        if self.no_verify_spatial {
            config.verify_spatial = Some(false);
        }
        if self.timeout_ms.is_some() {
            config.timeout_ms = self.timeout_ms;
        }
        if self.segmenter_timeout_ms.is_some() {
            config.segmenter_timeout_ms = self.segmenter_timeout_ms;
        }
        Ok(config)
    }

    pub fn to_pipeline_run(&self) -> SegResult<PipelineRun> {
        PipelineRun::from_config(self.to_config()?)
    }
}

/// One line per mode, the default marked.
pub fn modes_listing() -> Vec<String> {
    ALL_MODES
        .iter()
        .map(|mode| {
            if *mode == SegmentationMode::default() {
                format!("{mode} (default)")
            } else {
                mode.to_string()
            }
        })
        .collect()
}

pub fn tools_report(fast: &FslFast) -> Value {
    json!({
        "segmenters": [{
            "name": fast.name(),
            "binary": fast.binary(),
            "available": fast.is_available(),
        }],
    })
}
