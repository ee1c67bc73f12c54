use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cleanup;
use crate::error::{SegError, SegResult};
use crate::lock::RunLock;
use crate::mask::{LabelVolume, apply_mask, label_to_mask};
use crate::model::{
    CleanupReport, CompartmentOutput, CompartmentSpec, RunConfig, RunEvent, RunReport,
    SegmentationMode, StreamedRunEvent, TumorClassMapping,
};
use crate::normalize::normalize_region;
use crate::paths::{
    BRAIN_BASENAME, TUMOR_BASENAME, default_work_dir, ensure_dir, output_dir,
    segmentation_basename, volume_path,
};
use crate::segmenter::{FslFast, SegmentRequest, Segmenter};
use crate::split::{Modality, SplitOutputs, split_tumor_from_brain};
use crate::volume::{self, Volume};

// ---------------------------------------------------------------------------
// Stages and run states
// ---------------------------------------------------------------------------

/// A discrete step of a run; checkpoints sit between consecutive stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrchestratorStage {
    /// Configuration, input loading and spatial checks. Never writes.
    Validate,
    /// Output directory creation and locking.
    Prepare,
    /// Tumor/brain partition of every modality.
    Split,
    /// Joint segmentation of the brain part (or raw inputs, tumor-agnostic).
    SegmentBrain,
    /// Intensity-only segmentation of the tumor part.
    SegmentTumor,
    /// Per-label cut and normalization of the tumor part.
    WeightTumor,
    Cleanup,
    Report,
}

impl OrchestratorStage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Prepare => "prepare",
            Self::Split => "split",
            Self::SegmentBrain => "segment_brain",
            Self::SegmentTumor => "segment_tumor",
            Self::WeightTumor => "weight_tumor",
            Self::Cleanup => "cleanup",
            Self::Report => "report",
        }
    }
}

impl fmt::Display for OrchestratorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Stages a mode executes between `prepare` and `cleanup`, in order.
pub fn strategy_stages(mode: SegmentationMode) -> &'static [OrchestratorStage] {
    use OrchestratorStage::{SegmentBrain, SegmentTumor, Split, WeightTumor};
    match mode {
        SegmentationMode::TumorAgnostic => &[SegmentBrain],
        SegmentationMode::BiasCorrected => &[Split, SegmentBrain, SegmentTumor],
        SegmentationMode::TumorEntityWeighted => &[Split, SegmentBrain, WeightTumor],
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Validated,
    Running(SegmentationMode),
    CleanedUp,
    Done,
}

impl RunState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Validated => "validated",
            Self::Running(mode) => mode.as_str(),
            Self::CleanedUp => "cleaned_up",
            Self::Done => "done",
        }
    }

    pub fn can_advance_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Validated)
                | (Self::Validated, Self::Running(_))
                | (Self::Running(_), Self::CleanedUp)
                | (Self::CleanedUp, Self::Done)
        )
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared cancellation flag plus optional wall-clock deadline.
///
/// Clones observe the same flag. Also trips once the process-wide Ctrl+C flag
/// is set.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    deadline: Option<DateTime<Utc>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same flag, with a deadline `timeout_ms` from now (`None` clears it).
    #[must_use]
    pub fn with_deadline_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.deadline = timeout_ms.map(|ms| {
            let clamped = i64::try_from(ms).unwrap_or(i64::MAX);
            Utc::now()
                .checked_add_signed(chrono::Duration::milliseconds(clamped))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    pub fn checkpoint(&self) -> SegResult<()> {
        if self.is_cancelled() {
            return Err(SegError::Cancelled("run cancelled by caller".to_owned()));
        }
        if crate::cli::ShutdownController::is_shutting_down() {
            return Err(SegError::Cancelled(
                "pipeline cancelled via Ctrl+C".to_owned(),
            ));
        }
        if let Some(deadline) = self.deadline
            && Utc::now() >= deadline
        {
            return Err(SegError::Cancelled("run deadline exceeded".to_owned()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

pub(crate) struct EventLog {
    run_id: String,
    seq: u64,
    events: Vec<RunEvent>,
    event_tx: Option<Sender<StreamedRunEvent>>,
    stage_start: Option<Instant>,
}

impl EventLog {
    pub(crate) fn new(run_id: String, event_tx: Option<Sender<StreamedRunEvent>>) -> Self {
        Self {
            run_id,
            seq: 0,
            events: Vec::new(),
            event_tx,
            stage_start: None,
        }
    }

    fn mark_stage_start(&mut self) {
        self.stage_start = Some(Instant::now());
    }

    fn stage_elapsed_ms(&self) -> Option<u64> {
        self.stage_start
            .map(|start| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX))
    }

    pub(crate) fn push(&mut self, stage: &str, code: &str, message: &str, mut payload: Value) {
        if let Value::Object(ref mut map) = payload
            && let Some(elapsed) = self.stage_elapsed_ms()
        {
            map.insert("elapsed_ms".to_owned(), json!(elapsed));
        }

        self.seq += 1;
        let event = RunEvent {
            seq: self.seq,
            ts_rfc3339: Utc::now().to_rfc3339(),
            stage: stage.to_owned(),
            code: code.to_owned(),
            message: message.to_owned(),
            payload,
        };
        self.events.push(event.clone());

        if let Some(tx) = &self.event_tx {
            let _ = tx.send(StreamedRunEvent {
                run_id: self.run_id.clone(),
                event,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn events(&self) -> &[RunEvent] {
        &self.events
    }

    fn into_events(self) -> Vec<RunEvent> {
        self.events
    }
}

fn stage_failure_code(stage: &str, error: &SegError) -> String {
    match error {
        SegError::CommandTimedOut { .. } => format!("{stage}.timeout"),
        SegError::Cancelled(_) => format!("{stage}.cancelled"),
        _ => format!("{stage}.error"),
    }
}

fn stage_failure_message<'a>(error: &SegError, default: &'a str) -> &'a str {
    match error {
        SegError::CommandTimedOut { .. } => "segmenter exceeded its time budget",
        SegError::Cancelled(_) => "run cancelled at checkpoint",
        _ => default,
    }
}

fn checkpoint_or_emit(
    stage: OrchestratorStage,
    token: &CancellationToken,
    log: &mut EventLog,
) -> SegResult<()> {
    token.checkpoint().inspect_err(|error| {
        let code = stage_failure_code(stage.label(), error);
        log.push(
            stage.label(),
            &code,
            stage_failure_message(error, "checkpoint failed"),
            json!({
                "error": error.to_string(),
                "checkpoint": true,
                "deadline_rfc3339": token.deadline().map(|d| d.to_rfc3339()),
            }),
        );
    })
}

/// Checkpoint, then run one step with start/ok/error events around it.
fn run_step<T>(
    stage: OrchestratorStage,
    token: &CancellationToken,
    log: &mut EventLog,
    payload: Value,
    step: impl FnOnce() -> SegResult<T>,
) -> SegResult<T> {
    checkpoint_or_emit(stage, token, log)?;
    let label = stage.label();
    log.mark_stage_start();
    log.push(label, &format!("{label}.start"), "step started", payload);
    tracing::info!(stage = label, "Step started");

    match step() {
        Ok(value) => {
            log.push(label, &format!("{label}.ok"), "step completed", json!({}));
            tracing::info!(stage = label, "Step completed");
            Ok(value)
        }
        Err(error) => {
            let code = stage_failure_code(label, &error);
            log.push(
                label,
                &code,
                stage_failure_message(&error, "step failed"),
                json!({
                    "error": error.to_string(),
                    "error_code": error.error_code(),
                    "error_kind": error.kind().as_str(),
                }),
            );
            tracing::error!(stage = label, error_code = error.error_code(), "{error}");
            Err(error)
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline run
// ---------------------------------------------------------------------------

/// One configured segmentation run. Consumed by [`PipelineRun::run`].
pub struct PipelineRun {
    work_dir: PathBuf,
    inputs: Vec<PathBuf>,
    tumor_label: Option<PathBuf>,
    mode: SegmentationMode,
    brain_classes: CompartmentSpec,
    tumor_classes: TumorClassMapping,
    remove_interim_files: bool,
    isolate_run: bool,
    verify_spatial: bool,
    timeout_ms: Option<u64>,
    segmenter: Arc<dyn Segmenter>,
    token: CancellationToken,
    event_tx: Option<Sender<StreamedRunEvent>>,
}

impl fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRun")
            .field("work_dir", &self.work_dir)
            .field("inputs", &self.inputs)
            .field("tumor_label", &self.tumor_label)
            .field("mode", &self.mode)
            .field("brain_classes", &self.brain_classes)
            .field("tumor_classes", &self.tumor_classes)
            .field("remove_interim_files", &self.remove_interim_files)
            .field("isolate_run", &self.isolate_run)
            .field("verify_spatial", &self.verify_spatial)
            .field("timeout_ms", &self.timeout_ms)
            .field("segmenter", &self.segmenter.name())
            .finish_non_exhaustive()
    }
}

impl PipelineRun {
    pub fn new(work_dir: impl Into<PathBuf>, inputs: Vec<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            inputs,
            tumor_label: None,
            mode: SegmentationMode::default(),
            brain_classes: CompartmentSpec::default(),
            tumor_classes: TumorClassMapping::default(),
            remove_interim_files: true,
            isolate_run: false,
            verify_spatial: true,
            timeout_ms: None,
            segmenter: Arc::new(FslFast::from_env()),
            token: CancellationToken::new(),
            event_tx: None,
        }
    }

    /// Apply a config file over the built-in defaults.
    pub fn from_config(config: RunConfig) -> SegResult<Self> {
        let work_dir = match config.work_dir {
            Some(dir) => dir,
            None => default_work_dir()?,
        };
        let mut run = Self::new(work_dir, config.inputs);
        run.tumor_label = config.tumor_label;
        if let Some(mode) = config.mode {
            run.mode = mode;
        }
        if let Some(classes) = config.brain_classes {
            run.brain_classes = classes;
        }
        if let Some(mapping) = config.tumor_classes {
            run.tumor_classes = mapping;
        }
        if let Some(remove) = config.remove_interim_files {
            run.remove_interim_files = remove;
        }
        if let Some(isolate) = config.isolate_run {
            run.isolate_run = isolate;
        }
        if let Some(verify) = config.verify_spatial {
            run.verify_spatial = verify;
        }
        run.timeout_ms = config.timeout_ms;
        if let Some(ms) = config.segmenter_timeout_ms {
            run.segmenter = Arc::new(
                FslFast::from_env().with_hard_timeout(Some(std::time::Duration::from_millis(ms))),
            );
        }
        Ok(run)
    }

    pub fn set_work_dir(&mut self, work_dir: impl Into<PathBuf>) -> &mut Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn set_inputs(&mut self, inputs: Vec<PathBuf>) -> &mut Self {
        self.inputs = inputs;
        self
    }

    pub fn set_tumor_label(&mut self, label: Option<PathBuf>) -> &mut Self {
        self.tumor_label = label;
        self
    }

    pub fn set_mode(&mut self, mode: SegmentationMode) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Parse and set a mode by name; unknown names are a configuration error.
    pub fn set_mode_name(&mut self, name: &str) -> SegResult<&mut Self> {
        self.mode = name.parse()?;
        Ok(self)
    }

    pub fn set_brain_classes(&mut self, classes: CompartmentSpec) -> &mut Self {
        self.brain_classes = classes;
        self
    }

    pub fn set_tumor_classes(&mut self, mapping: TumorClassMapping) -> &mut Self {
        self.tumor_classes = mapping;
        self
    }

    pub fn set_remove_interim_files(&mut self, remove: bool) -> &mut Self {
        self.remove_interim_files = remove;
        self
    }

    pub fn set_isolate_run(&mut self, isolate: bool) -> &mut Self {
        self.isolate_run = isolate;
        self
    }

    pub fn set_verify_spatial(&mut self, verify: bool) -> &mut Self {
        self.verify_spatial = verify;
        self
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: Option<u64>) -> &mut Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn set_segmenter(&mut self, segmenter: Arc<dyn Segmenter>) -> &mut Self {
        self.segmenter = segmenter;
        self
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) -> &mut Self {
        self.token = token;
        self
    }

    pub fn set_event_sender(&mut self, tx: Sender<StreamedRunEvent>) -> &mut Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn tumor_label(&self) -> Option<&Path> {
        self.tumor_label.as_deref()
    }

    pub fn mode(&self) -> SegmentationMode {
        self.mode
    }

    pub fn brain_classes(&self) -> &CompartmentSpec {
        &self.brain_classes
    }

    pub fn tumor_classes(&self) -> &TumorClassMapping {
        &self.tumor_classes
    }

    pub fn remove_interim_files(&self) -> bool {
        self.remove_interim_files
    }

    pub fn isolate_run(&self) -> bool {
        self.isolate_run
    }

    pub fn verify_spatial(&self) -> bool {
        self.verify_spatial
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    pub fn segmenter(&self) -> &dyn Segmenter {
        self.segmenter.as_ref()
    }

    /// Handle that cancels this run from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Shared output directory `<work_dir>/structure_segmentation`.
    pub fn output_dir(&self) -> PathBuf {
        output_dir(&self.work_dir)
    }

    /// Validate, execute the selected strategy, rename, clean up.
    pub fn run(self) -> SegResult<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let token = self.token.clone().with_deadline_ms(self.timeout_ms);
        let mut log = EventLog::new(run_id.clone(), self.event_tx.clone());
        let mut state = StateTracker::default();

        tracing::info!(
            run_id = %run_id,
            mode = %self.mode,
            work_dir = %self.work_dir.display(),
            inputs = self.inputs.len(),
            segmenter = self.segmenter.name(),
            "Starting segmentation run"
        );

        let validated = run_step(
            OrchestratorStage::Validate,
            &token,
            &mut log,
            json!({
                "mode": self.mode.as_str(),
                "inputs": self.inputs.len(),
                "stages": strategy_stages(self.mode)
                    .iter()
                    .map(|stage| stage.label())
                    .collect::<Vec<_>>(),
            }),
            || self.validate(),
        )?;
        state.advance(RunState::Validated, &mut log)?;

        let out_dir = if self.isolate_run {
            self.output_dir().join(&run_id)
        } else {
            self.output_dir()
        };
        let lock = run_step(
            OrchestratorStage::Prepare,
            &token,
            &mut log,
            json!({ "output_dir": out_dir.display().to_string() }),
            || {
                ensure_dir(&out_dir)?;
                RunLock::acquire(&out_dir, &run_id)
            },
        )?;

        state.advance(RunState::Running(self.mode), &mut log)?;
        let ctx = StrategyContext {
            run: &self,
            validated: &validated,
            out_dir: &out_dir,
            token: &token,
        };
        let produced = match self.mode {
            SegmentationMode::TumorAgnostic => ctx.tumor_agnostic(&mut log)?,
            SegmentationMode::BiasCorrected => ctx.bias_corrected(&mut log)?,
            SegmentationMode::TumorEntityWeighted => ctx.tumor_entity_weighted(&mut log)?,
        };

        let cleanup_report = if self.remove_interim_files {
            let report = run_step(
                OrchestratorStage::Cleanup,
                &token,
                &mut log,
                json!({ "dir": out_dir.display().to_string() }),
                || Ok(cleanup::remove_interim_files(&out_dir)),
            )?;
            record_cleanup_failures(&report, &mut log);
            Some(report)
        } else {
            tracing::debug!("Keeping interim files");
            None
        };
        state.advance(RunState::CleanedUp, &mut log)?;

        let compartments = run_step(
            OrchestratorStage::Report,
            &token,
            &mut log,
            json!({ "compartments": produced.len() }),
            || digest_compartments(produced),
        )?;
        lock.release()?;
        state.advance(RunState::Done, &mut log)?;

        tracing::info!(
            run_id = %run_id,
            output_dir = %out_dir.display(),
            compartments = compartments.len(),
            "Segmentation run finished"
        );

        Ok(RunReport {
            run_id,
            mode: self.mode,
            work_dir: self.work_dir,
            output_dir: out_dir,
            started_at_rfc3339: started_at.to_rfc3339(),
            finished_at_rfc3339: Utc::now().to_rfc3339(),
            compartments,
            cleanup: cleanup_report,
            events: log.into_events(),
        })
    }

    /// Every check that must pass before anything is written.
    fn validate(&self) -> SegResult<ValidatedRun> {
        if self.inputs.is_empty() {
            return Err(SegError::Configuration(
                "at least one input volume is required".to_owned(),
            ));
        }
        if self.mode.requires_tumor_label() && self.tumor_label.is_none() {
            return Err(SegError::Configuration(format!(
                "mode `{}` requires a tumor label volume",
                self.mode
            )));
        }
        if self.mode.requires_tumor_label()
            && let Some(shared) = self
                .tumor_classes
                .names()
                .into_iter()
                .find(|name| self.brain_classes.names().contains(name))
        {
            return Err(SegError::Configuration(format!(
                "class `{shared}` is both a brain and a tumor class; its output would be overwritten"
            )));
        }

        let modalities = self
            .inputs
            .iter()
            .map(|path| Modality::load(path))
            .collect::<SegResult<Vec<_>>>()?;
        for (i, modality) in modalities.iter().enumerate() {
            if modalities[..i].iter().any(|m| m.stem == modality.stem) {
                return Err(SegError::Configuration(format!(
                    "inputs share the stem `{}`; derived file names would collide",
                    modality.stem
                )));
            }
        }

        let label = match (&self.tumor_label, self.mode.requires_tumor_label()) {
            (Some(path), true) => Some(LabelVolume::load(path)?),
            (Some(path), false) => {
                tracing::debug!(label = %path.display(), "Tumor label unused in this mode");
                None
            }
            (None, _) => None,
        };

        let reference = &modalities[0];
        if self.verify_spatial {
            let others = modalities[1..]
                .iter()
                .map(|m| (&m.path, &m.volume))
                .chain(label.iter().map(|l| (&l.path, &l.volume)));
            for (path, other) in others {
                reference
                    .volume
                    .same_grid(other)
                    .map_err(|detail| SegError::SpatialMismatch {
                        path: path.clone(),
                        detail,
                    })?;
            }
        }

        Ok(ValidatedRun {
            affine: reference.volume.affine,
            modalities,
            label,
        })
    }
}

#[derive(Debug)]
struct ValidatedRun {
    modalities: Vec<Modality>,
    label: Option<LabelVolume>,
    /// Captured from the first input; every derived volume carries it.
    affine: [f64; 16],
}

impl ValidatedRun {
    fn label(&self) -> SegResult<&LabelVolume> {
        self.label
            .as_ref()
            .ok_or_else(|| SegError::Configuration("tumor label volume not loaded".to_owned()))
    }
}

#[derive(Debug)]
struct StateTracker {
    current: RunState,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self {
            current: RunState::Idle,
        }
    }
}

impl StateTracker {
    fn advance(&mut self, next: RunState, log: &mut EventLog) -> SegResult<()> {
        if !self.current.can_advance_to(next) {
            return Err(SegError::Configuration(format!(
                "illegal run transition {} -> {}",
                self.current.label(),
                next.label()
            )));
        }
        log.push(
            "state",
            "state.enter",
            next.label(),
            json!({ "from": self.current.label(), "to": next.label() }),
        );
        self.current = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

struct StrategyContext<'a> {
    run: &'a PipelineRun,
    validated: &'a ValidatedRun,
    out_dir: &'a Path,
    token: &'a CancellationToken,
}

type Produced = Vec<(String, PathBuf)>;

impl StrategyContext<'_> {
    fn tumor_agnostic(&self, log: &mut EventLog) -> SegResult<Produced> {
        let inputs = self
            .validated
            .modalities
            .iter()
            .map(|m| m.path.clone())
            .collect();
        self.segment_and_rename(
            OrchestratorStage::SegmentBrain,
            inputs,
            segmentation_basename(self.out_dir, ""),
            self.run.brain_classes.names(),
            log,
        )
    }

    fn bias_corrected(&self, log: &mut EventLog) -> SegResult<Produced> {
        let split = self.split(log)?;
        let mut produced = self.segment_brain_part(&split, log)?;
        produced.extend(self.segment_and_rename(
            OrchestratorStage::SegmentTumor,
            split.with_tumor,
            segmentation_basename(self.out_dir, TUMOR_BASENAME),
            &self.run.tumor_classes.names(),
            log,
        )?);
        Ok(produced)
    }

    fn tumor_entity_weighted(&self, log: &mut EventLog) -> SegResult<Produced> {
        let split = self.split(log)?;
        let mut produced = self.segment_brain_part(&split, log)?;
        produced.extend(run_step(
            OrchestratorStage::WeightTumor,
            self.token,
            log,
            json!({ "classes": self.run.tumor_classes.names() }),
            || self.weight_tumor_classes(),
        )?);
        Ok(produced)
    }

    fn split(&self, log: &mut EventLog) -> SegResult<SplitOutputs> {
        let label = self.validated.label()?;
        run_step(
            OrchestratorStage::Split,
            self.token,
            log,
            json!({
                "label": label.path.display().to_string(),
                "codes": self.run.tumor_classes.codes(),
            }),
            || {
                split_tumor_from_brain(
                    &self.validated.modalities,
                    label,
                    &self.run.tumor_classes,
                    &self.validated.affine,
                    self.out_dir,
                )
            },
        )
    }

    fn segment_brain_part(&self, split: &SplitOutputs, log: &mut EventLog) -> SegResult<Produced> {
        self.segment_and_rename(
            OrchestratorStage::SegmentBrain,
            split.without_tumor.clone(),
            segmentation_basename(self.out_dir, BRAIN_BASENAME),
            self.run.brain_classes.names(),
            log,
        )
    }

    fn segment_and_rename(
        &self,
        stage: OrchestratorStage,
        inputs: Vec<PathBuf>,
        basename: PathBuf,
        names: &[String],
        log: &mut EventLog,
    ) -> SegResult<Produced> {
        let request = SegmentRequest::new(inputs, basename, names.len());
        run_step(
            stage,
            self.token,
            log,
            json!({
                "segmenter": self.run.segmenter.name(),
                "channels": request.inputs.len(),
                "classes": names,
            }),
            || {
                let outputs = self.run.segmenter.segment(&request, self.token)?;
                rename_outputs(&outputs, names, self.out_dir)
            },
        )
    }

    /// Cut each configured label from every raw modality and normalize it.
    ///
    /// Each class file is written once; with several modalities the last
    /// modality's normalized cut is the one kept.
    fn weight_tumor_classes(&self) -> SegResult<Produced> {
        let label = self.validated.label()?;
        self.run
            .tumor_classes
            .classes()
            .par_iter()
            .map(|class| {
                let mask = label_to_mask(label, class.code, &[])?;
                let mut kept = None;
                for modality in &self.validated.modalities {
                    let cut = apply_mask(&modality.volume, &mask, false)?;
                    kept = Some(normalize_region(&cut, &class.name)?);
                }
                let normalized = kept.ok_or_else(|| {
                    SegError::Configuration("no input modality to cut".to_owned())
                })?;
                let path = volume_path(self.out_dir, &class.name);
                volume::save(&Volume::new(normalized.data, self.validated.affine), &path)?;
                tracing::info!(
                    class = %class.name,
                    code = class.code,
                    voxels = mask.voxel_count(),
                    path = %path.display(),
                    "Wrote normalized tumor class"
                );
                Ok((class.name.clone(), path))
            })
            .collect()
    }
}

/// Rename output `i` to `<out_dir>/<names[i]>.nii.gz`.
pub fn rename_outputs(outputs: &[PathBuf], names: &[String], out_dir: &Path) -> SegResult<Produced> {
    if outputs.len() != names.len() {
        return Err(SegError::Configuration(format!(
            "{} segmenter outputs cannot be named by {} classes",
            outputs.len(),
            names.len()
        )));
    }
    outputs
        .iter()
        .zip(names)
        .map(|(from, name)| {
            let to = volume_path(out_dir, name);
            fs::rename(from, &to)?;
            tracing::info!(from = %from.display(), to = %to.display(), "Renamed compartment");
            Ok((name.clone(), to))
        })
        .collect()
}

fn record_cleanup_failures(report: &CleanupReport, log: &mut EventLog) {
    for failure in &report.failures {
        log.push(
            OrchestratorStage::Cleanup.label(),
            "cleanup.warning",
            "interim file could not be removed",
            json!({
                "path": failure.path.display().to_string(),
                "error": failure.error,
            }),
        );
    }
}

fn digest_compartments(produced: Produced) -> SegResult<Vec<CompartmentOutput>> {
    produced
        .into_iter()
        .map(|(name, path)| {
            let sha256 = sha256_file(&path)?;
            Ok(CompartmentOutput { name, path, sha256 })
        })
        .collect()
}

pub(crate) fn sha256_file(path: &Path) -> SegResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use ndarray::Array3;
    use tempfile::tempdir;

    use super::*;
    use crate::paths::pve_path;
    use crate::volume::IDENTITY_AFFINE;

    /// Writes `k` constant volumes shaped like the first input.
    struct ConstantSegmenter;

    impl Segmenter for ConstantSegmenter {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn run(&self, request: &SegmentRequest, _token: &CancellationToken) -> SegResult<()> {
            let first = volume::load(&request.inputs[0])?;
            for i in 0..request.classes {
                let pve = first.with_data(Array3::from_elem(first.dims(), i as f64 / 10.0));
                volume::save(&pve, &pve_path(&request.basename, i))?;
            }
            Ok(())
        }
    }

    fn write_inputs(dir: &Path) -> (PathBuf, PathBuf) {
        let mut t1 = Array3::from_elem((4, 4, 2), 100.0);
        let mut label = Array3::zeros((4, 4, 2));
        for (i, code) in [1.0, 2.0, 4.0].into_iter().enumerate() {
            label[[i, 0, 0]] = code;
            t1[[i, 0, 0]] = 10.0 * (i as f64 + 1.0);
            label[[i, 1, 0]] = code;
        }
        let t1_path = dir.join("t1.nii.gz");
        let label_path = dir.join("seg.nii.gz");
        volume::save(&Volume::new(t1, IDENTITY_AFFINE), &t1_path).expect("save t1");
        volume::save(&Volume::new(label, IDENTITY_AFFINE), &label_path).expect("save label");
        (t1_path, label_path)
    }

    fn fake_run(work_dir: &Path, inputs: Vec<PathBuf>) -> PipelineRun {
        let mut run = PipelineRun::new(work_dir, inputs);
        run.set_segmenter(Arc::new(ConstantSegmenter));
        run
    }

    #[test]
    fn stage_labels_are_stable() {
        assert_eq!(OrchestratorStage::SegmentBrain.label(), "segment_brain");
        assert_eq!(OrchestratorStage::WeightTumor.to_string(), "weight_tumor");
    }

    #[test]
    fn strategy_stage_sequences() {
        use OrchestratorStage::*;
        assert_eq!(
            strategy_stages(SegmentationMode::TumorAgnostic),
            &[SegmentBrain]
        );
        assert_eq!(
            strategy_stages(SegmentationMode::BiasCorrected),
            &[Split, SegmentBrain, SegmentTumor]
        );
        assert_eq!(
            strategy_stages(SegmentationMode::TumorEntityWeighted),
            &[Split, SegmentBrain, WeightTumor]
        );
    }

    #[test]
    fn run_state_only_moves_forward() {
        let running = RunState::Running(SegmentationMode::BiasCorrected);
        assert!(RunState::Idle.can_advance_to(RunState::Validated));
        assert!(RunState::Validated.can_advance_to(running));
        assert!(running.can_advance_to(RunState::CleanedUp));
        assert!(RunState::CleanedUp.can_advance_to(RunState::Done));
        assert!(!RunState::Idle.can_advance_to(running));
        assert!(!RunState::Done.can_advance_to(RunState::Idle));
        assert_eq!(running.label(), "bias_corrected");
    }

    #[test]
    fn token_clones_share_the_flag() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.checkpoint().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.checkpoint(), Err(SegError::Cancelled(_))));
    }

    #[test]
    fn expired_deadline_trips_checkpoint() {
        let token = CancellationToken::new().with_deadline_ms(Some(0));
        let err = token.checkpoint().expect_err("deadline is now");
        assert!(err.to_string().contains("deadline"), "{err}");
        let relaxed = token.with_deadline_ms(None);
        assert!(relaxed.checkpoint().is_ok());
    }

    #[test]
    fn huge_deadline_saturates() {
        let token = CancellationToken::new().with_deadline_ms(Some(u64::MAX));
        assert!(token.deadline().is_some());
        assert!(token.checkpoint().is_ok());
    }

    #[test]
    fn event_log_numbers_and_streams_events() {
        let (tx, rx) = mpsc::channel();
        let mut log = EventLog::new("run-1".to_owned(), Some(tx));
        log.push("split", "split.start", "step started", json!({}));
        log.mark_stage_start();
        log.push("split", "split.ok", "step completed", json!({}));

        let seqs: Vec<u64> = log.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, [1, 2]);
        assert!(log.events()[1].payload.get("elapsed_ms").is_some());
        let streamed: Vec<StreamedRunEvent> = rx.try_iter().collect();
        assert_eq!(streamed.len(), 2);
        assert_eq!(streamed[0].run_id, "run-1");
        assert_eq!(streamed[1].event.code, "split.ok");
    }

    #[test]
    fn failure_codes_by_error_class() {
        let cancelled = SegError::Cancelled("x".to_owned());
        let timed_out = SegError::from_command_timeout("fast".to_owned(), 5, String::new());
        let other = SegError::EmptyRegion {
            class: "edema".to_owned(),
        };
        assert_eq!(stage_failure_code("split", &cancelled), "split.cancelled");
        assert_eq!(
            stage_failure_code("segment_brain", &timed_out),
            "segment_brain.timeout"
        );
        assert_eq!(stage_failure_code("weight_tumor", &other), "weight_tumor.error");
    }

    #[test]
    fn checkpoint_failure_is_logged_before_returning() {
        let token = CancellationToken::new();
        token.cancel();
        let mut log = EventLog::new("r".to_owned(), None);
        let err = checkpoint_or_emit(OrchestratorStage::Split, &token, &mut log)
            .expect_err("cancelled");
        assert!(matches!(err, SegError::Cancelled(_)));
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.events()[0].code, "split.cancelled");
        assert_eq!(log.events()[0].payload["checkpoint"], json!(true));
    }

    #[test]
    fn rename_maps_index_to_name() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path().join("wms_Brain");
        let outputs: Vec<PathBuf> = (0..2)
            .map(|i| {
                let p = pve_path(&base, i);
                fs::write(&p, format!("{i}")).expect("write");
                p
            })
            .collect();
        let names = vec!["csf".to_owned(), "gm".to_owned()];
        let produced = rename_outputs(&outputs, &names, dir.path()).expect("rename");

        assert_eq!(produced[1].0, "gm");
        assert_eq!(fs::read_to_string(&produced[1].1).expect("read"), "1");
        assert!(!outputs[0].exists());
        let err = rename_outputs(&outputs[..1], &names, dir.path()).expect_err("count");
        assert!(matches!(err, SegError::Configuration(_)));
    }

    #[test]
    fn missing_label_fails_validation_without_writing() {
        let dir = tempdir().expect("tempdir");
        let (t1, _) = write_inputs(dir.path());
        let run = fake_run(dir.path(), vec![t1]);
        let err = run.run().expect_err("bias_corrected needs a label");
        assert!(matches!(err, SegError::Configuration(_)), "{err:?}");
        assert!(!dir.path().join("structure_segmentation").exists());
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let mut run = fake_run(dir.path(), Vec::new());
        run.set_mode(SegmentationMode::TumorAgnostic);
        assert!(matches!(run.run(), Err(SegError::Configuration(_))));
    }

    #[test]
    fn unknown_mode_name_is_a_configuration_error() {
        let mut run = fake_run(Path::new("/tmp"), Vec::new());
        assert!(run.set_mode_name("tumor_agnostic").is_ok());
        assert_eq!(run.mode(), SegmentationMode::TumorAgnostic);
        assert!(matches!(
            run.set_mode_name("fast_track"),
            Err(SegError::Configuration(_))
        ));
    }

    #[test]
    fn duplicate_stems_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let (t1, _) = write_inputs(dir.path());
        let nested = dir.path().join("other");
        fs::create_dir(&nested).expect("mkdir");
        let twin = nested.join("t1.nii.gz");
        fs::copy(&t1, &twin).expect("copy");

        let mut run = fake_run(dir.path(), vec![t1, twin]);
        run.set_mode(SegmentationMode::TumorAgnostic);
        let err = run.run().expect_err("stems collide");
        assert!(err.to_string().contains("t1"), "{err}");
    }

    #[test]
    fn brain_and_tumor_classes_must_not_share_a_name() {
        let dir = tempdir().expect("tempdir");
        let (t1, label) = write_inputs(dir.path());
        let mut run = fake_run(dir.path(), vec![t1]);
        run.set_tumor_label(Some(label))
            .set_brain_classes(CompartmentSpec::new(["csf", "gm", "edema"]).expect("spec"));
        let err = run.run().expect_err("edema overlaps");
        assert!(matches!(err, SegError::Configuration(_)), "{err:?}");
        assert!(err.to_string().contains("edema"), "{err}");
        assert!(!dir.path().join("structure_segmentation").exists());
    }

    #[test]
    fn misaligned_label_is_a_spatial_mismatch() {
        let dir = tempdir().expect("tempdir");
        let (t1, _) = write_inputs(dir.path());
        let label = dir.path().join("small.nii.gz");
        volume::save(
            &Volume::new(Array3::from_elem((2, 2, 2), 1.0), IDENTITY_AFFINE),
            &label,
        )
        .expect("save");

        let mut run = fake_run(dir.path(), vec![t1]);
        run.set_tumor_label(Some(label));
        let err = run.run().expect_err("grids differ");
        assert!(matches!(err, SegError::SpatialMismatch { .. }), "{err:?}");
        assert!(!dir.path().join("structure_segmentation").exists());
    }

    #[test]
    fn pre_cancelled_run_stops_at_validate() {
        let dir = tempdir().expect("tempdir");
        let (t1, label) = write_inputs(dir.path());
        let mut run = fake_run(dir.path(), vec![t1]);
        run.set_tumor_label(Some(label));
        run.cancellation_token().cancel();
        assert!(matches!(run.run(), Err(SegError::Cancelled(_))));
        assert!(!dir.path().join("structure_segmentation").exists());
    }

    #[test]
    fn bias_corrected_run_reports_every_compartment() {
        let dir = tempdir().expect("tempdir");
        let (t1, label) = write_inputs(dir.path());
        let mut run = fake_run(dir.path(), vec![t1]);
        run.set_tumor_label(Some(label));

        let report = run.run().expect("run");
        let names: Vec<&str> = report.compartments.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "cerebrospinal_fluid",
                "gray_matter",
                "white_matter",
                "edema",
                "active",
                "necrotic"
            ]
        );
        for compartment in &report.compartments {
            assert!(compartment.path.is_file());
            assert_eq!(compartment.sha256.len(), 64);
        }
        assert!(!report.output_dir.join("t1-woTumor.nii.gz").exists());
        assert!(!report.output_dir.join(".oncoseg.lock").exists());

        let codes: Vec<&str> = report.events.iter().map(|e| e.code.as_str()).collect();
        let split = codes.iter().position(|c| *c == "split.ok").expect("split");
        let brain = codes.iter().position(|c| *c == "segment_brain.ok").expect("brain");
        let tumor = codes.iter().position(|c| *c == "segment_tumor.ok").expect("tumor");
        let clean = codes.iter().position(|c| *c == "cleanup.ok").expect("cleanup");
        assert!(split < brain && brain < tumor && tumor < clean);
    }

    #[test]
    fn isolated_runs_write_under_their_run_id() {
        let dir = tempdir().expect("tempdir");
        let (t1, _) = write_inputs(dir.path());
        let mut run = fake_run(dir.path(), vec![t1]);
        run.set_mode(SegmentationMode::TumorAgnostic)
            .set_isolate_run(true);

        let report = run.run().expect("run");
        assert_eq!(
            report.output_dir,
            dir.path().join("structure_segmentation").join(&report.run_id)
        );
        assert!(report.output_dir.join("gray_matter.nii.gz").is_file());
    }

    #[test]
    fn from_config_overrides_defaults() {
        let config = RunConfig {
            work_dir: Some(PathBuf::from("/data/case1")),
            inputs: vec![PathBuf::from("t1.nii.gz")],
            mode: Some(SegmentationMode::TumorAgnostic),
            remove_interim_files: Some(false),
            verify_spatial: Some(false),
            timeout_ms: Some(1_000),
            ..RunConfig::default()
        };
        let run = PipelineRun::from_config(config).expect("config");
        assert_eq!(run.work_dir(), Path::new("/data/case1"));
        assert_eq!(run.mode(), SegmentationMode::TumorAgnostic);
        assert!(!run.remove_interim_files());
        assert!(!run.verify_spatial());
        assert_eq!(run.timeout_ms(), Some(1_000));
        assert_eq!(run.brain_classes(), &CompartmentSpec::default());
        assert_eq!(
            run.output_dir(),
            PathBuf::from("/data/case1/structure_segmentation")
        );
    }

    #[test]
    fn sha256_of_known_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("abc");
        fs::write(&path, b"abc").expect("write");
        assert_eq!(
            sha256_file(&path).expect("hash"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
