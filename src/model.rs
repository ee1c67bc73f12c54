use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SegError, SegResult};
use crate::paths::VOLUME_EXTENSION;

// ---------------------------------------------------------------------------
// Segmentation modes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum SegmentationMode {
    /// Segment the raw modalities as if no tumor were present.
    TumorAgnostic,
    /// Segment brain and tumor regions separately, both by intensity.
    #[default]
    BiasCorrected,
    /// Segment the brain by intensity, cut and normalize each tumor label.
    TumorEntityWeighted,
}

pub const ALL_MODES: [SegmentationMode; 3] = [
    SegmentationMode::TumorAgnostic,
    SegmentationMode::BiasCorrected,
    SegmentationMode::TumorEntityWeighted,
];

impl SegmentationMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TumorAgnostic => "tumor_agnostic",
            Self::BiasCorrected => "bias_corrected",
            Self::TumorEntityWeighted => "tumor_entity_weighted",
        }
    }

    pub const fn requires_tumor_label(self) -> bool {
        !matches!(self, Self::TumorAgnostic)
    }
}

impl fmt::Display for SegmentationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SegmentationMode {
    type Err = SegError;

    fn from_str(raw: &str) -> SegResult<Self> {
        ALL_MODES
            .into_iter()
            .find(|mode| mode.as_str() == raw.trim())
            .ok_or_else(|| {
                let known: Vec<&str> = ALL_MODES.iter().map(|m| m.as_str()).collect();
                SegError::Configuration(format!(
                    "mode `{raw}` is not implemented; known modes: {}",
                    known.join(", ")
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Class specifications
// ---------------------------------------------------------------------------

pub const DEFAULT_BRAIN_CLASSES: [&str; 3] = ["cerebrospinal_fluid", "gray_matter", "white_matter"];
pub const DEFAULT_TUMOR_CLASSES: [(&str, f64); 3] =
    [("edema", 2.0), ("active", 4.0), ("necrotic", 1.0)];

/// Ordered class names; index `i` names external output `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CompartmentSpec(Vec<String>);

impl CompartmentSpec {
    pub fn new<I, S>(names: I) -> SegResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(SegError::Configuration(
                "brain class list must not be empty".to_owned(),
            ));
        }
        validate_class_names(names.iter().map(String::as_str))?;
        Ok(Self(names))
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for CompartmentSpec {
    fn default() -> Self {
        Self(DEFAULT_BRAIN_CLASSES.iter().map(|s| (*s).to_owned()).collect())
    }
}

impl TryFrom<Vec<String>> for CompartmentSpec {
    type Error = SegError;

    fn try_from(names: Vec<String>) -> SegResult<Self> {
        Self::new(names)
    }
}

impl From<CompartmentSpec> for Vec<String> {
    fn from(spec: CompartmentSpec) -> Self {
        spec.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TumorClass {
    pub name: String,
    pub code: f64,
}

/// Tumor class names and their label codes, in configured order.
///
/// Insertion order drives output ordering and is never re-sorted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TumorClass>", into = "Vec<TumorClass>")]
pub struct TumorClassMapping(Vec<TumorClass>);

impl TumorClassMapping {
    pub fn new<I, S>(pairs: I) -> SegResult<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let classes: Vec<TumorClass> = pairs
            .into_iter()
            .map(|(name, code)| TumorClass {
                name: name.into(),
                code,
            })
            .collect();
        if classes.is_empty() {
            return Err(SegError::Configuration(
                "tumor class mapping must not be empty".to_owned(),
            ));
        }
        validate_class_names(classes.iter().map(|c| c.name.as_str()))?;
        for (i, class) in classes.iter().enumerate() {
            if class.code == 0.0 {
                return Err(SegError::Configuration(format!(
                    "tumor class `{}` uses the background code 0",
                    class.name
                )));
            }
            if classes[..i].iter().any(|prior| prior.code == class.code) {
                return Err(SegError::Configuration(format!(
                    "tumor code {} is mapped more than once",
                    class.code
                )));
            }
        }
        Ok(Self(classes))
    }

    pub fn classes(&self) -> &[TumorClass] {
        &self.0
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|c| c.name.clone()).collect()
    }

    pub fn codes(&self) -> Vec<f64> {
        self.0.iter().map(|c| c.code).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for TumorClassMapping {
    fn default() -> Self {
        Self(
            DEFAULT_TUMOR_CLASSES
                .iter()
                .map(|(name, code)| TumorClass {
                    name: (*name).to_owned(),
                    code: *code,
                })
                .collect(),
        )
    }
}

impl TryFrom<Vec<TumorClass>> for TumorClassMapping {
    type Error = SegError;

    fn try_from(classes: Vec<TumorClass>) -> SegResult<Self> {
        Self::new(classes.into_iter().map(|c| (c.name, c.code)))
    }
}

impl From<TumorClassMapping> for Vec<TumorClass> {
    fn from(mapping: TumorClassMapping) -> Self {
        mapping.0
    }
}

/// Parse a `NAME=CODE` command-line pair.
pub fn parse_tumor_class(raw: &str) -> Result<(String, f64), String> {
    let (name, code) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=CODE, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty class name in `{raw}`"));
    }
    let code: f64 = code
        .trim()
        .parse()
        .map_err(|e| format!("invalid code in `{raw}`: {e}"))?;
    Ok((name.to_owned(), code))
}

fn validate_class_names<'a>(names: impl Iterator<Item = &'a str>) -> SegResult<()> {
    let mut seen: Vec<&str> = Vec::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(SegError::Configuration("class name must not be empty".to_owned()));
        }
        if name.contains(['/', '\\']) {
            return Err(SegError::Configuration(format!(
                "class name `{name}` must not contain a path separator"
            )));
        }
        if seen.contains(&name) {
            return Err(SegError::Configuration(format!(
                "class name `{name}` is listed more than once"
            )));
        }
        if crate::cleanup::is_interim_name(&format!("{name}.{VOLUME_EXTENSION}")) {
            return Err(SegError::Configuration(format!(
                "class name `{name}` ends like an interim file and would be removed by cleanup"
            )));
        }
        seen.push(name);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run configuration file
// ---------------------------------------------------------------------------

/// On-disk run configuration; every field is optional and falls back to the
/// built-in default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub work_dir: Option<PathBuf>,
    pub inputs: Vec<PathBuf>,
    pub tumor_label: Option<PathBuf>,
    pub mode: Option<SegmentationMode>,
    pub brain_classes: Option<CompartmentSpec>,
    pub tumor_classes: Option<TumorClassMapping>,
    pub remove_interim_files: Option<bool>,
    pub isolate_run: Option<bool>,
    pub verify_spatial: Option<bool>,
    pub segmenter_timeout_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl RunConfig {
    pub fn from_json_file(path: &std::path::Path) -> SegResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub ts_rfc3339: String,
    pub stage: String,
    pub code: String,
    pub message: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamedRunEvent {
    pub run_id: String,
    pub event: RunEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompartmentOutput {
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<CleanupFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: SegmentationMode,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
    pub started_at_rfc3339: String,
    pub finished_at_rfc3339: String,
    pub compartments: Vec<CompartmentOutput>,
    pub cleanup: Option<CleanupReport>,
    pub events: Vec<RunEvent>,
}
