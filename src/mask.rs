//! Mask algebra over label volumes.
//!
//! Labels may be stored as floating point, so code comparisons use the same
//! closeness rule as `numpy.isclose` with default tolerances.

use std::path::{Path, PathBuf};

use ndarray::Zip;

use crate::error::{SegError, SegResult};
use crate::volume::{self, Volume};

const LABEL_RTOL: f64 = 1e-5;
const LABEL_ATOL: f64 = 1e-8;

#[must_use]
pub fn label_matches(value: f64, code: f64) -> bool {
    (value - code).abs() <= LABEL_ATOL + LABEL_RTOL * code.abs()
}

/// Integer-coded volume, `0` meaning background.
#[derive(Debug, Clone)]
pub struct LabelVolume {
    pub volume: Volume,
    pub path: PathBuf,
}

impl LabelVolume {
    pub fn load(path: &Path) -> SegResult<Self> {
        Ok(Self {
            volume: volume::load(path)?,
            path: path.to_path_buf(),
        })
    }

    pub fn from_volume(volume: Volume, path: impl Into<PathBuf>) -> Self {
        Self {
            volume,
            path: path.into(),
        }
    }

    /// Distinct codes present in the volume, ascending.
    pub fn codes(&self) -> Vec<f64> {
        let mut values: Vec<f64> = self.volume.data.iter().copied().collect();
        values.sort_by(f64::total_cmp);
        values.dedup_by(|a, b| label_matches(*a, *b));
        values
    }

    pub fn contains_code(&self, code: f64) -> bool {
        self.volume.data.iter().any(|&v| label_matches(v, code))
    }
}

/// Binary volume holding only `0.0` and `1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask(Volume);

impl Mask {
    pub fn as_volume(&self) -> &Volume {
        &self.0
    }

    pub fn into_volume(self) -> Volume {
        self.0
    }

    pub fn voxel_count(&self) -> usize {
        self.0.data.iter().filter(|&&v| v > 0.5).count()
    }

    /// Elementwise OR.
    pub fn union(&self, other: &Mask) -> SegResult<Mask> {
        ensure_same_shape(&self.0, &other.0)?;
        let data = Zip::from(&self.0.data)
            .and(&other.0.data)
            .map_collect(|&a, &b| if a > 0.5 || b > 0.5 { 1.0 } else { 0.0 });
        Ok(Mask(self.0.with_data(data)))
    }
}

/// Mask equal to 1 where the label equals `target` or any code in `extra`.
///
/// `target` must be present in the label volume; absent `extra` codes are
/// ignored.
pub fn label_to_mask(label: &LabelVolume, target: f64, extra: &[f64]) -> SegResult<Mask> {
    if !label.contains_code(target) {
        return Err(SegError::LabelNotFound {
            code: target,
            path: label.path.clone(),
        });
    }

    let data = label.volume.data.mapv(|v| {
        let hit = label_matches(v, target) || extra.iter().any(|&code| label_matches(v, code));
        if hit { 1.0 } else { 0.0 }
    });
    Ok(Mask(label.volume.with_data(data)))
}

/// `volume * mask`, or `volume * (1 - mask)` when `inverse` is set.
///
/// The result keeps the grid of `volume`.
pub fn apply_mask(volume: &Volume, mask: &Mask, inverse: bool) -> SegResult<Volume> {
    ensure_same_shape(volume, &mask.0)?;
    let data = Zip::from(&volume.data)
        .and(&mask.0.data)
        .map_collect(|&v, &m| if inverse { v * (1.0 - m) } else { v * m });
    Ok(volume.with_data(data))
}

fn ensure_same_shape(expected: &Volume, found: &Volume) -> SegResult<()> {
    if expected.dims() != found.dims() {
        return Err(SegError::ShapeMismatch {
            expected: expected.dims(),
            found: found.dims(),
        });
    }
    Ok(())
}
