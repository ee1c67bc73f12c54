//! Tumor/brain partition of every input modality.

use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::error::{SegError, SegResult};
use crate::mask::{LabelVolume, Mask, apply_mask, label_to_mask};
use crate::model::TumorClassMapping;
use crate::paths::{modality_stem, with_tumor_path, without_tumor_path};
use crate::volume::{self, Volume};

/// One loaded input channel and the stem its derived files are named after.
#[derive(Debug, Clone)]
pub struct Modality {
    pub path: PathBuf,
    pub stem: String,
    pub volume: Volume,
}

impl Modality {
    pub fn load(path: &Path) -> SegResult<Self> {
        Ok(Self {
            stem: modality_stem(path)?,
            volume: volume::load(path)?,
            path: path.to_path_buf(),
        })
    }
}

/// Interim files written by [`split_tumor_from_brain`], in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitOutputs {
    pub without_tumor: Vec<PathBuf>,
    pub with_tumor: Vec<PathBuf>,
}

/// Mask of every configured tumor code combined.
///
/// The first configured code must be present in the label volume.
pub fn tumor_union_mask(label: &LabelVolume, mapping: &TumorClassMapping) -> SegResult<Mask> {
    let codes = mapping.codes();
    let (target, extra) = codes.split_first().ok_or_else(|| {
        SegError::Configuration("tumor class mapping must not be empty".to_owned())
    })?;
    label_to_mask(label, *target, extra)
}

/// Write `<stem>-woTumor` and `<stem>-withTumor` for each modality into `out_dir`.
///
/// Derived volumes carry `affine` rather than their source's transform.
pub fn split_tumor_from_brain(
    modalities: &[Modality],
    label: &LabelVolume,
    mapping: &TumorClassMapping,
    affine: &[f64; 16],
    out_dir: &Path,
) -> SegResult<SplitOutputs> {
    let union = tumor_union_mask(label, mapping)?;
    tracing::debug!(
        tumor_voxels = union.voxel_count(),
        modalities = modalities.len(),
        "Built tumor union mask"
    );

    let pairs = modalities
        .par_iter()
        .map(|modality| {
            let without = without_tumor_path(out_dir, &modality.stem);
            let with = with_tumor_path(out_dir, &modality.stem);

            let brain = apply_mask(&modality.volume, &union, true)?;
            volume::save(&Volume::new(brain.data, *affine), &without)?;
            let tumor = apply_mask(&modality.volume, &union, false)?;
            volume::save(&Volume::new(tumor.data, *affine), &with)?;

            tracing::debug!(
                modality = %modality.stem,
                without = %without.display(),
                with = %with.display(),
                "Split modality"
            );
            Ok((without, with))
        })
        .collect::<SegResult<Vec<_>>>()?;

    let (without_tumor, with_tumor) = pairs.into_iter().unzip();
    Ok(SplitOutputs {
        without_tumor,
        with_tumor,
    })
}
