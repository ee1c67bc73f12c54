//! Pure path helpers for the output layout.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{SegError, SegResult};

/// Fixed subdirectory of the work directory receiving all outputs.
pub const OUTPUT_SUBDIR: &str = "structure_segmentation";
pub const VOLUME_EXTENSION: &str = "nii.gz";

pub const WITHOUT_TUMOR_SUFFIX: &str = "-woTumor";
pub const WITH_TUMOR_SUFFIX: &str = "-withTumor";

/// Basename prefix of the brain-part segmentation.
pub const BRAIN_BASENAME: &str = "wms_Brain";
/// Basename prefix of the intensity-only tumor segmentation.
pub const TUMOR_BASENAME: &str = "tumor_class";

pub fn output_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(OUTPUT_SUBDIR)
}

pub fn ensure_dir(dir: &Path) -> SegResult<&Path> {
    fs::create_dir_all(dir)?;
    Ok(dir)
}

pub fn default_work_dir() -> SegResult<PathBuf> {
    Ok(std::env::current_dir()?)
}

/// File name with up to two extensions removed: `t1.nii.gz` -> `t1`.
pub fn modality_stem(path: &Path) -> SegResult<String> {
    let first = path.file_stem().map(Path::new).ok_or_else(|| {
        SegError::Configuration(format!("input `{}` has no file name", path.display()))
    })?;
    let stem = first.file_stem().unwrap_or(first.as_os_str());
    Ok(stem.to_string_lossy().into_owned())
}

/// `<dir>/<name>.nii.gz`
pub fn volume_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{VOLUME_EXTENSION}"))
}

pub fn without_tumor_path(dir: &Path, stem: &str) -> PathBuf {
    volume_path(dir, &format!("{stem}{WITHOUT_TUMOR_SUFFIX}"))
}

pub fn with_tumor_path(dir: &Path, stem: &str) -> PathBuf {
    volume_path(dir, &format!("{stem}{WITH_TUMOR_SUFFIX}"))
}

/// Prefix handed to the segmenter. An empty `prefix` yields `<dir>/`.
pub fn segmentation_basename(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(prefix)
}

/// `{basename}_pve_{index}.nii.gz`, the partial-volume output naming.
pub fn pve_path(basename: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!(
        "{}_pve_{index}.{VOLUME_EXTENSION}",
        basename.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stem_strips_double_extension() {
        assert_eq!(modality_stem(Path::new("/data/t1.nii.gz")).unwrap(), "t1");
        assert_eq!(modality_stem(Path::new("flair.nii")).unwrap(), "flair");
        assert_eq!(modality_stem(Path::new("sub-01_T2w")).unwrap(), "sub-01_T2w");
    }

    #[test]
    fn stem_of_empty_path_is_rejected() {
        assert!(modality_stem(Path::new("")).is_err());
        assert!(modality_stem(Path::new("/")).is_err());
    }

    #[test]
    fn interim_names_carry_region_suffixes() {
        let dir = Path::new("/w/structure_segmentation");
        assert_eq!(
            without_tumor_path(dir, "t1"),
            PathBuf::from("/w/structure_segmentation/t1-woTumor.nii.gz")
        );
        assert_eq!(
            with_tumor_path(dir, "t1"),
            PathBuf::from("/w/structure_segmentation/t1-withTumor.nii.gz")
        );
    }

    #[test]
    fn pve_paths_follow_basename() {
        let dir = Path::new("/w/out");
        let brain = segmentation_basename(dir, BRAIN_BASENAME);
        assert_eq!(
            pve_path(&brain, 2),
            PathBuf::from("/w/out/wms_Brain_pve_2.nii.gz")
        );
        let bare = segmentation_basename(dir, "");
        assert_eq!(pve_path(&bare, 0), PathBuf::from("/w/out/_pve_0.nii.gz"));
    }

    #[test]
    fn output_dir_is_a_fixed_subpath() {
        assert_eq!(
            output_dir(Path::new("/work")),
            PathBuf::from("/work/structure_segmentation")
        );
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("a/b");
        ensure_dir(&nested).expect("create");
        ensure_dir(&nested).expect("exists already");
        assert!(nested.is_dir());
    }
}
