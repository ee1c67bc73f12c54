#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ndarray::Array3;
use oncoseg::orchestrator::CancellationToken;
use oncoseg::paths::pve_path;
use oncoseg::segmenter::{SegmentRequest, Segmenter};
use oncoseg::volume::{self, IDENTITY_AFFINE, Volume};
use oncoseg::{SegError, SegResult};

pub const SHAPE: (usize, usize, usize) = (8, 6, 4);

/// Label codes laid out as three slabs along x: necrotic core, edema, active rim.
pub fn label_data() -> Array3<f64> {
    Array3::from_shape_fn(SHAPE, |(x, y, _)| match (x, y) {
        (0, 0..=1) => 1.0,
        (1, 0..=1) => 2.0,
        (2, 0..=1) => 4.0,
        _ => 0.0,
    })
}

/// Brain intensities rising with y so a 3-class fit has three distinct bands.
pub fn modality_data(scale: f64) -> Array3<f64> {
    Array3::from_shape_fn(SHAPE, |(x, y, z)| {
        scale * (10.0 * (y as f64 + 1.0) + x as f64 + 0.5 * z as f64)
    })
}

/// Write `name.nii.gz` into `dir` and return its path.
pub fn write_volume(dir: &Path, name: &str, data: Array3<f64>, affine: [f64; 16]) -> PathBuf {
    let path = dir.join(format!("{name}.nii.gz"));
    volume::save(&Volume::new(data, affine), &path).expect("save fixture volume");
    path
}

/// Inputs for one case under `dir/inputs`.
pub struct Case {
    pub work_dir: PathBuf,
    pub modalities: Vec<PathBuf>,
    pub label: PathBuf,
}

pub fn write_case(dir: &Path, modalities: &[(&str, f64)]) -> Case {
    let inputs = dir.join("inputs");
    fs::create_dir_all(&inputs).expect("inputs dir");
    let modalities = modalities
        .iter()
        .map(|(name, scale)| write_volume(&inputs, name, modality_data(*scale), IDENTITY_AFFINE))
        .collect();
    let label = write_volume(&inputs, "tumor_seg", label_data(), IDENTITY_AFFINE);
    Case {
        work_dir: dir.to_path_buf(),
        modalities,
        label,
    }
}

/// Sorted file names directly inside `dir`.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read dir")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn sorted(names: &[&str]) -> Vec<String> {
    let mut owned: Vec<String> = names.iter().map(|s| (*s).to_owned()).collect();
    owned.sort();
    owned
}

/// Hard partition of the first channel into `k` equal-width intensity bands.
///
/// `pve_i` is 1 where the voxel falls in band `i`, so index order follows
/// ascending intensity. Zero voxels belong to no band.
#[derive(Default)]
pub struct BandSegmenter {
    pub calls: Mutex<Vec<SegmentRequest>>,
}

impl BandSegmenter {
    pub fn requests(&self) -> Vec<SegmentRequest> {
        self.calls.lock().expect("calls").clone()
    }
}

impl Segmenter for BandSegmenter {
    fn name(&self) -> &'static str {
        "band"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn run(&self, request: &SegmentRequest, _token: &CancellationToken) -> SegResult<()> {
        self.calls.lock().expect("calls").push(request.clone());
        let first = volume::load(&request.inputs[0])?;
        let positive = first.data.iter().copied().filter(|v| *v > 0.0);
        let lo = positive.clone().fold(f64::INFINITY, f64::min);
        let hi = positive.fold(f64::NEG_INFINITY, f64::max);
        let k = request.classes;
        let band = |v: f64| -> Option<usize> {
            if v <= 0.0 {
                return None;
            }
            if hi <= lo {
                return Some(0);
            }
            let scaled = ((v - lo) / (hi - lo) * k as f64).floor() as usize;
            Some(scaled.min(k - 1))
        };
        for i in 0..k {
            let data = first
                .data
                .mapv(|v| if band(v) == Some(i) { 1.0 } else { 0.0 });
            volume::save(&first.with_data(data), &pve_path(&request.basename, i))?;
        }
        Ok(())
    }
}

/// Exits like a crashed external tool.
pub struct FailingSegmenter;

impl Segmenter for FailingSegmenter {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn run(&self, _request: &SegmentRequest, _token: &CancellationToken) -> SegResult<()> {
        Err(SegError::from_command_failure(
            "fast -v".to_owned(),
            2,
            "Image Exception : #22 :: Failed to read volume".to_owned(),
        ))
    }
}

/// Succeeds but writes one output fewer than requested.
pub struct ShortSegmenter;

impl Segmenter for ShortSegmenter {
    fn name(&self) -> &'static str {
        "short"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn run(&self, request: &SegmentRequest, _token: &CancellationToken) -> SegResult<()> {
        let first = volume::load(&request.inputs[0])?;
        for i in 0..request.classes.saturating_sub(1) {
            volume::save(&first, &pve_path(&request.basename, i))?;
        }
        Ok(())
    }
}

/// Delegates to [`BandSegmenter`], then cancels the token it was handed.
#[derive(Default)]
pub struct CancellingSegmenter {
    pub inner: BandSegmenter,
}

impl Segmenter for CancellingSegmenter {
    fn name(&self) -> &'static str {
        "cancelling"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn run(&self, request: &SegmentRequest, token: &CancellationToken) -> SegResult<()> {
        self.inner.run(request, token)?;
        token.cancel();
        Ok(())
    }
}

/// Delegates to [`BandSegmenter`] and leaves a directory named like the
/// tool's `_seg` side output, which cleanup cannot remove as a file.
#[derive(Default)]
pub struct LitteringSegmenter {
    pub inner: BandSegmenter,
}

impl Segmenter for LitteringSegmenter {
    fn name(&self) -> &'static str {
        "littering"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn run(&self, request: &SegmentRequest, token: &CancellationToken) -> SegResult<()> {
        self.inner.run(request, token)?;
        let side = PathBuf::from(format!("{}_seg.nii.gz", request.basename.display()));
        fs::create_dir_all(&side)?;
        Ok(())
    }
}
