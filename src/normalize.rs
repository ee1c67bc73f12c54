//! Intensity normalization of a cut region.
//!
//! Background (exact zero) maps to `0`, the region's intensities are rescaled
//! into `[1, 2]` with the smallest positive voxel landing on `1`.

use crate::error::{SegError, SegResult};
use crate::volume::Volume;

const BACKGROUND_SENTINEL: f64 = -1.0;

/// Rescale a cut volume whose out-of-region voxels are exactly `0`.
///
/// `class` only names the region in the error when nothing in it is positive.
pub fn normalize_region(volume: &Volume, class: &str) -> SegResult<Volume> {
    let mut data = volume
        .data
        .mapv(|v| if v == 0.0 { BACKGROUND_SENTINEL } else { v });

    let fg_min = data
        .iter()
        .copied()
        .filter(|&v| v > 0.0)
        .fold(f64::INFINITY, f64::min);
    if !fg_min.is_finite() {
        return Err(SegError::EmptyRegion {
            class: class.to_owned(),
        });
    }
    let v_max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let span = v_max - fg_min;
    if span <= 0.0 {
        // Constant region: every region voxel is the maximum.
        data.mapv_inplace(|v| if v > 0.0 { 2.0 } else { 0.0 });
        return Ok(volume.with_data(data));
    }
    data.mapv_inplace(|v| {
        let scaled = (v - fg_min) / span;
        if scaled < 0.0 { BACKGROUND_SENTINEL } else { scaled }
    });
    data.mapv_inplace(|v| v + 1.0);

    Ok(volume.with_data(data))
}
