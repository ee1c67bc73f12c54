//! Volume type and NIfTI load/save.
//!
//! A [`Volume`] is a 3D scalar grid with its voxel-to-world affine. Files are
//! read with the `nifti` crate (`.nii` and `.nii.gz`, gzip auto-detected) and
//! written as single-file NIfTI-1 float32 images.

use std::io::{Cursor, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array3, Ix3};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{SegError, SegResult};

/// Affine entries may differ by this much and still count as the same grid.
const AFFINE_TOLERANCE: f64 = 1e-4;

const NIFTI1_HEADER_BYTES: usize = 348;
const NIFTI1_VOX_OFFSET: usize = 352;

pub const IDENTITY_AFFINE: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Array3<f64>,
    /// Row-major 4x4 voxel-to-world transform.
    pub affine: [f64; 16],
    pub voxel_size: (f64, f64, f64),
}

impl Volume {
    pub fn new(data: Array3<f64>, affine: [f64; 16]) -> Self {
        let voxel_size = voxel_size_from_affine(&affine);
        Self {
            data,
            affine,
            voxel_size,
        }
    }

    /// Same-grid volume carrying new data.
    pub fn with_data(&self, data: Array3<f64>) -> Self {
        Self {
            data,
            affine: self.affine,
            voxel_size: self.voxel_size,
        }
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Exact shape match and affine match within tolerance.
    pub fn same_grid(&self, other: &Volume) -> Result<(), String> {
        if self.dims() != other.dims() {
            return Err(format!(
                "shape {:?} differs from reference {:?}",
                other.dims(),
                self.dims()
            ));
        }
        let drift = self
            .affine
            .iter()
            .zip(other.affine.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);
        if drift > AFFINE_TOLERANCE {
            return Err(format!("affine differs from reference by up to {drift:.6}"));
        }
        Ok(())
    }
}

fn voxel_size_from_affine(affine: &[f64; 16]) -> (f64, f64, f64) {
    let column = |c: usize| {
        (affine[c] * affine[c] + affine[4 + c] * affine[4 + c] + affine[8 + c] * affine[8 + c])
            .sqrt()
    };
    (column(0), column(1), column(2))
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Read a volume from a `.nii` or `.nii.gz` file.
pub fn load(path: &Path) -> SegResult<Volume> {
    let bytes = std::fs::read(path)?;
    decode(&bytes).map_err(|detail| SegError::Nifti(format!("{}: {detail}", path.display())))
}

fn decode(bytes: &[u8]) -> Result<Volume, String> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes)))
            .map_err(|e| format!("failed to read gzipped NIfTI: {e}"))?
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| format!("failed to read NIfTI: {e}"))?
    };

    let header = obj.header();
    if header.dim[0] < 3 {
        return Err(format!("expected a 3D volume, got {}D", header.dim[0]));
    }
    let affine = header_affine(header);
    let voxel_size = (
        f64::from(header.pixdim[1]),
        f64::from(header.pixdim[2]),
        f64::from(header.pixdim[3]),
    );

    let array = obj
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|e| format!("failed to convert to ndarray: {e}"))?;

    // 4D inputs keep their first frame.
    let data = match array.ndim() {
        3 => array
            .into_dimensionality::<Ix3>()
            .map_err(|e| e.to_string())?,
        n if n > 3 => {
            let shape = array.shape();
            let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
            Array3::from_shape_fn((nx, ny, nz), |(i, j, k)| {
                let mut index = vec![0usize; n];
                index[0] = i;
                index[1] = j;
                index[2] = k;
                array[index.as_slice()]
            })
        }
        n => return Err(format!("expected at least 3D array, got {n}D")),
    };

    Ok(Volume {
        data,
        affine,
        voxel_size,
    })
}

/// Prefer sform when present, else scale the identity by the voxel size.
fn header_affine(header: &NiftiHeader) -> [f64; 16] {
    if header.sform_code > 0 {
        let (x, y, z) = (&header.srow_x, &header.srow_y, &header.srow_z);
        [
            f64::from(x[0]), f64::from(x[1]), f64::from(x[2]), f64::from(x[3]),
            f64::from(y[0]), f64::from(y[1]), f64::from(y[2]), f64::from(y[3]),
            f64::from(z[0]), f64::from(z[1]), f64::from(z[2]), f64::from(z[3]),
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        let mut affine = IDENTITY_AFFINE;
        affine[0] = f64::from(header.pixdim[1]);
        affine[5] = f64::from(header.pixdim[2]);
        affine[10] = f64::from(header.pixdim[3]);
        affine
    }
}

/// Write a volume; the file is gzip-compressed when the name ends in `.nii.gz`.
pub fn save(volume: &Volume, path: &Path) -> SegResult<()> {
    let raw = encode(volume)?;
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        encoder.finish()?
    } else {
        raw
    };
    std::fs::write(path, bytes)?;
    Ok(())
}

fn encode(volume: &Volume) -> SegResult<Vec<u8>> {
    let (nx, ny, nz) = volume.dims();
    let dim_i16 = |n: usize| {
        i16::try_from(n).map_err(|_| SegError::Nifti(format!("dimension {n} exceeds NIfTI-1 limit")))
    };
    let (vsx, vsy, vsz) = volume.voxel_size;

    let mut header = [0u8; NIFTI1_HEADER_BYTES];
    header[0..4].copy_from_slice(&(NIFTI1_HEADER_BYTES as i32).to_le_bytes());

    let dim: [i16; 8] = [3, dim_i16(nx)?, dim_i16(ny)?, dim_i16(nz)?, 1, 1, 1, 1];
    for (i, d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype FLOAT32, bitpix 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    header[108..112].copy_from_slice(&(NIFTI1_VOX_OFFSET as f32).to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat), srow_x/y/z
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + (row * 4 + col) * 4;
            header[offset..offset + 4]
                .copy_from_slice(&(volume.affine[row * 4 + col] as f32).to_le_bytes());
        }
    }
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(NIFTI1_VOX_OFFSET + nx * ny * nz * 4);
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&[0u8; 4]);

    // NIfTI stores x fastest.
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                buffer.extend_from_slice(&(volume.data[[i, j, k]] as f32).to_le_bytes());
            }
        }
    }
    Ok(buffer)
}
