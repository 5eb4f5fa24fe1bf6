//! Numeric summaries extracted from the QC pipeline's intermediate files.

use std::fs;
use std::path::Path;

use nalgebra::{Matrix3, Matrix4, Vector3};
use ndarray::{ArrayD, Axis, Zip};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};

use crate::error::BidsError;

/// Standard deviations at or below this produce a tSNR of zero.
const MIN_STDDEV: f64 = 1.0e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FdParams {
    /// Displacements strictly above this (mm) count as excessive.
    pub cutoff: f64,
    /// Radius (mm) of the sphere rotations are projected onto.
    pub radius: f64,
}

impl Default for FdParams {
    fn default() -> Self {
        Self {
            cutoff: 0.2,
            radius: 80.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fwhm {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub combined: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FdSummary {
    pub mean: f64,
    pub count_above: usize,
    pub percent_above: f64,
}

fn read_text(path: &Path) -> Result<String, BidsError> {
    fs::read_to_string(path)
        .map_err(|err| BidsError::Filesystem(format!("read {}: {err}", path.display())))
}

/// `3dFWHMx` prints `x y z combined` on its last line.
pub fn parse_fwhm(path: &Path) -> Result<Fwhm, BidsError> {
    parse_fwhm_text(&read_text(path)?).ok_or_else(|| BidsError::MalformedFwhm(path.to_path_buf()))
}

pub fn parse_fwhm_text(text: &str) -> Option<Fwhm> {
    let line = text.lines().rev().find(|line| !line.trim().is_empty())?;
    let values = line
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    match values.as_slice() {
        [x, y, z, combined] => Some(Fwhm {
            x: *x,
            y: *y,
            z: *z,
            combined: *combined,
        }),
        _ => None,
    }
}

/// Reads a `3dvolreg -1Dmatrix_save` file: one row of 12 values per frame,
/// `#` lines are comments.
pub fn read_affines(path: &Path) -> Result<Vec<[f64; 12]>, BidsError> {
    parse_affines(&read_text(path)?).map_err(|message| BidsError::MalformedMotion {
        path: path.to_path_buf(),
        message,
    })
}

pub fn parse_affines(text: &str) -> Result<Vec<[f64; 12]>, String> {
    let mut rows = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("line {}: {err}", number + 1))?;
        let row: [f64; 12] = values
            .try_into()
            .map_err(|values: Vec<f64>| {
                format!("line {}: expected 12 values, found {}", number + 1, values.len())
            })?;
        rows.push(row);
    }
    Ok(rows)
}

fn rigid_body(row: &[f64; 12]) -> Matrix4<f64> {
    let mut matrix = Matrix4::identity();
    for (index, value) in row.iter().enumerate() {
        matrix[(index / 4, index % 4)] = *value;
    }
    matrix
}

/// Jenkinson framewise displacement, one value per frame.
///
/// The first frame has no predecessor and gets a placeholder of 0 so the
/// output is as long as the input.
pub fn framewise_displacement(rows: &[[f64; 12]], radius: f64) -> Result<Vec<f64>, BidsError> {
    let mut displacements = Vec::with_capacity(rows.len());
    let mut previous: Option<Matrix4<f64>> = None;

    for (frame, row) in rows.iter().enumerate() {
        let current = rigid_body(row);
        match previous {
            None => displacements.push(0.0),
            Some(prev) => {
                let prev_inverse = prev
                    .try_inverse()
                    .ok_or(BidsError::SingularTransform(frame - 1))?;
                let relative = current * prev_inverse - Matrix4::identity();
                let a: Matrix3<f64> = relative.fixed_view::<3, 3>(0, 0).into_owned();
                let b: Vector3<f64> = relative.fixed_view::<3, 1>(0, 3).into_owned();
                let rotation = (radius * radius / 5.0) * (a.transpose() * a).trace();
                displacements.push((rotation + b.dot(&b)).sqrt());
            }
        }
        previous = Some(current);
    }

    Ok(displacements)
}

pub fn write_fd(path: &Path, values: &[f64]) -> Result<(), BidsError> {
    let mut content = String::with_capacity(values.len() * 26);
    for value in values {
        content.push_str(&format!("{value:.18e}\n"));
    }
    fs::write(path, content)
        .map_err(|err| BidsError::Filesystem(format!("write {}: {err}", path.display())))
}

pub fn read_fd(path: &Path) -> Result<Vec<f64>, BidsError> {
    read_text(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<f64>().map_err(|err| BidsError::MalformedMotion {
                path: path.to_path_buf(),
                message: format!("{line}: {err}"),
            })
        })
        .collect()
}

/// Mean displacement and the count/percentage strictly above `cutoff`.
/// The leading placeholder is part of the statistic.
pub fn summarize_fd(values: &[f64], cutoff: f64) -> Option<FdSummary> {
    if values.is_empty() {
        return None;
    }
    let total = values.len() as f64;
    let mean = values.iter().sum::<f64>() / total;
    let count_above = values.iter().filter(|value| **value > cutoff).count();
    Some(FdSummary {
        mean,
        count_above,
        percent_above: count_above as f64 / total * 100.0,
    })
}

/// Per-voxel temporal mean over standard deviation of a 4D series.
pub fn tsnr_map(series: &ArrayD<f64>) -> Result<ArrayD<f64>, BidsError> {
    let series = match series.ndim() {
        4 => series.view(),
        3 => series.view().insert_axis(Axis(3)).into_dyn(),
        other => {
            return Err(BidsError::ShapeMismatch(format!(
                "expected a 3D or 4D series, found {other} dimensions"
            )));
        }
    };
    let time = Axis(3);
    let mean = series
        .mean_axis(time)
        .ok_or_else(|| BidsError::ShapeMismatch("series has no time points".to_string()))?;
    let stddev = series.std_axis(time, 0.0);

    let mut tsnr = ArrayD::<f64>::zeros(mean.raw_dim());
    Zip::from(&mut tsnr)
        .and(&mean)
        .and(&stddev)
        .for_each(|out, &m, &s| {
            if s > MIN_STDDEV {
                *out = m / s;
            }
        });
    Ok(tsnr)
}

/// Median of `values` over voxels where `mask` is positive. NaN and
/// non-positive mask entries are outside the brain.
pub fn masked_median(values: &ArrayD<f64>, mask: &ArrayD<f64>) -> Result<Option<f64>, BidsError> {
    let mask = squeeze_time(mask);
    if values.shape() != mask.shape() {
        return Err(BidsError::ShapeMismatch(format!(
            "values {:?} vs mask {:?}",
            values.shape(),
            mask.shape()
        )));
    }
    let mut selected = values
        .iter()
        .zip(mask.iter())
        .filter(|(_, m)| m.is_finite() && **m > 0.0)
        .map(|(v, _)| *v)
        .collect::<Vec<_>>();
    if selected.is_empty() {
        return Ok(None);
    }
    selected.sort_by(f64::total_cmp);
    let mid = selected.len() / 2;
    let median = if selected.len() % 2 == 0 {
        (selected[mid - 1] + selected[mid]) / 2.0
    } else {
        selected[mid]
    };
    Ok(Some(median))
}

fn squeeze_time(mask: &ArrayD<f64>) -> ArrayD<f64> {
    if mask.ndim() == 4 && mask.shape()[3] == 1 {
        mask.index_axis(Axis(3), 0).to_owned()
    } else {
        mask.clone()
    }
}

pub fn read_nifti(path: &Path) -> Result<ArrayD<f64>, BidsError> {
    let nifti_err = |message: String| BidsError::Nifti {
        path: path.to_path_buf(),
        message,
    };
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|err| nifti_err(err.to_string()))?;
    obj.into_volume()
        .into_ndarray::<f64>()
        .map_err(|err| nifti_err(err.to_string()))
}

/// Median tSNR of `series_path` inside `mask_path`.
pub fn compute_tsnr(series_path: &Path, mask_path: &Path) -> Result<f64, BidsError> {
    let series = read_nifti(series_path)?;
    let mask = read_nifti(mask_path)?;
    let tsnr = tsnr_map(&series)?;
    masked_median(&tsnr, &mask)?.ok_or_else(|| BidsError::EmptyMask(mask_path.to_path_buf()))
}
