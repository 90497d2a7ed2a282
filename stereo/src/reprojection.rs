//! Disparity to 3D reprojection
//!
//! Turns a disparity map and the disparity-to-depth matrix `Q` into one camera
//! space point per pixel. Several numeric back-ends are available; only the
//! reference back-end accounts for a region-of-interest offset.

use crate::{DisparityMap, Error, Result};
use image::GrayImage;
use nalgebra::{Matrix4, Point3, Vector3, Vector4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReprojectionMethod {
    /// Single precision, offset-aware, bit-reproducible.
    #[default]
    Reference,
    /// Double precision homogeneous multiply. Ignores ROI offsets.
    Stock,
    /// Row-parallel variant of `Stock`. Ignores ROI offsets.
    Parallel,
}

impl ReprojectionMethod {
    pub const ALL: [ReprojectionMethod; 3] = [
        ReprojectionMethod::Reference,
        ReprojectionMethod::Stock,
        ReprojectionMethod::Parallel,
    ];

    pub fn is_offset_aware(&self) -> bool {
        matches!(self, ReprojectionMethod::Reference)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReprojectionMethod::Reference => "reference",
            ReprojectionMethod::Stock => "stock",
            ReprojectionMethod::Parallel => "parallel",
        }
    }
}

impl fmt::Display for ReprojectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReprojectionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reference" | "default" => Ok(ReprojectionMethod::Reference),
            "stock" | "cpu" => Ok(ReprojectionMethod::Stock),
            "parallel" => Ok(ReprojectionMethod::Parallel),
            other => Err(Error::NotSupported(format!(
                "unknown reprojection method '{other}'"
            ))),
        }
    }
}

/// One 3D point per disparity pixel, row-major.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointImage {
    pub width: u32,
    pub height: u32,
    pub points: Vec<Vector3<f32>>,
}

impl PointImage {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Vector3<f32>> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.points.get((y * self.width + x) as usize).copied()
    }

    /// Finite points with `0 < z <= max_depth`.
    pub fn to_point_cloud(&self, max_depth: f32) -> Vec<Point3<f32>> {
        self.points
            .iter()
            .filter(|p| is_plausible(p, max_depth))
            .map(|p| Point3::from(*p))
            .collect()
    }

    /// Write the plausible points as an ASCII PLY file, colored by `colors`
    /// when it has the same size as this point image.
    pub fn save_ply<P: AsRef<Path>>(
        &self,
        path: P,
        max_depth: f32,
        colors: Option<&GrayImage>,
    ) -> Result<usize> {
        let colors = colors.filter(|c| c.dimensions() == (self.width, self.height));
        let selected: Vec<(usize, &Vector3<f32>)> = self
            .points
            .iter()
            .enumerate()
            .filter(|(_, p)| is_plausible(p, max_depth))
            .collect();

        let mut file = BufWriter::new(File::create(path.as_ref())?);

        writeln!(file, "ply")?;
        writeln!(file, "format ascii 1.0")?;
        writeln!(file, "element vertex {}", selected.len())?;
        writeln!(file, "property float x")?;
        writeln!(file, "property float y")?;
        writeln!(file, "property float z")?;
        if colors.is_some() {
            writeln!(file, "property uchar red")?;
            writeln!(file, "property uchar green")?;
            writeln!(file, "property uchar blue")?;
        }
        writeln!(file, "end_header")?;

        for (i, p) in &selected {
            match colors {
                Some(img) => {
                    let v = img.as_raw()[*i];
                    writeln!(file, "{} {} {} {} {} {}", p.x, p.y, p.z, v, v, v)?;
                }
                None => writeln!(file, "{} {} {}", p.x, p.y, p.z)?,
            }
        }
        file.flush()?;
        Ok(selected.len())
    }
}

fn is_plausible(p: &Vector3<f32>, max_depth: f32) -> bool {
    p.iter().all(|v| v.is_finite()) && p.z > 0.0 && p.z <= max_depth
}

#[derive(Debug, Clone, Copy)]
struct Matrices {
    q32: Matrix4<f32>,
    q64: Matrix4<f64>,
}

#[derive(Debug, Clone)]
pub struct Reprojection {
    matrices: Option<Matrices>,
    method: ReprojectionMethod,
    parallel_available: bool,
}

impl Default for Reprojection {
    fn default() -> Self {
        Self::new()
    }
}

impl Reprojection {
    pub fn new() -> Self {
        Self {
            matrices: None,
            method: ReprojectionMethod::Reference,
            parallel_available: true,
        }
    }

    /// Store `Q`. The single precision copy used by the reference back-end is
    /// narrowed here, once, not per frame.
    pub fn set_reprojection_matrix(&mut self, q: &Matrix4<f64>) {
        if q.iter().all(|v| v.is_finite()) {
            self.matrices = Some(Matrices {
                q32: q.cast::<f32>(),
                q64: *q,
            });
        } else {
            tracing::warn!("reprojection matrix has non-finite entries; reprojection disabled");
            self.matrices = None;
        }
    }

    pub fn set_reprojection_matrix_f32(&mut self, q: &Matrix4<f32>) {
        if q.iter().all(|v| v.is_finite()) {
            self.matrices = Some(Matrices {
                q32: *q,
                q64: q.cast::<f64>(),
            });
        } else {
            tracing::warn!("reprojection matrix has non-finite entries; reprojection disabled");
            self.matrices = None;
        }
    }

    /// Row-major 4x4 matrix. Anything but 16 values invalidates the matrix.
    pub fn set_reprojection_matrix_from_slice(&mut self, values: &[f64]) -> bool {
        if values.len() != 16 {
            tracing::warn!(len = values.len(), "reprojection matrix must have 16 entries");
            self.matrices = None;
            return false;
        }
        self.set_reprojection_matrix(&Matrix4::from_row_slice(values));
        self.matrices.is_some()
    }

    pub fn clear_reprojection_matrix(&mut self) {
        self.matrices = None;
    }

    pub fn reprojection_matrix(&self) -> Option<&Matrix4<f64>> {
        self.matrices.as_ref().map(|m| &m.q64)
    }

    pub fn has_valid_matrix(&self) -> bool {
        self.matrices.is_some()
    }

    pub fn method(&self) -> ReprojectionMethod {
        self.method
    }

    pub fn is_available(&self, method: ReprojectionMethod) -> bool {
        method != ReprojectionMethod::Parallel || self.parallel_available
    }

    pub fn available_methods(&self) -> Vec<ReprojectionMethod> {
        ReprojectionMethod::ALL
            .into_iter()
            .filter(|m| self.is_available(*m))
            .collect()
    }

    /// Select a back-end. Unavailable back-ends fall back to the reference one;
    /// the method actually in use is returned.
    pub fn set_method(&mut self, method: ReprojectionMethod) -> ReprojectionMethod {
        if self.is_available(method) {
            self.method = method;
        } else {
            tracing::warn!(%method, "reprojection method unavailable, using reference");
            self.method = ReprojectionMethod::Reference;
        }
        self.method
    }

    pub fn set_method_by_name(&mut self, name: &str) -> ReprojectionMethod {
        match name.parse() {
            Ok(method) => self.set_method(method),
            Err(e) => {
                tracing::warn!("{e}, using reference");
                self.set_method(ReprojectionMethod::Reference)
            }
        }
    }

    /// Declare whether a data-parallel device is available.
    pub fn set_parallel_available(&mut self, available: bool) {
        self.parallel_available = available;
        if !available && self.method == ReprojectionMethod::Parallel {
            self.set_method(ReprojectionMethod::Parallel);
        }
    }

    /// Reproject every pixel of `disparity`, whose pixel `(0, 0)` sits at
    /// `(offset_x, offset_y)` in the full calibrated frame.
    ///
    /// Without a valid matrix, or for an empty map, the result is empty.
    /// Zero and invalid disparities are not special-cased.
    pub fn reproject(
        &self,
        disparity: &DisparityMap,
        offset_x: i32,
        offset_y: i32,
    ) -> Result<PointImage> {
        let Some(m) = &self.matrices else {
            tracing::debug!("no reprojection matrix, skipping reprojection");
            return Ok(PointImage::empty());
        };
        if disparity.is_empty() {
            return Ok(PointImage::empty());
        }
        if disparity.data.len() != (disparity.width as usize) * (disparity.height as usize) {
            return Err(Error::dimension_mismatch(format!(
                "disparity map holds {} values for {}x{}",
                disparity.data.len(),
                disparity.width,
                disparity.height
            )));
        }
        if !self.method.is_offset_aware() && (offset_x != 0 || offset_y != 0) {
            return Err(Error::AlgorithmError(format!(
                "{} reprojection cannot apply ROI offset ({offset_x}, {offset_y})",
                self.method
            )));
        }

        let points = match self.method {
            ReprojectionMethod::Reference => {
                reproject_reference(&m.q32, disparity, offset_x, offset_y)
            }
            ReprojectionMethod::Stock => reproject_stock(&m.q64, disparity),
            ReprojectionMethod::Parallel => reproject_parallel(&m.q64, disparity),
        };
        Ok(PointImage {
            width: disparity.width,
            height: disparity.height,
            points,
        })
    }
}

fn reproject_reference(
    q: &Matrix4<f32>,
    disparity: &DisparityMap,
    offset_x: i32,
    offset_y: i32,
) -> Vec<Vector3<f32>> {
    let width = disparity.width as usize;
    let mut out = Vec::with_capacity(disparity.data.len());

    for (y, row) in disparity.data.chunks(width).enumerate() {
        let ty = (y as i32 + offset_y) as f32;
        let qx = q[(0, 1)] * ty + q[(0, 3)];
        let qy = q[(1, 1)] * ty + q[(1, 3)];
        let qz = q[(2, 1)] * ty + q[(2, 3)];
        let qw = q[(3, 1)] * ty + q[(3, 3)];

        for (x, &d) in row.iter().enumerate() {
            let tx = (x as i32 + offset_x) as f32;
            let iw = 1.0 / (q[(3, 0)] * tx + qw + q[(3, 2)] * d);
            out.push(Vector3::new(
                (q[(0, 0)] * tx + qx + q[(0, 2)] * d) * iw,
                (q[(1, 0)] * tx + qy + q[(1, 2)] * d) * iw,
                (q[(2, 0)] * tx + qz + q[(2, 2)] * d) * iw,
            ));
        }
    }
    out
}

fn stock_point(q: &Matrix4<f64>, x: usize, y: usize, d: f32) -> Vector3<f32> {
    let h = q * Vector4::new(x as f64, y as f64, d as f64, 1.0);
    Vector3::new((h[0] / h[3]) as f32, (h[1] / h[3]) as f32, (h[2] / h[3]) as f32)
}

fn reproject_stock(q: &Matrix4<f64>, disparity: &DisparityMap) -> Vec<Vector3<f32>> {
    let width = disparity.width as usize;
    disparity
        .data
        .iter()
        .enumerate()
        .map(|(i, &d)| stock_point(q, i % width, i / width, d))
        .collect()
}

fn reproject_parallel(q: &Matrix4<f64>, disparity: &DisparityMap) -> Vec<Vector3<f32>> {
    let width = disparity.width as usize;
    let mut out = vec![Vector3::zeros(); disparity.data.len()];
    out.par_chunks_mut(width)
        .zip(disparity.data.par_chunks(width))
        .enumerate()
        .for_each(|(y, (dst, row))| {
            for (x, (p, &d)) in dst.iter_mut().zip(row).enumerate() {
                *p = stock_point(q, x, y, d);
            }
        });
    out
}
