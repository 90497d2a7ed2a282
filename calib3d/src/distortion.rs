//! Distortion correction for point sets and remap tables.

use crate::{CalibError, Result};
use cv_core::Distortion;
use nalgebra::{Matrix3, Point2, Vector3};
use rayon::prelude::*;

fn checked_inverse(m: &Matrix3<f64>, what: &str) -> Result<Matrix3<f64>> {
    m.try_inverse()
        .filter(|inv| inv.iter().all(|v| v.is_finite()))
        .ok_or_else(|| CalibError::CalibrationError(format!("{what} is not invertible")))
}

/// Undistort pixel coordinates.
///
/// Points are normalized with `camera`, undistorted, optionally rotated by
/// `rectification` and finally projected with `new_camera`. Without a new
/// camera matrix the result stays in normalized coordinates.
pub fn undistort_points(
    distorted_points: &[Point2<f64>],
    camera: &Matrix3<f64>,
    distortion: &Distortion,
    rectification: Option<&Matrix3<f64>>,
    new_camera: Option<&Matrix3<f64>>,
) -> Result<Vec<Point2<f64>>> {
    let k_inv = checked_inverse(camera, "camera matrix")?;
    let r = rectification.copied().unwrap_or_else(Matrix3::identity);

    let mut out = Vec::with_capacity(distorted_points.len());
    for p in distorted_points {
        let n = k_inv * Vector3::new(p.x, p.y, 1.0);
        let (xu, yu) = distortion.remove(n[0] / n[2], n[1] / n[2]);
        let rotated = r * Vector3::new(xu, yu, 1.0);
        let (x, y) = (rotated[0] / rotated[2], rotated[1] / rotated[2]);
        out.push(match new_camera {
            Some(p) => Point2::new(
                p[(0, 0)] * x + p[(0, 1)] * y + p[(0, 2)],
                p[(1, 1)] * y + p[(1, 2)],
            ),
            None => Point2::new(x, y),
        });
    }
    Ok(out)
}

/// Bake the per-pixel lookup tables that undistort and rectify one camera.
///
/// For every destination pixel the tables hold the source pixel to sample, so
/// applying them later is a pure table lookup.
pub fn init_undistort_rectify_map(
    image_size: (u32, u32),
    camera: &Matrix3<f64>,
    distortion: &Distortion,
    rectification: &Matrix3<f64>,
    new_camera: &Matrix3<f64>,
) -> Result<(Vec<f32>, Vec<f32>)> {
    if image_size.0 == 0 || image_size.1 == 0 {
        return Err(CalibError::InvalidParameters(
            "init_undistort_rectify_map requires non-zero image size".to_string(),
        ));
    }
    let (width, height) = image_size;
    let mut map_x = vec![0.0f32; (width * height) as usize];
    let mut map_y = vec![0.0f32; (width * height) as usize];

    let ir = checked_inverse(&(new_camera * rectification), "rectified projection")?;
    let (fx, fy, cx, cy, skew) = (
        camera[(0, 0)],
        camera[(1, 1)],
        camera[(0, 2)],
        camera[(1, 2)],
        camera[(0, 1)],
    );

    map_x
        .par_chunks_mut(width as usize)
        .zip(map_y.par_chunks_mut(width as usize))
        .enumerate()
        .for_each(|(y, (row_x, row_y))| {
            for x in 0..width as usize {
                let original = ir * Vector3::new(x as f64, y as f64, 1.0);
                if original[2].abs() <= 1e-12 {
                    row_x[x] = f32::NAN;
                    row_y[x] = f32::NAN;
                    continue;
                }
                let xn = original[0] / original[2];
                let yn = original[1] / original[2];
                let (xd, yd) = distortion.apply(xn, yn);

                row_x[x] = (fx * xd + skew * yd + cx) as f32;
                row_y[x] = (fy * yd + cy) as f32;
            }
        });

    Ok((map_x, map_y))
}
