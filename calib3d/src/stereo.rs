//! Bouguet stereo rectification.
//!
//! Splits the relative rotation between both cameras in half, then rotates both
//! views so the baseline becomes parallel to the image rows (or columns for a
//! vertical rig). The result is a pair of rectifying rotations, the new
//! projection matrices, the disparity-to-depth matrix `Q` and the valid-pixel
//! rectangles of both rectified views.

use crate::distortion::undistort_points;
use crate::{CalibError, Result};
use cv_core::{Distortion, Rect};
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Point2, Rotation3, Vector3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoRectifyOptions {
    /// Free scaling in `[0, 1]`: 0 keeps only valid pixels, 1 keeps every
    /// source pixel. Negative selects the default scaling.
    pub alpha: f64,
    /// Force both principal points to coincide so zero disparity means infinity.
    pub zero_disparity: bool,
}

impl Default for StereoRectifyOptions {
    fn default() -> Self {
        Self {
            alpha: -1.0,
            zero_disparity: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StereoRectification {
    pub r1: Matrix3<f64>,
    pub r2: Matrix3<f64>,
    pub p1: Matrix3x4<f64>,
    pub p2: Matrix3x4<f64>,
    pub q: Matrix4<f64>,
    pub valid_roi: [Rect; 2],
    /// True when the cameras are stacked vertically and epipolar lines run along columns.
    pub vertical: bool,
}

impl StereoRectification {
    /// Left 3x3 block of a projection matrix, usable as a new camera matrix.
    pub fn camera_matrix(p: &Matrix3x4<f64>) -> Matrix3<f64> {
        p.fixed_view::<3, 3>(0, 0).into_owned()
    }
}

#[derive(Debug, Clone, Copy)]
struct BoundsF {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
}

impl BoundsF {
    fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    fn height(&self) -> f64 {
        self.y1 - self.y0
    }
}

/// Inner (all valid) and outer (all source pixels) rectangles of a rectified view.
fn rectified_bounds(
    camera: &Matrix3<f64>,
    distortion: &Distortion,
    rectification: &Matrix3<f64>,
    new_camera: &Matrix3<f64>,
    image_size: (u32, u32),
) -> Result<(BoundsF, BoundsF)> {
    const N: usize = 9;
    let (w, h) = (image_size.0 as f64, image_size.1 as f64);
    let mut grid = Vec::with_capacity(N * N);
    for y in 0..N {
        for x in 0..N {
            grid.push(Point2::new(
                x as f64 * w / (N - 1) as f64,
                y as f64 * h / (N - 1) as f64,
            ));
        }
    }
    let pts = undistort_points(
        &grid,
        camera,
        distortion,
        Some(rectification),
        Some(new_camera),
    )?;

    let mut inner = BoundsF {
        x0: f64::MIN,
        y0: f64::MIN,
        x1: f64::MAX,
        y1: f64::MAX,
    };
    let mut outer = BoundsF {
        x0: f64::MAX,
        y0: f64::MAX,
        x1: f64::MIN,
        y1: f64::MIN,
    };
    for y in 0..N {
        for x in 0..N {
            let p = pts[y * N + x];
            outer.x0 = outer.x0.min(p.x);
            outer.x1 = outer.x1.max(p.x);
            outer.y0 = outer.y0.min(p.y);
            outer.y1 = outer.y1.max(p.y);
            if x == 0 {
                inner.x0 = inner.x0.max(p.x);
            }
            if x == N - 1 {
                inner.x1 = inner.x1.min(p.x);
            }
            if y == 0 {
                inner.y0 = inner.y0.max(p.y);
            }
            if y == N - 1 {
                inner.y1 = inner.y1.min(p.y);
            }
        }
    }
    Ok((inner, outer))
}

// Round-off below this distance from an integer must not cost a whole pixel.
fn snap(v: f64) -> f64 {
    if (v - v.round()).abs() < 1e-6 {
        v.round()
    } else {
        v
    }
}

fn scaled_roi(inner: &BoundsF, cx: f64, cy: f64, s: f64, image_size: (u32, u32)) -> Rect {
    let x = snap((inner.x0 - cx) * s + cx).ceil();
    let y = snap((inner.y0 - cy) * s + cy).ceil();
    let w = snap(inner.width() * s).floor();
    let h = snap(inner.height() * s).floor();
    Rect::from_bounds(x, y, x + w, y + h, &Rect::full(image_size.0, image_size.1))
}

/// Compute rectifying transforms for a calibrated stereo pair.
///
/// `rotation`/`translation` map points from the left camera frame into the
/// right camera frame. Degenerate geometry (zero baseline, singular camera
/// matrices, non-finite results) is reported as a calibration error.
pub fn stereo_rectify(
    camera_left: &Matrix3<f64>,
    distortion_left: &Distortion,
    camera_right: &Matrix3<f64>,
    distortion_right: &Distortion,
    image_size: (u32, u32),
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    options: StereoRectifyOptions,
) -> Result<StereoRectification> {
    if image_size.0 == 0 || image_size.1 == 0 {
        return Err(CalibError::CalibrationError(
            "stereo_rectify requires a non-zero image size".to_string(),
        ));
    }
    if !rotation.iter().chain(translation.iter()).all(|v| v.is_finite()) {
        return Err(CalibError::CalibrationError(
            "stereo extrinsics contain non-finite values".to_string(),
        ));
    }
    let (nx, ny) = (image_size.0 as f64, image_size.1 as f64);

    // Half of the inverse relative rotation, applied to both views.
    let om = Rotation3::from_matrix(rotation).scaled_axis();
    let r_r = Rotation3::new(om * -0.5).into_inner();
    let t = r_r * translation;

    let idx = if t[0].abs() > t[1].abs() { 0 } else { 1 };
    let c = t[idx];
    let nt = t.norm();
    if !(nt > 1e-12) {
        return Err(CalibError::CalibrationError(
            "stereo_rectify requires a non-zero baseline".to_string(),
        ));
    }

    let mut uu = Vector3::zeros();
    uu[idx] = if c > 0.0 { 1.0 } else { -1.0 };
    let mut ww = t.cross(&uu);
    let nw = ww.norm();
    if nw > 0.0 {
        ww *= (c.abs() / nt).acos() / nw;
    }
    let w_r = Rotation3::new(ww).into_inner();

    let r1 = w_r * r_r.transpose();
    let r2 = w_r * r_r;
    let ti = r2 * translation;

    let cameras = [
        (camera_left, distortion_left, &r1),
        (camera_right, distortion_right, &r2),
    ];

    let mut fc_new = f64::MAX;
    for (camera, distortion, _) in &cameras {
        let mut fc = if idx == 0 {
            camera[(1, 1)]
        } else {
            camera[(0, 0)]
        };
        if distortion.k1 < 0.0 {
            fc *= 1.0 + distortion.k1 * (nx * nx + ny * ny) / (4.0 * fc * fc);
        }
        fc_new = fc_new.min(fc);
    }
    if !(fc_new.is_finite() && fc_new > 0.0) {
        return Err(CalibError::CalibrationError(format!(
            "degenerate rectified focal length {fc_new}"
        )));
    }

    let corners = [
        Point2::new(0.0, 0.0),
        Point2::new(nx - 1.0, 0.0),
        Point2::new(0.0, ny - 1.0),
        Point2::new(nx - 1.0, ny - 1.0),
    ];
    let mut cc_new = [Point2::origin(); 2];
    for (k, (camera, distortion, rect)) in cameras.iter().enumerate() {
        let normalized = undistort_points(&corners, camera, distortion, None, None)?;
        let mut sum = Vector3::zeros();
        for p in &normalized {
            let v = *rect * Vector3::new(p.x, p.y, 1.0);
            sum += Vector3::new(fc_new * v[0] / v[2], fc_new * v[1] / v[2], 0.0);
        }
        let avg = sum / corners.len() as f64;
        cc_new[k] = Point2::new((nx - 1.0) / 2.0 - avg[0], (ny - 1.0) / 2.0 - avg[1]);
    }

    if options.zero_disparity {
        let mid = Point2::new(
            (cc_new[0].x + cc_new[1].x) * 0.5,
            (cc_new[0].y + cc_new[1].y) * 0.5,
        );
        cc_new = [mid, mid];
    } else if idx == 0 {
        let cy = (cc_new[0].y + cc_new[1].y) * 0.5;
        cc_new[0].y = cy;
        cc_new[1].y = cy;
    } else {
        let cx = (cc_new[0].x + cc_new[1].x) * 0.5;
        cc_new[0].x = cx;
        cc_new[1].x = cx;
    }

    let projection = |fc: f64, cc: &Point2<f64>| {
        Matrix3x4::new(
            fc, 0.0, cc.x, 0.0, //
            0.0, fc, cc.y, 0.0, //
            0.0, 0.0, 1.0, 0.0,
        )
    };
    let mut p1 = projection(fc_new, &cc_new[0]);
    let mut p2 = projection(fc_new, &cc_new[1]);
    p2[(idx, 3)] = ti[idx] * fc_new;

    let (inner1, outer1) = rectified_bounds(
        camera_left,
        distortion_left,
        &r1,
        &StereoRectification::camera_matrix(&p1),
        image_size,
    )?;
    let (inner2, outer2) = rectified_bounds(
        camera_right,
        distortion_right,
        &r2,
        &StereoRectification::camera_matrix(&p2),
        image_size,
    )?;

    let mut s = 1.0;
    if options.alpha >= 0.0 {
        let alpha = options.alpha.min(1.0);
        let ratios = |b: &BoundsF, cc: &Point2<f64>| {
            [
                cc.x / (cc.x - b.x0),
                cc.y / (cc.y - b.y0),
                (nx - cc.x) / (b.x1 - cc.x),
                (ny - cc.y) / (b.y1 - cc.y),
            ]
        };
        let s0 = ratios(&inner1, &cc_new[0])
            .into_iter()
            .chain(ratios(&inner2, &cc_new[1]))
            .fold(f64::MIN, f64::max);
        let s1 = ratios(&outer1, &cc_new[0])
            .into_iter()
            .chain(ratios(&outer2, &cc_new[1]))
            .fold(f64::MAX, f64::min);
        s = s0 * (1.0 - alpha) + s1 * alpha;
        if !(s.is_finite() && s > 0.0) {
            return Err(CalibError::CalibrationError(format!(
                "degenerate rectification scale {s}"
            )));
        }

        fc_new *= s;
        for p in [&mut p1, &mut p2] {
            p[(0, 0)] = fc_new;
            p[(1, 1)] = fc_new;
        }
        p2[(idx, 3)] *= s;
    }

    let valid_roi = [
        scaled_roi(&inner1, cc_new[0].x, cc_new[0].y, s, image_size),
        scaled_roi(&inner2, cc_new[1].x, cc_new[1].y, s, image_size),
    ];

    let mut q = Matrix4::<f64>::zeros();
    q[(0, 0)] = 1.0;
    q[(0, 3)] = -cc_new[0].x;
    q[(1, 1)] = 1.0;
    q[(1, 3)] = -cc_new[0].y;
    q[(2, 3)] = fc_new;
    q[(3, 2)] = -1.0 / ti[idx];
    let cc_shift = if idx == 0 {
        cc_new[0].x - cc_new[1].x
    } else {
        cc_new[0].y - cc_new[1].y
    };
    q[(3, 3)] = cc_shift / ti[idx];

    let all_finite = r1
        .iter()
        .chain(r2.iter())
        .chain(p1.iter())
        .chain(p2.iter())
        .chain(q.iter())
        .all(|v| v.is_finite());
    if !all_finite {
        return Err(CalibError::CalibrationError(
            "stereo rectification produced non-finite values".to_string(),
        ));
    }

    Ok(StereoRectification {
        r1,
        r2,
        p1,
        p2,
        q,
        valid_roi,
        vertical: idx == 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> Matrix3<f64> {
        Matrix3::new(700.0, 0.0, 320.0, 0.0, 700.0, 240.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn ideal_horizontal_rig_keeps_geometry() {
        let k = camera();
        let d = Distortion::none();
        let t = Vector3::new(-0.12, 0.0, 0.0);
        let rect = stereo_rectify(
            &k,
            &d,
            &k,
            &d,
            (640, 480),
            &Matrix3::identity(),
            &t,
            StereoRectifyOptions::default(),
        )
        .unwrap();

        assert!(!rect.vertical);
        assert_relative_eq!(rect.r1, Matrix3::identity(), epsilon = 1e-9);
        assert_relative_eq!(rect.r2, Matrix3::identity(), epsilon = 1e-9);
        assert_relative_eq!(rect.p1[(0, 0)], 700.0, epsilon = 1e-9);
        assert_relative_eq!(rect.p2[(0, 3)], -0.12 * 700.0, epsilon = 1e-9);
        // Q[3][2] = -1/Tx, so 1/Q[3][2] recovers the baseline.
        assert_relative_eq!(1.0 / rect.q[(3, 2)], 0.12, epsilon = 1e-9);
        assert_relative_eq!(rect.q[(3, 3)], 0.0, epsilon = 1e-9);
        assert_eq!(rect.valid_roi[0], Rect::new(0, 0, 640, 480));
    }

    #[test]
    fn rotated_rig_rows_are_aligned() {
        let k = camera();
        let d = Distortion::none();
        let r = Rotation3::from_euler_angles(0.01, -0.02, 0.005).into_inner();
        let t = Vector3::new(-0.1, 0.003, 0.001);
        let rect = stereo_rectify(&k, &d, &k, &d, (640, 480), &r, &t, StereoRectifyOptions::default())
            .unwrap();

        // A world point must land on the same rectified row in both views.
        let world = Vector3::new(0.2, -0.1, 2.5);
        let right_cam = r * world + t;
        let project = |p: &Matrix3x4<f64>, rect_r: &Matrix3<f64>, x: Vector3<f64>| {
            let xr = rect_r * x;
            let h = p.fixed_view::<3, 3>(0, 0) * xr;
            (h[0] / h[2], h[1] / h[2])
        };
        let (_, yl) = project(&rect.p1, &rect.r1, world);
        let (_, yr) = project(&rect.p2, &rect.r2, right_cam);
        assert_relative_eq!(yl, yr, epsilon = 1e-6);
    }

    #[test]
    fn vertical_rig_is_detected() {
        let k = camera();
        let d = Distortion::none();
        let t = Vector3::new(0.0, -0.1, 0.0);
        let rect = stereo_rectify(
            &k,
            &d,
            &k,
            &d,
            (640, 480),
            &Matrix3::identity(),
            &t,
            StereoRectifyOptions::default(),
        )
        .unwrap();
        assert!(rect.vertical);
        assert_relative_eq!(rect.p2[(1, 3)], -0.1 * 700.0, epsilon = 1e-9);
    }

    #[test]
    fn zero_baseline_is_degenerate() {
        let k = camera();
        let d = Distortion::none();
        let res = stereo_rectify(
            &k,
            &d,
            &k,
            &d,
            (640, 480),
            &Matrix3::identity(),
            &Vector3::zeros(),
            StereoRectifyOptions::default(),
        );
        assert!(matches!(res, Err(CalibError::CalibrationError(_))));
    }

    #[test]
    fn alpha_trades_valid_area_for_coverage() {
        let k = camera();
        let d = Distortion::new(-0.2, 0.03, 0.0, 0.0, 0.0);
        let t = Vector3::new(-0.1, 0.0, 0.0);
        let r = Rotation3::from_euler_angles(0.0, 0.02, 0.0).into_inner();
        let opts = |alpha| StereoRectifyOptions {
            alpha,
            zero_disparity: true,
        };
        let cropped = stereo_rectify(&k, &d, &k, &d, (640, 480), &r, &t, opts(0.0)).unwrap();
        let full = stereo_rectify(&k, &d, &k, &d, (640, 480), &r, &t, opts(1.0)).unwrap();

        assert!(full.p1[(0, 0)] < cropped.p1[(0, 0)]);
        assert!(cropped.valid_roi[0].area() >= full.valid_roi[0].area());
    }

    #[test]
    fn zero_disparity_aligns_principal_points() {
        let k1 = camera();
        let k2 = Matrix3::new(705.0, 0.0, 330.0, 0.0, 705.0, 236.0, 0.0, 0.0, 1.0);
        let d = Distortion::none();
        let t = Vector3::new(-0.1, 0.0, 0.0);
        let r = Rotation3::from_euler_angles(0.0, 0.01, 0.0).into_inner();

        let aligned = stereo_rectify(&k1, &d, &k2, &d, (640, 480), &r, &t, StereoRectifyOptions::default())
            .unwrap();
        assert_relative_eq!(aligned.p1[(0, 2)], aligned.p2[(0, 2)], epsilon = 1e-9);
        assert_relative_eq!(aligned.q[(3, 3)], 0.0, epsilon = 1e-12);

        let free = stereo_rectify(
            &k1,
            &d,
            &k2,
            &d,
            (640, 480),
            &r,
            &t,
            StereoRectifyOptions {
                alpha: -1.0,
                zero_disparity: false,
            },
        )
        .unwrap();
        assert_relative_eq!(free.p1[(1, 2)], free.p2[(1, 2)], epsilon = 1e-9);
        assert!((free.p1[(0, 2)] - free.p2[(0, 2)]).abs() > 1e-3);
    }
}
