use crate::{Error, Result};
use nalgebra::{Matrix3, Point2, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
        }
    }

    /// Build intrinsics from a 3x3 camera matrix. Skew is ignored.
    pub fn from_matrix(k: &Matrix3<f64>, width: u32, height: u32) -> Self {
        Self::new(k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)], width, height)
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn is_invertible(&self) -> bool {
        self.fx.is_finite() && self.fy.is_finite() && self.fx.abs() > 1e-12 && self.fy.abs() > 1e-12
    }

    pub fn normalize(&self, pixel: &Point2<f64>) -> Point2<f64> {
        Point2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy)
    }

    pub fn denormalize(&self, point: &Point2<f64>) -> Point2<f64> {
        Point2::new(point.x * self.fx + self.cx, point.y * self.fy + self.cy)
    }
}

/// Brown-Conrady distortion with three radial and two tangential terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

impl Distortion {
    pub fn new(k1: f64, k2: f64, p1: f64, p2: f64, k3: f64) -> Self {
        Self { k1, k2, p1, p2, k3 }
    }

    pub fn none() -> Self {
        Self {
            k1: 0.0,
            k2: 0.0,
            p1: 0.0,
            p2: 0.0,
            k3: 0.0,
        }
    }

    /// Accepts the usual `k1, k2, p1, p2[, k3]` coefficient layout.
    pub fn from_coefficients(coeffs: &[f64]) -> Result<Self> {
        match coeffs.len() {
            0 => Ok(Self::none()),
            4 => Ok(Self::new(coeffs[0], coeffs[1], coeffs[2], coeffs[3], 0.0)),
            5 => Ok(Self::new(coeffs[0], coeffs[1], coeffs[2], coeffs[3], coeffs[4])),
            n => Err(Error::InvalidParameters(format!(
                "expected 0, 4 or 5 distortion coefficients, got {n}"
            ))),
        }
    }

    pub fn coefficients(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_zero(&self) -> bool {
        self.coefficients().iter().all(|c| *c == 0.0)
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (x * radial + dx, y * radial + dy)
    }

    /// Invert [`Distortion::apply`] by fixed-point iteration on normalized coordinates.
    pub fn remove(&self, xd: f64, yd: f64) -> (f64, f64) {
        if self.is_zero() {
            return (xd, yd);
        }
        let mut x = xd;
        let mut y = yd;
        for _ in 0..20 {
            let r2 = x * x + y * y;
            let icdist = 1.0 / (1.0 + ((self.k3 * r2 + self.k2) * r2 + self.k1) * r2);
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
            x = (xd - dx) * icdist;
            y = (yd - dy) * icdist;
        }
        (x, y)
    }
}

impl Default for Distortion {
    fn default() -> Self {
        Self::none()
    }
}

pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// Axis-aligned pixel rectangle, used for regions of interest and valid-pixel areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return Rect::default();
        }
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }

    /// Rectangle from floating point bounds, rounding inward and clipping to `bounds`.
    pub fn from_bounds(x0: f64, y0: f64, x1: f64, y1: f64, bounds: &Rect) -> Rect {
        if !(x0.is_finite() && y0.is_finite() && x1.is_finite() && y1.is_finite()) {
            return Rect::default();
        }
        let left = x0.ceil().max(0.0);
        let top = y0.ceil().max(0.0);
        let right = x1.floor().max(0.0);
        let bottom = y1.floor().max(0.0);
        if right <= left || bottom <= top {
            return Rect::default();
        }
        Rect::new(
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        )
        .intersect(bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn distortion_remove_inverts_apply() {
        let d = Distortion::new(-0.21, 0.05, 0.001, -0.0005, 0.0);
        let (xd, yd) = d.apply(0.3, -0.2);
        let (xu, yu) = d.remove(xd, yd);
        assert_relative_eq!(xu, 0.3, epsilon = 1e-8);
        assert_relative_eq!(yu, -0.2, epsilon = 1e-8);
    }

    #[test]
    fn distortion_coefficient_layouts() {
        assert!(Distortion::from_coefficients(&[0.1, 0.0, 0.0, 0.0]).is_ok());
        assert_eq!(
            Distortion::from_coefficients(&[0.1, 0.2, 0.0, 0.0, 0.3])
                .unwrap()
                .k3,
            0.3
        );
        assert!(Distortion::from_coefficients(&[0.1, 0.2]).is_err());
    }

    #[test]
    fn intrinsics_matrix_roundtrip() {
        let k = CameraIntrinsics::new(700.0, 710.0, 320.0, 240.0, 640, 480);
        let back = CameraIntrinsics::from_matrix(&k.matrix(), 640, 480);
        assert_eq!(k, back);
        let p = Point2::new(100.0, 50.0);
        let n = k.normalize(&p);
        assert_relative_eq!(k.denormalize(&n), p, epsilon = 1e-12);
    }

    #[test]
    fn rect_intersection() {
        let a = Rect::new(10, 10, 20, 20);
        let b = Rect::new(25, 0, 100, 15);
        assert_eq!(a.intersect(&b), Rect::new(25, 10, 5, 5));
        assert!(a.intersect(&Rect::new(40, 40, 5, 5)).is_empty());
        assert!(a.contains(10, 29));
        assert!(!a.contains(30, 10));
    }

    #[test]
    fn rect_from_float_bounds_rounds_inward() {
        let bounds = Rect::full(100, 80);
        let r = Rect::from_bounds(2.2, -3.0, 120.0, 40.9, &bounds);
        assert_eq!(r, Rect::new(3, 0, 97, 40));
        assert!(Rect::from_bounds(f64::NAN, 0.0, 1.0, 1.0, &bounds).is_empty());
    }
}
