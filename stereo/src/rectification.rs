//! Stereo rectification
//!
//! Owns the raw stereo calibration, bakes the per-camera remap tables once per
//! calibration change and applies them to incoming pairs, optionally restricted
//! to a region of interest. Without a usable calibration, or while bypassed,
//! pairs pass through unchanged.

use crate::{Error, Rect, Result};
use cv_calib3d::{
    init_undistort_rectify_map, stereo_rectify, StereoCalibration, StereoRectification,
    StereoRectifyOptions,
};
use cv_core::Distortion;
use cv_imgproc::{remap_region, Interpolation};
use image::GrayImage;
use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Runtime rectification settings. Never persisted with the calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RectificationOptions {
    /// Free scaling in `[0, 1]`; negative selects the default.
    pub scale: f64,
    pub zero_disparity: bool,
    /// Sampling used when applying the remap tables.
    pub interpolation: Interpolation,
}

impl Default for RectificationOptions {
    fn default() -> Self {
        Self {
            scale: -1.0,
            zero_disparity: true,
            interpolation: Interpolation::Linear,
        }
    }
}

impl RectificationOptions {
    fn rectify_options(&self) -> StereoRectifyOptions {
        StereoRectifyOptions {
            alpha: self.scale,
            zero_disparity: self.zero_disparity,
        }
    }

    fn same_geometry(&self, other: &Self) -> bool {
        self.scale == other.scale && self.zero_disparity == other.zero_disparity
    }
}

/// Value written for rectified pixels that map outside the source frame.
const OUTSIDE_FILL: u8 = 0;

/// Everything derived from a calibration: remap tables for both cameras plus
/// the rectified geometry.
#[derive(Debug, Clone)]
pub struct RectificationMaps {
    pub left_x: Vec<f32>,
    pub left_y: Vec<f32>,
    pub right_x: Vec<f32>,
    pub right_y: Vec<f32>,
    pub geometry: StereoRectification,
}

impl RectificationMaps {
    fn derive(calib: &StereoCalibration, options: &RectificationOptions) -> Result<Self> {
        let geometry = stereo_rectify(
            &calib.camera_matrix_left,
            &calib.distortion_left,
            &calib.camera_matrix_right,
            &calib.distortion_right,
            calib.image_size,
            &calib.rotation,
            &calib.translation,
            options.rectify_options(),
        )?;

        let (left_x, left_y) = init_undistort_rectify_map(
            calib.image_size,
            &calib.camera_matrix_left,
            &calib.distortion_left,
            &geometry.r1,
            &StereoRectification::camera_matrix(&geometry.p1),
        )?;
        let (right_x, right_y) = init_undistort_rectify_map(
            calib.image_size,
            &calib.camera_matrix_right,
            &calib.distortion_right,
            &geometry.r2,
            &StereoRectification::camera_matrix(&geometry.p2),
        )?;

        Ok(Self {
            left_x,
            left_y,
            right_x,
            right_y,
            geometry,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Rectification {
    calibration: Option<StereoCalibration>,
    maps: Option<RectificationMaps>,
    options: RectificationOptions,
    roi: Option<Rect>,
    bypass: bool,
}

impl Rectification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: RectificationOptions) -> Self {
        let mut rect = Self::new();
        rect.options = Self::sanitize(options);
        rect
    }

    fn sanitize(mut options: RectificationOptions) -> RectificationOptions {
        if !options.scale.is_finite() || options.scale < 0.0 {
            options.scale = -1.0;
        } else {
            options.scale = options.scale.min(1.0);
        }
        options
    }

    /// Install a calibration and derive the rectification maps.
    ///
    /// Degenerate geometry leaves the component invalid (pass-through) and is
    /// reported as a calibration error.
    pub fn set_calibration(&mut self, calibration: StereoCalibration) -> Result<()> {
        match RectificationMaps::derive(&calibration, &self.options) {
            Ok(maps) => {
                tracing::info!(
                    width = calibration.image_size.0,
                    height = calibration.image_size.1,
                    vertical = maps.geometry.vertical,
                    "stereo calibration installed"
                );
                self.calibration = Some(calibration);
                self.maps = Some(maps);
                self.clip_roi();
                Ok(())
            }
            Err(e) => {
                tracing::warn!("rectification derivation failed, passing images through: {e}");
                self.calibration = None;
                self.maps = None;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_calibration_parts(
        &mut self,
        camera_left: Matrix3<f64>,
        distortion_left: Distortion,
        camera_right: Matrix3<f64>,
        distortion_right: Distortion,
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
        image_size: (u32, u32),
    ) -> Result<()> {
        self.set_calibration(StereoCalibration::new(
            camera_left,
            distortion_left,
            camera_right,
            distortion_right,
            rotation,
            translation,
            image_size,
        ))
    }

    pub fn clear(&mut self) {
        if self.calibration.is_some() {
            tracing::debug!("stereo calibration cleared");
        }
        self.calibration = None;
        self.maps = None;
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let calibration = StereoCalibration::load(path)?;
        self.set_calibration(calibration)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        match &self.calibration {
            Some(calibration) => calibration.save(path),
            None => Err(Error::ConfigError(
                "no stereo calibration to save".to_string(),
            )),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.maps.is_some()
    }

    pub fn calibration(&self) -> Option<&StereoCalibration> {
        self.calibration.as_ref()
    }

    pub fn maps(&self) -> Option<&RectificationMaps> {
        self.maps.as_ref()
    }

    pub fn image_size(&self) -> Option<(u32, u32)> {
        self.calibration.as_ref().map(|c| c.image_size)
    }

    /// Disparity-to-depth matrix of the current rectification.
    pub fn q(&self) -> Option<&Matrix4<f64>> {
        self.maps.as_ref().map(|m| &m.geometry.q)
    }

    pub fn valid_rois(&self) -> Option<[Rect; 2]> {
        self.maps.as_ref().map(|m| m.geometry.valid_roi)
    }

    pub fn is_vertical(&self) -> bool {
        self.maps.as_ref().is_some_and(|m| m.geometry.vertical)
    }

    /// Stereo baseline, read back from the inverse-baseline term of `Q`.
    pub fn baseline(&self) -> Option<f64> {
        self.q().map(|q| 1.0 / q[(3, 2)])
    }

    pub fn options(&self) -> RectificationOptions {
        self.options
    }

    /// Apply new options, re-deriving the maps when the geometry changes.
    ///
    /// If the maps cannot be re-derived the calibration is kept and the
    /// component passes images through until options that work are applied.
    pub fn set_options(&mut self, options: RectificationOptions) -> Result<()> {
        let options = Self::sanitize(options);
        let rederive = !options.same_geometry(&self.options);
        self.options = options;
        if rederive {
            self.rederive()
        } else {
            Ok(())
        }
    }

    pub fn set_interpolation(&mut self, interpolation: Interpolation) {
        self.options.interpolation = interpolation;
    }

    /// Negative selects the default scaling, anything else is clamped to `[0, 1]`.
    pub fn set_scale(&mut self, scale: f64) -> Result<()> {
        self.set_options(RectificationOptions {
            scale,
            ..self.options
        })
    }

    pub fn set_zero_disparity(&mut self, zero_disparity: bool) -> Result<()> {
        self.set_options(RectificationOptions {
            zero_disparity,
            ..self.options
        })
    }

    fn rederive(&mut self) -> Result<()> {
        let Some(calibration) = &self.calibration else {
            return Ok(());
        };
        match RectificationMaps::derive(calibration, &self.options) {
            Ok(maps) => {
                tracing::debug!(scale = self.options.scale, "rectification maps re-derived");
                self.maps = Some(maps);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("rectification options rejected, passing images through: {e}");
                self.maps = None;
                Err(e)
            }
        }
    }

    pub fn roi(&self) -> Option<Rect> {
        self.roi
    }

    /// Restrict rectification to `roi`, clipped to the calibrated frame. A region
    /// that does not overlap the frame is rejected and the previous one kept.
    pub fn set_roi(&mut self, roi: Option<Rect>) -> bool {
        let Some(requested) = roi else {
            self.roi = None;
            return true;
        };
        let clipped = match self.image_size() {
            Some((w, h)) => requested.intersect(&Rect::full(w, h)),
            None => requested,
        };
        if clipped.is_empty() {
            tracing::warn!(?requested, "rejecting ROI outside the calibrated frame");
            return false;
        }
        self.roi = Some(clipped);
        true
    }

    fn clip_roi(&mut self) {
        if let (Some(roi), Some((w, h))) = (self.roi, self.image_size()) {
            let clipped = roi.intersect(&Rect::full(w, h));
            self.roi = if clipped.is_empty() {
                tracing::warn!(?roi, "dropping ROI outside the new calibrated frame");
                None
            } else {
                Some(clipped)
            };
        }
    }

    /// Pixel offset of the rectified output inside the full calibrated frame.
    pub fn roi_offset(&self) -> (i32, i32) {
        match self.roi {
            Some(r) if self.is_valid() && !self.bypass => (r.x as i32, r.y as i32),
            _ => (0, 0),
        }
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Rectify a pair.
    ///
    /// Without a valid calibration, or while bypassed, the inputs are copied
    /// through. Inputs that do not match the calibrated size are rejected.
    pub fn rectify_pair(&self, left: &GrayImage, right: &GrayImage) -> Result<(GrayImage, GrayImage)> {
        let (Some(maps), Some((w, h)), false) = (&self.maps, self.image_size(), self.bypass) else {
            return Ok((left.clone(), right.clone()));
        };

        for (side, img) in [("left", left), ("right", right)] {
            if img.dimensions() != (w, h) {
                return Err(Error::dimension_mismatch(format!(
                    "{side} image is {}x{}, calibration expects {w}x{h}",
                    img.width(),
                    img.height()
                )));
            }
        }

        let region = self.roi.unwrap_or_else(|| Rect::full(w, h));
        let interpolation = self.options.interpolation;
        let rect_left = remap_region(
            left,
            &maps.left_x,
            &maps.left_y,
            w,
            region,
            interpolation,
            OUTSIDE_FILL,
        )?;
        let rect_right = remap_region(
            right,
            &maps.right_x,
            &maps.right_y,
            w,
            region,
            interpolation,
            OUTSIDE_FILL,
        )?;
        Ok((rect_left, rect_right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn calibration(size: (u32, u32)) -> StereoCalibration {
        let k = Matrix3::new(
            80.0,
            0.0,
            size.0 as f64 / 2.0,
            0.0,
            80.0,
            size.1 as f64 / 2.0,
            0.0,
            0.0,
            1.0,
        );
        StereoCalibration::new(
            k,
            Distortion::none(),
            k,
            Distortion::none(),
            Matrix3::identity(),
            Vector3::new(-0.12, 0.0, 0.0),
            size,
        )
    }

    fn gradient(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x * 7 + y * 3) % 256) as u8]))
    }

    #[test]
    fn invalid_rectification_passes_through() {
        let rect = Rectification::new();
        let left = gradient(16, 12);
        let right = gradient(16, 12);
        let (l, r) = rect.rectify_pair(&left, &right).unwrap();
        assert_eq!(l, left);
        assert_eq!(r, right);
        assert!(rect.baseline().is_none());
    }

    #[test]
    fn ideal_rig_rectifies_to_identity() {
        let mut rect = Rectification::new();
        rect.set_calibration(calibration((32, 24))).unwrap();
        assert!(rect.is_valid());
        let img = gradient(32, 24);
        let (l, _) = rect.rectify_pair(&img, &img).unwrap();
        assert_eq!(l.get_pixel(10, 7), img.get_pixel(10, 7));
        assert!((rect.baseline().unwrap() - 0.12).abs() < 1e-9);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut rect = Rectification::new();
        rect.set_calibration(calibration((32, 24))).unwrap();
        let err = rect
            .rectify_pair(&gradient(32, 24), &gradient(30, 24))
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)));
    }

    #[test]
    fn degenerate_calibration_invalidates() {
        let mut rect = Rectification::new();
        rect.set_calibration(calibration((32, 24))).unwrap();
        let mut bad = calibration((32, 24));
        bad.translation = Vector3::zeros();
        assert!(rect.set_calibration(bad).is_err());
        assert!(!rect.is_valid());
        assert!(rect.calibration().is_none());
    }

    #[test]
    fn roi_restricts_output_and_reports_offset() {
        let mut rect = Rectification::new();
        rect.set_calibration(calibration((32, 24))).unwrap();
        assert!(rect.set_roi(Some(Rect::new(4, 2, 100, 10))));
        assert_eq!(rect.roi(), Some(Rect::new(4, 2, 28, 10)));
        assert_eq!(rect.roi_offset(), (4, 2));

        let img = gradient(32, 24);
        let (l, r) = rect.rectify_pair(&img, &img).unwrap();
        assert_eq!(l.dimensions(), (28, 10));
        assert_eq!(r.dimensions(), (28, 10));
        assert_eq!(l.get_pixel(0, 0), img.get_pixel(4, 2));

        assert!(!rect.set_roi(Some(Rect::new(40, 0, 5, 5))));
        assert_eq!(rect.roi(), Some(Rect::new(4, 2, 28, 10)));
    }

    #[test]
    fn bypass_copies_inputs() {
        let mut rect = Rectification::new();
        rect.set_calibration(calibration((32, 24))).unwrap();
        rect.set_roi(Some(Rect::new(0, 0, 8, 8)));
        rect.set_bypass(true);
        let img = gradient(32, 24);
        let (l, _) = rect.rectify_pair(&img, &img).unwrap();
        assert_eq!(l, img);
        assert_eq!(rect.roi_offset(), (0, 0));
    }

    #[test]
    fn scale_is_clamped_and_rederives() {
        let mut rect = Rectification::new();
        rect.set_calibration(calibration((32, 24))).unwrap();
        rect.set_scale(3.0).unwrap();
        assert_eq!(rect.options().scale, 1.0);
        rect.set_scale(-0.5).unwrap();
        assert_eq!(rect.options().scale, -1.0);
        assert!(rect.is_valid());
    }

    #[test]
    fn failed_rederive_keeps_calibration() {
        let mut rect = Rectification::new();
        rect.set_calibration(calibration((32, 24))).unwrap();
        let good = rect.calibration().cloned().unwrap();

        if let Some(c) = rect.calibration.as_mut() {
            c.translation = Vector3::zeros();
        }
        assert!(rect.set_scale(0.5).is_err());
        assert!(!rect.is_valid());
        assert!(rect.calibration().is_some());
        assert_eq!(rect.roi_offset(), (0, 0));

        rect.calibration = Some(good);
        rect.set_scale(-1.0).unwrap();
        assert!(rect.is_valid());
        assert!((rect.baseline().unwrap() - 0.12).abs() < 1e-9);
    }

    #[test]
    fn interpolation_switch_keeps_maps() {
        let mut rect = Rectification::new();
        rect.set_calibration(calibration((32, 24))).unwrap();
        rect.set_interpolation(Interpolation::Nearest);
        assert_eq!(rect.options().interpolation, Interpolation::Nearest);
        assert!(rect.is_valid());

        let img = gradient(32, 24);
        let (l, r) = rect.rectify_pair(&img, &img).unwrap();
        assert_eq!(l.get_pixel(10, 7), img.get_pixel(10, 7));
        assert_eq!(r.get_pixel(20, 15), img.get_pixel(20, 15));

        let json = serde_json::to_string(&rect.options()).unwrap();
        assert!(json.contains("\"nearest\""));
    }

    #[test]
    fn save_requires_calibration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib.json");
        let mut rect = Rectification::new();
        assert!(rect.save(&path).is_err());

        rect.set_calibration(calibration((32, 24))).unwrap();
        rect.save(&path).unwrap();

        let mut loaded = Rectification::new();
        loaded.load(&path).unwrap();
        assert_eq!(loaded.calibration(), rect.calibration());
        assert_eq!(loaded.q(), rect.q());
    }
}
