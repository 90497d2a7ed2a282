//! Stereo vision pipeline
//!
//! Rectifies stereo image pairs, hands them to a pluggable disparity method and
//! turns the resulting disparity maps into color images and 3D points.

use image::GrayImage;

pub mod params;
pub mod pipeline;
pub mod rectification;
pub mod registry;
pub mod reprojection;
pub mod source;
pub mod visualization;

pub use cv_calib3d as calib3d;
pub use cv_calib3d::{StereoCalibration, CALIBRATION_SCHEMA};
pub use cv_core::{Error, ErrorKind, Rect, Result};
pub use cv_imgproc::Interpolation;
pub use cv_runtime::{BackendType, DeviceId, DeviceInfo, DeviceRegistry};

pub use params::MethodParams;
pub use pipeline::{Pipeline, PipelineConfig, PipelineEvent, Stage, StageError, StageStatistics};
pub use rectification::{Rectification, RectificationMaps, RectificationOptions};
pub use registry::Registry;
pub use reprojection::{PointImage, Reprojection, ReprojectionMethod};
pub use source::{
    ImagePair, ImagePairSource, PushHandle, PushImagePairSource, SourceNotifier,
    StaticImagePairSource,
};
pub use visualization::{visualize, ColorMap};

/// Disparity computation strategy.
///
/// The pipeline never calls a method concurrently with itself, but it does call
/// it from a worker thread, hence the `Send` bound.
pub trait StereoMethod: Send {
    fn name(&self) -> &str;

    /// Compute a disparity map for a rectified pair. The returned map carries the
    /// disparity search range it was computed with.
    fn compute_disparity(&mut self, left: &GrayImage, right: &GrayImage) -> Result<DisparityMap>;

    fn export_params(&self) -> MethodParams {
        MethodParams::new(self.name())
    }

    fn import_params(&mut self, params: &MethodParams) -> Result<()> {
        params.check_method(self.name())
    }
}

/// Disparity map representation
///
/// Values below `min_disparity` mark pixels without a match; [`DisparityMap::invalid_value`]
/// is the sentinel methods are expected to write there.
#[derive(Debug, Clone, PartialEq)]
pub struct DisparityMap {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub min_disparity: i32,
    pub max_disparity: i32,
}

impl Default for DisparityMap {
    fn default() -> Self {
        Self::empty()
    }
}

impl DisparityMap {
    pub fn new(width: u32, height: u32, min_d: i32, max_d: i32) -> Self {
        let size = (width * height) as usize;
        Self {
            data: vec![0.0; size],
            width,
            height,
            min_disparity: min_d,
            max_disparity: max_d,
        }
    }

    pub fn from_data(
        width: u32,
        height: u32,
        data: Vec<f32>,
        min_d: i32,
        max_d: i32,
    ) -> Result<Self> {
        if data.len() != (width as usize) * (height as usize) {
            return Err(Error::dimension_mismatch(format!(
                "disparity data has {} values for a {}x{} map",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            min_disparity: min_d,
            max_disparity: max_d,
        })
    }

    pub fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of disparity levels searched.
    pub fn num_disparities(&self) -> u32 {
        (self.max_disparity - self.min_disparity).max(0) as u32
    }

    pub fn invalid_value(&self) -> f32 {
        (self.min_disparity - 1) as f32
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        let idx = (y * self.width + x) as usize;
        self.data.get(idx).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let idx = (y * self.width + x) as usize;
        if let Some(cell) = self.data.get_mut(idx) {
            *cell = value;
        }
    }

    /// Whether `(x, y)` lies inside the map and holds a disparity within the searched range.
    pub fn is_valid(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let d = self.get(x, y);
        d.is_finite() && d >= self.min_disparity as f32 && d < self.max_disparity as f32
    }
}
