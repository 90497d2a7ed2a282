pub type CalibError = cv_core::Error;
pub type Result<T> = cv_core::Result<T>;

pub mod distortion;
pub use distortion::{init_undistort_rectify_map, undistort_points};

pub mod stereo;
pub use stereo::{stereo_rectify, StereoRectification, StereoRectifyOptions};

pub mod calibration;
pub use calibration::{StereoCalibration, CALIBRATION_SCHEMA};
