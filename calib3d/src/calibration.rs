//! Raw stereo calibration and its on-disk representation.
//!
//! Only the calibration itself is persisted. Rectification settings such as the
//! free scaling factor are runtime options and never written to the file.

use crate::{CalibError, Result};
use cv_core::Distortion;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Schema tag written into every calibration document.
pub const CALIBRATION_SCHEMA: &str = "cv-stereo-calibration/1";

#[derive(Debug, Clone, PartialEq)]
pub struct StereoCalibration {
    pub camera_matrix_left: Matrix3<f64>,
    pub distortion_left: Distortion,
    pub camera_matrix_right: Matrix3<f64>,
    pub distortion_right: Distortion,
    /// Rotation from the left camera frame into the right camera frame.
    pub rotation: Matrix3<f64>,
    /// Translation from the left camera frame into the right camera frame.
    pub translation: Vector3<f64>,
    pub image_size: (u32, u32),
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationDocument {
    schema: String,
    image_width: u32,
    image_height: u32,
    camera_matrix_left: [[f64; 3]; 3],
    dist_coeffs_left: Vec<f64>,
    camera_matrix_right: [[f64; 3]; 3],
    dist_coeffs_right: Vec<f64>,
    rotation: [[f64; 3]; 3],
    translation: [f64; 3],
}

fn to_rows(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    let mut rows = [[0.0; 3]; 3];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = m[(r, c)];
        }
    }
    rows
}

fn from_rows(rows: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::from_fn(|r, c| rows[r][c])
}

impl StereoCalibration {
    pub fn new(
        camera_matrix_left: Matrix3<f64>,
        distortion_left: Distortion,
        camera_matrix_right: Matrix3<f64>,
        distortion_right: Distortion,
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
        image_size: (u32, u32),
    ) -> Self {
        Self {
            camera_matrix_left,
            distortion_left,
            camera_matrix_right,
            distortion_right,
            rotation,
            translation,
            image_size,
        }
    }

    /// Distance between the two optical centres, in calibration units.
    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }

    fn to_document(&self) -> CalibrationDocument {
        CalibrationDocument {
            schema: CALIBRATION_SCHEMA.to_string(),
            image_width: self.image_size.0,
            image_height: self.image_size.1,
            camera_matrix_left: to_rows(&self.camera_matrix_left),
            dist_coeffs_left: self.distortion_left.coefficients().to_vec(),
            camera_matrix_right: to_rows(&self.camera_matrix_right),
            dist_coeffs_right: self.distortion_right.coefficients().to_vec(),
            rotation: to_rows(&self.rotation),
            translation: [self.translation[0], self.translation[1], self.translation[2]],
        }
    }

    fn from_document(doc: CalibrationDocument) -> Result<Self> {
        Ok(Self {
            camera_matrix_left: from_rows(&doc.camera_matrix_left),
            distortion_left: Distortion::from_coefficients(&doc.dist_coeffs_left)?,
            camera_matrix_right: from_rows(&doc.camera_matrix_right),
            distortion_right: Distortion::from_coefficients(&doc.dist_coeffs_right)?,
            rotation: from_rows(&doc.rotation),
            translation: Vector3::from(doc.translation),
            image_size: (doc.image_width, doc.image_height),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_document())?)
    }

    /// Parse a calibration document, rejecting any other schema tag.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        check_schema(&value)?;
        Self::from_document(serde_json::from_value(value)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            CalibError::ConfigError(format!(
                "cannot open calibration file {} for writing: {e}",
                path.display()
            ))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.to_document())?;
        tracing::debug!(path = %path.display(), "saved stereo calibration");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            CalibError::ConfigError(format!(
                "cannot open calibration file {}: {e}",
                path.display()
            ))
        })?;
        let value: serde_json::Value = serde_json::from_reader(BufReader::new(file))?;
        check_schema(&value).map_err(|e| {
            CalibError::ConfigError(format!("{}: {e}", path.display()))
        })?;
        let calibration = Self::from_document(serde_json::from_value(value)?)?;
        tracing::debug!(path = %path.display(), "loaded stereo calibration");
        Ok(calibration)
    }
}

fn check_schema(value: &serde_json::Value) -> Result<()> {
    match value.get("schema").and_then(|s| s.as_str()) {
        Some(CALIBRATION_SCHEMA) => Ok(()),
        Some(other) => Err(CalibError::ConfigError(format!(
            "unexpected calibration schema '{other}', expected '{CALIBRATION_SCHEMA}'"
        ))),
        None => Err(CalibError::ConfigError(
            "calibration document has no schema tag".to_string(),
        )),
    }
}
