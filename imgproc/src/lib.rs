//! Lookup-table remapping for grayscale images.

pub mod geometry;

pub use geometry::remap_region;

pub use cv_core::{Error, Result};

use serde::{Deserialize, Serialize};

/// How a fractional source coordinate is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
}
