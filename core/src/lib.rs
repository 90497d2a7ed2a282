//! Core types shared by every crate in the stereo pipeline workspace.
//!
//! Holds the workspace-wide [`Error`] type, the pinhole camera description
//! and the lens distortion model, and the [`Rect`] used for regions of interest.

pub mod error;
pub mod geometry;

pub use error::{Error, ErrorKind, Result};
pub use geometry::*;
