//! Disparity map rendering.

use crate::{DisparityMap, Error, Result};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMap {
    Grayscale,
    #[default]
    Jet,
}

impl ColorMap {
    /// Color for `t` in `[0, 1]`.
    pub fn color(&self, t: f32) -> Rgb<u8> {
        let t = t.clamp(0.0, 1.0);
        match self {
            ColorMap::Grayscale => {
                let v = (t * 255.0).round() as u8;
                Rgb([v, v, v])
            }
            ColorMap::Jet => {
                let r = if t < 0.5 { 0.0 } else { (t - 0.5) * 2.0 * 255.0 };
                let g = if t < 0.5 {
                    t * 2.0 * 255.0
                } else {
                    (1.0 - t) * 2.0 * 255.0
                };
                let b = if t < 0.5 { (0.5 - t) * 2.0 * 255.0 } else { 0.0 };
                Rgb([r as u8, g as u8, b as u8])
            }
        }
    }
}

impl FromStr for ColorMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grayscale" | "gray" | "grey" => Ok(ColorMap::Grayscale),
            "jet" => Ok(ColorMap::Jet),
            other => Err(Error::NotSupported(format!("unknown color map '{other}'"))),
        }
    }
}

/// Render `disparity` over its searched range `[min, min + num_disparities)`.
///
/// Pixels outside the range, including the invalid sentinel, are black. An
/// empty map renders as an empty image.
pub fn visualize(disparity: &DisparityMap, colormap: ColorMap) -> RgbImage {
    if disparity.is_empty() {
        return RgbImage::new(0, 0);
    }
    let min = disparity.min_disparity as f32;
    let range = disparity.num_disparities().max(1) as f32;

    RgbImage::from_fn(disparity.width, disparity.height, |x, y| {
        if !disparity.is_valid(x, y) {
            return Rgb([0, 0, 0]);
        }
        colormap.color((disparity.get(x, y) - min) / range)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grayscale_spans_the_search_range() {
        let mut disp = DisparityMap::new(3, 1, 0, 16);
        disp.set(0, 0, 0.0);
        disp.set(1, 0, 8.0);
        disp.set(2, 0, disp.invalid_value());
        let img = visualize(&disp, ColorMap::Grayscale);
        assert_eq!(img.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(1, 0), &Rgb([128, 128, 128]));
        assert_eq!(img.get_pixel(2, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn jet_runs_from_blue_to_red() {
        assert_eq!(ColorMap::Jet.color(0.0), Rgb([0, 0, 255]));
        assert_eq!(ColorMap::Jet.color(1.0), Rgb([255, 0, 0]));
        assert_eq!(ColorMap::Jet.color(0.5)[1], 255);
    }

    #[test]
    fn empty_map_renders_empty() {
        assert_eq!(visualize(&DisparityMap::empty(), ColorMap::Jet).dimensions(), (0, 0));
        assert_eq!("Gray".parse::<ColorMap>().unwrap(), ColorMap::Grayscale);
        assert!("viridis".parse::<ColorMap>().is_err());
    }
}
