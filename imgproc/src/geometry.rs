use crate::Interpolation;
use cv_core::{Error, Rect, Result};
use image::GrayImage;
use rayon::prelude::*;

/// Reads source pixels, substituting `fill` for anything outside the image.
struct Sampler<'a> {
    src: &'a GrayImage,
    fill: f32,
}

impl Sampler<'_> {
    fn pixel(&self, x: i64, y: i64) -> f32 {
        let (w, h) = self.src.dimensions();
        if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
            return self.fill;
        }
        self.src.as_raw()[y as usize * w as usize + x as usize] as f32
    }

    fn sample(&self, x: f32, y: f32, interpolation: Interpolation) -> f32 {
        if !(x.is_finite() && y.is_finite()) {
            return self.fill;
        }
        match interpolation {
            Interpolation::Nearest => self.pixel(x.round() as i64, y.round() as i64),
            Interpolation::Linear => {
                let (xf, yf) = (x.floor(), y.floor());
                let (ax, ay) = (x - xf, y - yf);
                let (x0, y0) = (xf as i64, yf as i64);
                let top = self.pixel(x0, y0) * (1.0 - ax) + self.pixel(x0 + 1, y0) * ax;
                let bottom = self.pixel(x0, y0 + 1) * (1.0 - ax) + self.pixel(x0 + 1, y0 + 1) * ax;
                top * (1.0 - ay) + bottom * ay
            }
        }
    }
}

/// Apply per-pixel lookup tables to `src`, producing only the pixels inside `region`.
///
/// The tables describe a full `map_width`-wide destination frame: entry `i`
/// holds the source coordinate of destination pixel `i`. The output has the
/// size of `region` and its pixel `(0, 0)` is the table entry at
/// `(region.x, region.y)`. Samples falling outside `src` read as `fill`.
pub fn remap_region(
    src: &GrayImage,
    map_x: &[f32],
    map_y: &[f32],
    map_width: u32,
    region: Rect,
    interpolation: Interpolation,
    fill: u8,
) -> Result<GrayImage> {
    if map_x.len() != map_y.len() {
        return Err(Error::dimension_mismatch(format!(
            "remap tables differ in length: {} vs {}",
            map_x.len(),
            map_y.len()
        )));
    }
    if map_width == 0 || map_x.len() % map_width as usize != 0 {
        return Err(Error::dimension_mismatch(format!(
            "remap table of {} entries is not a multiple of width {}",
            map_x.len(),
            map_width
        )));
    }
    let map_height = (map_x.len() / map_width as usize) as u32;
    if region.is_empty() || region.right() > map_width || region.bottom() > map_height {
        return Err(Error::dimension_mismatch(format!(
            "region {:?} outside {}x{} remap tables",
            region, map_width, map_height
        )));
    }

    let sampler = Sampler {
        src,
        fill: fill as f32,
    };
    let stride = map_width as usize;
    let mut dst = GrayImage::new(region.width, region.height);

    dst.par_chunks_mut(region.width as usize)
        .enumerate()
        .for_each(|(row, out)| {
            let base = (region.y as usize + row) * stride + region.x as usize;
            let xs = &map_x[base..base + out.len()];
            let ys = &map_y[base..base + out.len()];
            for ((px, &sx), &sy) in out.iter_mut().zip(xs).zip(ys) {
                *px = sampler
                    .sample(sx, sy, interpolation)
                    .round()
                    .clamp(0.0, 255.0) as u8;
            }
        });

    Ok(dst)
}
