use cv_core::Rect;
use cv_imgproc::*;
use image::{GrayImage, Luma};

fn gradient(width: u32, height: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| Luma([(x * 4 + y * 2) as u8]))
}

fn shift_tables(width: u32, height: u32, dx: f32, dy: f32) -> (Vec<f32>, Vec<f32>) {
    (0..height)
        .flat_map(|y| (0..width).map(move |x| (x as f32 + dx, y as f32 + dy)))
        .unzip()
}

#[test]
fn integer_shift_moves_pixels() {
    let img = gradient(16, 12);
    let (map_x, map_y) = shift_tables(16, 12, 2.0, 1.0);
    for interpolation in [Interpolation::Linear, Interpolation::Nearest] {
        let out = remap_region(&img, &map_x, &map_y, 16, Rect::full(16, 12), interpolation, 0)
            .unwrap();
        assert_eq!(out.get_pixel(0, 0), img.get_pixel(2, 1));
        assert_eq!(out.get_pixel(10, 7), img.get_pixel(12, 8));
        assert_eq!(out.get_pixel(15, 11)[0], 0);
    }
}

#[test]
fn region_equals_crop_of_full_frame() {
    let img = gradient(20, 10);
    let (map_x, map_y) = shift_tables(20, 10, 0.5, 0.25);
    let full = remap_region(&img, &map_x, &map_y, 20, Rect::full(20, 10), Interpolation::Linear, 0)
        .unwrap();
    let region = Rect::new(3, 2, 9, 5);
    let part = remap_region(&img, &map_x, &map_y, 20, region, Interpolation::Linear, 0).unwrap();

    assert_eq!(part.dimensions(), (9, 5));
    for y in 0..5 {
        for x in 0..9 {
            assert_eq!(part.get_pixel(x, y), full.get_pixel(x + 3, y + 2));
        }
    }
}

#[test]
fn malformed_tables_are_rejected() {
    let img = gradient(4, 4);
    let (map_x, map_y) = shift_tables(4, 4, 0.0, 0.0);
    let full = Rect::full(4, 4);
    assert!(remap_region(&img, &map_x, &map_y[..8], 4, full, Interpolation::Nearest, 0).is_err());
    assert!(remap_region(&img, &map_x[..15], &map_y[..15], 4, full, Interpolation::Nearest, 0).is_err());
    assert!(remap_region(&img, &map_x, &map_y, 0, full, Interpolation::Nearest, 0).is_err());
}
