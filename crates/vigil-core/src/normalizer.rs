//! Face normalization: crop a located region and resample it to a fixed
//! `TEMPLATE_SIZE`×`TEMPLATE_SIZE` template.

use crate::types::{FaceRect, FaceTemplate, TEMPLATE_SIZE};
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("cannot normalize a face from an empty image")]
    EmptyImage,
}

/// Crop `rect` out of `image` and resize it to a face template.
///
/// The region is first clamped to the image; a region lying entirely outside
/// collapses to the nearest border pixel. Deterministic for equal inputs.
pub fn normalize(image: &GrayImage, rect: FaceRect) -> Result<FaceTemplate, NormalizeError> {
    let region = rect
        .clamp_to(image.width(), image.height())
        .ok_or(NormalizeError::EmptyImage)?;

    let pixels = resample(image, region, TEMPLATE_SIZE as usize);
    GrayImage::from_raw(TEMPLATE_SIZE, TEMPLATE_SIZE, pixels)
        .and_then(FaceTemplate::from_image)
        .ok_or(NormalizeError::EmptyImage)
}

/// Largest region by area; the first one wins on ties.
pub fn largest_region(regions: impl IntoIterator<Item = FaceRect>) -> Option<FaceRect> {
    regions.into_iter().fold(None, |best, r| match best {
        Some(b) if b.area() >= r.area() => Some(b),
        _ => Some(r),
    })
}

/// Bilinear resample of `region` into an `out_size`×`out_size` buffer.
///
/// Pixel centers are aligned, and samples are clamped to the region so the
/// border never bleeds in from outside it.
fn resample(image: &GrayImage, region: FaceRect, out_size: usize) -> Vec<u8> {
    let src = image.as_raw();
    let stride = image.width() as usize;
    let (rx, ry) = (region.x as usize, region.y as usize);
    let (rw, rh) = (region.width as usize, region.height as usize);
    let scale_x = rw as f32 / out_size as f32;
    let scale_y = rh as f32 / out_size as f32;

    let sample = |x: usize, y: usize| -> f32 { src[(ry + y) * stride + rx + x] as f32 };

    let mut output = vec![0u8; out_size * out_size];
    for oy in 0..out_size {
        let sy = ((oy as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (rh - 1) as f32);
        let y0 = sy.floor() as usize;
        let y1 = (y0 + 1).min(rh - 1);
        let fy = sy - y0 as f32;

        for ox in 0..out_size {
            let sx = ((ox as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (rw - 1) as f32);
            let x0 = sx.floor() as usize;
            let x1 = (x0 + 1).min(rw - 1);
            let fx = sx - x0 as f32;

            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x1, y0) * fx * (1.0 - fy)
                + sample(x0, y1) * (1.0 - fx) * fy
                + sample(x1, y1) * fx * fy;

            output[oy * out_size + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_output_is_template_sized() {
        let image = GrayImage::from_pixel(640, 480, Luma([128]));
        let template = normalize(&image, FaceRect::new(100, 100, 150, 120)).unwrap();
        assert_eq!((template.width(), template.height()), (TEMPLATE_SIZE, TEMPLATE_SIZE));
        assert!(template.as_raw().iter().all(|&p| p == 128));
    }

    #[test]
    fn test_crop_stays_inside_region() {
        // Bright square at (50..150, 50..150), dark elsewhere.
        let image = GrayImage::from_fn(300, 300, |x, y| {
            let inside = (50..150).contains(&x) && (50..150).contains(&y);
            Luma([if inside { 200 } else { 10 }])
        });
        let template = normalize(&image, FaceRect::new(50, 50, 100, 100)).unwrap();
        assert!(template.as_raw().iter().all(|&p| p == 200));
    }

    #[test]
    fn test_overshooting_region_is_clamped() {
        let image = GrayImage::from_fn(100, 100, |x, _| Luma([x as u8]));
        let template = normalize(&image, FaceRect::new(60, 60, 500, 500)).unwrap();
        let raw = template.as_raw();
        assert_eq!(raw[0], 60);
        assert_eq!(raw[TEMPLATE_SIZE as usize - 1], 99);
    }

    #[test]
    fn test_region_outside_image_collapses_to_border_pixel() {
        let image = GrayImage::from_fn(40, 30, |x, y| Luma([(x + y) as u8]));
        let template = normalize(&image, FaceRect::new(1000, 1000, 20, 20)).unwrap();
        assert!(template.as_raw().iter().all(|&p| p == 39 + 29));
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let image = GrayImage::new(0, 0);
        assert_eq!(
            normalize(&image, FaceRect::new(0, 0, 10, 10)),
            Err(NormalizeError::EmptyImage)
        );
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let image = GrayImage::from_fn(320, 240, |x, y| Luma([((x * 7 + y * 13) % 256) as u8]));
        let rect = FaceRect::new(33, 21, 117, 143);
        assert_eq!(normalize(&image, rect), normalize(&image, rect));
    }

    #[test]
    fn test_largest_region() {
        let regions = vec![
            FaceRect::new(0, 0, 10, 10),
            FaceRect::new(5, 5, 30, 20),
            FaceRect::new(9, 9, 20, 30),
        ];
        assert_eq!(largest_region(regions), Some(FaceRect::new(5, 5, 30, 20)));
        assert_eq!(largest_region(Vec::new()), None);
    }
}
