//! Image helpers shared by the feature extractor, the environment builder
//! and the light-probe samplers.

use image::{GrayImage, Rgb, Rgb32FImage, RgbImage};
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for UtilError {
    fn from(err: std::io::Error) -> Self {
        UtilError::IOError(err.to_string())
    }
}

impl From<image::ImageError> for UtilError {
    fn from(err: image::ImageError) -> Self {
        UtilError::IOError(err.to_string())
    }
}

/// Convert RGB image to grayscale
pub fn rgb_to_grayscale(img: &RgbImage) -> GrayImage {
    let (width, height) = img.dimensions();
    let mut gray_img = GrayImage::new(width, height);

    for (x, y, pixel) in img.enumerate_pixels() {
        let gray_value =
            (0.299 * pixel[0] as f64 + 0.587 * pixel[1] as f64 + 0.114 * pixel[2] as f64) as u8;
        gray_img.put_pixel(x, y, image::Luma([gray_value]));
    }

    gray_img
}

/// Relative luminance of a linear RGB triple.
pub fn luminance(pixel: &[f32; 3]) -> f64 {
    0.2125 * pixel[0] as f64 + 0.7154 * pixel[1] as f64 + 0.0721 * pixel[2] as f64
}

/// Bilinearly interpolates an 8-bit colour image at a subpixel location.
///
/// Returns `None` outside the image; the last row and column are sampled
/// by clamping the neighbour.
pub fn sample_bilinear(img: &RgbImage, x: f64, y: f64) -> Option<[f32; 3]> {
    let (width, height) = img.dimensions();
    let (max_x, max_y) = ((width.max(1) - 1) as f64, (height.max(1) - 1) as f64);
    let tolerance = 1e-9;
    if width == 0 || height == 0 || x < -tolerance || y < -tolerance || x > max_x + tolerance || y > max_y + tolerance {
        return None;
    }
    let (x, y) = (x.clamp(0.0, max_x), y.clamp(0.0, max_y));
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = (x - x0 as f64) as f32;
    let fy = (y - y0 as f64) as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut out = [0.0f32; 3];
    for (c, value) in out.iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *value = top * (1.0 - fy) + bottom * fy;
    }
    Some(out)
}

/// Converts a floating point image to 8 bits, clamping to `[0, 255]`.
pub fn to_rgb8(img: &Rgb32FImage) -> RgbImage {
    RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y);
        Rgb([0, 1, 2].map(|c| p[c].round().clamp(0.0, 255.0) as u8))
    })
}

/// Load an image from file path
pub fn load_image(image_path: &str) -> Result<RgbImage, UtilError> {
    let img = image::open(image_path)
        .map_err(|e| UtilError::InvalidParams(format!("Failed to load image: {e}")))?;

    Ok(img.to_rgb8())
}

/// Saves an image, creating the parent directory if needed.
pub fn save_image(image: &RgbImage, path: &str) -> Result<(), UtilError> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    image.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rgb_to_grayscale() {
        let img = RgbImage::from_pixel(4, 3, Rgb([200, 100, 50]));
        let gray = rgb_to_grayscale(&img);
        assert_eq!(gray.dimensions(), (4, 3));
        assert_eq!(gray.get_pixel(2, 1)[0], (0.299 * 200.0 + 0.587 * 100.0 + 0.114 * 50.0) as u8);
    }

    #[test]
    fn test_sample_bilinear_interpolates() {
        let img = RgbImage::from_fn(2, 2, |x, _| if x == 0 { Rgb([0, 0, 0]) } else { Rgb([100, 200, 50]) });
        let p = sample_bilinear(&img, 0.25, 0.5).unwrap();
        assert_relative_eq!(p[0], 25.0);
        assert_relative_eq!(p[1], 50.0);
        assert!(sample_bilinear(&img, 1.5, 0.0).is_none());
        assert!(sample_bilinear(&img, -0.1, 0.0).is_none());
    }

    #[test]
    fn test_save_and_load_image() {
        let img = RgbImage::from_fn(6, 4, |x, y| Rgb([(x * 40) as u8, (y * 60) as u8, 7]));
        let dir = std::env::temp_dir().join("mobile_ar_util_test");
        let path = dir.join("nested").join("image.png");
        let path = path.to_str().unwrap();
        save_image(&img, path).unwrap();
        assert_eq!(load_image(path).unwrap(), img);
        std::fs::remove_dir_all(&dir).unwrap();
        assert!(matches!(load_image(path), Err(UtilError::InvalidParams(_))));
    }

    #[test]
    fn test_luminance_weights_sum_to_one() {
        assert_relative_eq!(luminance(&[1.0, 1.0, 1.0]), 1.0, epsilon = 1e-12);
    }
}
