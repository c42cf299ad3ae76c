//! Equirectangular compositing.
//!
//! Every panorama pixel `(c, r)` of a `W × H` target looks along
//! `(cos φ cos θ, cos φ sin θ, sin φ)` with `φ = π (0.5 - r / H)` and
//! `θ = 2π (W - c - 1) / W`, so the world `z` axis points to the top row.
//! Frames are splatted by projecting those directions into each image and
//! blending the samples with a weight that fades towards the image border.

use crate::util::{sample_bilinear, to_rgb8};
use image::{Rgb, Rgb32FImage, RgbImage};
use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use std::f64::consts::PI;

/// Pixels with less accumulated weight than this stay black.
const MIN_WEIGHT: f32 = 1e-5;
/// Weight floor so the outermost ring of an image still contributes.
const BORDER_BIAS: f64 = 0.05;

/// World direction seen by panorama pixel `(column, row)`.
pub fn equirect_direction(column: u32, row: u32, width: u32, height: u32) -> Vector3<f64> {
    pixel_direction(column as f64, row as f64, width, height)
}

/// Same mapping at a subpixel position.
pub fn pixel_direction(x: f64, y: f64, width: u32, height: u32) -> Vector3<f64> {
    let phi = PI * (0.5 - y / height as f64);
    let theta = (width as f64 - x - 1.0) / width as f64 * 2.0 * PI;
    Vector3::new(phi.cos() * theta.cos(), phi.cos() * theta.sin(), phi.sin())
}

/// Blending weight of a sample at `(u, v)` in a `width × height` image.
pub fn border_weight(u: f64, v: f64, width: u32, height: u32) -> f64 {
    let (w, h) = (width as f64, height as f64);
    let horizontal = u.min(w - u - 1.0) / w;
    let vertical = v.min(h - v - 1.0) / h;
    horizontal.min(vertical) + BORDER_BIAS
}

/// Weighted running sum of the frames of one exposure level.
#[derive(Debug, Clone)]
pub struct Panorama {
    width: u32,
    height: u32,
    directions: Vec<Vector3<f64>>,
    sums: Rgb32FImage,
    weights: Vec<f32>,
}

impl Panorama {
    pub fn new(width: u32, height: u32) -> Self {
        let directions = (0..height)
            .flat_map(|r| (0..width).map(move |c| equirect_direction(c, r, width, height)))
            .collect();
        Self {
            width,
            height,
            directions,
            sums: Rgb32FImage::new(width, height),
            weights: vec![0.0; (width * height) as usize],
        }
    }

    /// Adds `image`, taken with camera matrix `k` and world-to-camera
    /// rotation `rotation`. Returns the number of panorama pixels it covered.
    pub fn splat(&mut self, image: &RgbImage, k: &Matrix3<f64>, rotation: &UnitQuaternion<f64>) -> usize {
        let (iw, ih) = image.dimensions();
        let to_image = k * rotation.to_rotation_matrix().into_inner();
        let mut covered = 0;
        for (index, direction) in self.directions.iter().enumerate() {
            let p = to_image * direction;
            if p.z <= 0.0 {
                continue;
            }
            let (u, v) = (p.x / p.z, p.y / p.z);
            let Some(colour) = sample_bilinear(image, u, v) else {
                continue;
            };
            let weight = border_weight(u, v, iw, ih) as f32;
            let (x, y) = (index as u32 % self.width, index as u32 / self.width);
            let sum = self.sums.get_pixel_mut(x, y);
            for c in 0..3 {
                sum[c] += colour[c] * weight;
            }
            self.weights[index] += weight;
            covered += 1;
        }
        covered
    }

    /// Normalized panorama; pixels no frame reached are black.
    pub fn resolve(&self) -> RgbImage {
        let mut normalized = Rgb32FImage::new(self.width, self.height);
        for (index, &weight) in self.weights.iter().enumerate() {
            if weight <= MIN_WEIGHT {
                continue;
            }
            let (x, y) = (index as u32 % self.width, index as u32 / self.width);
            let sum = self.sums.get_pixel(x, y);
            normalized.put_pixel(x, y, Rgb([sum[0] / weight, sum[1] / weight, sum[2] / weight]));
        }
        to_rgb8(&normalized)
    }
}
