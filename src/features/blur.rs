//! Blur estimation from a three-level Haar wavelet decomposition.
//!
//! Edges are classified by how their energy evolves across scales: sharp
//! Dirac and abrupt step edges lose energy at coarser levels, while roof and
//! gradual step edges gain it. The share of sharp edges (`per`) tells whether
//! the image is in focus; the share of gradual edges that are too weak at the
//! finest scale is the blur extent.

use image::GrayImage;

/// Window sizes of the local maxima at levels 1..=3, so every level yields
/// one value per 8x8 block of the input.
const WINDOWS: [usize; 3] = [4, 2, 1];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlurDetector {
    /// Minimum edge energy for a block to count as an edge.
    pub threshold: f32,
}

impl Default for BlurDetector {
    fn default() -> Self {
        Self { threshold: 35.0 }
    }
}

/// Dense row-major single-channel buffer.
struct Plane {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Plane {
    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    fn at(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    fn set(&mut self, r: usize, c: usize, value: f32) {
        self.data[r * self.cols + c] = value;
    }
}

impl BlurDetector {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Returns `(per, blur_extent)` for a grayscale image, both zero if the
    /// image has no edges at all.
    pub fn detect(&self, gray: &GrayImage) -> (f32, f32) {
        self.analyze(gray).unwrap_or((0.0, 0.0))
    }

    /// Like [`Self::detect`], but `None` for an edgeless image, whose
    /// sharpness cannot be judged.
    ///
    /// The image is cropped to a multiple of 16 pixels.
    pub fn analyze(&self, gray: &GrayImage) -> Option<(f32, f32)> {
        let rows = (gray.height() as usize >> 4) << 4;
        let cols = (gray.width() as usize >> 4) << 4;
        if rows == 0 || cols == 0 {
            return None;
        }

        let mut ll = Plane::zeros(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                ll.set(r, c, gray.get_pixel(c as u32, r as u32)[0] as f32);
            }
        }

        let mut maxima = Vec::with_capacity(WINDOWS.len());
        for window in WINDOWS {
            let (next, energy) = haar_level(&ll);
            maxima.push(local_maxima(&energy, window));
            ll = next;
        }

        let (mut n_edge, mut n_da, mut n_rg, mut n_brg) = (0usize, 0usize, 0usize, 0usize);
        for (i, &e1) in maxima[0].data.iter().enumerate() {
            let (e2, e3) = (maxima[1].data[i], maxima[2].data[i]);
            if e1 < self.threshold && e2 < self.threshold && e3 < self.threshold {
                continue;
            }
            n_edge += 1;

            if e1 > e2 && e2 > e3 {
                n_da += 1;
                continue;
            }

            if e1 < e2 && (e2 < e3 || e3 < e2) {
                n_rg += 1;
                if e1 < self.threshold {
                    n_brg += 1;
                }
            }
        }

        if n_edge == 0 {
            return None;
        }
        let per = n_da as f32 / n_edge as f32;
        let blur_extent = if n_rg == 0 { 0.0 } else { n_brg as f32 / n_rg as f32 };
        Some((per, blur_extent))
    }

    /// True if the sharp-edge share falls below `min_per`.
    pub fn is_blurry(&self, gray: &GrayImage, min_per: f32) -> bool {
        self.detect(gray).0 < min_per
    }
}

/// One Haar step: the low-pass image at half resolution and the edge energy
/// `HH² + HL² + LH²`.
fn haar_level(ll0: &Plane) -> (Plane, Plane) {
    let (rows, cols) = (ll0.rows / 2, ll0.cols / 2);
    let mut ll = Plane::zeros(rows, cols);
    let mut energy = Plane::zeros(rows, cols);
    for r in 0..rows {
        for c in 0..cols {
            let p00 = ll0.at(2 * r, 2 * c);
            let p01 = ll0.at(2 * r, 2 * c + 1);
            let p10 = ll0.at(2 * r + 1, 2 * c);
            let p11 = ll0.at(2 * r + 1, 2 * c + 1);

            let hh = (p00 + p11 - p10 - p01) * 0.5;
            let hl = (p00 + p10 - p11 - p01) * 0.5;
            let lh = (p00 + p01 - p10 - p11) * 0.5;
            ll.set(r, c, (p00 + p01 + p10 + p11) * 0.5);
            energy.set(r, c, hh * hh + hl * hl + lh * lh);
        }
    }
    (ll, energy)
}

fn local_maxima(energy: &Plane, window: usize) -> Plane {
    let mut out = Plane::zeros(energy.rows / window, energy.cols / window);
    for r in 0..out.rows {
        for c in 0..out.cols {
            let mut max = 0.0f32;
            for dr in 0..window {
                for dc in 0..window {
                    max = max.max(energy.at(r * window + dr, c * window + dc));
                }
            }
            out.set(r, c, max);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_black_image_has_no_edges() {
        let detector = BlurDetector::default();
        assert_eq!(detector.detect(&GrayImage::new(128, 128)), (0.0, 0.0));
        assert!(detector.is_blurry(&GrayImage::new(128, 128), 0.01));
    }

    #[test]
    fn test_tiny_image() {
        assert_eq!(BlurDetector::default().detect(&GrayImage::new(10, 10)), (0.0, 0.0));
        assert!(BlurDetector::default().analyze(&GrayImage::new(128, 128)).is_none());
    }

    #[test]
    fn test_noise_is_sharp() {
        let mut rng = StdRng::seed_from_u64(1);
        let image = GrayImage::from_fn(128, 128, |_, _| Luma([rng.gen()]));
        let (per, _) = BlurDetector::default().detect(&image);
        assert!(per > 0.3, "per = {per}");
    }

    #[test]
    fn test_smooth_gradient_is_blurry() {
        let image = GrayImage::from_fn(128, 128, |x, _| {
            Luma([(128.0 + 100.0 * (x as f64 / 20.0).sin()) as u8])
        });
        let (per, blur) = BlurDetector::default().detect(&image);
        assert_eq!(per, 0.0);
        assert!(blur > 0.5);
        assert!(BlurDetector::default().is_blurry(&image, 0.01));
    }
}
