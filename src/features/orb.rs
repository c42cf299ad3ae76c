//! ORB: FAST-9 corners on a scale pyramid, ranked by the Harris response,
//! oriented by their intensity centroid and described by steered BRIEF.

use super::{Descriptor, FeatureExtractor, Keypoint};
use image::{imageops, GrayImage};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Bresenham circle of radius 3 around the candidate pixel.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Minimum number of contiguous circle pixels that must all be brighter or darker.
const ARC_LENGTH: usize = 9;

const HARRIS_K: f64 = 0.04;
const HARRIS_RADIUS: i32 = 3;

/// Sampling pairs of the BRIEF test lie in a square of this half-size.
const PATTERN_RADIUS: i32 = 13;
const PATTERN_SEED: u64 = 0x0b1e_f00d;
const DESCRIPTOR_BITS: usize = 256;

/// Gaussian smoothing applied before the binary tests.
const DESCRIPTOR_SIGMA: f32 = 2.0;

/// Oriented FAST and rotated BRIEF feature extractor.
#[derive(Debug, Clone)]
pub struct OrbExtractor {
    pub n_features: usize,
    pub scale_factor: f64,
    pub n_levels: u32,
    pub patch_size: i32,
    pub fast_threshold: u8,
    pattern: Vec<[(f64, f64); 2]>,
}

impl Default for OrbExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl OrbExtractor {
    pub fn new() -> Self {
        Self {
            n_features: 500,
            scale_factor: 1.2,
            n_levels: 8,
            patch_size: 31,
            fast_threshold: 20,
            pattern: brief_pattern(),
        }
    }

    pub fn with_n_features(mut self, n: usize) -> Self {
        self.n_features = n;
        self
    }

    pub fn with_scale_factor(mut self, scale: f64) -> Self {
        self.scale_factor = scale;
        self
    }

    pub fn with_n_levels(mut self, levels: u32) -> Self {
        self.n_levels = levels.max(1);
        self
    }

    pub fn with_fast_threshold(mut self, threshold: u8) -> Self {
        self.fast_threshold = threshold;
        self
    }

    /// Distance from the image border a keypoint must keep so that the
    /// orientation patch and every rotated BRIEF test stay inside the image.
    fn border(&self) -> i32 {
        (self.patch_size / 2).max((PATTERN_RADIUS as f64 * std::f64::consts::SQRT_2).ceil() as i32)
            + HARRIS_RADIUS
            + 2
    }

    /// Number of features each pyramid level may contribute.
    fn level_budgets(&self) -> Vec<usize> {
        let levels = self.n_levels.max(1) as i32;
        let factor = 1.0 / self.scale_factor;
        let first = if (factor - 1.0).abs() < 1e-12 {
            self.n_features as f64 / levels as f64
        } else {
            self.n_features as f64 * (1.0 - factor) / (1.0 - factor.powi(levels))
        };

        let mut budgets = Vec::with_capacity(levels as usize);
        let mut assigned = 0;
        for level in 0..levels - 1 {
            let n = (first * factor.powi(level)).round() as usize;
            let n = n.min(self.n_features - assigned);
            budgets.push(n);
            assigned += n;
        }
        budgets.push(self.n_features - assigned);
        budgets
    }

    /// Detects and describes keypoints on a single pyramid level.
    fn process_level(&self, image: &GrayImage, level: u32, budget: usize) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let border = self.border();
        let (width, height) = (image.width() as i32, image.height() as i32);
        if budget == 0 || width <= 2 * border || height <= 2 * border {
            return (Vec::new(), Vec::new());
        }

        let mut candidates: Vec<Keypoint> = fast_detect(image, self.fast_threshold)
            .into_iter()
            .filter(|&(x, y)| x >= border && y >= border && x < width - border && y < height - border)
            .map(|(x, y)| Keypoint::new(x as f64, y as f64).with_response(harris_response(image, x, y)))
            .collect();
        candidates.sort_by(|a, b| b.response.total_cmp(&a.response));
        candidates.truncate(budget);

        let smoothed = imageops::blur(image, DESCRIPTOR_SIGMA);
        let scale = self.scale_factor.powi(level as i32);
        let mut keypoints = Vec::with_capacity(candidates.len());
        let mut descriptors = Vec::with_capacity(candidates.len());
        for kp in candidates {
            let (x, y) = (kp.x as i32, kp.y as i32);
            let angle = intensity_centroid_angle(image, x, y, self.patch_size / 2);
            descriptors.push(steered_brief(&smoothed, x, y, angle, &self.pattern));
            keypoints.push(
                Keypoint::new(kp.x * scale, kp.y * scale)
                    .with_angle(angle)
                    .with_response(kp.response)
                    .with_octave(level)
                    .with_size(self.patch_size as f64 * scale),
            );
        }
        (keypoints, descriptors)
    }
}

impl FeatureExtractor for OrbExtractor {
    fn detect_and_compute(&self, image: &GrayImage) -> (Vec<Keypoint>, Vec<Descriptor>) {
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();

        for (level, budget) in self.level_budgets().into_iter().enumerate() {
            let scale = self.scale_factor.powi(level as i32);
            let scaled = if level == 0 {
                image.clone()
            } else {
                scale_image(image, scale)
            };
            let (kps, descs) = self.process_level(&scaled, level as u32, budget);
            keypoints.extend(kps);
            descriptors.extend(descs);
        }

        debug!(
            "ORB extracted {} features from a {}x{} image",
            keypoints.len(),
            image.width(),
            image.height()
        );
        (keypoints, descriptors)
    }
}

/// FAST-9 segment test followed by 3x3 non-maximum suppression.
///
/// Returns the pixel coordinates of the surviving corners.
pub fn fast_detect(image: &GrayImage, threshold: u8) -> Vec<(i32, i32)> {
    let (width, height) = (image.width() as i32, image.height() as i32);
    if width < 7 || height < 7 {
        return Vec::new();
    }

    let mut scores = vec![0u32; (width * height) as usize];
    for y in 3..height - 3 {
        for x in 3..width - 3 {
            scores[(y * width + x) as usize] = segment_score(image, x, y, threshold);
        }
    }

    let mut corners = Vec::new();
    for y in 3..height - 3 {
        for x in 3..width - 3 {
            let score = scores[(y * width + x) as usize];
            if score == 0 {
                continue;
            }
            let mut is_max = true;
            'window: for dy in -1..=1 {
                for dx in -1..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let other = scores[((y + dy) * width + x + dx) as usize];
                    // ties are broken towards the earlier pixel in scan order
                    if other > score || (other == score && (dy < 0 || (dy == 0 && dx < 0))) {
                        is_max = false;
                        break 'window;
                    }
                }
            }
            if is_max {
                corners.push((x, y));
            }
        }
    }
    corners
}

/// Score of the segment test at `(x, y)`; zero if the pixel is not a corner.
fn segment_score(image: &GrayImage, x: i32, y: i32, threshold: u8) -> u32 {
    let p = image.get_pixel(x as u32, y as u32)[0] as i32;
    let t = threshold as i32;

    let mut diffs = [0i32; 16];
    for (i, &(dx, dy)) in CIRCLE.iter().enumerate() {
        diffs[i] = image.get_pixel((x + dx) as u32, (y + dy) as u32)[0] as i32 - p;
    }

    let mut best = 0u32;
    for sign in [1i32, -1] {
        let mut run = 0;
        let mut longest = 0;
        for i in 0..CIRCLE.len() + ARC_LENGTH - 1 {
            if sign * diffs[i % 16] > t {
                run += 1;
                longest = longest.max(run);
            } else {
                run = 0;
            }
        }
        if longest >= ARC_LENGTH {
            let score: i32 = diffs
                .iter()
                .map(|d| sign * d - t)
                .filter(|d| *d > 0)
                .sum();
            best = best.max(score as u32);
        }
    }
    best
}

/// Harris corner measure over a 7x7 window of Sobel gradients.
fn harris_response(image: &GrayImage, x: i32, y: i32) -> f64 {
    let at = |u: i32, v: i32| image.get_pixel(u as u32, v as u32)[0] as f64;

    let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
    for v in y - HARRIS_RADIUS..=y + HARRIS_RADIUS {
        for u in x - HARRIS_RADIUS..=x + HARRIS_RADIUS {
            let ix = (at(u + 1, v - 1) + 2.0 * at(u + 1, v) + at(u + 1, v + 1))
                - (at(u - 1, v - 1) + 2.0 * at(u - 1, v) + at(u - 1, v + 1));
            let iy = (at(u - 1, v + 1) + 2.0 * at(u, v + 1) + at(u + 1, v + 1))
                - (at(u - 1, v - 1) + 2.0 * at(u, v - 1) + at(u + 1, v - 1));
            a += ix * ix;
            b += iy * iy;
            c += ix * iy;
        }
    }
    a * b - c * c - HARRIS_K * (a + b) * (a + b)
}

/// Orientation of the vector from the keypoint to the intensity centroid of a disc.
fn intensity_centroid_angle(image: &GrayImage, x: i32, y: i32, radius: i32) -> f64 {
    let mut m01 = 0.0f64;
    let mut m10 = 0.0f64;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let intensity = image.get_pixel((x + dx) as u32, (y + dy) as u32)[0] as f64;
            m10 += intensity * dx as f64;
            m01 += intensity * dy as f64;
        }
    }
    m01.atan2(m10)
}

/// Binary intensity tests rotated to the keypoint orientation.
fn steered_brief(image: &GrayImage, x: i32, y: i32, angle: f64, pattern: &[[(f64, f64); 2]]) -> Descriptor {
    let (sin_a, cos_a) = angle.sin_cos();
    let sample = |(px, py): (f64, f64)| {
        let rx = (cos_a * px - sin_a * py).round() as i32;
        let ry = (sin_a * px + cos_a * py).round() as i32;
        image.get_pixel((x + rx) as u32, (y + ry) as u32)[0]
    };

    let mut bytes = [0u8; 32];
    for (bit, pair) in pattern.iter().enumerate() {
        if sample(pair[0]) < sample(pair[1]) {
            bytes[bit / 8] |= 1 << (bit % 8);
        }
    }
    Descriptor(bytes)
}

/// Deterministic BRIEF sampling pattern shared by every extractor.
fn brief_pattern() -> Vec<[(f64, f64); 2]> {
    let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
    let mut point = || {
        (
            rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS) as f64,
            rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS) as f64,
        )
    };

    let mut pattern = Vec::with_capacity(DESCRIPTOR_BITS);
    while pattern.len() < DESCRIPTOR_BITS {
        let (a, b) = (point(), point());
        if a != b {
            pattern.push([a, b]);
        }
    }
    pattern
}

fn scale_image(image: &GrayImage, scale: f64) -> GrayImage {
    let new_width = ((image.width() as f64 / scale).round() as u32).max(1);
    let new_height = ((image.height() as f64 / scale).round() as u32).max(1);

    imageops::resize(image, new_width, new_height, imageops::FilterType::Triangle)
}
