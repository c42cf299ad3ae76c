//! Recursive region splitting of an equirectangular light probe.
//!
//! The luminance of every row is scaled by the cosine of its latitude so
//! that the over-represented poles do not attract all the cuts. Starting
//! from the whole image, each region is cut in two along the axis and
//! position chosen by the [`SplitStrategy`]; after `depth` levels every
//! leaf becomes one directional light.

use super::moments::{Moments, Region};
use super::{LightError, LightSource};
use crate::config::SamplerConfig;
use crate::environment::projection::pixel_direction;
use crate::util::luminance;
use image::{Rgb, Rgb32FImage, RgbImage};
use log::debug;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Relative difference below which two candidate cuts are a tie; ties go to
/// the first candidate and to vertical cuts, keeping symmetric inputs
/// symmetric despite rounding.
const TIE: f64 = 1e-9;

/// How a region is cut in two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStrategy {
    /// Balance the luminance of both halves.
    MedianCut,
    /// Minimize the larger of the two halves' spatial luminance variance.
    VarianceCut,
}

pub struct LightProbeSampler {
    depth: usize,
    strategy: SplitStrategy,
    image: Rgb32FImage,
    m00: Moments<0, 0>,
    m10: Moments<1, 0>,
    m01: Moments<0, 1>,
    m20: Moments<2, 0>,
    m02: Moments<0, 2>,
}

impl std::fmt::Debug for LightProbeSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightProbeSampler")
            .field("depth", &self.depth)
            .field("strategy", &self.strategy)
            .field("size", &self.image.dimensions())
            .finish()
    }
}

/// Latitude of the centre of row `y`.
fn latitude(y: usize, height: usize) -> f64 {
    PI * (0.5 - (y as f64 + 0.5) / height as f64)
}

fn is_better(candidate: f64, best: Option<f64>) -> bool {
    best.map_or(true, |b| candidate < b - TIE * b.abs().max(1.0))
}

impl LightProbeSampler {
    /// Samples a linear radiance map.
    pub fn new(image: Rgb32FImage, depth: usize, strategy: SplitStrategy) -> Result<Self, LightError> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        if width == 0 || height == 0 {
            return Err(LightError::EmptyImage);
        }

        let mut weighted = Vec::with_capacity(width * height);
        for y in 0..height {
            let w = latitude(y, height).cos();
            for x in 0..width {
                weighted.push(w * luminance(&image.get_pixel(x as u32, y as u32).0));
            }
        }

        Ok(Self {
            depth,
            strategy,
            m00: Moments::new(&weighted, width, height),
            m10: Moments::new(&weighted, width, height),
            m01: Moments::new(&weighted, width, height),
            m20: Moments::new(&weighted, width, height),
            m02: Moments::new(&weighted, width, height),
            image,
        })
    }

    /// Samples an 8-bit panorama, mapping `[0, 255]` to `[0, 1]`.
    pub fn from_rgb8(image: &RgbImage, depth: usize, strategy: SplitStrategy) -> Result<Self, LightError> {
        let scaled = Rgb32FImage::from_fn(image.width(), image.height(), |x, y| {
            Rgb(image.get_pixel(x, y).0.map(|c| c as f32 / 255.0))
        });
        Self::new(scaled, depth, strategy)
    }

    pub fn with_config(image: Rgb32FImage, config: &SamplerConfig) -> Result<Self, LightError> {
        Self::new(image, config.depth, config.strategy)
    }

    /// Returns one light per leaf region, at most `2^depth` of them.
    pub fn sample(&self) -> Vec<LightSource> {
        let (width, height) = self.image.dimensions();
        let mut lights = Vec::with_capacity(1 << self.depth.min(16));
        self.split(Region::new(0, 0, height as usize - 1, width as usize - 1), 0, &mut lights);
        debug!("{:?} produced {} lights", self.strategy, lights.len());
        lights
    }

    fn split(&self, region: Region, depth: usize, lights: &mut Vec<LightSource>) {
        if depth >= self.depth {
            lights.push(self.light(&region));
            return;
        }

        let mut best_row: Option<(usize, f64)> = None;
        for y in region.y0..region.y1 {
            let (a, b) = region.split_rows(y);
            let cost = self.cost(&a, &b);
            if is_better(cost, best_row.map(|(_, c)| c)) {
                best_row = Some((y, cost));
            }
        }
        let mut best_col: Option<(usize, f64)> = None;
        for x in region.x0..region.x1 {
            let (a, b) = region.split_cols(x);
            let cost = self.cost(&a, &b);
            if is_better(cost, best_col.map(|(_, c)| c)) {
                best_col = Some((x, cost));
            }
        }

        let halves = match (best_row, best_col) {
            (Some((y, row_cost)), Some((_, col_cost))) if is_better(row_cost, Some(col_cost)) => region.split_rows(y),
            (_, Some((x, _))) => region.split_cols(x),
            (Some((y, _)), None) => region.split_rows(y),
            // a single pixel cannot be cut any further
            (None, None) => {
                lights.push(self.light(&region));
                return;
            }
        };
        self.split(halves.0, depth + 1, lights);
        self.split(halves.1, depth + 1, lights);
    }

    /// Score of cutting a region into `a` and `b`; lower is better.
    fn cost(&self, a: &Region, b: &Region) -> f64 {
        match self.strategy {
            SplitStrategy::MedianCut => (self.m00.sum(a) - self.m00.sum(b)).abs(),
            SplitStrategy::VarianceCut => self.variance(a).max(self.variance(b)),
        }
    }

    /// Luminance-weighted spread of pixel positions around the centroid.
    fn variance(&self, region: &Region) -> f64 {
        let m00 = self.m00.sum(region);
        if m00 <= 0.0 {
            return 0.0;
        }
        let (m10, m01) = (self.m10.sum(region), self.m01.sum(region));
        let (y, x) = (m10 / m00, m01 / m00);
        self.m20.sum(region) + self.m02.sum(region) - 2.0 * (x * m01 + y * m10) + m00 * (x * x + y * y)
    }

    /// Luminance centroid `(x, y)`, the geometric centre for a black region.
    fn centroid(&self, region: &Region) -> (f64, f64) {
        let m00 = self.m00.sum(region);
        if m00 <= f64::EPSILON {
            return region.centre();
        }
        (self.m01.sum(region) / m00, self.m10.sum(region) / m00)
    }

    fn light(&self, region: &Region) -> LightSource {
        let (width, height) = self.image.dimensions();
        let (cx, cy) = self.centroid(region);

        // pixels close to the centroid dominate the colour
        let mut sum = [0.0f64; 3];
        let mut total = 0.0;
        for y in region.y0..=region.y1 {
            for x in region.x0..=region.x1 {
                let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                let w = 1.0 / (d2 + 1.0);
                let p = self.image.get_pixel(x as u32, y as u32);
                for c in 0..3 {
                    sum[c] += w * p[c] as f64;
                }
                total += w;
            }
        }

        // solid angle of the region, relative to π
        let pixel = (2.0 * PI / width as f64) * (PI / height as f64);
        let rows: f64 = (region.y0..=region.y1)
            .map(|y| latitude(y, height as usize).cos())
            .sum();
        let scale = region.width() as f64 * rows * pixel / PI;

        let diffuse = sum.map(|s| s / total * scale);
        let direction = -pixel_direction(cx, cy, width, height);
        LightSource {
            direction,
            ambient: diffuse.map(|c| c / 5.0),
            diffuse,
            specular: diffuse.map(|c| c * 1.5),
            region: *region,
            centroid: [cx, cy],
        }
    }
}
