//! Debevec-Malik response recovery and radiance merging.
//!
//! For pixel value `z` at exposure time `Δt` the camera response satisfies
//! `g(z) = ln E + ln Δt`. Observing a set of pixels across all exposures
//! gives an overdetermined linear system in `g(0..=255)` and the unknown
//! log radiances, regularized by a second-difference smoothness term and
//! pinned by `g(127) = 0`. Each colour channel is recovered separately.

use super::HdrError;
use image::{Rgb, Rgb32FImage, RgbImage};
use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const LEVELS: usize = 256;
/// Pixel value pinned to `g = 0`.
const MIDDLE: usize = 127;
/// Accumulated weight below which a pixel is considered unobserved.
const MIN_WEIGHT: f64 = 1e-5;
const RIDGE: f64 = 1e-10;

/// Hat weighting favouring mid-range pixel values.
fn weight(z: u8) -> f64 {
    let z = z as f64;
    (if z > 128.0 { 256.0 - z } else { z }) / 128.0
}

/// Log exposure `g(z)` of every pixel value.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseCurve(pub [f64; LEVELS]);

impl ResponseCurve {
    pub fn log_exposure(&self, z: u8) -> f64 {
        self.0[z as usize]
    }
}

#[derive(Debug, Clone)]
pub struct HdrBuilder {
    /// Number of pixel locations the response is fitted on.
    pub samples: usize,
    /// Weight of the smoothness term.
    pub smoothness: f64,
    pub seed: u64,
}

impl Default for HdrBuilder {
    fn default() -> Self {
        Self {
            samples: 256,
            smoothness: 50.0,
            seed: 0,
        }
    }
}

/// One colour channel of every exposure, with its exposure time.
pub type Channel = Vec<(Vec<u8>, f64)>;

impl HdrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `(image, exposure time)` pairs into a radiance map.
    ///
    /// Pixels that are black or saturated in every exposure carry no
    /// information and are set to a radiance of one.
    pub fn build(&self, exposures: &[(RgbImage, f64)]) -> Result<Rgb32FImage, HdrError> {
        let Some((first, _)) = exposures.first() else {
            return Err(HdrError::Empty);
        };
        let (width, height) = first.dimensions();
        for (image, dt) in exposures {
            if image.dimensions() != (width, height) {
                return Err(HdrError::SizeMismatch);
            }
            if *dt <= 0.0 || !dt.is_finite() {
                return Err(HdrError::InvalidExposure(*dt));
            }
        }

        let mut radiance = Rgb32FImage::new(width, height);
        for c in 0..3 {
            let channel: Channel = exposures
                .iter()
                .map(|(image, dt)| (image.pixels().map(|p| p[c]).collect(), *dt))
                .collect();
            let curve = self.recover(&channel)?;
            for (i, value) in self.merge(&channel, &curve).into_iter().enumerate() {
                let (x, y) = (i as u32 % width, i as u32 / width);
                let pixel: &mut Rgb<f32> = radiance.get_pixel_mut(x, y);
                pixel[c] = value as f32;
            }
        }
        Ok(radiance)
    }

    /// Pixel locations used to fit the response: one per pixel value seen,
    /// topped up with random pixels that are not black in any exposure.
    fn sample_locations(&self, channel: &Channel) -> Vec<usize> {
        let mut last_seen = [None; LEVELS];
        for (values, _) in channel {
            for (i, &z) in values.iter().enumerate() {
                last_seen[z as usize] = Some(i);
            }
        }
        let pixels = channel.first().map_or(0, |(values, _)| values.len());
        let mut taken = vec![false; pixels];
        let mut locations: Vec<usize> = Vec::with_capacity(self.samples);
        for &i in last_seen.iter().rev().flatten() {
            if !taken[i] {
                taken[i] = true;
                locations.push(i);
            }
        }

        if locations.len() < self.samples {
            let mut candidates: Vec<usize> = (0..pixels)
                .filter(|&i| !taken[i])
                .filter(|&i| channel.iter().all(|(values, _)| values[i] != 0))
                .collect();
            candidates.shuffle(&mut StdRng::seed_from_u64(self.seed));
            let missing = self.samples - locations.len();
            locations.extend(candidates.into_iter().take(missing));
        }
        locations
    }

    /// Solves for the response curve of one channel in the least-squares
    /// sense through the normal equations.
    pub fn recover(&self, channel: &Channel) -> Result<ResponseCurve, HdrError> {
        let locations = self.sample_locations(channel);
        let n = LEVELS + locations.len();
        let mut ata = DMatrix::<f64>::zeros(n, n);
        let mut atb = DVector::<f64>::zeros(n);
        let mut add_row = |entries: &[(usize, f64)], b: f64| {
            for &(i, a) in entries {
                atb[i] += a * b;
                for &(j, c) in entries {
                    ata[(i, j)] += a * c;
                }
            }
        };

        for (values, dt) in channel {
            let log_dt = dt.ln();
            for (k, &location) in locations.iter().enumerate() {
                let z = values[location];
                let w = weight(z);
                add_row(&[(z as usize, w), (LEVELS + k, -w)], w * log_dt);
            }
        }
        add_row(&[(MIDDLE, 1.0)], 0.0);
        for z in 1..LEVELS - 1 {
            let w = self.smoothness * weight(z as u8);
            add_row(&[(z - 1, w), (z, -2.0 * w), (z + 1, w)], 0.0);
        }

        for i in 0..n {
            ata[(i, i)] += RIDGE;
        }
        let solution = ata.cholesky().ok_or(HdrError::Singular)?.solve(&atb);

        let mut g = [0.0; LEVELS];
        g[1..LEVELS - 1].copy_from_slice(&solution.as_slice()[1..LEVELS - 1]);
        g[0] = g[1];
        g[LEVELS - 1] = g[LEVELS - 2];
        debug!("response fitted on {} locations", locations.len());
        Ok(ResponseCurve(g))
    }

    /// Weighted average of the per-exposure radiance estimates.
    fn merge(&self, channel: &Channel, curve: &ResponseCurve) -> Vec<f64> {
        let pixels = channel.first().map_or(0, |(values, _)| values.len());
        (0..pixels)
            .map(|i| {
                let (mut sum, mut total) = (0.0, 0.0);
                for (values, dt) in channel {
                    let z = values[i];
                    let w = weight(z);
                    sum += w * (curve.log_exposure(z) - dt.ln());
                    total += w;
                }
                if total > MIN_WEIGHT {
                    (sum / total).exp()
                } else {
                    1.0
                }
            })
            .collect()
    }
}
