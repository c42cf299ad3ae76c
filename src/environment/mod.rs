//! Panoramic environment map construction.
//!
//! Batches of bracketed exposures taken from a fixed position are added one
//! at a time. Each batch is checked for sharpness and texture, matched
//! within itself and against every frame accepted so far, and committed only
//! if all checks pass. [`EnvironmentBuilder::composite`] then groups the
//! matches into tracks, refines all camera orientations with a global bundle
//! adjustment and blends each exposure level into an equirectangular image.

pub mod bundle;
pub mod gate;
pub mod graph;
pub mod projection;

pub use crate::geometry::HMethod;
pub use bundle::{optimize, BundleResult};
pub use graph::{group_matches, MatchGraph, MatchGroup};
pub use projection::Panorama;

use crate::camera::{undistort_image, Intrinsics, RadTanModel};
use crate::config::{ConfigError, EnvironmentConfig};
use crate::features::{BlurDetector, BruteForceMatcher, Descriptor, FeatureExtractor, Keypoint, OrbExtractor};
use crate::geometry::{angle, find_homography, GeometryError};
use crate::util::rgb_to_grayscale;
use gate::{drift_covariance, GyroGate};
use image::imageops::{self, FilterType};
use image::RgbImage;
use log::{debug, info};
use nalgebra::{Matrix3, Point2, UnitQuaternion};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exposure times of two batches must agree to within this many seconds.
const EXPOSURE_TOLERANCE: f64 = 1e-7;

/// Objective of the global bundle adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BAMethod {
    /// Align the world-space viewing rays of every pair of observations.
    Rays,
    /// Reproject a free 3-D point per track.
    Points,
    /// Reproject a unit direction per track.
    Vectors,
    /// Transfer every observation into every other frame of its track.
    Reproj,
}

#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("Frame is blurry")]
    Blurry,
    #[error("Not enough features")]
    NotEnoughFeatures,
    #[error("Frames of the batch do not match each other")]
    NoPairwiseMatches,
    #[error("Batch does not match any previous frame")]
    NoGlobalMatches,
    #[error("Exposure times differ from the first batch")]
    ExposureMismatch,
    #[error("Batch is empty")]
    EmptyBatch,
    #[error("Optimization failed: {0}")]
    Optimization(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<GeometryError> for EnvironmentError {
    fn from(err: GeometryError) -> Self {
        EnvironmentError::Optimization(err.to_string())
    }
}

/// One captured exposure with its gyroscope orientation.
#[derive(Debug, Clone)]
pub struct HdrFrame {
    pub image: RgbImage,
    /// Exposure time in seconds.
    pub exposure: f64,
    pub intrinsics: Intrinsics,
    /// World-to-camera rotation.
    pub rotation: UnitQuaternion<f64>,
}

/// An accepted frame: features at full resolution, pixels downscaled for
/// compositing.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    /// Position of the frame inside its batch, i.e. its exposure level.
    pub level: usize,
    pub image: RgbImage,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    /// Camera matrix of the keypoint coordinates.
    pub k: Matrix3<f64>,
    /// Camera matrix of the downscaled image.
    pub k_scaled: Matrix3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

#[derive(Debug)]
pub struct EnvironmentBuilder {
    config: EnvironmentConfig,
    camera: RadTanModel,
    orb: OrbExtractor,
    blur: BlurDetector,
    matcher: BruteForceMatcher,
    exposures: Vec<f64>,
    frames: Vec<Frame>,
    graph: MatchGraph,
    index: usize,
}

impl EnvironmentBuilder {
    /// `camera` supplies the distortion removed from frames when
    /// `config.undistort` is set.
    pub fn new(config: EnvironmentConfig, camera: RadTanModel) -> Result<Self, EnvironmentError> {
        config.validate()?;
        Ok(Self {
            orb: OrbExtractor::new().with_n_features(config.max_features),
            blur: BlurDetector::new(config.blur_edge_threshold),
            matcher: BruteForceMatcher::new().with_cross_check(),
            config,
            camera,
            exposures: Vec::new(),
            frames: Vec::new(),
            graph: MatchGraph::new(),
            index: 0,
        })
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn exposures(&self) -> &[f64] {
        &self.exposures
    }

    pub fn graph(&self) -> &MatchGraph {
        &self.graph
    }

    /// Adds one batch of exposures, ordered by exposure level.
    ///
    /// On error nothing is committed and the builder is left as it was.
    pub fn add_frames(&mut self, batch: &[HdrFrame]) -> Result<(), EnvironmentError> {
        if batch.is_empty() {
            return Err(EnvironmentError::EmptyBatch);
        }
        if !self.exposures.is_empty() {
            let matching = self.exposures.len() == batch.len()
                && self
                    .exposures
                    .iter()
                    .zip(batch)
                    .all(|(e, f)| (e - f.exposure).abs() < EXPOSURE_TOLERANCE);
            if !matching {
                return Err(EnvironmentError::ExposureMismatch);
            }
        }
        let levels = batch.len();

        let frames = batch
            .iter()
            .enumerate()
            .map(|(level, raw)| self.prepare_frame(raw, self.index + level, level))
            .collect::<Result<Vec<_>, _>>()?;

        let mut local = MatchGraph::new();
        for (i, train) in frames.iter().enumerate() {
            for query in &frames[i + 1..] {
                let graph = self.match_frames(train, query, levels);
                if graph.is_empty() {
                    debug!("frames {} and {} do not match", train.index, query.index);
                    return Err(EnvironmentError::NoPairwiseMatches);
                }
                local.merge(&graph);
            }
        }

        let mut pairs = 0;
        for query in &frames {
            for train in self.frames.iter().rev() {
                let graph = self.match_frames(train, query, levels);
                if !graph.is_empty() {
                    local.merge(&graph);
                    pairs += 1;
                }
            }
        }
        let required = if self.frames.len() < self.config.gap_frames {
            0
        } else {
            self.config.min_pairs
        };
        if !self.frames.is_empty() && pairs <= required {
            return Err(EnvironmentError::NoGlobalMatches);
        }

        if self.exposures.is_empty() {
            self.exposures = batch.iter().map(|f| f.exposure).collect();
        }
        self.frames.extend(frames);
        self.graph.merge(&local);
        self.index += levels;
        info!("accepted batch, {} frames, {pairs} global pairs", self.frames.len());
        Ok(())
    }

    /// Undistorts, checks and describes one frame.
    fn prepare_frame(&self, raw: &HdrFrame, index: usize, level: usize) -> Result<Frame, EnvironmentError> {
        let image = if self.config.undistort {
            undistort_image(&raw.image, &self.camera)
        } else {
            raw.image.clone()
        };
        let gray = rgb_to_grayscale(&image);

        if self.config.check_blur {
            // an edgeless frame cannot be judged here; the feature count rejects it
            if let Some((per, _)) = self.blur.analyze(&gray) {
                if per < self.config.min_blur_threshold {
                    debug!("frame {index} is blurry: {per:.4}");
                    return Err(EnvironmentError::Blurry);
                }
            }
        }

        let (keypoints, descriptors) = self.orb.detect_and_compute(&gray);
        if keypoints.len() < self.config.min_features {
            debug!("frame {index} has {} features", keypoints.len());
            return Err(EnvironmentError::NotEnoughFeatures);
        }

        let (width, height) = image.dimensions();
        let (cw, ch) = (self.config.composite_width, self.config.composite_height);
        let scaled = imageops::resize(&image, cw, ch, FilterType::Triangle);
        Ok(Frame {
            index,
            level,
            image: scaled,
            keypoints,
            descriptors,
            k: raw.intrinsics.matrix(),
            k_scaled: raw
                .intrinsics
                .scaled(cw as f64 / width as f64, ch as f64 / height as f64)
                .matrix(),
            rotation: raw.rotation,
        })
    }

    /// Matches `query` against `train`, returning the verified
    /// correspondences as a graph, empty if the pair is rejected.
    ///
    /// `levels` is the number of exposures per batch, used to tell whether
    /// either frame belongs to the first few batches.
    pub fn match_frames(&self, train: &Frame, query: &Frame, levels: usize) -> MatchGraph {
        let config = &self.config;
        let gap_end = config.gap_frames * levels;
        let gap = train.index < gap_end || query.index < gap_end;

        let max_rotation = config.max_rotation_deg.to_radians();
        let relative = angle(&(query.rotation.inverse() * train.rotation)).abs();
        if relative > if gap { 2.0 * max_rotation } else { max_rotation } {
            return MatchGraph::new();
        }

        let mut matches = self.matcher.match_descriptors(&query.descriptors, &train.descriptors);
        if matches.len() < config.min_matches {
            return MatchGraph::new();
        }
        matches.sort_by_key(|m| m.distance);
        let best = matches.first().map_or(0, |m| m.distance);
        let max_distance = config.max_hamming_distance.min(best * 5);
        matches.retain(|m| m.distance <= max_distance);
        if matches.len() < config.min_matches {
            return MatchGraph::new();
        }

        // drift accumulates too much across large gap-closing turns for the gate
        if !(gap && relative > max_rotation) {
            let covariance = drift_covariance(gap, relative, config.min_rotation_deg.to_radians());
            let Some(gate) = GyroGate::new(
                &query.k,
                &query.rotation,
                &train.k,
                &train.rotation,
                covariance,
                config.confidence_interval,
            ) else {
                return MatchGraph::new();
            };
            matches.retain(|m| {
                let (q, t) = (&query.keypoints[m.query_idx], &train.keypoints[m.train_idx]);
                gate.accepts(&Point2::new(q.x, q.y), &Point2::new(t.x, t.y))
            });
            if matches.len() < config.min_matches {
                return MatchGraph::new();
            }
        }

        let (src, dst): (Vec<_>, Vec<_>) = matches
            .iter()
            .map(|m| {
                let (t, q) = (&train.keypoints[m.train_idx], &query.keypoints[m.query_idx]);
                (Point2::new(t.x, t.y), Point2::new(q.x, q.y))
            })
            .unzip();
        let threshold = match config.h_method {
            HMethod::Ransac => config.ransac_reproj_error,
            HMethod::Lmeds => config.lmeds_reproj_error,
        };
        let mask = match find_homography(&src, &dst, config.h_method, threshold) {
            Ok((_, mask)) => mask,
            Err(e) => {
                debug!("no homography between {} and {}: {e}", train.index, query.index);
                return MatchGraph::new();
            }
        };
        let inliers = mask.iter().filter(|&&inlier| inlier).count();
        let n = matches.len() as f64;
        let accepted = match config.h_method {
            HMethod::Ransac => inliers as f64 >= 5.9 + 0.22 * n,
            HMethod::Lmeds => inliers as f64 >= 0.5 * n,
        };
        if !accepted {
            debug!("{inliers} of {n} inliers between {} and {}", train.index, query.index);
            return MatchGraph::new();
        }

        let mut graph = MatchGraph::new();
        for (m, _) in matches.iter().zip(&mask).filter(|(_, &inlier)| inlier) {
            graph.add_match((query.index, m.query_idx), (train.index, m.train_idx));
        }
        graph
    }

    /// Runs the reconstruction and returns one panorama per exposure level
    /// with its exposure time. `progress` is told the name of each stage as
    /// it starts.
    pub fn composite<P: FnMut(&str)>(self, mut progress: P) -> Result<Vec<(RgbImage, f64)>, EnvironmentError> {
        let config = &self.config;

        progress("Match Graph Optimization");
        let frames = &self.frames;
        let groups = group_matches(
            &self.graph,
            |(frame, keypoint)| {
                let kp = frames.get(frame)?.keypoints.get(keypoint)?;
                Some(Point2::new(kp.x, kp.y))
            },
            config.max_group_std,
        );
        info!("{} tracks over {} frames", groups.len(), frames.len());

        progress("Bundle Adjustment");
        let rotations: Vec<_> = frames.iter().map(|f| f.rotation).collect();
        let intrinsics: Vec<_> = frames.iter().map(|f| f.k).collect();
        let result = optimize(&rotations, &intrinsics, &groups, config.ba_method, config)?;

        progress("Compositing");
        let mut panoramas: Vec<Panorama> = self
            .exposures
            .iter()
            .map(|_| Panorama::new(config.width, config.height))
            .collect();
        for ((frame, rotation), &optimized) in frames.iter().zip(&result.rotations).zip(&result.optimized) {
            if !optimized {
                continue;
            }
            if let Some(panorama) = panoramas.get_mut(frame.level) {
                panorama.splat(&frame.image, &frame.k_scaled, rotation);
            }
        }

        Ok(panoramas
            .iter()
            .zip(&self.exposures)
            .map(|(panorama, &exposure)| (panorama.resolve(), exposure))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Resolution;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn camera() -> RadTanModel {
        let intrinsics = Intrinsics {
            fx: 300.0,
            fy: 300.0,
            cx: 160.0,
            cy: 120.0,
        };
        let resolution = Resolution {
            width: 320,
            height: 240,
        };
        RadTanModel::new(intrinsics, resolution, [0.0; 5]).unwrap()
    }

    fn config() -> EnvironmentConfig {
        EnvironmentConfig {
            width: 128,
            height: 64,
            check_blur: false,
            composite_width: 160,
            composite_height: 120,
            ..EnvironmentConfig::default()
        }
    }

    /// Random 8x8 colour blocks.
    fn textured() -> RgbImage {
        let mut rng = StdRng::seed_from_u64(11);
        let blocks: Vec<[u8; 3]> = (0..40 * 30).map(|_| rng.gen()).collect();
        RgbImage::from_fn(320, 240, |x, y| Rgb(blocks[((y / 8) * 40 + x / 8) as usize]))
    }

    fn frame(image: RgbImage, exposure: f64, rotation: UnitQuaternion<f64>) -> HdrFrame {
        HdrFrame {
            image,
            exposure,
            intrinsics: camera().intrinsics,
            rotation,
        }
    }

    fn batch(exposures: &[f64]) -> Vec<HdrFrame> {
        exposures
            .iter()
            .map(|&e| frame(textured(), e, UnitQuaternion::identity()))
            .collect()
    }

    #[test]
    fn test_black_frame_has_not_enough_features() {
        let config = EnvironmentConfig {
            check_blur: true,
            ..config()
        };
        let mut builder = EnvironmentBuilder::new(config, camera()).unwrap();
        let black = frame(RgbImage::new(320, 240), 0.001, UnitQuaternion::identity());
        let bright = frame(textured(), 0.01, UnitQuaternion::identity());
        let result = builder.add_frames(&[black, bright]);
        assert!(matches!(result, Err(EnvironmentError::NotEnoughFeatures)));
        assert!(builder.frames().is_empty());
        assert!(builder.exposures().is_empty());
    }

    #[test]
    fn test_empty_batch() {
        let mut builder = EnvironmentBuilder::new(config(), camera()).unwrap();
        assert!(matches!(builder.add_frames(&[]), Err(EnvironmentError::EmptyBatch)));
    }

    #[test]
    fn test_identical_batches_commit() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut builder = EnvironmentBuilder::new(config(), camera()).unwrap();
        builder.add_frames(&batch(&[0.01, 0.02])).unwrap();
        assert_eq!(builder.frames().len(), 2);
        assert_eq!(builder.exposures(), &[0.01, 0.02]);
        assert!(!builder.graph().is_empty());

        builder.add_frames(&batch(&[0.01, 0.02])).unwrap();
        let indices: Vec<_> = builder.frames().iter().map(|f| (f.index, f.level)).collect();
        assert_eq!(indices, vec![(0, 0), (1, 1), (2, 0), (3, 1)]);
    }

    #[test]
    fn test_mismatched_exposures_are_rejected() {
        let mut builder = EnvironmentBuilder::new(config(), camera()).unwrap();
        builder.add_frames(&batch(&[0.01, 0.02])).unwrap();
        let graph = builder.graph().clone();

        let result = builder.add_frames(&batch(&[0.01, 0.04]));
        assert!(matches!(result, Err(EnvironmentError::ExposureMismatch)));
        let result = builder.add_frames(&batch(&[0.01]));
        assert!(matches!(result, Err(EnvironmentError::ExposureMismatch)));
        assert_eq!(builder.frames().len(), 2);
        assert_eq!(builder.graph(), &graph);
    }

    #[test]
    fn test_large_rotation_is_not_matched() {
        let builder = EnvironmentBuilder::new(config(), camera()).unwrap();
        let turned = UnitQuaternion::from_euler_angles(0.0, 100f64.to_radians(), 0.0);
        let a = builder.prepare_frame(&frame(textured(), 0.01, UnitQuaternion::identity()), 0, 0).unwrap();
        let b = builder.prepare_frame(&frame(textured(), 0.01, turned), 1, 0).unwrap();
        assert!(builder.match_frames(&a, &b, 1).is_empty());
        assert!(!builder.match_frames(&a, &a.clone(), 1).is_empty());
    }

    #[test]
    fn test_unrelated_batch_has_no_pairwise_matches() {
        let mut builder = EnvironmentBuilder::new(config(), camera()).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        let blocks: Vec<[u8; 3]> = (0..40 * 30).map(|_| rng.gen()).collect();
        let other = RgbImage::from_fn(320, 240, |x, y| Rgb(blocks[((y / 8) * 40 + x / 8) as usize]));
        let result = builder.add_frames(&[
            frame(textured(), 0.01, UnitQuaternion::identity()),
            frame(other, 0.02, UnitQuaternion::identity()),
        ]);
        assert!(matches!(result, Err(EnvironmentError::NoPairwiseMatches)));
        assert!(builder.frames().is_empty());
    }

    #[test]
    fn test_composite_reports_progress() {
        let mut builder = EnvironmentBuilder::new(config(), camera()).unwrap();
        builder.add_frames(&batch(&[0.01, 0.02])).unwrap();
        builder.add_frames(&batch(&[0.01, 0.02])).unwrap();

        let mut stages = Vec::new();
        let panoramas = builder.composite(|stage| stages.push(stage.to_string())).unwrap();
        assert_eq!(stages, vec!["Match Graph Optimization", "Bundle Adjustment", "Compositing"]);
        assert_eq!(panoramas.len(), 2);
        for ((image, exposure), expected) in panoramas.iter().zip([0.01, 0.02]) {
            assert_eq!(*exposure, expected);
            assert_eq!(image.dimensions(), (128, 64));
            assert!(image.pixels().any(|p| *p != Rgb([0, 0, 0])));
        }
    }

    /// The textured scene as a 2.2-gamma camera sees it at `gain` times the
    /// shortest exposure.
    fn bracketed(gain: f64) -> RgbImage {
        let scene = textured();
        RgbImage::from_fn(320, 240, |x, y| {
            let radiance = scene.get_pixel(x, y).0.map(|c| c as f64 / 1020.0);
            Rgb(radiance.map(|l| (255.0 * (l * gain).min(1.0).powf(1.0 / 2.2)).round() as u8))
        })
    }

    #[test]
    fn test_composited_exposures_yield_lights() {
        // looking along the world y axis, centred on panorama pixel (95, 32)
        let rotation = UnitQuaternion::from_euler_angles(std::f64::consts::FRAC_PI_2, 0.0, 0.0);
        let gains = [1.0, 2.0, 4.0];
        let exposures: Vec<_> = gains
            .iter()
            .map(|&gain| frame(bracketed(gain), 0.0025 * gain, rotation))
            .collect();
        let mut builder = EnvironmentBuilder::new(config(), camera()).unwrap();
        builder.add_frames(&exposures).unwrap();
        let panoramas = builder.composite(|_| {}).unwrap();
        assert_eq!(panoramas.len(), 3);

        let radiance = crate::hdr::HdrBuilder::new().build(&panoramas).unwrap();
        assert_eq!(radiance.dimensions(), (128, 64));
        assert!(radiance.pixels().all(|p| p.0.iter().all(|c| c.is_finite() && *c > 0.0)));
        let mean = |columns: std::ops::Range<u32>, rows: std::ops::Range<u32>| {
            let values: Vec<f32> = rows
                .flat_map(|y| columns.clone().map(move |x| (x, y)))
                .map(|(x, y)| radiance.get_pixel(x, y)[1])
                .collect();
            values.iter().sum::<f32>() / values.len() as f32
        };
        // pixels no exposure saw read as unit radiance
        assert_eq!(mean(10..20, 28..36), 1.0);
        assert!(mean(90..101, 28..37) > 5.0);

        let sampler = crate::light::LightProbeSampler::new(radiance, 3, crate::light::SplitStrategy::MedianCut).unwrap();
        let lights = sampler.sample();
        assert_eq!(lights.len(), 8);
        for light in &lights {
            assert!((light.direction.norm() - 1.0).abs() < 1e-9);
            assert!(light.diffuse.iter().all(|c| c.is_finite() && *c >= 0.0));
        }
        let facing = lights
            .iter()
            .filter(|light| {
                let [x, y] = light.centroid;
                (75.0..116.0).contains(&x) && (14.0..50.0).contains(&y)
            })
            .count();
        assert!(facing >= 4, "only {facing} of 8 lights face the captured frames");
    }
}
