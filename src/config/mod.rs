//! Tunable parameters of the trackers, the environment builder and the
//! light-probe samplers.
//!
//! Every struct deserializes from YAML with missing fields falling back to
//! their defaults, so a file only needs to name what it changes:
//!
//! ```yaml
//! tracker:
//!   marker_size: 5.0
//! environment:
//!   ba_method: Points
//!   width: 2048
//!   height: 1024
//! ```

use crate::environment::BAMethod;
use crate::geometry::HMethod;
use crate::light::SplitStrategy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("YAML Error: {0}")]
    YamlError(String),
    #[error("Invalid parameter: {0}")]
    InvalidParams(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::YamlError(err.to_string())
    }
}

/// Marker and calibration-pattern tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Side length of a square marker, in world units (cm).
    pub marker_size: f64,
    /// Number of marker-to-world orientation offsets averaged by the fusion.
    pub relative_poses: usize,
    /// Standard gravity in world units per second squared.
    pub gravity: f64,
    pub pnp_ransac_iterations: usize,
    /// Inlier threshold of the RANSAC PnP, in pixels.
    pub pnp_reprojection_threshold: f64,
    /// A pose is logged if the camera moved farther than this...
    pub novelty_distance: f64,
    /// ...or turned by more than this many degrees.
    pub novelty_angle_deg: f64,
    pub ba_iterations: usize,
    pub local_refine_iterations: usize,
    pub huber_threshold: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            marker_size: 4.6,
            relative_poses: 50,
            gravity: 9.80665 * 100.0,
            pnp_ransac_iterations: 100,
            pnp_reprojection_threshold: 5.0,
            novelty_distance: 2.0,
            novelty_angle_deg: 5.0,
            ba_iterations: 30,
            local_refine_iterations: 10,
            huber_threshold: 1.0,
        }
    }
}

/// Panorama construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Size of the equirectangular output.
    pub width: u32,
    pub height: u32,
    pub undistort: bool,
    pub check_blur: bool,
    pub ba_method: BAMethod,
    pub h_method: HMethod,
    /// Frames whose sharp-edge ratio is below this are rejected as blurry.
    pub min_blur_threshold: f32,
    pub blur_edge_threshold: f32,
    pub min_features: usize,
    pub min_matches: usize,
    /// Frames within this many batches of the start relax the rotation gates.
    pub gap_frames: usize,
    pub ransac_reproj_error: f64,
    pub lmeds_reproj_error: f64,
    pub max_hamming_distance: u32,
    /// Mahalanobis gate of the gyroscope consistency check.
    pub confidence_interval: f64,
    pub min_rotation_deg: f64,
    pub max_rotation_deg: f64,
    pub min_pairs: usize,
    /// Same-frame observations of a track scattered more than this are discarded.
    pub max_group_std: f64,
    pub huber_threshold: f64,
    pub max_features: usize,
    /// Frames are stored downscaled to this size for compositing.
    pub composite_width: u32,
    pub composite_height: u32,
    pub ba_iterations: usize,
    /// Iteration budget of the point-based objectives.
    pub point_ba_iterations: usize,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 512,
            undistort: false,
            check_blur: true,
            ba_method: BAMethod::Rays,
            h_method: HMethod::Ransac,
            min_blur_threshold: 0.01,
            blur_edge_threshold: 35.0,
            min_features: 50,
            min_matches: 25,
            gap_frames: 5,
            ransac_reproj_error: 5.0,
            lmeds_reproj_error: 3.0,
            max_hamming_distance: 20,
            confidence_interval: 0.103,
            min_rotation_deg: 15.0,
            max_rotation_deg: 40.0,
            min_pairs: 2,
            max_group_std: 15.0,
            huber_threshold: 1.0,
            max_features: 1000,
            composite_width: 640,
            composite_height: 360,
            ba_iterations: 30,
            point_ba_iterations: 100,
        }
    }
}

impl EnvironmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidParams("panorama size must be positive".to_string()));
        }
        if self.composite_width == 0 || self.composite_height == 0 {
            return Err(ConfigError::InvalidParams("composite size must be positive".to_string()));
        }
        if self.max_rotation_deg <= 0.0 || self.min_rotation_deg <= 0.0 {
            return Err(ConfigError::InvalidParams("rotation gates must be positive".to_string()));
        }
        Ok(())
    }
}

/// Light-probe sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Recursion depth; the sampler emits up to `2^depth` lights.
    pub depth: usize,
    pub strategy: SplitStrategy,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            depth: 6,
            strategy: SplitStrategy::MedianCut,
        }
    }
}

/// All sections of a configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub environment: EnvironmentConfig,
    pub sampler: SamplerConfig,
}

/// Reads any of the configuration structs from a YAML file.
pub fn load_from_yaml<T: DeserializeOwned>(path: &str) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Writes a configuration struct as YAML.
pub fn save_to_yaml<T: Serialize>(value: &T, path: &str) -> Result<(), ConfigError> {
    let yaml = serde_yaml::to_string(value)?;
    fs::write(path, yaml)?;
    Ok(())
}
