//! Directional light estimation from environment maps.

pub mod moments;
pub mod sampler;

pub use moments::{Moments, Region};
pub use sampler::{LightProbeSampler, SplitStrategy};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LightError {
    #[error("Light probe image is empty")]
    EmptyImage,
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("JSON Error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for LightError {
    fn from(err: std::io::Error) -> Self {
        LightError::IOError(err.to_string())
    }
}

impl From<serde_json::Error> for LightError {
    fn from(err: serde_json::Error) -> Self {
        LightError::JsonError(err.to_string())
    }
}

/// A directional light estimated from one region of the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightSource {
    /// Unit direction the light travels in, from the region towards the
    /// centre of the sphere.
    pub direction: Vector3<f64>,
    pub ambient: [f64; 3],
    pub diffuse: [f64; 3],
    pub specular: [f64; 3],
    /// Region of the probe the light was sampled from.
    pub region: Region,
    /// Luminance centroid `[x, y]` of the region, in pixels.
    pub centroid: [f64; 2],
}

pub fn to_json(lights: &[LightSource]) -> Result<String, LightError> {
    Ok(serde_json::to_string_pretty(lights)?)
}

pub fn from_json(json: &str) -> Result<Vec<LightSource>, LightError> {
    Ok(serde_json::from_str(json)?)
}

/// Writes the lights as a JSON array.
pub fn save_json(lights: &[LightSource], path: &str) -> Result<(), LightError> {
    fs::write(path, to_json(lights)?)?;
    Ok(())
}
