//! Oriented binary features, brute-force matching and blur detection.
//!
//! The environment builder extracts ORB keypoints from every frame it
//! ingests, matches them pairwise with a Hamming-distance brute-force
//! matcher and rejects blurry frames with a wavelet edge analysis before
//! spending time on extraction.

pub mod blur;
pub mod matcher;
pub mod orb;

pub use blur::BlurDetector;
pub use matcher::{BruteForceMatcher, FeatureMatch};
pub use orb::OrbExtractor;

use image::GrayImage;
use serde::{Deserialize, Serialize};

/// A detected corner in level-0 pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    /// Orientation of the intensity centroid, in radians.
    pub angle: f64,
    /// Harris corner response, used for ranking.
    pub response: f64,
    /// Pyramid level the corner was detected on.
    pub octave: u32,
    /// Diameter of the described patch in level-0 pixels.
    pub size: f64,
}

impl Keypoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            angle: 0.0,
            response: 0.0,
            octave: 0,
            size: 1.0,
        }
    }

    pub fn with_angle(mut self, angle: f64) -> Self {
        self.angle = angle;
        self
    }

    pub fn with_response(mut self, response: f64) -> Self {
        self.response = response;
        self
    }

    pub fn with_octave(mut self, octave: u32) -> Self {
        self.octave = octave;
        self
    }

    pub fn with_size(mut self, size: f64) -> Self {
        self.size = size;
        self
    }
}

/// A 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u8; 32]);

impl Descriptor {
    /// Number of differing bits.
    pub fn hamming_distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Anything that turns a grayscale image into keypoints with descriptors.
///
/// The two returned vectors always have the same length, descriptor `i`
/// describing keypoint `i`.
pub trait FeatureExtractor {
    fn detect_and_compute(&self, image: &GrayImage) -> (Vec<Keypoint>, Vec<Descriptor>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hamming_distance() {
        let a = Descriptor([0u8; 32]);
        let mut bytes = [0u8; 32];
        bytes[0] = 0b1011_0000;
        bytes[31] = 0xff;
        let b = Descriptor(bytes);
        assert_eq!(a.hamming_distance(&a), 0);
        assert_eq!(a.hamming_distance(&b), 11);
        assert_eq!(b.hamming_distance(&a), 11);
    }

    #[test]
    fn test_keypoint_builder() {
        let kp = Keypoint::new(3.0, 4.0)
            .with_angle(0.5)
            .with_octave(2)
            .with_response(10.0)
            .with_size(44.64);
        assert_eq!(kp.x, 3.0);
        assert_eq!(kp.octave, 2);
        assert_eq!(kp.angle, 0.5);
    }
}
