//! Mobile AR Library
//!
//! Core algorithms of a mobile augmented-reality pipeline:
//! - Marker and calibration-pattern tracking, with a background bundle
//!   adjustment refining the marker map
//! - Visual-inertial fusion through orientation and position Kalman filters
//! - Panoramic environment capture from bracketed, gyroscope-tagged exposures
//! - HDR merging and light-probe sampling of the resulting environment maps
//!
//! Nonlinear least-squares problems are solved with the tiny-solver
//! optimization framework.

pub mod camera;
pub mod config;
pub mod ekf;
pub mod environment;
pub mod features;
pub mod geometry;
pub mod hdr;
pub mod light;
pub mod tracking;
pub mod util;

// Re-export commonly used types
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};

pub use config::{Config, ConfigError, EnvironmentConfig, SamplerConfig, TrackerConfig};

pub use ekf::{EkfOrientation, EkfPosition};

pub use environment::{BAMethod, EnvironmentBuilder, EnvironmentError, HMethod, HdrFrame};

pub use hdr::HdrBuilder;

pub use light::{LightProbeSampler, LightSource, SplitStrategy};

pub use tracking::{
    CalibTracker, CameraFrame, FrameTracker, MarkerTracker, Tracker, TrackingError, TrackingResult,
};
