//! High dynamic range radiance maps from bracketed exposures.
//!
//! The composited panoramas of every exposure level are merged into one
//! linear radiance map, which is what the light-probe samplers expect.

pub mod builder;

pub use builder::{HdrBuilder, ResponseCurve};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HdrError {
    #[error("No exposures given")]
    Empty,
    #[error("All exposures must be of the same size")]
    SizeMismatch,
    #[error("Exposure time must be positive, got {0}")]
    InvalidExposure(f64),
    #[error("Response curve system is singular")]
    Singular,
}
