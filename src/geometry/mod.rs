//! Geometry building blocks: dual numbers, rotation manifolds, robust
//! estimation, homographies and perspective-n-point solvers.

pub mod homography;
pub mod jet;
pub mod pnp;
pub mod robust;
pub mod rotation;

pub use homography::{find_homography, HMethod};
pub use jet::{Jet, Real};
pub use pnp::{solve_pnp_ransac, PnpSolution};
pub use rotation::{angle, quaternion_average};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Not enough points: required {required}, found {found}")]
    NotEnoughPoints { required: usize, found: usize },

    #[error("Degenerate configuration: {0}")]
    Degenerate(String),

    #[error("Optimization failed: {0}")]
    Optimization(String),
}
