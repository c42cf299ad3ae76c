//! Camera models used by the trackers and the environment builder.
//!
//! Frames arrive with pinhole intrinsics and radial-tangential distortion
//! coefficients. [`RadTanModel`] undistorts marker corners before pose
//! estimation and can resample a whole image into its undistorted pinhole
//! counterpart; the undistorted projection itself is [`Intrinsics::matrix`].

pub mod rad_tan;

pub use rad_tan::{undistort_image, RadTanModel};

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Upper-triangular camera matrix `K`.
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Reads the intrinsics out of a camera matrix, ignoring skew.
    pub fn from_matrix(k: &Matrix3<f64>) -> Self {
        Self {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        }
    }

    /// Scales the intrinsics for an image resized by `(sx, sy)`.
    pub fn scaled(&self, sx: f64, sy: f64) -> Self {
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum CameraModelError {
    #[error("Projection is outside the image")]
    ProjectionOutSideImage,
    #[error("Input point is outside the image")]
    PointIsOutSideImage,
    #[error("z is close to zero, point is at camera center")]
    PointAtCameraCenter,
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Principal point must be finite")]
    PrincipalPointMustBeFinite,
    #[error("Invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraModelError {
    fn from(err: std::io::Error) -> Self {
        CameraModelError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraModelError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraModelError::YamlError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point in camera coordinates to pixel coordinates
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError>;

    /// Unproject pixel coordinates to a unit-length viewing ray
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError>;

    /// Load camera parameters from a YAML file in the `cam0:` layout
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError>
    where
        Self: Sized;

    /// Save camera parameters to a YAML file in the `cam0:` layout
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraModelError>;

    fn get_resolution(&self) -> Resolution;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_distortion(&self) -> Vec<f64>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CameraModelError> {
        if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
            return Err(CameraModelError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CameraModelError::PrincipalPointMustBeFinite);
        }
        Ok(())
    }

    /// Checks that a pixel lies inside the image.
    pub fn inside(resolution: &Resolution, point: &Vector2<f64>) -> bool {
        point.x >= 0.0
            && point.x < resolution.width as f64
            && point.y >= 0.0
            && point.y < resolution.height as f64
    }
}

/// Reads the `cam0` block shared by every model's YAML file.
pub(crate) fn load_cam0(path: &str) -> Result<(yaml_rust::Yaml, Intrinsics, Resolution), CameraModelError> {
    let contents = std::fs::read_to_string(path)?;
    let docs = yaml_rust::YamlLoader::load_from_str(&contents)?;
    let doc = docs
        .into_iter()
        .next()
        .ok_or_else(|| CameraModelError::InvalidParams("Empty YAML document".to_string()))?;
    let cam0 = doc["cam0"].clone();

    let intrinsics_yaml = cam0["intrinsics"].as_vec().ok_or_else(|| {
        CameraModelError::InvalidParams("YAML missing 'intrinsics' or not an array".to_string())
    })?;
    let resolution_yaml = cam0["resolution"].as_vec().ok_or_else(|| {
        CameraModelError::InvalidParams("YAML missing 'resolution' or not an array".to_string())
    })?;
    if intrinsics_yaml.len() != 4 || resolution_yaml.len() != 2 {
        return Err(CameraModelError::InvalidParams(
            "Expected 4 intrinsics and 2 resolution values".to_string(),
        ));
    }

    let value = |i: usize, name: &str| {
        intrinsics_yaml[i]
            .as_f64()
            .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}: not a float")))
    };
    let intrinsics = Intrinsics {
        fx: value(0, "fx")?,
        fy: value(1, "fy")?,
        cx: value(2, "cx")?,
        cy: value(3, "cy")?,
    };

    let resolution = Resolution {
        width: resolution_yaml[0].as_i64().ok_or_else(|| {
            CameraModelError::InvalidParams("Invalid width: not an integer".to_string())
        })? as u32,
        height: resolution_yaml[1].as_i64().ok_or_else(|| {
            CameraModelError::InvalidParams("Invalid height: not an integer".to_string())
        })? as u32,
    };

    Ok((cam0, intrinsics, resolution))
}

/// Writes a `cam0` block with the given model name and optional distortion.
pub(crate) fn save_cam0(
    path: &str,
    model: &str,
    intrinsics: &Intrinsics,
    resolution: &Resolution,
    distortion: Option<&[f64]>,
) -> Result<(), CameraModelError> {
    use serde_yaml::{Mapping, Value};
    let to_value = |v| serde_yaml::to_value(v).map_err(|e| CameraModelError::YamlError(e.to_string()));

    let mut cam0 = Mapping::new();
    cam0.insert(Value::String("camera_model".to_string()), Value::String(model.to_string()));
    cam0.insert(
        Value::String("intrinsics".to_string()),
        to_value(vec![intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy])?,
    );
    if let Some(distortion) = distortion {
        cam0.insert(Value::String("distortion".to_string()), to_value(distortion.to_vec())?);
    }
    cam0.insert(
        Value::String("resolution".to_string()),
        serde_yaml::to_value(vec![resolution.width, resolution.height])
            .map_err(|e| CameraModelError::YamlError(e.to_string()))?,
    );

    let mut root = Mapping::new();
    root.insert(Value::String("cam0".to_string()), Value::Mapping(cam0));
    let yaml_string =
        serde_yaml::to_string(&root).map_err(|e| CameraModelError::YamlError(e.to_string()))?;
    std::fs::write(path, yaml_string)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_intrinsics_matrix_round_trip() {
        let intrinsics = Intrinsics {
            fx: 500.0,
            fy: 510.0,
            cx: 320.0,
            cy: 240.0,
        };
        let k = intrinsics.matrix();
        assert_eq!(Intrinsics::from_matrix(&k), intrinsics);
        let half = intrinsics.scaled(0.5, 0.5);
        assert_relative_eq!(half.fx, 250.0);
        assert_relative_eq!(half.cy, 120.0);
    }

    #[test]
    fn test_validate_intrinsics() {
        let bad = Intrinsics {
            fx: -1.0,
            fy: 1.0,
            cx: 0.0,
            cy: 0.0,
        };
        assert!(matches!(
            validation::validate_intrinsics(&bad),
            Err(CameraModelError::FocalLengthMustBePositive)
        ));
        let nan = Intrinsics {
            fx: 1.0,
            fy: 1.0,
            cx: f64::NAN,
            cy: 0.0,
        };
        assert!(matches!(
            validation::validate_intrinsics(&nan),
            Err(CameraModelError::PrincipalPointMustBeFinite)
        ));
    }
}
