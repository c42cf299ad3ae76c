//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! Mobile camera frames come with five distortion coefficients
//! `[k1, k2, p1, p2, k3]`. Projection applies the forward distortion;
//! unprojection inverts it with Newton iterations. [`undistort_image`]
//! resamples a frame into the equivalent distortion-free pinhole image.

use crate::camera::{
    load_cam0, save_cam0, validation, CameraModel, CameraModelError, Intrinsics, Resolution,
};
use crate::util::sample_bilinear;
use image::{Rgb, RgbImage};
use nalgebra::{Matrix2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Convergence tolerance of the iterative undistortion.
const EPS: f64 = 1e-9;
const MAX_ITERATIONS: u32 = 100;

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// # Examples
///
/// ```rust
/// use mobile_ar::camera::{Intrinsics, RadTanModel, Resolution};
///
/// let intrinsics = Intrinsics { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 };
/// let resolution = Resolution { width: 640, height: 480 };
/// let model = RadTanModel::new(intrinsics, resolution, [0.1, -0.05, 0.001, 0.001, 0.02]).unwrap();
/// assert_eq!(model.distortions[0], 0.1);
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct RadTanModel {
    pub intrinsics: Intrinsics,
    pub resolution: Resolution,
    /// The 5 distortion coefficients: `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`], validating the intrinsics.
    pub fn new(
        intrinsics: Intrinsics,
        resolution: Resolution,
        distortions: [f64; 5],
    ) -> Result<Self, CameraModelError> {
        let model = RadTanModel {
            intrinsics,
            resolution,
            distortions,
        };
        model.validate_params()?;
        Ok(model)
    }

    /// Applies the distortion to normalized image coordinates.
    pub fn distort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let (x, y) = (point.x, point.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Jacobian of [`Self::distort`] with respect to the normalized point.
    fn distort_jacobian(&self, point: &Vector2<f64>) -> Matrix2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let (x, y) = (point.x, point.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        // d(radial)/d(r2)
        let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r2 * r2;

        let j00 = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
        let j01 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
        let j10 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
        let j11 = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;
        Matrix2::new(j00, j01, j10, j11)
    }

    /// Removes the distortion from normalized image coordinates.
    ///
    /// # Errors
    ///
    /// [`CameraModelError::NumericalError`] if the Jacobian becomes singular
    /// or the iteration does not converge.
    pub fn undistort(&self, distorted: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let mut point = *distorted;
        for _ in 0..MAX_ITERATIONS {
            let error = self.distort(&point) - distorted;
            if error.norm() < EPS {
                return Ok(point);
            }
            let inv_jacobian = self
                .distort_jacobian(&point)
                .try_inverse()
                .ok_or_else(|| CameraModelError::NumericalError("Jacobian is singular".to_string()))?;
            let delta = inv_jacobian * error;
            point -= delta;
            if delta.norm() < EPS {
                return Ok(point);
            }
        }
        Err(CameraModelError::NumericalError(format!(
            "Unprojection did not converge after {MAX_ITERATIONS} iterations."
        )))
    }

    /// Maps a pixel of the distorted frame to where a distortion-free
    /// pinhole camera with the same intrinsics would see it.
    pub fn undistort_pixel(&self, pixel: &Vector2<f64>) -> Result<Vector2<f64>, CameraModelError> {
        let i = &self.intrinsics;
        let normalized = self.undistort(&Vector2::new((pixel.x - i.cx) / i.fx, (pixel.y - i.cy) / i.fy))?;
        Ok(Vector2::new(i.fx * normalized.x + i.cx, i.fy * normalized.y + i.cy))
    }

    /// Pixel in the distorted image observing the normalized direction `point`.
    fn to_pixel(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let d = self.distort(point);
        Vector2::new(
            self.intrinsics.fx * d.x + self.intrinsics.cx,
            self.intrinsics.fy * d.y + self.intrinsics.cy,
        )
    }
}

impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTan [fx: {} fy: {} cx: {} cy: {} distortions: {:?}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions
        )
    }
}

impl CameraModel for RadTanModel {
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }
        let uv = self.to_pixel(&Vector2::new(point_3d.x / point_3d.z, point_3d.y / point_3d.z));
        if !validation::inside(&self.resolution, &uv) {
            return Err(CameraModelError::ProjectionOutSideImage);
        }
        Ok(uv)
    }

    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        if !validation::inside(&self.resolution, point_2d) {
            return Err(CameraModelError::PointIsOutSideImage);
        }
        let distorted = Vector2::new(
            (point_2d.x - self.intrinsics.cx) / self.intrinsics.fx,
            (point_2d.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        let point = self.undistort(&distorted)?;
        Ok(Vector3::new(point.x, point.y, 1.0).normalize())
    }

    /// Loads RadTan camera parameters from a YAML file.
    ///
    /// Expects `cam0` with `intrinsics`, `resolution` and a five element
    /// `distortion` array.
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let (cam0, intrinsics, resolution) = load_cam0(path)?;
        let distortion_yaml = cam0["distortion"].as_vec().ok_or_else(|| {
            CameraModelError::InvalidParams("YAML missing 'distortion' or not an array".to_string())
        })?;
        if distortion_yaml.len() != 5 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 5 distortion coefficients, found {}",
                distortion_yaml.len()
            )));
        }
        let mut distortions = [0.0; 5];
        for (d, yaml) in distortions.iter_mut().zip(distortion_yaml) {
            *d = yaml.as_f64().ok_or_else(|| {
                CameraModelError::InvalidParams("Invalid distortion: not a float".to_string())
            })?;
        }
        RadTanModel::new(intrinsics, resolution, distortions)
    }

    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        save_cam0(
            path,
            "radtan",
            &self.intrinsics,
            &self.resolution,
            Some(&self.distortions),
        )
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if !self.distortions.iter().all(|d| d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortions.to_vec()
    }
}

/// Resamples a distorted frame into the pinhole image with the same intrinsics.
///
/// Every destination pixel is mapped through the forward distortion and
/// bilinearly sampled; pixels whose source falls outside the frame are black.
pub fn undistort_image(image: &RgbImage, model: &RadTanModel) -> RgbImage {
    let (width, height) = image.dimensions();
    let intrinsics = &model.intrinsics;
    RgbImage::from_fn(width, height, |x, y| {
        let normalized = Vector2::new(
            (x as f64 - intrinsics.cx) / intrinsics.fx,
            (y as f64 - intrinsics.cy) / intrinsics.fy,
        );
        let source = model.to_pixel(&normalized);
        match sample_bilinear(image, source.x, source.y) {
            Some(p) => Rgb(p.map(|c| c.round().clamp(0.0, 255.0) as u8)),
            None => Rgb([0, 0, 0]),
        }
    })
}
