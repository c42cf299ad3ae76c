//! Gyroscope consistency check for feature matches.
//!
//! Under pure rotation a query pixel maps into the train image through
//! `K_t R_t R_q⁻¹ K_q⁻¹`. Gyroscope drift is modelled as a small rotation
//! `Rx(wx) Ry(wy) Rz(wz)` inserted in the middle with covariance `Q`; its
//! effect on the predicted pixel is linearized with jets, giving a 2-D
//! covariance `J Q Jᵀ` against which the actual match is tested.

use crate::geometry::jet::{Jet, Real};
use nalgebra::{Matrix2, Matrix2x3, Matrix3, Point2, UnitQuaternion, Vector2, Vector3};

type J3 = Jet<3>;

/// Covariance of the gyroscope drift between two frames, in radians.
///
/// Near the start of a capture the roll uncertainty is fixed; elsewhere the
/// whole covariance grows with the relative angle, but never below
/// `min_rotation`.
pub fn drift_covariance(gap: bool, angle: f64, min_rotation: f64) -> Matrix3<f64> {
    let deg = |d: f64| d.to_radians();
    if gap {
        Matrix3::from_diagonal(&Vector3::new(deg(6.0), deg(6.0), deg(20.0)))
    } else {
        Matrix3::from_diagonal(&Vector3::new(deg(6.0), deg(6.0), deg(15.0))) * min_rotation.max(angle)
    }
}

/// Rotates `v` about coordinate axis `axis` by the jet angle `theta`.
fn rotate_axis(v: [J3; 3], axis: usize, theta: J3) -> [J3; 3] {
    let (c, s) = (theta.cos(), theta.sin());
    let (i, j) = ((axis + 1) % 3, (axis + 2) % 3);
    let mut out = v;
    out[i] = c * v[i] - s * v[j];
    out[j] = s * v[i] + c * v[j];
    out
}

#[derive(Debug, Clone)]
pub struct GyroGate {
    to_world: Matrix3<f64>,
    to_train: Matrix3<f64>,
    covariance: Matrix3<f64>,
    threshold: f64,
}

impl GyroGate {
    /// Returns `None` if the query intrinsics are not invertible.
    pub fn new(
        query_k: &Matrix3<f64>,
        query_rotation: &UnitQuaternion<f64>,
        train_k: &Matrix3<f64>,
        train_rotation: &UnitQuaternion<f64>,
        covariance: Matrix3<f64>,
        threshold: f64,
    ) -> Option<Self> {
        let k_inv = query_k.try_inverse()?;
        Some(Self {
            to_world: query_rotation.inverse().to_rotation_matrix().into_inner() * k_inv,
            to_train: train_k * train_rotation.to_rotation_matrix().into_inner(),
            covariance,
            threshold,
        })
    }

    /// Predicted train pixel of a query pixel and its covariance, `None` if
    /// the ray falls behind the train camera.
    pub fn predict(&self, query: &Point2<f64>) -> Option<(Point2<f64>, Matrix2<f64>)> {
        let ray = self.to_world * Vector3::new(query.x, query.y, 1.0);
        let mut v = [J3::constant(ray.x), J3::constant(ray.y), J3::constant(ray.z)];
        // Rx(wx) Ry(wy) Rz(wz) v, evaluated at zero drift
        v = rotate_axis(v, 2, J3::variable(0.0, 2));
        v = rotate_axis(v, 1, J3::variable(0.0, 1));
        v = rotate_axis(v, 0, J3::variable(0.0, 0));

        let m = &self.to_train;
        let row = |r: usize| v[0] * m[(r, 0)] + v[1] * m[(r, 1)] + v[2] * m[(r, 2)];
        let (x, y, z) = (row(0), row(1), row(2));
        if z.value() <= 0.0 {
            return None;
        }
        let (px, py) = (x / z, y / z);

        let jacobian = Matrix2x3::from_rows(&[px.e.transpose(), py.e.transpose()]);
        let covariance = jacobian * self.covariance * jacobian.transpose();
        Some((Point2::new(px.s, py.s), covariance))
    }

    /// True if `train` lies within the confidence ellipse around the
    /// prediction for `query`. A degenerate ellipse accepts the match.
    pub fn accepts(&self, query: &Point2<f64>, train: &Point2<f64>) -> bool {
        let Some((mu, s)) = self.predict(query) else {
            return false;
        };
        let Some(s_inv) = s.try_inverse() else {
            return true;
        };
        let d: Vector2<f64> = train - mu;
        (d.transpose() * s_inv * d)[(0, 0)] <= self.threshold
    }
}
