//! Rotation utilities shared by the trackers and optimizers.
//!
//! Rotations are optimized on their manifolds: a unit quaternion is updated
//! through a 3-dimensional tangent vector and a unit vector through a
//! 2-dimensional one, so an update can never leave the unit sphere.
//!
//! The generic functions at the bottom of this module are evaluated inside
//! `tiny_solver` residuals, where `T` is a dual number. Quaternions there are
//! plain `[w, x, y, z]` arrays.

use nalgebra::{Matrix4, Quaternion, RealField, SymmetricEigen, Unit, UnitQuaternion, Vector2, Vector3};
use std::f64::consts::PI;

/// Tangent perturbations smaller than this leave the point unchanged.
const MIN_TANGENT_NORM: f64 = 1e-10;

/// Averages a set of orientations.
///
/// Returns the unit quaternion minimizing the sum of squared Frobenius
/// distances of the rotations, i.e. the dominant eigenvector of `Σ q qᵀ`.
/// The sign is chosen to agree with the first input. Returns `None` for an
/// empty set.
pub fn quaternion_average(quaternions: &[UnitQuaternion<f64>]) -> Option<UnitQuaternion<f64>> {
    let first = quaternions.first()?;

    let mut m = Matrix4::zeros();
    for q in quaternions {
        m += q.coords * q.coords.transpose();
    }

    let eigen = SymmetricEigen::new(m);
    let (index, _) = eigen.eigenvalues.argmax();
    let mut v = eigen.eigenvectors.column(index).into_owned();
    if v.dot(&first.coords) < 0.0 {
        v = -v;
    }

    // coords are stored as [i, j, k, w]
    Some(UnitQuaternion::from_quaternion(Quaternion::new(
        v[3], v[0], v[1], v[2],
    )))
}

/// Returns the rotation angle of `q`, wrapped to `[-π, π]`.
pub fn angle(q: &UnitQuaternion<f64>) -> f64 {
    let angle = 2.0 * q.w.clamp(-1.0, 1.0).acos();
    if angle > PI {
        angle - 2.0 * PI
    } else {
        angle
    }
}

/// Moves `q` along the tangent vector `delta`: `exp(delta) ⊗ q`.
///
/// The exponential is `(cos|δ|, sin|δ|/|δ| · δ)`, so the result stays on the
/// unit sphere for any `delta`.
pub fn quaternion_plus(q: &UnitQuaternion<f64>, delta: &Vector3<f64>) -> UnitQuaternion<f64> {
    let norm = delta.norm();
    if norm < MIN_TANGENT_NORM {
        return *q;
    }
    let k = norm.sin() / norm;
    let step = Quaternion::new(norm.cos(), k * delta.x, k * delta.y, k * delta.z);
    UnitQuaternion::new_normalize(step * q.into_inner())
}

/// Orthonormal basis of the tangent plane of the unit sphere at `x`.
pub fn tangent_basis(x: &Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let seed = if x.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let b1 = (seed - x * seed.dot(x)).normalize();
    let b2 = x.cross(&b1);
    (b1, b2)
}

/// Moves the unit vector `x` along the geodesic given by the 2-dimensional tangent `delta`.
pub fn unit_vector_plus(x: &Unit<Vector3<f64>>, delta: &Vector2<f64>) -> Unit<Vector3<f64>> {
    let (b1, b2) = tangent_basis(x);
    let v = b1 * delta.x + b2 * delta.y;
    let theta = v.norm();
    if theta < MIN_TANGENT_NORM {
        return *x;
    }
    Unit::new_normalize(x.into_inner() * theta.cos() + v * (theta.sin() / theta))
}

/// Converts a `[w, x, y, z]` array into a unit quaternion.
pub fn quaternion_from_array(q: &[f64; 4]) -> UnitQuaternion<f64> {
    UnitQuaternion::from_quaternion(Quaternion::new(q[0], q[1], q[2], q[3]))
}

/// Converts a unit quaternion into a `[w, x, y, z]` array of solver scalars.
pub fn quaternion_to_array<T: RealField>(q: &UnitQuaternion<f64>) -> [T; 4] {
    [lit(q.w), lit(q.i), lit(q.j), lit(q.k)]
}

/// Lifts an `f64` constant into a solver scalar.
pub fn lit<T: RealField>(value: f64) -> T {
    nalgebra::convert(value)
}

/// Generic quaternion exponential, `delta` being a 3-element tangent vector.
///
/// Near zero a Taylor expansion is used so derivatives at the origin stay finite.
pub fn exp_quaternion<T: RealField>(delta: &[T]) -> [T; 4] {
    let (dx, dy, dz) = (delta[0].clone(), delta[1].clone(), delta[2].clone());
    let theta2 = dx.clone() * dx.clone() + dy.clone() * dy.clone() + dz.clone() * dz.clone();
    if theta2 < lit(1e-12) {
        let k = lit::<T>(1.0) - theta2.clone() / lit(6.0);
        [lit::<T>(1.0) - theta2 / lit(2.0), dx * k.clone(), dy * k.clone(), dz * k]
    } else {
        let theta = theta2.sqrt();
        let k = theta.clone().sin() / theta.clone();
        [theta.cos(), dx * k.clone(), dy * k.clone(), dz * k]
    }
}

/// Hamilton product of two `[w, x, y, z]` quaternions.
pub fn quaternion_mul<T: RealField>(a: &[T; 4], b: &[T; 4]) -> [T; 4] {
    let [aw, ax, ay, az] = a.clone();
    let [bw, bx, by, bz] = b.clone();
    [
        aw.clone() * bw.clone() - ax.clone() * bx.clone() - ay.clone() * by.clone() - az.clone() * bz.clone(),
        aw.clone() * bx.clone() + ax.clone() * bw.clone() + ay.clone() * bz.clone() - az.clone() * by.clone(),
        aw.clone() * by.clone() - ax.clone() * bz.clone() + ay.clone() * bw.clone() + az.clone() * bx.clone(),
        aw * bz + ax * by - ay * bx + az * bw,
    ]
}

/// `exp(delta) ⊗ q0` with `q0` held constant, the solver-side counterpart of [`quaternion_plus`].
pub fn perturb<T: RealField>(q0: &UnitQuaternion<f64>, delta: &[T]) -> [T; 4] {
    quaternion_mul(&exp_quaternion(delta), &quaternion_to_array(q0))
}

/// Rotates `v` by the unit quaternion `q`.
pub fn rotate<T: RealField>(q: &[T; 4], v: &[T; 3]) -> [T; 3] {
    let [w, x, y, z] = q.clone();
    let [vx, vy, vz] = v.clone();
    let two = lit::<T>(2.0);
    // t = 2 (u × v)
    let tx = two.clone() * (y.clone() * vz.clone() - z.clone() * vy.clone());
    let ty = two.clone() * (z.clone() * vx.clone() - x.clone() * vz.clone());
    let tz = two * (x.clone() * vy.clone() - y.clone() * vx.clone());
    // v' = v + w t + u × t
    [
        vx + w.clone() * tx.clone() + y.clone() * tz.clone() - z.clone() * ty.clone(),
        vy + w.clone() * ty.clone() + z * tx.clone() - x.clone() * tz.clone(),
        vz + w * tz + x * ty - y * tx,
    ]
}

/// Rotates `v` by the inverse of the unit quaternion `q`.
pub fn rotate_inverse<T: RealField>(q: &[T; 4], v: &[T; 3]) -> [T; 3] {
    let [w, x, y, z] = q.clone();
    rotate(&[w, -x, -y, -z], v)
}

/// Generic geodesic step on the unit sphere from the constant point `x0`.
pub fn unit_vector_exp<T: RealField>(x0: &Vector3<f64>, delta: &[T]) -> [T; 3] {
    let (b1, b2) = tangent_basis(x0);
    let v: Vec<T> = (0..3)
        .map(|i| delta[0].clone() * lit(b1[i]) + delta[1].clone() * lit(b2[i]))
        .collect();
    let theta2 = v.iter().fold(lit::<T>(0.0), |acc, c| acc + c.clone() * c.clone());
    let (a, b) = if theta2 < lit(1e-12) {
        (
            lit::<T>(1.0) - theta2.clone() / lit(2.0),
            lit::<T>(1.0) - theta2 / lit(6.0),
        )
    } else {
        let theta = theta2.sqrt();
        (theta.clone().cos(), theta.clone().sin() / theta)
    };
    [
        a.clone() * lit(x0.x) + b.clone() * v[0].clone(),
        a.clone() * lit(x0.y) + b.clone() * v[1].clone(),
        a * lit(x0.z) + b * v[2].clone(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_quaternion_average_of_identical_rotations() {
        let q = UnitQuaternion::from_euler_angles(0.1, -0.4, 0.7);
        let avg = quaternion_average(&[q, q, q]).unwrap();
        assert_relative_eq!(avg.angle_to(&q), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_quaternion_average_is_sign_invariant() {
        let q = UnitQuaternion::from_euler_angles(0.3, 0.2, -0.1);
        let flipped = UnitQuaternion::new_unchecked(-q.into_inner());
        let avg = quaternion_average(&[q, flipped]).unwrap();
        assert_relative_eq!(avg.angle_to(&q), 0.0, epsilon = 1e-9);
        assert!(avg.coords.dot(&q.coords) > 0.0);
    }

    #[test]
    fn test_quaternion_average_of_symmetric_pair() {
        let axis = Vector3::z_axis();
        let a = UnitQuaternion::from_axis_angle(&axis, 0.2);
        let b = UnitQuaternion::from_axis_angle(&axis, 0.6);
        let avg = quaternion_average(&[a, b]).unwrap();
        assert_relative_eq!(avg.angle(), 0.4, epsilon = 1e-9);
        assert!(quaternion_average(&[]).is_none());
    }

    #[test]
    fn test_angle_wraps() {
        let axis = Vector3::x_axis();
        assert_relative_eq!(angle(&UnitQuaternion::from_axis_angle(&axis, 0.5)), 0.5, epsilon = 1e-12);
        let large = UnitQuaternion::new_unchecked(-UnitQuaternion::from_axis_angle(&axis, 0.5).into_inner());
        assert_relative_eq!(angle(&large), -0.5, epsilon = 1e-12);
        assert_relative_eq!(angle(&UnitQuaternion::identity()), 0.0);
    }

    #[test]
    fn test_quaternion_plus_stays_on_manifold() {
        let q = UnitQuaternion::from_euler_angles(0.4, -1.1, 2.0);
        for delta in [
            Vector3::new(1e-3, -2e-3, 5e-4),
            Vector3::new(0.3, 0.1, -0.2),
            Vector3::new(2.0, -3.0, 1.5),
        ] {
            let updated = quaternion_plus(&q, &delta);
            assert_relative_eq!(updated.into_inner().norm(), 1.0, epsilon = 1e-12);
        }
        assert_eq!(quaternion_plus(&q, &Vector3::zeros()), q);
    }

    #[test]
    fn test_unit_vector_plus_stays_on_manifold() {
        let x = Unit::new_normalize(Vector3::new(0.2, -0.5, 0.9));
        let moved = unit_vector_plus(&x, &Vector2::new(0.1, -0.3));
        assert_relative_eq!(moved.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(moved.dot(&x).acos(), (0.1f64.powi(2) + 0.3f64.powi(2)).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_generic_perturbation_matches_plus() {
        let q = UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3);
        let delta = Vector3::new(0.05, -0.02, 0.1);
        let expected = quaternion_plus(&q, &delta);
        let got = quaternion_from_array(&perturb(&q, delta.as_slice()));
        assert_relative_eq!(got.angle_to(&expected), 0.0, epsilon = 1e-9);

        let v = Vector3::new(1.0, -2.0, 0.5);
        let rotated = rotate(&quaternion_to_array::<f64>(&q), &[v.x, v.y, v.z]);
        assert_relative_eq!(Vector3::from(rotated), q * v, epsilon = 1e-12);
        let back = rotate_inverse(&quaternion_to_array::<f64>(&q), &rotated);
        assert_relative_eq!(Vector3::from(back), v, epsilon = 1e-12);
    }

    #[test]
    fn test_generic_unit_vector_step_matches_plus() {
        let x = Unit::new_normalize(Vector3::new(0.9, 0.1, -0.3));
        let delta = Vector2::new(-0.2, 0.05);
        let expected = unit_vector_plus(&x, &delta);
        let got = unit_vector_exp(&x, delta.as_slice());
        assert_relative_eq!(Vector3::from(got), expected.into_inner(), epsilon = 1e-12);
    }
}
